use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::error::{EnvelopeError, EnvelopeResult as Result};
use crate::version::{major_version, CURRENT_PROTOCOL_VERSION};

/// Network message envelope
///
/// Every message between a client and the exercise server travels inside an
/// envelope. Requests carry a fresh `msg_id`; replies echo it back in
/// `correlation_id` so the requester can resolve the matching round trip.
///
/// Wire format (big-endian):
/// ```text
/// ┌─────────────────┬──────┬───────────┐
/// │ protocol_version│ u16  │  2 bytes  │
/// ├─────────────────┼──────┼───────────┤
/// │ codec_id        │ u8   │  1 byte   │
/// ├─────────────────┼──────┼───────────┤
/// │ route_id        │ u16  │  2 bytes  │
/// ├─────────────────┼──────┼───────────┤
/// │ msg_id          │ u64  │  8 bytes  │
/// ├─────────────────┼──────┼───────────┤
/// │ correlation_id  │ u64  │  8 bytes  │
/// ├─────────────────┼──────┼───────────┤
/// │ payload_len     │ u32  │  4 bytes  │
/// ├─────────────────┼──────┼───────────┤
/// │ payload         │ [u8] │  N bytes  │
/// └─────────────────┴──────┴───────────┘
/// Total header: 25 bytes
/// ```
#[derive(Debug, Clone, PartialEq)]
pub struct Envelope {
    /// Protocol version number
    pub protocol_version: u16,

    /// Codec identifier (JSON=1, Postcard=2)
    pub codec_id: u8,

    /// Route/message type identifier
    pub route_id: u16,

    /// Sender-assigned message identifier
    pub msg_id: u64,

    /// `msg_id` of the request this envelope answers (0 if not a reply)
    pub correlation_id: u64,

    /// Length of the payload in bytes
    pub payload_len: u32,

    /// Encoded message payload
    pub payload: Bytes,
}

/// Size of the envelope header in bytes (excluding payload)
pub const ENVELOPE_HEADER_SIZE: usize = 25;

impl Envelope {
    /// Creates a new envelope for the current protocol version
    pub fn new(codec_id: u8, route_id: u16, msg_id: u64, correlation_id: u64, payload: Bytes) -> Self {
        Self {
            protocol_version: CURRENT_PROTOCOL_VERSION,
            codec_id,
            route_id,
            msg_id,
            correlation_id,
            payload_len: payload.len() as u32,
            payload,
        }
    }

    /// Creates an envelope that is not a reply to anything
    pub fn request(codec_id: u8, route_id: u16, msg_id: u64, payload: Bytes) -> Self {
        Self::new(codec_id, route_id, msg_id, 0, payload)
    }

    /// Returns true if this envelope answers an earlier request
    #[inline]
    pub fn is_reply(&self) -> bool {
        self.correlation_id != 0
    }

    /// Validates the envelope
    pub fn validate(&self) -> Result<()> {
        if self.payload.len() != self.payload_len as usize {
            return Err(EnvelopeError::PayloadLengthMismatch {
                expected: self.payload_len,
                actual: self.payload.len(),
            });
        }

        if major_version(self.protocol_version) != major_version(CURRENT_PROTOCOL_VERSION) {
            return Err(EnvelopeError::UnsupportedVersion(self.protocol_version));
        }

        Ok(())
    }

    /// Serializes the envelope to bytes (big-endian)
    pub fn to_bytes(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(ENVELOPE_HEADER_SIZE + self.payload.len());

        buf.put_u16(self.protocol_version);
        buf.put_u8(self.codec_id);
        buf.put_u16(self.route_id);
        buf.put_u64(self.msg_id);
        buf.put_u64(self.correlation_id);
        buf.put_u32(self.payload_len);
        buf.put_slice(&self.payload);

        buf.freeze()
    }

    /// Deserializes and validates an envelope from bytes (big-endian)
    pub fn from_bytes(mut data: Bytes) -> Result<Self> {
        if data.len() < ENVELOPE_HEADER_SIZE {
            return Err(EnvelopeError::BufferTooShort {
                need: ENVELOPE_HEADER_SIZE,
                have: data.len(),
            });
        }

        let protocol_version = data.get_u16();
        let codec_id = data.get_u8();
        let route_id = data.get_u16();
        let msg_id = data.get_u64();
        let correlation_id = data.get_u64();
        let payload_len = data.get_u32();

        if data.len() != payload_len as usize {
            return Err(EnvelopeError::PayloadLengthMismatch {
                expected: payload_len,
                actual: data.len(),
            });
        }

        let envelope = Self {
            protocol_version,
            codec_id,
            route_id,
            msg_id,
            correlation_id,
            payload_len,
            payload: data,
        };
        envelope.validate()?;

        Ok(envelope)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_envelope_wire_layout() {
        let envelope = Envelope::new(1, 0x0102, 7, 3, Bytes::from_static(b"hi"));
        let bytes = envelope.to_bytes();

        assert_eq!(bytes.len(), ENVELOPE_HEADER_SIZE + 2);
        assert_eq!(&bytes[0..2], &CURRENT_PROTOCOL_VERSION.to_be_bytes());
        assert_eq!(bytes[2], 1);
        assert_eq!(&bytes[3..5], &[0x01, 0x02]);
        assert_eq!(&bytes[5..13], &7u64.to_be_bytes());
        assert_eq!(&bytes[13..21], &3u64.to_be_bytes());
        assert_eq!(&bytes[21..25], &2u32.to_be_bytes());
        assert_eq!(&bytes[25..], b"hi");

        let parsed = Envelope::from_bytes(bytes).unwrap();
        assert_eq!(parsed, envelope);
        assert!(parsed.is_reply());
    }

    #[test]
    fn test_request_has_no_correlation() {
        let envelope = Envelope::request(2, 100, 1, Bytes::new());
        assert_eq!(envelope.correlation_id, 0);
        assert!(!envelope.is_reply());
    }

    #[test]
    fn test_buffer_too_short() {
        let result = Envelope::from_bytes(Bytes::from_static(&[0u8; 10]));
        assert_eq!(
            result,
            Err(EnvelopeError::BufferTooShort {
                need: ENVELOPE_HEADER_SIZE,
                have: 10
            })
        );
    }

    #[test]
    fn test_truncated_payload() {
        let envelope = Envelope::request(1, 100, 1, Bytes::from_static(b"payload"));
        let bytes = envelope.to_bytes();
        let truncated = bytes.slice(0..bytes.len() - 3);

        assert_eq!(
            Envelope::from_bytes(truncated),
            Err(EnvelopeError::PayloadLengthMismatch {
                expected: 7,
                actual: 4
            })
        );
    }

    #[test]
    fn test_rejects_other_major_version() {
        let mut envelope = Envelope::request(1, 100, 1, Bytes::new());
        envelope.protocol_version = 0x0200;

        assert_eq!(
            Envelope::from_bytes(envelope.to_bytes()),
            Err(EnvelopeError::UnsupportedVersion(0x0200))
        );
    }

    #[test]
    fn test_validate_length_mismatch() {
        let mut envelope = Envelope::request(1, 100, 1, Bytes::from_static(b"abc"));
        envelope.payload_len = 10;
        assert!(envelope.validate().is_err());
    }
}
