//! # exsim Protocol
//!
//! Wire-level definitions shared by exercise clients and the exercise server.
//!
//! This crate provides:
//! - `Envelope`: the framing every message travels in
//! - `CodecType`: JSON and Postcard payload codecs
//! - Control and exercise messages, and the `Response` outcome type
//! - `ConnectionState`: the per-connection state machine
//! - Version negotiation
//! - `Transport` / `ServerTransport`: the seams transports plug into
//!
//! ## Example
//!
//! ```
//! use exsim_protocol::{messages::{routes, ProposeAction}, CodecType, Envelope};
//!
//! let codec = CodecType::from_id(1).unwrap();
//! let payload = codec.encode(&ProposeAction { action: "add-patient" }).unwrap();
//! let envelope = Envelope::request(codec.id(), routes::PROPOSE_ACTION, 1, payload);
//!
//! let received = Envelope::from_bytes(envelope.to_bytes()).unwrap();
//! let proposal: ProposeAction<String> = codec.decode(&received.payload).unwrap();
//! assert_eq!(proposal.action, "add-patient");
//! ```

pub mod codec;
pub mod envelope;
pub mod error;
pub mod messages;
pub mod response;
pub mod state;
pub mod transport;
pub mod version;

pub use codec::CodecType;
pub use envelope::{Envelope, ENVELOPE_HEADER_SIZE};
pub use error::{EnvelopeError, ProtocolError, Result};
pub use messages::{ExerciseHistory, LoggedAction};
pub use response::{ActionResponse, Response};
pub use state::ConnectionState;
pub use transport::{ServerTransport, SessionEvent, Transport};
pub use version::{negotiate_version, CURRENT_PROTOCOL_VERSION, MIN_PROTOCOL_VERSION};

/// Identifies one client connection on the server
///
/// Assigned by the server transport when a connection is accepted. It is
/// never part of an envelope; it only routes envelopes inside the server.
pub type SessionId = uuid::Uuid;

/// Envelope tagged with the session it came from or is going to
#[derive(Debug, Clone)]
pub struct SessionEnvelope {
    /// Session identifier for routing
    pub session_id: SessionId,

    /// The envelope itself
    pub envelope: Envelope,
}

impl SessionEnvelope {
    /// Creates a new SessionEnvelope
    pub fn new(session_id: SessionId, envelope: Envelope) -> Self {
        Self {
            session_id,
            envelope,
        }
    }
}
