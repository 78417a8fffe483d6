use thiserror::Error;

use crate::state::ConnectionState;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum EnvelopeError {
    #[error("Payload length mismatch: expected {expected}, got {actual}")]
    PayloadLengthMismatch { expected: u32, actual: usize },

    #[error("Buffer too short: need {need} bytes, have {have}")]
    BufferTooShort { need: usize, have: usize },

    #[error("Unsupported protocol version: {0:#06x}")]
    UnsupportedVersion(u16),
}

#[derive(Error, Debug, Clone, PartialEq)]
pub enum ProtocolError {
    #[error(transparent)]
    Envelope(#[from] EnvelopeError),

    #[error(
        "No common protocol version: client supports {client_min:#06x}..={client_max:#06x}, \
         server supports {server_min:#06x}..={server_max:#06x}"
    )]
    VersionMismatch {
        client_min: u16,
        client_max: u16,
        server_min: u16,
        server_max: u16,
    },

    #[error("Invalid state transition from {from} to {to}")]
    InvalidStateTransition {
        from: ConnectionState,
        to: ConnectionState,
    },

    #[error("Codec error: {0}")]
    CodecError(String),

    #[error("Unknown route: {0}")]
    UnknownRoute(u16),
}

pub type EnvelopeResult<T> = std::result::Result<T, EnvelopeError>;
pub type Result<T> = std::result::Result<T, ProtocolError>;
