//! Connection state machine
//!
//! State transitions:
//! ```text
//! Client: CLOSED → CONNECTING → HELLO_SENT → CONNECTED → JOINING → JOINED
//! Server: CLOSED → CONNECTING ───────────────→ CONNECTED ──────────→ JOINED
//!                                                  ↑                    │
//!                                                  └──── (leave) ───────┘
//!           any state ──(error / disconnect)──→ CLOSED
//! ```
//!
//! Authoritative actions are only exchanged in `Joined`: a session must have
//! received a full snapshot before any `PERFORM_ACTION` is trusted.

use crate::error::{ProtocolError, Result};

/// Connection state in the protocol state machine
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ConnectionState {
    /// No connection established
    #[default]
    Closed,

    /// Transport connected, HELLO not sent yet
    Connecting,

    /// HELLO sent, waiting for HELLO_OK or HELLO_ERROR
    HelloSent,

    /// Handshake complete, not part of the exercise
    Connected,

    /// JOIN_EXERCISE sent, waiting for the snapshot
    Joining,

    /// Snapshot received, authoritative actions flow
    Joined,
}

impl ConnectionState {
    /// Validates a state transition
    pub fn can_transition_to(&self, next: ConnectionState) -> bool {
        use ConnectionState::*;

        match (self, next) {
            (_, Closed) => true,
            (Closed, Connecting) => true,
            (Connecting, HelloSent) => true,
            (Connecting, Connected) => true,
            (HelloSent, Connected) => true,
            (Connected, Joining) => true,
            (Connected, Joined) => true,
            (Joining, Joined) => true,
            (Joined, Connected) => true,
            (a, b) => *a == b,
        }
    }

    /// Attempts to transition to a new state
    ///
    /// Returns Ok(()) if transition is valid, Err otherwise
    pub fn transition_to(&mut self, next: ConnectionState) -> Result<()> {
        if self.can_transition_to(next) {
            *self = next;
            Ok(())
        } else {
            Err(ProtocolError::InvalidStateTransition {
                from: *self,
                to: next,
            })
        }
    }

    /// Returns true once the handshake completed (joined or not)
    #[inline]
    pub fn is_connected(&self) -> bool {
        matches!(
            self,
            ConnectionState::Connected | ConnectionState::Joining | ConnectionState::Joined
        )
    }

    #[inline]
    pub fn is_closed(&self) -> bool {
        matches!(self, ConnectionState::Closed)
    }

    #[inline]
    pub fn is_joined(&self) -> bool {
        matches!(self, ConnectionState::Joined)
    }
}

impl std::fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConnectionState::Closed => write!(f, "Closed"),
            ConnectionState::Connecting => write!(f, "Connecting"),
            ConnectionState::HelloSent => write!(f, "HelloSent"),
            ConnectionState::Connected => write!(f, "Connected"),
            ConnectionState::Joining => write!(f, "Joining"),
            ConnectionState::Joined => write!(f, "Joined"),
        }
    }
}
