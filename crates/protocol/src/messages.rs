//! Messages exchanged between exercise clients and the server
//!
//! Control messages (route_id < 100) negotiate the connection. Exercise
//! messages (route_id >= 100) carry the joined session: proposals, their
//! responses, authoritative actions and full state transfers.
//!
//! Replies travel on their own route with `correlation_id` set to the
//! request's `msg_id`:
//!
//! | request          | reply                                        |
//! |------------------|----------------------------------------------|
//! | `HELLO`          | `HELLO_OK` / `HELLO_ERROR`                   |
//! | `JOIN_EXERCISE`  | `EXERCISE_STATE` (`Response<S>`)             |
//! | `GET_STATE`      | `EXERCISE_STATE` (`Response<S>`)             |
//! | `PROPOSE_ACTION` | `ACTION_RESPONSE` (`ActionResponse`)         |
//! | `GET_HISTORY`    | `EXERCISE_HISTORY` (`Response<ExerciseHistory>`) |
//!
//! `PERFORM_ACTION` is pushed by the server, in commit order, to every
//! joined session.

use serde::{Deserialize, Serialize};

/// Route IDs
pub mod routes {
    /// Client → Server: initial handshake
    pub const HELLO: u16 = 1;

    /// Server → Client: handshake accepted
    pub const HELLO_OK: u16 = 2;

    /// Server → Client: handshake rejected
    pub const HELLO_ERROR: u16 = 3;

    /// Client → Server: join the exercise and receive its state
    pub const JOIN_EXERCISE: u16 = 100;

    /// Client → Server: stop receiving authoritative actions
    pub const LEAVE_EXERCISE: u16 = 101;

    /// Client → Server: propose an action
    pub const PROPOSE_ACTION: u16 = 110;

    /// Server → Client: outcome of a proposal
    pub const ACTION_RESPONSE: u16 = 111;

    /// Server → Client: authoritative action to apply
    pub const PERFORM_ACTION: u16 = 112;

    /// Client → Server: request a full state snapshot
    pub const GET_STATE: u16 = 120;

    /// Server → Client: full state snapshot
    pub const EXERCISE_STATE: u16 = 121;

    /// Client → Server: request the recorded action history
    pub const GET_HISTORY: u16 = 130;

    /// Server → Client: initial state plus every committed action
    pub const EXERCISE_HISTORY: u16 = 131;
}

/// Exercise messages start from route_id >= 100
pub const EXERCISE_MESSAGES_START: u16 = 100;

/// HELLO message sent by a client right after the transport connects
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Hello {
    /// Client's preferred protocol version
    pub protocol_version: u16,

    /// Minimum protocol version the client supports
    pub min_protocol_version: u16,

    /// Codec the client will use for exercise messages
    pub codec_id: u8,
}

/// HELLO_OK message sent by the server when the handshake is accepted
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HelloOk {
    /// Negotiated protocol version
    pub server_version: u16,

    /// Server-side identifier of this connection
    pub session_id: String,
}

/// HELLO_ERROR message sent by the server when the handshake is rejected
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HelloError {
    pub reason: ErrorReason,
    pub message: String,
}

/// Reasons for rejecting a handshake
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ErrorReason {
    VersionMismatch,
    UnsupportedCodec,
    InvalidState,
}

/// JOIN_EXERCISE request
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JoinExercise {
    /// Display name of the participant
    pub participant_name: String,
}

/// LEAVE_EXERCISE notification
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct LeaveExercise;

/// GET_STATE request
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct GetState;

/// GET_HISTORY request
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct GetHistory;

/// PROPOSE_ACTION request
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProposeAction<A> {
    pub action: A,
}

/// PERFORM_ACTION push
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PerformAction<A> {
    pub action: A,
}

/// An action as recorded in the exercise history
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LoggedAction<A> {
    pub action: A,

    /// Exercise clock at the moment the action was committed
    pub timestamp: u64,
}

/// Payload of EXERCISE_HISTORY
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExerciseHistory<S, A> {
    /// State the exercise started from
    pub initial_state: S,

    /// Every committed action, in commit order
    pub actions: Vec<LoggedAction<A>>,
}
