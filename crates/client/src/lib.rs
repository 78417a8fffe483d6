//! # exsim Client
//!
//! Client-side session for a shared exercise.
//!
//! [`ExerciseClient`] is an event loop that owns the local copy of the
//! exercise state. It talks to the server through a pair of envelope channels
//! bridged by a [`Transport`](exsim_protocol::Transport), and to the
//! application through a cloneable [`ClientHandle`].
//!
//! Every state change happens on the loop, one event at a time: incoming
//! envelopes, application commands and the round-trip deadline. This is what
//! lets the optimistic coordinator stay lock-free.
//!
//! ## Example
//!
//! ```no_run
//! # use exsim_simulation::{LogicalClock, Reducer, ReducerError};
//! # use serde::{Deserialize, Serialize};
//! # #[derive(Clone, Default, Serialize, Deserialize)]
//! # struct Exercise { time: u64 }
//! # impl LogicalClock for Exercise { fn current_time(&self) -> u64 { self.time } }
//! # struct Tick;
//! # impl Reducer for Tick {
//! #     type State = Exercise;
//! #     type Action = u64;
//! #     fn reduce(&self, state: &mut Exercise, ms: &u64) -> Result<(), ReducerError> {
//! #         state.time += ms;
//! #         Ok(())
//! #     }
//! # }
//! use exsim_client::{transport::websocket::WebSocketClient, ClientConfig, ExerciseClient};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let transport = WebSocketClient::new("ws://127.0.0.1:3201");
//!     let (handle, _tasks) =
//!         ExerciseClient::spawn(transport, Tick, Exercise::default(), ClientConfig::default());
//!
//!     handle.join("trainer").await?;
//!     let response = handle.propose_action(1000, true).await?;
//!     println!("accepted: {}", response.success);
//!     Ok(())
//! }
//! ```

mod handle;
mod session;
pub mod transport;

use std::time::Duration;

use exsim_protocol::codec::JSON_CODEC_ID;
use exsim_protocol::ProtocolError;
use exsim_simulation::{ProposalError, ReducerError};

pub use handle::ClientHandle;
pub use session::ExerciseClient;

/// Client configuration
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Codec ID used for exercise messages (1 = JSON, 2 = Postcard)
    ///
    /// Control messages are always JSON.
    pub codec_id: u8,

    /// Capacity of the envelope and command channels
    pub channel_capacity: usize,

    /// How long an optimistic proposal may wait for the server's answer
    ///
    /// When it expires the proposal fails with
    /// [`ClientError::RoundTripTimedOut`] and the tentative state is rolled
    /// back, which unblocks the proposals queued behind it. The outcome of a
    /// timed-out proposal is unknown: the server may still commit it, in
    /// which case it shows up in the state like any authoritative action.
    /// Check the state before proposing it again. `None` waits forever.
    pub round_trip_timeout: Option<Duration>,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            codec_id: JSON_CODEC_ID,
            channel_capacity: 100,
            round_trip_timeout: Some(Duration::from_secs(30)),
        }
    }
}

/// What the local state currently represents
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SessionMode {
    /// Not joined to an exercise
    #[default]
    Idle,

    /// Following the server: authoritative actions are applied as they arrive
    Live,

    /// Showing a reconstructed past state; the server is not followed
    TimeTravel {
        /// Exercise time last jumped to
        time: u64,
    },
}

/// Client errors
#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    #[error("Failed to send envelope through channel")]
    ChannelSendError,

    #[error("Session closed")]
    SessionClosed,

    #[error("Invalid message: {0}")]
    InvalidMessage(String),

    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    #[error("Handshake rejected: {0}")]
    HandshakeRejected(String),

    #[error("Request rejected by server: {0}")]
    Rejected(String),

    #[error("Action does not apply to the local state: {0}")]
    Reducer(#[from] ReducerError),

    #[error("Not joined to an exercise")]
    NotJoined,

    #[error("Already joined to an exercise")]
    AlreadyJoined,

    #[error("Not available while time travelling")]
    TimeTravelActive,

    #[error("Not time travelling")]
    NotTimeTravelling,

    #[error("An optimistic proposal is still waiting for the server")]
    RoundTripInFlight,

    /// The server did not answer in time; the proposal may still be committed
    #[error("No answer from the server in time, outcome unknown")]
    RoundTripTimedOut,
}

impl From<ProposalError> for ClientError {
    fn from(err: ProposalError) -> Self {
        match err {
            ProposalError::Reducer(e) => ClientError::Reducer(e),
            ProposalError::Unanswered => ClientError::RoundTripTimedOut,
        }
    }
}
