//! # exsim Simulation Layer
//!
//! Optimistic state synchronisation for a shared, server-authoritative
//! exercise state.
//!
//! The server is the only source of truth. A client nevertheless wants its
//! own actions to show up immediately, so it may apply them tentatively and
//! undo them once the server has answered. This crate holds the pieces that
//! make that safe:
//!
//! - [`Reducer`]: the pure transition function `state × action → state`
//! - [`store::ReducerStore`]: the state container, publishing immutable snapshots
//! - [`coordinator::OptimisticCoordinator`]: orders tentative and authoritative actions
//! - [`replay::ReplayLog`]: rebuilds historical states for time travel
//!
//! ## Example
//!
//! ```rust
//! use exsim_simulation::{LogicalClock, Reducer, ReducerError};
//! use serde::{Deserialize, Serialize};
//!
//! #[derive(Clone, Default, Serialize, Deserialize)]
//! struct Exercise {
//!     time: u64,
//!     patients: Vec<String>,
//! }
//!
//! impl LogicalClock for Exercise {
//!     fn current_time(&self) -> u64 {
//!         self.time
//!     }
//! }
//!
//! #[derive(Clone, Debug, Serialize, Deserialize)]
//! enum Action {
//!     Tick(u64),
//!     AddPatient(String),
//!     RemovePatient(String),
//! }
//!
//! #[derive(Clone)]
//! struct ExerciseReducer;
//!
//! impl Reducer for ExerciseReducer {
//!     type State = Exercise;
//!     type Action = Action;
//!
//!     fn reduce(&self, state: &mut Exercise, action: &Action) -> Result<(), ReducerError> {
//!         match action {
//!             Action::Tick(ms) => state.time += ms,
//!             Action::AddPatient(id) => state.patients.push(id.clone()),
//!             Action::RemovePatient(id) => {
//!                 let index = state
//!                     .patients
//!                     .iter()
//!                     .position(|p| p == id)
//!                     .ok_or_else(|| ReducerError::not_found("patient", id))?;
//!                 state.patients.remove(index);
//!             }
//!         }
//!         Ok(())
//!     }
//! }
//! ```

use std::fmt::Debug;

use serde::{de::DeserializeOwned, Serialize};

pub mod coordinator;
pub mod queue;
pub mod replay;
pub mod store;

pub use coordinator::{
    Dispatch, OptimisticCoordinator, ProposalError, ProposalResult, Responder, Settled,
};
pub use queue::ActionQueue;
pub use replay::ReplayLog;
pub use store::{ReducerStore, StateStore};

/// Exposes the exercise clock stored inside a state
pub trait LogicalClock {
    /// Current exercise time, in whatever unit the exercise counts
    fn current_time(&self) -> u64;
}

/// Pure state transition function shared by client and server
///
/// # Requirements
///
/// - **Deterministic**: the same state and action always give the same result.
///   Client replay, rollback and time travel all rely on it.
/// - **Loud**: an action that does not apply to the state (for example one
///   referring to an entity that no longer exists) must return an error
///   instead of silently doing nothing.
///
/// `reduce` mutates its argument in place. Callers that need the previous
/// state to survive a failure reduce on a copy; see [`store::ReducerStore`].
pub trait Reducer: Send + Sync + 'static {
    /// Full exercise state
    type State: LogicalClock + Clone + Serialize + DeserializeOwned + Send + Sync + 'static;

    /// A single state change
    type Action: Clone + Debug + Serialize + DeserializeOwned + Send + Sync + 'static;

    /// Applies `action` to `state`
    fn reduce(&self, state: &mut Self::State, action: &Self::Action) -> Result<(), ReducerError>;
}

/// An action could not be applied to a state
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ReducerError {
    /// The action refers to an entity that does not exist
    #[error("{entity} with id {id} not found")]
    NotFound { entity: String, id: String },

    /// The action is not valid for the current state
    #[error("invalid action: {0}")]
    Invalid(String),
}

impl ReducerError {
    pub fn not_found(entity: impl Into<String>, id: impl ToString) -> Self {
        ReducerError::NotFound {
            entity: entity.into(),
            id: id.to_string(),
        }
    }

    pub fn invalid(reason: impl Into<String>) -> Self {
        ReducerError::Invalid(reason.into())
    }
}
