//! Optimistic action coordination
//!
//! [`OptimisticCoordinator`] sequences locally proposed actions against the
//! stream of authoritative actions coming from the server, so that the
//! locally observed state is always the authoritative state known so far,
//! plus at most one tentative action whose round trip is still open, plus
//! tentative copies of proposals queued behind it.
//!
//! The coordinator itself never performs I/O. It tells its driver what to
//! send ([`Dispatch`]) and is told when the open round trip has been
//! answered ([`OptimisticCoordinator::finish_round_trip`]). This keeps every
//! transition synchronous; the only suspension point lives in the driver,
//! between handing out an optimistic dispatch and reporting its response.
//!
//! ## Round trip
//!
//! ```text
//! propose(a, optimistic)            perform(x)            response(a)
//!   save snapshot S                   queue x               restore S
//!   apply a  → S·a                    (S·a stays)           replay x → S·x
//!   dispatch a                                              drain queued proposals
//! ```
//!
//! The tentative application of `a` is always discarded, whether the server
//! accepted it or not: if it was accepted, its authoritative copy arrives as
//! a `perform` like any other action.

use std::sync::Arc;

use exsim_protocol::ActionResponse;
use tokio::sync::oneshot;

use crate::queue::ActionQueue;
use crate::store::StateStore;
use crate::ReducerError;

/// Outcome delivered to a proposer
///
/// `Ok` carries the server's answer, which may itself be a rejection.
/// `Err` means there is no answer: either the action could not even be
/// applied locally, or the driver stopped waiting for the server.
pub type ProposalResult = Result<ActionResponse, ProposalError>;

/// A proposal that ended without an answer from the server
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ProposalError {
    /// The action does not apply to the local state; nothing was sent
    #[error(transparent)]
    Reducer(#[from] ReducerError),

    /// The action was sent but its answer never arrived in time
    ///
    /// The server may still have committed it. Its authoritative copy, if
    /// any, arrives as a regular perform.
    #[error("no answer from the server in time, the action may still be committed")]
    Unanswered,
}

/// Reply channel of one proposal
pub type Responder = oneshot::Sender<ProposalResult>;

/// An action the driver must send to the server now
#[derive(Debug)]
pub struct Dispatch<A> {
    pub action: A,

    /// Whether this dispatch opened the coordinator's round trip
    ///
    /// The driver must call [`OptimisticCoordinator::finish_round_trip`]
    /// once an optimistic dispatch has been answered (or given up on).
    pub optimistic: bool,

    /// Where the server's answer goes
    pub reply: Responder,
}

/// Result of closing a round trip
#[derive(Debug)]
pub struct Settled<A> {
    /// Queued proposals that are ready to be sent, in submission order
    pub dispatches: Vec<Dispatch<A>>,

    /// Set if an authoritative action failed to replay
    ///
    /// The local state no longer matches the server's and has to be
    /// resynchronized from a full snapshot. Authoritative actions queued
    /// after the failing one were discarded.
    pub replay_error: Option<ReducerError>,
}

impl<A> Default for Settled<A> {
    fn default() -> Self {
        Self {
            dispatches: Vec::new(),
            replay_error: None,
        }
    }
}

#[derive(Debug)]
struct QueuedProposal<A> {
    action: A,
    optimistic: bool,
    reply: Responder,
}

/// Sequencer for optimistic and authoritative actions
///
/// # Example
///
/// ```rust
/// # use exsim_simulation::{LogicalClock, Reducer, ReducerError, ReducerStore, OptimisticCoordinator};
/// # use exsim_protocol::Response;
/// # use serde::{Deserialize, Serialize};
/// # use std::sync::Arc;
/// # use tokio::sync::oneshot;
/// # #[derive(Clone, Serialize, Deserialize)]
/// # struct Text(String);
/// # impl LogicalClock for Text { fn current_time(&self) -> u64 { 0 } }
/// # struct Append;
/// # impl Reducer for Append {
/// #     type State = Text;
/// #     type Action = char;
/// #     fn reduce(&self, state: &mut Text, c: &char) -> Result<(), ReducerError> {
/// #         state.0.push(*c);
/// #         Ok(())
/// #     }
/// # }
/// let store = ReducerStore::new(Arc::new(Append), Text(String::new()));
/// let mut coordinator = OptimisticCoordinator::new(store);
///
/// // Propose optimistically: visible immediately
/// let (reply, _answer) = oneshot::channel();
/// let dispatch = coordinator.propose_action('a', true, reply).unwrap();
/// assert_eq!(coordinator.state().0, "a");
///
/// // Another client's action arrives while we wait: it is held back
/// coordinator.perform_action('b').unwrap();
/// assert_eq!(coordinator.state().0, "a");
///
/// // The server answers: roll back, then replay what arrived meanwhile
/// dispatch.reply.send(Ok(Response::ok())).unwrap();
/// coordinator.finish_round_trip();
/// assert_eq!(coordinator.state().0, "b");
///
/// // Our own action comes back as an authoritative one
/// coordinator.perform_action('a').unwrap();
/// assert_eq!(coordinator.state().0, "ba");
/// ```
pub struct OptimisticCoordinator<St: StateStore> {
    store: St,

    /// Snapshot taken before the open round trip's tentative action
    ///
    /// `Some` exactly while a round trip is open, so at most one optimistic
    /// round trip can exist at a time.
    saved_state: Option<Arc<St::State>>,

    /// Authoritative actions received while the round trip is open
    perform_queue: ActionQueue<St::Action>,

    /// Proposals made while the round trip is open
    proposal_queue: ActionQueue<QueuedProposal<St::Action>>,
}

impl<St: StateStore> OptimisticCoordinator<St> {
    /// Creates a coordinator managing `store`
    pub fn new(store: St) -> Self {
        Self {
            store,
            saved_state: None,
            perform_queue: ActionQueue::new(),
            proposal_queue: ActionQueue::new(),
        }
    }

    /// Proposes an action
    ///
    /// Returns the dispatch the driver must send right away, if any:
    ///
    /// - Round trip open: an optimistic action is applied tentatively, then
    ///   the proposal is queued and `None` is returned. It is re-proposed,
    ///   in submission order, when the round trip closes.
    /// - No round trip, not optimistic: the state is untouched and the action
    ///   is returned for sending. Its effect arrives later via
    ///   [`perform_action`](Self::perform_action).
    /// - No round trip, optimistic: the current state is saved, the action is
    ///   applied, and the returned dispatch opens a round trip.
    ///
    /// If a tentative application fails in the reducer, `reply` receives the
    /// error and nothing is queued or sent.
    pub fn propose_action(
        &mut self,
        action: St::Action,
        optimistic: bool,
        reply: Responder,
    ) -> Option<Dispatch<St::Action>> {
        if self.saved_state.is_some() {
            if optimistic {
                if let Err(err) = self.store.apply_action(&action) {
                    tracing::debug!(error = %err, "Queued optimistic proposal does not apply");
                    let _ = reply.send(Err(err.into()));
                    return None;
                }
            }

            self.proposal_queue.push(QueuedProposal {
                action,
                optimistic,
                reply,
            });
            tracing::trace!(
                queued = self.proposal_queue.len(),
                optimistic,
                "Round trip open, proposal queued"
            );
            return None;
        }

        if !optimistic {
            return Some(Dispatch {
                action,
                optimistic: false,
                reply,
            });
        }

        let saved = self.store.get_state();
        if let Err(err) = self.store.apply_action(&action) {
            tracing::debug!(error = %err, "Optimistic proposal does not apply");
            let _ = reply.send(Err(err.into()));
            return None;
        }
        self.saved_state = Some(saved);

        Some(Dispatch {
            action,
            optimistic: true,
            reply,
        })
    }

    /// Applies an authoritative action, or holds it back while a round trip is open
    ///
    /// Authoritative actions are applied exactly once and in the order they
    /// are passed in. An error means the local state has diverged from the
    /// server's.
    pub fn perform_action(&mut self, action: St::Action) -> Result<(), ReducerError> {
        if self.saved_state.is_some() {
            self.perform_queue.push(action);
            return Ok(());
        }

        self.store.apply_action(&action)
    }

    /// Closes the open round trip
    ///
    /// Restores the snapshot taken before the tentative action, replays the
    /// authoritative actions held back meanwhile, then re-proposes every
    /// proposal queued so far. Only proposals queued before this call are
    /// visited; if one of them opens a new round trip, the ones behind it are
    /// queued again for the next pass.
    ///
    /// The caller answers the closed round trip's own proposer; this method
    /// only returns what has to be sent next.
    pub fn finish_round_trip(&mut self) -> Settled<St::Action> {
        let Some(saved) = self.saved_state.take() else {
            tracing::warn!("finish_round_trip called without an open round trip");
            return Settled::default();
        };

        self.store.set_state(saved);

        let mut replay_error = None;
        let mut held_back = self.perform_queue.take_batch().into_iter();
        for action in held_back.by_ref() {
            if let Err(err) = self.store.apply_action(&action) {
                replay_error = Some(err);
                break;
            }
        }
        if let Some(err) = &replay_error {
            tracing::error!(
                error = %err,
                discarded = held_back.len(),
                "Authoritative action failed to replay after rollback"
            );
        }

        let mut dispatches = Vec::new();
        for queued in self.proposal_queue.take_batch() {
            if let Some(dispatch) = self.propose_action(queued.action, queued.optimistic, queued.reply) {
                dispatches.push(dispatch);
            }
        }

        Settled {
            dispatches,
            replay_error,
        }
    }

    /// Replaces the canonical state with a full snapshot from the server
    ///
    /// Authoritative actions held back so far are contained in the snapshot
    /// and are dropped. If a round trip is open, it will roll back to the
    /// snapshot instead of the state saved before its tentative action.
    pub fn resynchronize(&mut self, state: Arc<St::State>) {
        if self.saved_state.is_some() {
            self.saved_state = Some(state.clone());
            self.perform_queue.clear();
        }

        self.store.set_state(state);
    }

    /// Returns true while an optimistic round trip is open
    #[inline]
    pub fn is_waiting(&self) -> bool {
        self.saved_state.is_some()
    }

    /// Returns the number of proposals queued behind the open round trip
    pub fn queued_proposals(&self) -> usize {
        self.proposal_queue.len()
    }

    /// Returns the number of authoritative actions held back
    pub fn queued_actions(&self) -> usize {
        self.perform_queue.len()
    }

    /// Returns the current canonical state
    pub fn state(&self) -> Arc<St::State> {
        self.store.get_state()
    }

    /// Returns the managed store
    pub fn store(&self) -> &St {
        &self.store
    }

    /// Returns the managed store mutably
    ///
    /// Intended for modes that bypass coordination entirely, such as time
    /// travel. Must not be used while a round trip is open.
    pub fn store_mut(&mut self) -> &mut St {
        &mut self.store
    }
}
