//! State container
//!
//! Holds the canonical exercise state as an immutable snapshot behind an
//! `Arc`. Readers get a cheap handle to a snapshot that can never change
//! under them; every change produces a new snapshot and publishes it to
//! observers.

use std::sync::Arc;

use tokio::sync::watch;

use crate::{Reducer, ReducerError};

/// Synchronous access to a canonical state
///
/// This is the only surface the [`OptimisticCoordinator`] needs: read the
/// state, replace it wholesale, or apply a single action to it.
///
/// [`OptimisticCoordinator`]: crate::coordinator::OptimisticCoordinator
pub trait StateStore {
    type State;
    type Action;

    /// Returns the current snapshot
    fn get_state(&self) -> Arc<Self::State>;

    /// Replaces the current snapshot
    fn set_state(&mut self, state: Arc<Self::State>);

    /// Applies one action to the current snapshot
    ///
    /// On error the current snapshot is left untouched.
    fn apply_action(&mut self, action: &Self::Action) -> Result<(), ReducerError>;
}

/// [`StateStore`] backed by a [`Reducer`], with observers
///
/// # Example
///
/// ```rust
/// # use exsim_simulation::{LogicalClock, Reducer, ReducerError, ReducerStore, StateStore};
/// # use serde::{Deserialize, Serialize};
/// # use std::sync::Arc;
/// # #[derive(Clone, Serialize, Deserialize)]
/// # struct Counter(u64);
/// # impl LogicalClock for Counter { fn current_time(&self) -> u64 { 0 } }
/// # struct Add;
/// # impl Reducer for Add {
/// #     type State = Counter;
/// #     type Action = u64;
/// #     fn reduce(&self, state: &mut Counter, n: &u64) -> Result<(), ReducerError> {
/// #         state.0 += n;
/// #         Ok(())
/// #     }
/// # }
/// let mut store = ReducerStore::new(Arc::new(Add), Counter(0));
/// let observer = store.subscribe();
///
/// store.apply_action(&5).unwrap();
///
/// assert_eq!(store.get_state().0, 5);
/// assert_eq!(observer.borrow().0, 5);
/// ```
pub struct ReducerStore<R: Reducer> {
    reducer: Arc<R>,
    state: Arc<R::State>,
    observers: watch::Sender<Arc<R::State>>,
}

impl<R: Reducer> ReducerStore<R> {
    /// Creates a store holding `initial`
    pub fn new(reducer: Arc<R>, initial: R::State) -> Self {
        let state = Arc::new(initial);
        let (observers, _) = watch::channel(state.clone());
        Self {
            reducer,
            state,
            observers,
        }
    }

    /// Subscribes to every snapshot published from now on
    ///
    /// The receiver starts out holding the current snapshot.
    pub fn subscribe(&self) -> watch::Receiver<Arc<R::State>> {
        self.observers.subscribe()
    }

    /// Returns the reducer this store applies actions with
    pub fn reducer(&self) -> &Arc<R> {
        &self.reducer
    }
}

impl<R: Reducer> StateStore for ReducerStore<R> {
    type State = R::State;
    type Action = R::Action;

    fn get_state(&self) -> Arc<R::State> {
        self.state.clone()
    }

    fn set_state(&mut self, state: Arc<R::State>) {
        self.state = state;
        self.observers.send_replace(self.state.clone());
    }

    fn apply_action(&mut self, action: &R::Action) -> Result<(), ReducerError> {
        let mut draft = R::State::clone(&self.state);
        self.reducer.reduce(&mut draft, action)?;
        self.set_state(Arc::new(draft));
        Ok(())
    }
}
