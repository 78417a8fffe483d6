//! Deterministic replay for time travel
//!
//! A [`ReplayLog`] is an initial snapshot plus every action committed since,
//! in commit order. Any intermediate state can be rebuilt by replaying a
//! prefix of the log through the same reducer that produced it.

use std::sync::Arc;

use exsim_protocol::{ExerciseHistory, LoggedAction};

use crate::{LogicalClock, Reducer, ReducerError};

/// Initial snapshot plus ordered action log
pub struct ReplayLog<R: Reducer> {
    reducer: Arc<R>,
    initial_state: Arc<R::State>,
    actions: Vec<LoggedAction<R::Action>>,
}

impl<R: Reducer> ReplayLog<R> {
    /// Creates an empty log anchored at `initial_state`
    pub fn new(reducer: Arc<R>, initial_state: Arc<R::State>) -> Self {
        Self {
            reducer,
            initial_state,
            actions: Vec::new(),
        }
    }

    /// Rebuilds a log from a history received over the wire
    pub fn from_history(reducer: Arc<R>, history: ExerciseHistory<R::State, R::Action>) -> Self {
        Self {
            reducer,
            initial_state: Arc::new(history.initial_state),
            actions: history.actions,
        }
    }

    /// Appends a committed action
    pub fn push(&mut self, action: R::Action, timestamp: u64) {
        self.actions.push(LoggedAction { action, timestamp });
    }

    /// Rebuilds the state at exercise time `time`
    ///
    /// Actions are applied in log order, stopping right after the first one
    /// that moves the clock past `time`. That action is kept: the result is
    /// the state at `time` or one action beyond it.
    pub fn state_at(&self, time: u64) -> Result<Arc<R::State>, ReducerError> {
        if self.initial_state.current_time() > time {
            return Ok(self.initial_state.clone());
        }

        let mut state = R::State::clone(&self.initial_state);
        for logged in &self.actions {
            self.reducer.reduce(&mut state, &logged.action)?;
            if state.current_time() > time {
                break;
            }
        }

        Ok(Arc::new(state))
    }

    /// Rebuilds the state after every logged action
    pub fn latest_state(&self) -> Result<Arc<R::State>, ReducerError> {
        let mut state = R::State::clone(&self.initial_state);
        for logged in &self.actions {
            self.reducer.reduce(&mut state, &logged.action)?;
        }
        Ok(Arc::new(state))
    }

    /// Returns the exercise time covered by the log
    ///
    /// Starts at the initial snapshot's clock and ends at the latest
    /// recorded timestamp.
    pub fn time_range(&self) -> (u64, u64) {
        let start = self.initial_state.current_time();
        let end = self
            .actions
            .iter()
            .map(|logged| logged.timestamp)
            .max()
            .map_or(start, |end| end.max(start));
        (start, end)
    }

    /// Snapshot the log starts from
    pub fn initial_state(&self) -> &Arc<R::State> {
        &self.initial_state
    }

    /// Logged actions in commit order
    pub fn actions(&self) -> &[LoggedAction<R::Action>] {
        &self.actions
    }

    /// Number of logged actions
    pub fn len(&self) -> usize {
        self.actions.len()
    }

    /// Checks if no action has been logged
    pub fn is_empty(&self) -> bool {
        self.actions.is_empty()
    }

    /// Copies the log into its wire form
    pub fn to_history(&self) -> ExerciseHistory<R::State, R::Action> {
        ExerciseHistory {
            initial_state: R::State::clone(&self.initial_state),
            actions: self.actions.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{Edit, Word, WordReducer};

    /// "a" at 0, tick to 10, "b", tick to 20, "c"
    fn sample_log() -> ReplayLog<WordReducer> {
        let mut log = ReplayLog::new(Arc::new(WordReducer), Arc::new(Word::new("")));
        log.push(Edit::Append('a'), 0);
        log.push(Edit::Tick(10), 10);
        log.push(Edit::Append('b'), 10);
        log.push(Edit::Tick(10), 20);
        log.push(Edit::Append('c'), 20);
        log
    }

    #[test]
    fn test_state_at_stops_after_first_action_past_target() {
        let log = sample_log();

        // The tick to 10 overshoots 5 and is kept; "b" is not applied
        let state = log.state_at(5).unwrap();
        assert_eq!(state.word, "a");
        assert_eq!(state.time, 10);
    }

    #[test]
    fn test_state_at_exact_time_includes_actions_at_that_time() {
        let log = sample_log();

        let state = log.state_at(10).unwrap();
        assert_eq!(state.word, "ab");
        assert_eq!(state.time, 20);
    }

    #[test]
    fn test_state_at_end_replays_everything() {
        let log = sample_log();

        let state = log.state_at(u64::MAX).unwrap();
        assert_eq!(state.word, "abc");
        assert_eq!(state, log.latest_state().unwrap());
    }

    #[test]
    fn test_state_before_initial_clock_is_initial_state() {
        let mut initial = Word::new("start");
        initial.time = 100;
        let mut log = ReplayLog::new(Arc::new(WordReducer), Arc::new(initial));
        log.push(Edit::Append('x'), 100);

        let state = log.state_at(50).unwrap();
        assert!(Arc::ptr_eq(&state, log.initial_state()));
    }

    #[test]
    fn test_replay_is_deterministic() {
        let log = sample_log();

        assert_eq!(log.state_at(15).unwrap(), log.state_at(15).unwrap());
    }

    #[test]
    fn test_replay_surfaces_reducer_errors() {
        let mut log = ReplayLog::new(Arc::new(WordReducer), Arc::new(Word::new("")));
        log.push(Edit::Pop('q'), 0);

        assert!(log.state_at(0).is_err());
    }

    #[test]
    fn test_time_range() {
        assert_eq!(sample_log().time_range(), (0, 20));

        let empty = ReplayLog::new(Arc::new(WordReducer), Arc::new(Word::new("")));
        assert_eq!(empty.time_range(), (0, 0));
        assert!(empty.is_empty());
    }

    #[test]
    fn test_history_round_trip() {
        let log = sample_log();

        let rebuilt = ReplayLog::from_history(Arc::new(WordReducer), log.to_history());

        assert_eq!(rebuilt.len(), 5);
        assert_eq!(rebuilt.state_at(10).unwrap(), log.state_at(10).unwrap());
    }
}
