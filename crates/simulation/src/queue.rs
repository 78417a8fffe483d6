//! FIFO buffer for work that has to wait for the current round trip

use std::collections::VecDeque;

/// First-in first-out queue of deferred entries
///
/// Unlike a prediction input buffer this queue never drops entries: every
/// authoritative action and every proposal it holds must eventually be
/// processed exactly once.
#[derive(Debug, Clone)]
pub struct ActionQueue<T> {
    entries: VecDeque<T>,
}

impl<T> ActionQueue<T> {
    /// Creates an empty queue
    pub fn new() -> Self {
        Self {
            entries: VecDeque::new(),
        }
    }

    /// Appends an entry at the back
    pub fn push(&mut self, entry: T) {
        self.entries.push_back(entry);
    }

    /// Removes and returns every entry queued so far, oldest first
    ///
    /// Entries pushed while the returned batch is being processed land in
    /// the (now empty) queue and are not part of the batch. This bounds a
    /// drain pass to the length the queue had when it started.
    pub fn take_batch(&mut self) -> Vec<T> {
        self.entries.drain(..).collect()
    }

    /// Returns the number of queued entries
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Checks if the queue is empty
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Drops all queued entries
    pub fn clear(&mut self) {
        self.entries.clear();
    }
}

impl<T> Default for ActionQueue<T> {
    fn default() -> Self {
        Self::new()
    }
}
