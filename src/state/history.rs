//! Bounded undo/redo history.

use std::collections::VecDeque;

/// Default number of snapshots kept on each stack.
pub const DEFAULT_HISTORY_CAPACITY: usize = 100;

/// Linear undo/redo stacks of full snapshots.
///
/// Pushing a new snapshot invalidates the redo stack. Both stacks are ring
/// buffers: once `capacity` entries are held, the oldest is evicted.
#[derive(Clone, Debug)]
pub struct HistoryManager<T> {
    past: VecDeque<T>,
    future: VecDeque<T>,
    capacity: usize,
}

impl<T> HistoryManager<T> {
    /// Create a history holding at most `capacity` entries per stack.
    /// A capacity of zero disables history.
    pub fn new(capacity: usize) -> Self {
        Self {
            past: VecDeque::with_capacity(capacity.min(DEFAULT_HISTORY_CAPACITY)),
            future: VecDeque::new(),
            capacity,
        }
    }

    /// Record the state before a forward mutation.
    pub fn push(&mut self, snapshot: T) {
        if self.capacity == 0 {
            return;
        }
        push_bounded(&mut self.past, snapshot, self.capacity);
        self.future.clear();
    }

    /// Step back: returns the previous snapshot and parks `current` for redo.
    pub fn undo(&mut self, current: T) -> Option<T> {
        let previous = self.past.pop_back()?;
        push_bounded(&mut self.future, current, self.capacity);
        Some(previous)
    }

    /// Step forward: returns the next snapshot and parks `current` for undo.
    pub fn redo(&mut self, current: T) -> Option<T> {
        let next = self.future.pop_back()?;
        push_bounded(&mut self.past, current, self.capacity);
        Some(next)
    }

    pub fn can_undo(&self) -> bool {
        !self.past.is_empty()
    }

    pub fn can_redo(&self) -> bool {
        !self.future.is_empty()
    }

    pub fn clear(&mut self) {
        self.past.clear();
        self.future.clear();
    }

    pub fn past_len(&self) -> usize {
        self.past.len()
    }

    pub fn future_len(&self) -> usize {
        self.future.len()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

impl<T> Default for HistoryManager<T> {
    fn default() -> Self {
        Self::new(DEFAULT_HISTORY_CAPACITY)
    }
}

fn push_bounded<T>(stack: &mut VecDeque<T>, item: T, capacity: usize) {
    if capacity == 0 {
        return;
    }
    while stack.len() >= capacity {
        stack.pop_front();
    }
    stack.push_back(item);
}
