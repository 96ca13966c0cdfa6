// AFDX-lite - TDMA gateway protocol core
// Copyright (c) 2025 David Martin Venti
//
// Dual-licensed under AGPL-3.0 and Commercial License.
// See LICENSE file for details.

//! Deadline-ordered task queue with cancellable handles
//!
//! Nothing here reads the clock: callers pass `now` to [`TimerQueue::pop_due`]
//! and ask [`TimerQueue::next_deadline`] when to come back.

use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap};

/// Handle returned by [`TimerQueue::schedule`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TimerId(u64);

/// Scheduled tasks ordered by deadline, ties in scheduling order
#[derive(Debug, Clone)]
pub struct TimerQueue<T> {
    heap: BinaryHeap<Reverse<(u64, u64)>>,
    live: HashMap<u64, T>,
    next_id: u64,
}

impl<T> Default for TimerQueue<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> TimerQueue<T> {
    /// Create an empty queue
    pub fn new() -> Self {
        Self {
            heap: BinaryHeap::new(),
            live: HashMap::new(),
            next_id: 0,
        }
    }

    /// Schedule `task` to fire at `deadline`
    pub fn schedule(&mut self, deadline: u64, task: T) -> TimerId {
        let id = self.next_id;
        self.next_id += 1;
        self.heap.push(Reverse((deadline, id)));
        self.live.insert(id, task);
        TimerId(id)
    }

    /// Cancel a pending task; false if it already fired or was cancelled
    pub fn cancel(&mut self, id: TimerId) -> bool {
        let removed = self.live.remove(&id.0).is_some();
        if removed {
            self.prune();
        }
        removed
    }

    /// Remove and return the earliest task due at or before `now`
    pub fn pop_due(&mut self, now: u64) -> Option<(u64, T)> {
        self.prune();
        let Reverse((deadline, id)) = *self.heap.peek()?;
        if deadline > now {
            return None;
        }
        self.heap.pop();
        self.live.remove(&id).map(|task| (deadline, task))
    }

    /// Whether a task is still pending
    pub fn contains(&self, id: TimerId) -> bool {
        self.live.contains_key(&id.0)
    }

    /// Earliest pending deadline
    pub fn next_deadline(&self) -> Option<u64> {
        self.heap
            .iter()
            .filter(|Reverse((_, id))| self.live.contains_key(id))
            .map(|Reverse((deadline, _))| *deadline)
            .min()
    }

    /// Drop every pending task
    pub fn clear(&mut self) {
        self.heap.clear();
        self.live.clear();
    }

    /// Number of pending tasks
    pub fn len(&self) -> usize {
        self.live.len()
    }

    /// Whether nothing is pending
    pub fn is_empty(&self) -> bool {
        self.live.is_empty()
    }

    // Cancelled entries stay in the heap until they reach the top
    fn prune(&mut self) {
        while let Some(Reverse((_, id))) = self.heap.peek() {
            if self.live.contains_key(id) {
                break;
            }
            self.heap.pop();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fires_in_deadline_order() {
        let mut queue = TimerQueue::new();
        queue.schedule(30, "c");
        queue.schedule(10, "a");
        queue.schedule(20, "b");

        assert_eq!(queue.next_deadline(), Some(10));
        assert_eq!(queue.pop_due(25), Some((10, "a")));
        assert_eq!(queue.pop_due(25), Some((20, "b")));
        assert_eq!(queue.pop_due(25), None);
        assert_eq!(queue.len(), 1);
    }

    #[test]
    fn test_ties_in_scheduling_order() {
        let mut queue = TimerQueue::new();
        queue.schedule(5, 1);
        queue.schedule(5, 2);
        queue.schedule(5, 3);

        let fired: Vec<_> = std::iter::from_fn(|| queue.pop_due(5)).map(|(_, t)| t).collect();
        assert_eq!(fired, vec![1, 2, 3]);
    }

    #[test]
    fn test_cancelled_never_fires() {
        let mut queue = TimerQueue::new();
        let first = queue.schedule(1, "first");
        queue.schedule(2, "second");

        assert!(queue.cancel(first));
        assert!(!queue.cancel(first));
        assert_eq!(queue.next_deadline(), Some(2));
        assert_eq!(queue.pop_due(10), Some((2, "second")));
        assert!(queue.is_empty());
    }

    #[test]
    fn test_clear() {
        let mut queue = TimerQueue::new();
        let id = queue.schedule(1, ());
        queue.schedule(2, ());
        queue.clear();

        assert_eq!(queue.len(), 0);
        assert_eq!(queue.next_deadline(), None);
        assert_eq!(queue.pop_due(100), None);
        assert!(!queue.cancel(id));
    }
}
