//! Timing utilities for coalescing and grace periods.
//!
//! All timers read `tokio::time::Instant` so tests can drive them with a
//! paused clock. Nothing here spawns tasks; the engine loop polls the
//! structures against the current instant and sleeps until the earliest
//! deadline.

use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashSet};
use std::hash::Hash;
use std::time::Duration;
use tokio::time::Instant;

/// A coalescing window that opens on the first request and becomes due
/// once its duration has elapsed. Requests arriving while open do not
/// extend it.
#[derive(Debug, Clone)]
pub struct CoalescingWindow {
    duration: Duration,
    opened_at: Option<Instant>,
}

impl CoalescingWindow {
    /// Create a closed window of the given duration.
    pub fn new(duration: Duration) -> Self {
        Self {
            duration,
            opened_at: None,
        }
    }

    /// Open the window if it is not already open.
    pub fn open(&mut self, now: Instant) {
        if self.opened_at.is_none() {
            self.opened_at = Some(now);
        }
    }

    /// Whether the window is currently open.
    pub fn is_open(&self) -> bool {
        self.opened_at.is_some()
    }

    /// The instant at which the window becomes due.
    pub fn deadline(&self) -> Option<Instant> {
        self.opened_at.map(|at| at + self.duration)
    }

    /// Whether the window is open and its duration has elapsed.
    pub fn is_due(&self, now: Instant) -> bool {
        self.deadline().is_some_and(|deadline| now >= deadline)
    }

    /// Close the window.
    pub fn close(&mut self) {
        self.opened_at = None;
    }

    /// The configured duration.
    pub fn duration(&self) -> Duration {
        self.duration
    }
}

/// Min-heap of keyed deadlines. A key can be cancelled; cancelled entries
/// are skipped lazily when popped.
#[derive(Debug)]
pub struct DeadlineQueue<K: Ord + Hash + Clone> {
    heap: BinaryHeap<Reverse<(Instant, K)>>,
    cancelled: HashSet<K>,
}

impl<K: Ord + Hash + Clone> Default for DeadlineQueue<K> {
    fn default() -> Self {
        Self {
            heap: BinaryHeap::new(),
            cancelled: HashSet::new(),
        }
    }
}

impl<K: Ord + Hash + Clone> DeadlineQueue<K> {
    /// Create an empty queue.
    pub fn new() -> Self {
        Self::default()
    }

    /// Schedule `key` to fire at `deadline`.
    pub fn schedule(&mut self, key: K, deadline: Instant) {
        self.cancelled.remove(&key);
        self.heap.push(Reverse((deadline, key)));
    }

    /// Cancel any pending deadline for `key`.
    pub fn cancel(&mut self, key: &K) {
        if self.heap.iter().any(|Reverse((_, k))| k == key) {
            self.cancelled.insert(key.clone());
        }
    }

    /// Earliest pending deadline.
    pub fn next_deadline(&self) -> Option<Instant> {
        self.heap.peek().map(|Reverse((at, _))| *at)
    }

    /// Pop every key whose deadline is at or before `now`.
    pub fn pop_due(&mut self, now: Instant) -> Vec<K> {
        let mut due = Vec::new();
        while let Some(at) = self.next_deadline() {
            if at > now {
                break;
            }
            if let Some(Reverse((_, key))) = self.heap.pop() {
                if !self.cancelled.remove(&key) {
                    due.push(key);
                }
            }
        }
        due
    }

    /// Number of scheduled entries, including cancelled ones not yet popped.
    pub fn len(&self) -> usize {
        self.heap.len()
    }

    /// Whether nothing is scheduled.
    pub fn is_empty(&self) -> bool {
        self.heap.is_empty()
    }
}

/// Earliest of two optional instants.
pub fn earliest(a: Option<Instant>, b: Option<Instant>) -> Option<Instant> {
    match (a, b) {
        (Some(a), Some(b)) => Some(a.min(b)),
        (a, None) => a,
        (None, b) => b,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_window_opens_once() {
        let start = Instant::now();
        let mut window = CoalescingWindow::new(Duration::from_millis(500));
        assert!(!window.is_open());
        assert!(!window.is_due(start));

        window.open(start);
        window.open(start + Duration::from_millis(400));
        assert_eq!(window.deadline(), Some(start + Duration::from_millis(500)));
        assert!(!window.is_due(start + Duration::from_millis(499)));
        assert!(window.is_due(start + Duration::from_millis(500)));

        window.close();
        assert!(!window.is_open());
    }

    #[test]
    fn test_deadline_queue_order_and_cancel() {
        let start = Instant::now();
        let mut queue = DeadlineQueue::new();
        queue.schedule(3_i64, start + Duration::from_millis(30));
        queue.schedule(1_i64, start + Duration::from_millis(10));
        queue.schedule(2_i64, start + Duration::from_millis(20));
        queue.cancel(&2);

        assert_eq!(queue.next_deadline(), Some(start + Duration::from_millis(10)));
        assert_eq!(queue.pop_due(start + Duration::from_millis(25)), vec![1]);
        assert_eq!(queue.pop_due(start + Duration::from_millis(30)), vec![3]);
        assert!(queue.is_empty());
    }

    #[test]
    fn test_earliest() {
        let now = Instant::now();
        let later = now + Duration::from_secs(1);
        assert_eq!(earliest(Some(later), Some(now)), Some(now));
        assert_eq!(earliest(None, Some(now)), Some(now));
        assert_eq!(earliest(None, None), None);
    }
}
