//! Receiver-side duplicate suppression.
//!
//! The wire may deliver a message more than once (a replayed buffer entry
//! whose first attempt actually landed, a spool file copied twice). Receivers
//! remember recently seen `msg_id`s in a bounded FIFO set.

use std::collections::{HashSet, VecDeque};
use std::sync::Mutex;

pub const DEFAULT_DEDUP_CAPACITY: usize = 10_000;

pub struct MessageDeduplicator {
    capacity: usize,
    inner: Mutex<Seen>,
}

#[derive(Default)]
struct Seen {
    order: VecDeque<String>,
    ids: HashSet<String>,
}

impl MessageDeduplicator {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            inner: Mutex::new(Seen::default()),
        }
    }

    /// Returns `true` the first time an id is seen.
    pub fn check_and_insert(&self, msg_id: &str) -> bool {
        let mut seen = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        if seen.ids.contains(msg_id) {
            return false;
        }
        if seen.order.len() == self.capacity {
            if let Some(oldest) = seen.order.pop_front() {
                seen.ids.remove(&oldest);
            }
        }
        seen.order.push_back(msg_id.to_string());
        seen.ids.insert(msg_id.to_string());
        true
    }

    pub fn len(&self) -> usize {
        self.inner.lock().unwrap_or_else(|e| e.into_inner()).order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for MessageDeduplicator {
    fn default() -> Self {
        Self::new(DEFAULT_DEDUP_CAPACITY)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_duplicates_rejected_and_oldest_evicted() {
        let dedup = MessageDeduplicator::new(2);
        assert!(dedup.check_and_insert("a"));
        assert!(!dedup.check_and_insert("a"));
        assert!(dedup.check_and_insert("b"));
        assert!(dedup.check_and_insert("c"));
        assert_eq!(dedup.len(), 2);
        // "a" fell out of the window
        assert!(dedup.check_and_insert("a"));
        assert!(!dedup.check_and_insert("c"));
    }
}
