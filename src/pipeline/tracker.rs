//! Per-transaction commit milestones.

use std::time::Duration;

use parking_lot::{Condvar, Mutex};

#[derive(Debug, Clone, Copy)]
struct Watermarks {
    soft: i64,
    hard: i64,
}

/// Tracks the soft-commit and hard-commit watermarks.
///
/// Both watermarks are monotonic and `hard <= soft` always holds under
/// a consistent read: advancing the hard watermark drags the soft one
/// along. Waiters are parked on a single condvar and every advance
/// wakes them all; each waiter re-checks its own transaction id, so no
/// waiter can be skipped.
pub struct TransactionTracker {
    state: Mutex<Watermarks>,
    advanced: Condvar,
}

impl TransactionTracker {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(Watermarks { soft: 0, hard: 0 }),
            advanced: Condvar::new(),
        }
    }

    /// The highest transaction id visible to readers.
    pub fn soft_commit_watermark(&self) -> i64 {
        self.state.lock().soft
    }

    /// The highest transaction id durable on disk.
    pub fn hard_commit_watermark(&self) -> i64 {
        self.state.lock().hard
    }

    /// Marks everything up to `transaction_id` as visible in memory.
    pub fn advance_soft(&self, transaction_id: i64) {
        let mut state = self.state.lock();
        if transaction_id > state.soft {
            state.soft = transaction_id;
            self.advanced.notify_all();
        }
    }

    /// Marks everything up to `transaction_id` as durable on disk.
    pub fn advance_hard(&self, transaction_id: i64) {
        let mut state = self.state.lock();
        let mut changed = false;
        if transaction_id > state.soft {
            state.soft = transaction_id;
            changed = true;
        }
        if transaction_id > state.hard {
            state.hard = transaction_id;
            changed = true;
        }
        if changed {
            self.advanced.notify_all();
        }
    }

    /// Blocks until `transaction_id` is visible to readers.
    pub fn wait_for_soft_commit(&self, transaction_id: i64) {
        let mut state = self.state.lock();
        while state.soft < transaction_id {
            self.advanced.wait(&mut state);
        }
    }

    /// Blocks until `transaction_id` is durable on disk.
    pub fn wait_for_hard_commit(&self, transaction_id: i64) {
        let mut state = self.state.lock();
        while state.hard < transaction_id {
            self.advanced.wait(&mut state);
        }
    }

    /// Bounded wait variant; returns whether the milestone was reached.
    pub fn wait_for_hard_commit_timeout(&self, transaction_id: i64, timeout: Duration) -> bool {
        let deadline = std::time::Instant::now() + timeout;
        let mut state = self.state.lock();
        while state.hard < transaction_id {
            if self
                .advanced
                .wait_until(&mut state, deadline)
                .timed_out()
            {
                return state.hard >= transaction_id;
            }
        }
        true
    }
}

impl Default for TransactionTracker {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use std::{sync::Arc, thread, time::Duration};

    use super::*;

    #[test]
    fn hard_commit_implies_soft_commit() {
        let tracker = TransactionTracker::new();
        tracker.advance_hard(7);
        assert_eq!(tracker.soft_commit_watermark(), 7);
        assert_eq!(tracker.hard_commit_watermark(), 7);

        tracker.advance_soft(9);
        assert_eq!(tracker.soft_commit_watermark(), 9);
        assert_eq!(tracker.hard_commit_watermark(), 7);
    }

    #[test]
    fn watermarks_never_regress() {
        let tracker = TransactionTracker::new();
        tracker.advance_hard(10);
        tracker.advance_soft(5);
        tracker.advance_hard(3);
        assert_eq!(tracker.soft_commit_watermark(), 10);
        assert_eq!(tracker.hard_commit_watermark(), 10);
    }

    #[test]
    fn every_waiter_is_released() {
        let tracker = Arc::new(TransactionTracker::new());
        let mut handles = Vec::new();
        for transaction_id in 1..=4 {
            let tracker = Arc::clone(&tracker);
            handles.push(thread::spawn(move || {
                tracker.wait_for_soft_commit(transaction_id);
            }));
        }
        thread::sleep(Duration::from_millis(20));
        tracker.advance_soft(4);
        for handle in handles {
            handle.join().expect("waiter must be released");
        }
    }

    #[test]
    fn timeout_variant_reports_misses() {
        let tracker = TransactionTracker::new();
        assert!(!tracker.wait_for_hard_commit_timeout(1, Duration::from_millis(10)));
        tracker.advance_hard(1);
        assert!(tracker.wait_for_hard_commit_timeout(1, Duration::from_millis(10)));
    }
}
