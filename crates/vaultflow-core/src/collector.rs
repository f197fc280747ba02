//! Index-addressed result collection
//!
//! One slot per submitted operation, preallocated up front. Workers write a
//! batch's results straight into the slots of its source indices; each slot
//! accepts exactly one write, so no lock guards the array.

use crate::error::ItemError;
use crate::types::OperationResult;
use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::OnceLock;
use tracing::warn;

/// Aggregate counters for one run
#[derive(Debug, Default)]
pub struct RunStats {
    /// Items that succeeded
    pub succeeded: AtomicU64,
    /// Items that succeeded after at least one failed attempt of their batch
    pub retried_succeeded: AtomicU64,
    /// Items that failed permanently
    pub failed: AtomicU64,
    /// Items that never completed because the run was cancelled
    pub cancelled: AtomicU64,
    /// Batches dispatched
    pub batches: AtomicU64,
    /// Batches whose final attempt failed as a whole
    pub failed_batches: AtomicU64,
    /// HTTP attempts across all batches
    pub attempts: AtomicU64,
    /// 429 responses observed
    pub rate_limited: AtomicU64,
}

impl RunStats {
    pub fn snapshot(&self) -> RunStatsSnapshot {
        RunStatsSnapshot {
            succeeded: self.succeeded.load(Ordering::Relaxed),
            retried_succeeded: self.retried_succeeded.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
            cancelled: self.cancelled.load(Ordering::Relaxed),
            batches: self.batches.load(Ordering::Relaxed),
            failed_batches: self.failed_batches.load(Ordering::Relaxed),
            attempts: self.attempts.load(Ordering::Relaxed),
            rate_limited: self.rate_limited.load(Ordering::Relaxed),
        }
    }
}

/// Point-in-time copy of [`RunStats`]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct RunStatsSnapshot {
    pub succeeded: u64,
    pub retried_succeeded: u64,
    pub failed: u64,
    pub cancelled: u64,
    pub batches: u64,
    pub failed_batches: u64,
    pub attempts: u64,
    pub rate_limited: u64,
}

impl RunStatsSnapshot {
    pub fn total(&self) -> u64 {
        self.succeeded + self.failed + self.cancelled
    }
}

/// Write-once result slots plus run counters
#[derive(Debug)]
pub struct ResultCollector {
    slots: Vec<OnceLock<OperationResult>>,
    stats: RunStats,
}

impl ResultCollector {
    pub fn new(len: usize) -> Self {
        Self {
            slots: (0..len).map(|_| OnceLock::new()).collect(),
            stats: RunStats::default(),
        }
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    pub fn stats(&self) -> &RunStats {
        &self.stats
    }

    /// Store the result for its index.
    ///
    /// `retried` marks a success that needed more than one attempt. Returns
    /// `false` if the index is out of range or already filled.
    pub fn record(&self, result: OperationResult, retried: bool) -> bool {
        let index = result.index;
        let Some(slot) = self.slots.get(index) else {
            warn!("Dropping result for out-of-range index {}", index);
            return false;
        };

        let success = result.is_success();
        let cancelled = result
            .error()
            .is_some_and(|e| e.kind == crate::error::ErrorKind::Cancelled);
        if slot.set(result).is_err() {
            warn!("Result for index {} already recorded", index);
            return false;
        }

        if success {
            self.stats.succeeded.fetch_add(1, Ordering::Relaxed);
            if retried {
                self.stats.retried_succeeded.fetch_add(1, Ordering::Relaxed);
            }
        } else if cancelled {
            self.stats.cancelled.fetch_add(1, Ordering::Relaxed);
        } else {
            self.stats.failed.fetch_add(1, Ordering::Relaxed);
        }
        true
    }

    /// Count one dispatched batch, the attempts it took and whether it
    /// ended in a batch-level failure
    pub fn record_batch(&self, attempts: u32, rate_limited: u32, failed: bool) {
        self.stats.batches.fetch_add(1, Ordering::Relaxed);
        if failed {
            self.stats.failed_batches.fetch_add(1, Ordering::Relaxed);
        }
        self.stats
            .attempts
            .fetch_add(u64::from(attempts), Ordering::Relaxed);
        self.stats
            .rate_limited
            .fetch_add(u64::from(rate_limited), Ordering::Relaxed);
    }

    /// Index-ordered results, with never-written slots reported as
    /// `Cancelled` and counted in the returned snapshot.
    pub fn finish(&self) -> (Vec<OperationResult>, RunStatsSnapshot) {
        let mut unfilled = 0;
        let results = self
            .slots
            .iter()
            .enumerate()
            .map(|(index, slot)| {
                slot.get().cloned().unwrap_or_else(|| {
                    unfilled += 1;
                    OperationResult::failure(index, ItemError::cancelled())
                })
            })
            .collect();
        let mut stats = self.stats.snapshot();
        stats.cancelled += unfilled;
        (results, stats)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use crate::types::OperationValue;

    fn ok(index: usize) -> OperationResult {
        OperationResult::success(index, OperationValue::Single(format!("tok{}", index)))
    }

    #[test]
    fn test_out_of_order_writes_come_back_in_index_order() {
        let collector = ResultCollector::new(4);
        for index in [3, 0, 2, 1] {
            assert!(collector.record(ok(index), false));
        }
        let (results, stats) = collector.finish();
        let indices: Vec<_> = results.iter().map(|r| r.index).collect();
        assert_eq!(indices, vec![0, 1, 2, 3]);
        assert_eq!(stats.succeeded, 4);
    }

    #[test]
    fn test_slot_written_once() {
        let collector = ResultCollector::new(1);
        assert!(collector.record(ok(0), false));
        assert!(!collector.record(
            OperationResult::failure(0, ItemError::rejected("late")),
            false
        ));
        assert!(!collector.record(ok(5), false));
        let (results, stats) = collector.finish();
        assert!(results[0].is_success());
        assert_eq!(stats.failed, 0);
    }

    #[test]
    fn test_unfilled_slots_become_cancelled() {
        let collector = ResultCollector::new(3);
        collector.record(ok(1), true);
        let (results, stats) = collector.finish();
        assert_eq!(results[0].error().map(|e| e.kind), Some(ErrorKind::Cancelled));
        assert!(results[1].is_success());
        assert_eq!(results[2].error().map(|e| e.kind), Some(ErrorKind::Cancelled));
        assert_eq!(stats.cancelled, 2);
        assert_eq!(stats.retried_succeeded, 1);
        assert_eq!(stats.total(), 3);
    }

    #[test]
    fn test_batch_counters() {
        let collector = ResultCollector::new(0);
        collector.record_batch(3, 1, true);
        collector.record_batch(1, 0, false);
        let (_, stats) = collector.finish();
        assert_eq!(stats.batches, 2);
        assert_eq!(stats.failed_batches, 1);
        assert_eq!(stats.attempts, 4);
        assert_eq!(stats.rate_limited, 1);
    }
}
