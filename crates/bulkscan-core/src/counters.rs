//! In-memory, monitor-side job counters.

use crate::status::{JobStatus, COUNTED_STATUSES};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};

/// Map from every status except `TO_BE_EXECUTED` to an atomic non-negative counter.
///
/// Owned by the progress monitor; the done-notification handler increments it concurrently.
pub struct BulkScanJobCounters {
    counts: HashMap<JobStatus, AtomicU64>,
}

impl BulkScanJobCounters {
    pub fn new() -> Self {
        let counts = COUNTED_STATUSES
            .iter()
            .map(|&s| (s, AtomicU64::new(0)))
            .collect();
        Self { counts }
    }

    /// Increment the counter for `status`, returning the new total across all statuses.
    ///
    /// Panics if `status` is `TO_BE_EXECUTED` — that status is never counted (programming error).
    pub fn increment(&self, status: JobStatus) -> u64 {
        let counter = self
            .counts
            .get(&status)
            .expect("TO_BE_EXECUTED is never counted");
        counter.fetch_add(1, Ordering::SeqCst);
        self.total()
    }

    pub fn get(&self, status: JobStatus) -> u64 {
        self.counts
            .get(&status)
            .map(|c| c.load(Ordering::SeqCst))
            .unwrap_or(0)
    }

    fn total(&self) -> u64 {
        self.counts.values().map(|c| c.load(Ordering::SeqCst)).sum()
    }

    /// An immutable point-in-time copy. Each entry is read independently, so entries may reflect
    /// slightly different instants under concurrent increments.
    pub fn snapshot(&self) -> HashMap<JobStatus, u64> {
        self.counts
            .iter()
            .map(|(&status, count)| (status, count.load(Ordering::SeqCst)))
            .collect()
    }
}

impl Default for BulkScanJobCounters {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn increment_returns_running_total_across_statuses() {
        let counters = BulkScanJobCounters::new();
        assert_eq!(counters.increment(JobStatus::Success), 1);
        assert_eq!(counters.increment(JobStatus::Error), 2);
        assert_eq!(counters.increment(JobStatus::Success), 3);
        assert_eq!(counters.get(JobStatus::Success), 2);
        assert_eq!(counters.get(JobStatus::Error), 1);
    }

    #[test]
    #[should_panic]
    fn increment_to_be_executed_panics() {
        let counters = BulkScanJobCounters::new();
        counters.increment(JobStatus::ToBeExecuted);
    }

    #[test]
    fn snapshot_is_monotone_non_decreasing_per_entry() {
        let counters = BulkScanJobCounters::new();
        counters.increment(JobStatus::Success);
        let first = counters.snapshot();
        counters.increment(JobStatus::Success);
        let second = counters.snapshot();
        assert!(second[&JobStatus::Success] >= first[&JobStatus::Success]);
    }
}
