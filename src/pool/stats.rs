//! Point-in-time pool statistics.

use std::time::Duration;

/// Snapshot returned by [`Pool::stats`](super::Pool::stats).
///
/// Intended for periodic logging rather than hot-path decisions.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct PoolStats {
    /// Sessions currently lent out, including ones being health-checked.
    pub active: usize,
    /// Sessions available for reuse.
    pub idle: usize,
    /// Sum of active and idle sessions.
    pub total: usize,
    /// Borrowers currently queued.
    pub waiting: usize,
    /// Sessions opened over the pool's lifetime.
    pub connections_created: u64,
    /// Sessions closed over the pool's lifetime.
    pub connections_closed: u64,
    /// Borrowers that had to queue.
    pub wait_count: u64,
    /// Total time borrowers spent queued.
    pub wait_duration: Duration,
    /// Idle sessions discarded after a failed probe.
    pub health_check_failures: u64,
}

impl PoolStats {
    /// Mean time spent queued per waiting borrower.
    #[must_use]
    pub fn average_wait(&self) -> Duration {
        u32::try_from(self.wait_count)
            .ok()
            .and_then(|count| self.wait_duration.checked_div(count))
            .unwrap_or_default()
    }
}

#[derive(Clone, Copy, Debug, Default)]
pub(super) struct Counters {
    pub(super) created: u64,
    pub(super) closed: u64,
    pub(super) waits: u64,
    pub(super) wait_duration: Duration,
    pub(super) health_check_failures: u64,
}

impl Counters {
    pub(super) fn record_closed(&mut self, count: usize) {
        self.closed = self
            .closed
            .saturating_add(u64::try_from(count).unwrap_or(u64::MAX));
    }

    pub(super) fn record_wait(&mut self, waited: Duration) {
        self.waits = self.waits.saturating_add(1);
        self.wait_duration = self.wait_duration.saturating_add(waited);
    }
}
