//! Unit tests for the session pool.
//!
//! Split by concern: borrowing and returning, queued borrowers, health
//! probes, and lifecycle (sweep and close).

mod borrow;
mod waiting;

use super::*;
use crate::test_support::FakeFactory;

/// Settings with the background sweep disabled and probes off.
pub(super) fn config(max_idle: usize, max_active: usize) -> PoolConfig {
    PoolConfig {
        max_idle,
        max_active,
        idle_timeout_ms: 60_000,
        wait_timeout_ms: 30_000,
        test_on_borrow: false,
        test_interval_ms: 0,
        sweep_interval_ms: 0,
        probe_command: String::from(DEFAULT_PROBE_COMMAND),
    }
}

pub(super) fn pool_with(config: PoolConfig) -> (Pool<FakeFactory>, FakeFactory) {
    let factory = FakeFactory::new();
    let pool = Pool::new(config, factory.clone()).expect("config should validate");
    (pool, factory)
}

pub(super) async fn wait_for_waiters(pool: &Pool<FakeFactory>, count: usize) {
    while pool.stats().waiting < count {
        tokio::task::yield_now().await;
    }
}
