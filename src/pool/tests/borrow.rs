//! Borrowing, returning and idle-stack behaviour.

use super::{config, pool_with};
use crate::pool::{PoolConfigError, PoolError};
use crate::session::{Session, SessionError};

#[tokio::test]
async fn new_session_is_counted_as_active() {
    let (pool, factory) = pool_with(config(2, 2));
    let lease = pool.get().await.expect("session should be created");

    let stats = pool.stats();
    assert_eq!(stats.active, 1);
    assert_eq!(stats.idle, 0);
    assert_eq!(stats.total, 1);
    assert_eq!(stats.connections_created, 1);
    assert_eq!(factory.created(), 1);
    drop(lease);
}

#[tokio::test]
async fn lease_dereferences_to_the_session() {
    let (pool, factory) = pool_with(config(2, 2));
    let lease = pool.get().await.expect("session should be created");

    let output = lease.run("echo hi").await.expect("command should run");
    assert!(output.is_success());
    assert_eq!(factory.commands(), [(1, String::from("echo hi"))]);
    lease.release().await;
}

#[tokio::test]
async fn idle_sessions_are_reused_most_recent_first() {
    let (pool, factory) = pool_with(config(2, 2));
    let first = pool.get().await.expect("first session");
    let second = pool.get().await.expect("second session");
    assert_eq!((first.serial(), second.serial()), (1, 2));

    first.release().await;
    second.release().await;
    let reused = pool.get().await.expect("idle session");

    assert_eq!(reused.serial(), 2, "most recently returned session is reused");
    assert_eq!(factory.created(), 2);
    assert_eq!(pool.stats().idle, 1);
}

#[tokio::test]
async fn dropping_a_lease_returns_the_session() {
    let (pool, factory) = pool_with(config(2, 2));
    {
        let _lease = pool.get().await.expect("session");
    }

    let stats = pool.stats();
    assert_eq!(stats.active, 0);
    assert_eq!(stats.idle, 1);
    assert_eq!(factory.closed(), 0);
}

#[tokio::test]
async fn returns_beyond_max_idle_are_closed() {
    let (pool, factory) = pool_with(config(1, 3));
    let first = pool.get().await.expect("first");
    let second = pool.get().await.expect("second");

    first.release().await;
    second.release().await;

    let stats = pool.stats();
    assert_eq!(stats.idle, 1);
    assert_eq!(stats.connections_closed, 1);
    assert_eq!(factory.closed(), 1);
}

#[tokio::test]
async fn discard_closes_the_session_and_frees_capacity() {
    let (pool, factory) = pool_with(config(1, 1));
    let lease = pool.get().await.expect("session");
    lease.discard().await;

    let stats = pool.stats();
    assert_eq!(stats.active, 0);
    assert_eq!(stats.idle, 0);
    assert_eq!(stats.connections_closed, 1);
    assert_eq!(factory.closed(), 1);

    let replacement = pool.get().await.expect("capacity was freed");
    assert_eq!(replacement.serial(), 2);
}

#[tokio::test]
async fn failed_creation_leaves_capacity_untouched() {
    let (pool, factory) = pool_with(config(1, 1));
    factory.fail_next_creates(1);

    let err = pool.get().await.expect_err("creation should fail");
    assert!(
        matches!(err, PoolError::SessionCreation(SessionError::Connect { .. })),
        "unexpected error: {err}"
    );
    let stats = pool.stats();
    assert_eq!(stats.active, 0);
    assert_eq!(stats.connections_created, 0);

    let lease = pool.get().await.expect("next attempt should succeed");
    assert_eq!(lease.serial(), 1);
}

#[tokio::test]
async fn zero_max_active_is_unbounded() {
    let (pool, factory) = pool_with(config(2, 0));
    let mut leases = Vec::new();
    for _ in 0..20 {
        leases.push(pool.get().await.expect("unbounded pool never waits"));
    }
    assert_eq!(pool.stats().active, 20);
    assert_eq!(factory.created(), 20);
}

#[test]
fn inconsistent_config_is_rejected() {
    let factory = crate::test_support::FakeFactory::new();
    let err = crate::pool::Pool::new(config(5, 2), factory).expect_err("max_idle > max_active");
    assert!(
        matches!(
            err,
            PoolError::Config(PoolConfigError::InvalidConfig { ref field, .. }) if field == "max_idle"
        ),
        "unexpected error: {err}"
    );
}
