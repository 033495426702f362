//! Queued borrowers: fairness, hand-off, timeouts and cancellation.

use std::collections::HashSet;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use rstest::rstest;
use tokio::sync::Semaphore;

use super::{config, pool_with, wait_for_waiters};
use crate::pool::{Pool, PoolError, Step};
use crate::test_support::FakeFactory;

#[tokio::test(start_paused = true)]
async fn concurrent_borrowers_fill_max_active_and_queue_the_rest() {
    let factory = FakeFactory::new().with_create_delay(Duration::from_millis(10));
    let pool = Pool::new(config(10, 10), factory.clone()).expect("config should validate");
    let in_use = Arc::new(parking_lot::Mutex::new(HashSet::new()));
    let concurrent = Arc::new(AtomicUsize::new(0));
    let peak = Arc::new(AtomicUsize::new(0));
    let gate = Arc::new(Semaphore::new(0));

    let mut tasks = Vec::new();
    for _ in 0..100 {
        let task_pool = pool.clone();
        let task_in_use = Arc::clone(&in_use);
        let task_concurrent = Arc::clone(&concurrent);
        let task_peak = Arc::clone(&peak);
        let task_gate = Arc::clone(&gate);
        tasks.push(tokio::spawn(async move {
            let lease = task_pool.get().await.expect("borrow should succeed");
            assert!(
                task_in_use.lock().insert(lease.id()),
                "session {} issued twice",
                lease.id()
            );
            let now = task_concurrent.fetch_add(1, Ordering::SeqCst).saturating_add(1);
            task_peak.fetch_max(now, Ordering::SeqCst);
            let _permit = task_gate.acquire().await.expect("gate is never closed");
            task_concurrent.fetch_sub(1, Ordering::SeqCst);
            task_in_use.lock().remove(&lease.id());
            lease.release().await;
        }));
    }

    while concurrent.load(Ordering::SeqCst) < 10 || pool.stats().waiting < 90 {
        tokio::time::sleep(Duration::from_millis(1)).await;
    }
    let saturated = pool.stats();
    assert_eq!(concurrent.load(Ordering::SeqCst), 10);
    assert_eq!(saturated.active, 10);
    assert_eq!(saturated.waiting, 90);

    gate.add_permits(100);
    for task in tasks {
        task.await.expect("borrower task should not panic");
    }

    assert_eq!(peak.load(Ordering::SeqCst), 10, "exactly max_active sessions were out at once");
    assert_eq!(factory.created(), 10, "queued borrowers reuse returned sessions");
    let stats = pool.stats();
    assert_eq!(stats.active, 0);
    assert_eq!(stats.waiting, 0);
    assert_eq!(stats.wait_count, 90);
}

#[tokio::test(start_paused = true)]
async fn waiters_are_served_in_arrival_order() {
    let (pool, _factory) = pool_with(config(1, 1));
    let holder = pool.get().await.expect("first borrow");
    let order = Arc::new(parking_lot::Mutex::new(Vec::new()));

    let mut tasks = Vec::new();
    for index in 0..5_usize {
        let task_pool = pool.clone();
        let task_order = Arc::clone(&order);
        tasks.push(tokio::spawn(async move {
            let lease = task_pool.get().await.expect("queued borrow should succeed");
            task_order.lock().push(index);
            lease.release().await;
        }));
        wait_for_waiters(&pool, index.saturating_add(1)).await;
    }

    holder.release().await;
    for task in tasks {
        task.await.expect("waiter task should not panic");
    }

    assert_eq!(*order.lock(), [0, 1, 2, 3, 4]);
    let stats = pool.stats();
    assert_eq!(stats.wait_count, 5);
    assert_eq!(stats.connections_created, 1, "one session served everyone");
}

#[tokio::test(start_paused = true)]
async fn saturated_pool_times_out() {
    let mut settings = config(1, 1);
    settings.wait_timeout_ms = 50;
    let (pool, _factory) = pool_with(settings);
    let _holder = pool.get().await.expect("first borrow");

    let err = pool.get().await.expect_err("pool is saturated");
    let PoolError::Timeout { waited } = err else {
        panic!("expected timeout, got {err:?}");
    };
    assert!(waited >= Duration::from_millis(50), "waited only {waited:?}");
    let stats = pool.stats();
    assert_eq!(stats.waiting, 0);
    assert_eq!(stats.wait_count, 1);
    assert!(stats.wait_duration >= Duration::from_millis(50));
}

#[tokio::test]
async fn zero_wait_timeout_fails_without_queueing() {
    let mut settings = config(1, 1);
    settings.wait_timeout_ms = 0;
    let (pool, _factory) = pool_with(settings);
    let _holder = pool.get().await.expect("first borrow");

    let err = pool.get().await.expect_err("pool is saturated");
    assert_eq!(
        err,
        PoolError::Timeout {
            waited: Duration::ZERO
        }
    );
    assert_eq!(pool.stats().wait_count, 0);
}

#[tokio::test(start_paused = true)]
async fn cancelled_borrower_leaves_the_queue() {
    let (pool, _factory) = pool_with(config(1, 1));
    let holder = pool.get().await.expect("first borrow");

    let cancelled = tokio::time::timeout(Duration::from_millis(10), pool.get()).await;
    assert!(cancelled.is_err(), "borrow should have been cancelled");
    assert_eq!(pool.stats().waiting, 0);

    holder.release().await;
    let stats = pool.stats();
    assert_eq!(stats.idle, 1, "session was not handed to a cancelled borrower");
    assert_eq!(stats.active, 0);
}

#[tokio::test(start_paused = true)]
async fn failed_creation_hands_capacity_to_a_waiter() {
    let factory = FakeFactory::new().with_create_delay(Duration::from_millis(10));
    factory.fail_next_creates(1);
    let pool = Pool::new(config(1, 1), factory.clone()).expect("config should validate");

    let first_pool = pool.clone();
    let first = tokio::spawn(async move { first_pool.get().await.map(|lease| lease.id()) });
    while factory.create_attempts() == 0 {
        tokio::task::yield_now().await;
    }
    let second_pool = pool.clone();
    let second = tokio::spawn(async move { second_pool.get().await.map(|lease| lease.id()) });
    wait_for_waiters(&pool, 1).await;

    let first_result = first.await.expect("first task should not panic");
    assert!(
        matches!(first_result, Err(PoolError::SessionCreation(_))),
        "unexpected first result: {first_result:?}"
    );
    let second_result = second.await.expect("second task should not panic");
    assert!(second_result.is_ok(), "waiter should open its own session");
    assert_eq!(factory.created(), 1);
    assert_eq!(factory.create_attempts(), 2);
}

#[tokio::test(start_paused = true)]
async fn close_wakes_queued_borrowers() {
    let (pool, _factory) = pool_with(config(1, 1));
    let _holder = pool.get().await.expect("first borrow");

    let waiter_pool = pool.clone();
    let waiter = tokio::spawn(async move { waiter_pool.get().await.map(|lease| lease.id()) });
    wait_for_waiters(&pool, 1).await;

    pool.close().await;
    let result = waiter.await.expect("waiter task should not panic");
    assert_eq!(result, Err(PoolError::Closed));
}

#[rstest]
#[case::pool_still_open(false, PoolError::Timeout { waited: Duration::from_millis(50) })]
#[case::pool_closed_meanwhile(true, PoolError::Closed)]
#[tokio::test]
async fn expired_wait_reports_why_it_ended(#[case] close_first: bool, #[case] expected: PoolError) {
    let (pool, _factory) = pool_with(config(1, 1));
    let _holder = pool.get().await.expect("first borrow");
    let Ok(Step::Wait(mut guard)) = pool.next_step(None) else {
        panic!("a saturated pool should queue the borrower");
    };
    if close_first {
        pool.close().await;
    }

    let err = pool
        .give_up(&mut guard, Duration::from_millis(50))
        .err()
        .expect("no session was handed over");

    assert_eq!(err, expected);
    assert_eq!(pool.stats().waiting, 0);
}
