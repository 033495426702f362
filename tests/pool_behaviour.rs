//! End-to-end behaviour of pooled execution through the public API.

use std::time::Duration;

use rstest::{fixture, rstest};
use shellpool::batch::{BATCH_SENTINEL, BatchBuilder, OutputFormat};
use shellpool::encoding::{decode, quote};
use shellpool::pool::DEFAULT_PROBE_COMMAND;
use shellpool::test_support::FakeFactory;
use shellpool::{CommandOutput, ExecError, Executor, Pool, PoolConfig};

#[fixture]
fn config() -> PoolConfig {
    PoolConfig {
        max_idle: 2,
        max_active: 2,
        idle_timeout_ms: 60_000,
        wait_timeout_ms: 5_000,
        test_on_borrow: true,
        test_interval_ms: 0,
        sweep_interval_ms: 0,
        probe_command: String::from(DEFAULT_PROBE_COMMAND),
    }
}

fn sent_script(factory: &FakeFactory, index: usize) -> String {
    let commands = factory.commands();
    let (_, command) = commands.get(index).expect("command should be recorded");
    let encoded = command
        .rsplit(' ')
        .next()
        .expect("encoded payload should be the last word");
    decode(encoded).expect("payload should decode")
}

#[rstest]
#[tokio::test]
async fn batch_round_trip_reuses_one_session(config: PoolConfig) {
    let factory = FakeFactory::new();
    let pool = Pool::new(config, factory.clone()).expect("pool");
    let executor = Executor::new().with_command_timeout(Duration::from_secs(5));

    let script = BatchBuilder::new()
        .output_format(OutputFormat::Separator)
        .add(format!("Test-Path {}", quote("C:\\app")))
        .add("hostname")
        .build();
    factory.push_output(CommandOutput {
        code: Some(0),
        stdout: format!("True\r\n{BATCH_SENTINEL}\r\nWIN01\r\n"),
        stderr: String::new(),
    });

    let lease = pool.get().await.expect("first borrow");
    let result = executor
        .run_batch(&*lease, &script)
        .await
        .expect("batch should parse");
    lease.release().await;

    assert_eq!(result.get_string(0).expect("index 0"), "True");
    assert_eq!(result.get_string(1).expect("index 1"), "WIN01");
    assert!(sent_script(&factory, 0).contains("Test-Path 'C:\\app'"));

    let again = pool.get().await.expect("second borrow");
    assert_eq!(again.serial(), 1, "idle session should be reused");
    again.release().await;

    let stats = pool.stats();
    assert_eq!(stats.connections_created, 1);
    assert_eq!(stats.idle, 1);
    assert_eq!(stats.active, 0);
    assert_eq!(
        factory.commands().last().map(|(_, command)| command.as_str()),
        Some(DEFAULT_PROBE_COMMAND),
        "reused session should be probed"
    );

    pool.close().await;
    assert_eq!(factory.closed(), 1);
}

#[rstest]
#[tokio::test]
async fn failed_command_keeps_session_healthy(config: PoolConfig) {
    let factory = FakeFactory::new();
    let pool = Pool::new(config, factory.clone()).expect("pool");
    factory.push_output(CommandOutput {
        code: Some(1),
        stdout: String::new(),
        stderr: String::from("Get-Item : Cannot find path 'C:\\nope' because it does not exist."),
    });

    let lease = pool.get().await.expect("borrow");
    let err = Executor::new()
        .run(&*lease, "Get-Item C:\\nope")
        .await
        .expect_err("command fails remotely");
    assert!(!err.is_transport_level());
    let ExecError::Failed { ref message, .. } = err else {
        panic!("expected Failed, got {err:?}");
    };
    assert_eq!(
        message,
        "Cannot find path 'C:\\nope' because it does not exist."
    );
    lease.release().await;

    assert_eq!(pool.stats().idle, 1);
    pool.close().await;
}
