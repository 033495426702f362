//! Unit tests for command and batch execution.

use std::time::Duration;

use rstest::{fixture, rstest};

use super::*;
use crate::batch::{BATCH_SENTINEL, BatchBuilder, BatchValue};
use crate::session::SessionFactory;
use crate::test_support::{FakeFactory, FakeSession};

const NOT_FOUND_ENVELOPE: &str = concat!(
    "#< CLIXML\r\n",
    "<Objs Version=\"1.1.0.1\" xmlns=\"http://schemas.microsoft.com/powershell/2004/04\">",
    "<S S=\"Error\">Get-Item : Cannot find path 'C:\\missing' because it does not exist._x000D__x000A_</S>",
    "<S S=\"Error\">At line:1 char:1_x000D__x000A_</S>",
    "<S S=\"Error\">+ Get-Item C:\\missing_x000D__x000A_</S>",
    "</Objs>"
);

#[fixture]
fn factory() -> FakeFactory {
    FakeFactory::new()
}

async fn session(factory: &FakeFactory) -> FakeSession {
    factory.create().await.expect("fake session")
}

fn output(code: i32, stdout: &str, stderr: &str) -> CommandOutput {
    CommandOutput {
        code: Some(code),
        stdout: stdout.to_owned(),
        stderr: stderr.to_owned(),
    }
}

#[rstest]
#[tokio::test]
async fn run_sends_an_encoded_invocation(factory: FakeFactory) {
    let session = session(&factory).await;
    factory.push_output(output(0, "Running\r\n", ""));

    let result = Executor::new()
        .run(&session, "(Get-Service 'W32Time').Status")
        .await
        .expect("command should succeed");

    assert_eq!(result.stdout, "Running\r\n");
    let commands = factory.commands();
    let (_, sent) = commands.first().expect("one command sent");
    assert_eq!(sent, &encoded_command("(Get-Service 'W32Time').Status"));
}

#[rstest]
#[tokio::test]
async fn successful_run_keeps_envelopes_without_errors(factory: FakeFactory) {
    let session = session(&factory).await;
    factory.push_output(output(
        0,
        "done",
        "#< CLIXML\r\n<Objs Version=\"1.1.0.1\"><Obj S=\"progress\" RefId=\"0\"/></Objs>",
    ));

    let result = Executor::new()
        .run(&session, "Install-WindowsFeature Web-Server")
        .await
        .expect("command should succeed");

    assert_eq!(result.stdout, "done");
    assert!(
        result.stderr.contains("CLIXML"),
        "an envelope without error streams is returned unchanged"
    );
}

#[rstest]
#[tokio::test]
async fn failure_surfaces_the_primary_error(factory: FakeFactory) {
    let session = session(&factory).await;
    factory.push_output(output(1, "", NOT_FOUND_ENVELOPE));

    let err = Executor::new()
        .run(&session, "Get-Item C:\\missing")
        .await
        .expect_err("command should fail");

    let ExecError::Failed {
        ref command,
        exit_code,
        ref stderr,
        ref detail,
        ref message,
        ..
    } = err
    else {
        panic!("expected Failed, got {err:?}");
    };
    assert_eq!(command, "Get-Item C:\\missing");
    assert_eq!(exit_code, Some(1));
    assert_eq!(stderr, NOT_FOUND_ENVELOPE);
    assert_eq!(
        detail,
        "Get-Item : Cannot find path 'C:\\missing' because it does not exist."
    );
    assert_eq!(message, "Cannot find path 'C:\\missing' because it does not exist.");
    assert_eq!(
        err.to_string(),
        "command `Get-Item C:\\missing` failed with status 1: Cannot find path 'C:\\missing' because it does not exist."
    );
}

#[rstest]
#[tokio::test]
async fn failure_without_diagnostics_names_the_status(factory: FakeFactory) {
    let session = session(&factory).await;
    factory.push_output(output(3, "", "  \r\n"));

    let err = Executor::new()
        .run(&session, "exit 3")
        .await
        .expect_err("command should fail");

    assert!(
        matches!(err, ExecError::Failed { ref message, .. } if message == "exited with status 3"),
        "unexpected error: {err:?}"
    );
}

#[rstest]
#[tokio::test]
async fn transport_errors_are_not_retried(factory: FakeFactory) {
    let session = session(&factory).await;
    factory.push_error(SessionError::Io(String::from("broken pipe")));

    let err = Executor::new()
        .run(&session, "hostname")
        .await
        .expect_err("transport failed");

    assert_eq!(
        err,
        ExecError::Transport {
            command: String::from("hostname"),
            source: SessionError::Io(String::from("broken pipe")),
        }
    );
    assert!(err.is_transport_level());
    assert_eq!(factory.commands().len(), 1);
}

#[tokio::test(start_paused = true)]
async fn slow_commands_time_out() {
    let factory = FakeFactory::new().with_run_delay(Duration::from_secs(5));
    let session = session(&factory).await;

    let err = Executor::new()
        .with_command_timeout(Duration::from_secs(1))
        .run(&session, "Start-Sleep 5")
        .await
        .expect_err("command should time out");

    assert_eq!(
        err,
        ExecError::TimedOut {
            command: String::from("Start-Sleep 5"),
            timeout: Duration::from_secs(1),
        }
    );
}

#[rstest]
#[tokio::test]
async fn long_commands_are_truncated_in_errors(factory: FakeFactory) {
    let session = session(&factory).await;
    factory.push_error(SessionError::Closed);
    let command = format!("Write-Output '{}'", "x".repeat(400));

    let err = Executor::new()
        .run(&session, &command)
        .await
        .expect_err("session closed");

    let ExecError::Transport { command: shown, .. } = err else {
        panic!("expected Transport, got {err:?}");
    };
    assert_eq!(shown.chars().count(), MAX_COMMAND_DISPLAY + 3);
    assert!(shown.ends_with("..."));
}

#[rstest]
#[tokio::test]
async fn empty_batch_does_not_touch_the_session(factory: FakeFactory) {
    let session = session(&factory).await;
    let batch = BatchBuilder::new().output_format(OutputFormat::Array).build();

    let result = Executor::new()
        .run_batch(&session, &batch)
        .await
        .expect("empty batch is a no-op");

    assert!(result.is_empty());
    assert_eq!(result.format(), OutputFormat::Array);
    assert!(factory.commands().is_empty());
}

#[rstest]
#[tokio::test]
async fn separator_batch_decodes_despite_a_failing_command(factory: FakeFactory) {
    let session = session(&factory).await;
    let batch = BatchBuilder::new()
        .output_format(OutputFormat::Separator)
        .add("Test-Path C:\\app")
        .add("Get-Item C:\\missing")
        .add("hostname")
        .build();
    factory.push_output(output(
        1,
        &format!("True\r\n{BATCH_SENTINEL}\r\n{BATCH_SENTINEL}\r\nWIN01\r\n"),
        NOT_FOUND_ENVELOPE,
    ));

    let result = Executor::new()
        .run_batch(&session, &batch)
        .await
        .expect("separator batch should decode");

    assert_eq!(
        result.values(),
        [
            BatchValue::String(String::from("True")),
            BatchValue::String(String::new()),
            BatchValue::String(String::from("WIN01")),
        ]
    );
    assert_eq!(
        result.diagnostic(),
        Some("Get-Item : Cannot find path 'C:\\missing' because it does not exist.")
    );
}

#[rstest]
#[tokio::test]
async fn separator_batch_cut_short_is_a_failure(factory: FakeFactory) {
    let session = session(&factory).await;
    let batch = BatchBuilder::new()
        .output_format(OutputFormat::Separator)
        .add("Write-Output A")
        .add("Get-Item C:\\missing")
        .add("Write-Output C")
        .build();
    factory.push_output(output(1, &format!("A\r\n{BATCH_SENTINEL}\r\n"), NOT_FOUND_ENVELOPE));

    let err = Executor::new()
        .run_batch(&session, &batch)
        .await
        .expect_err("a batch missing segments must not look successful");

    let ExecError::Failed {
        exit_code,
        ref message,
        ..
    } = err
    else {
        panic!("expected Failed, got {err:?}");
    };
    assert_eq!(exit_code, Some(1));
    assert_eq!(message, "Cannot find path 'C:\\missing' because it does not exist.");
}

#[rstest]
#[tokio::test]
async fn separator_segment_count_is_checked_on_success(factory: FakeFactory) {
    let session = session(&factory).await;
    let batch = BatchBuilder::new()
        .output_format(OutputFormat::Separator)
        .add("Write-Output A")
        .add("Write-Output B")
        .build();
    factory.push_output(output(0, "A\r\n", ""));

    let err = Executor::new()
        .run_batch(&session, &batch)
        .await
        .expect_err("one segment for two commands");

    assert!(
        matches!(err, ExecError::Parse(BatchError::Parse { format: OutputFormat::Separator, .. })),
        "unexpected error: {err:?}"
    );
}

#[rstest]
#[tokio::test]
async fn structured_batch_failure_is_reported(factory: FakeFactory) {
    let session = session(&factory).await;
    let batch = BatchBuilder::new()
        .output_format(OutputFormat::Array)
        .add("Get-Item C:\\missing")
        .build();
    factory.push_output(output(1, "", NOT_FOUND_ENVELOPE));

    let err = Executor::new()
        .run_batch(&session, &batch)
        .await
        .expect_err("array batch should fail");

    assert!(matches!(err, ExecError::Failed { .. }), "unexpected error: {err:?}");
}

#[rstest]
#[tokio::test]
async fn undecodable_batch_output_is_a_parse_error(factory: FakeFactory) {
    let session = session(&factory).await;
    let batch = BatchBuilder::new()
        .output_format(OutputFormat::Object)
        .add("hostname")
        .build();
    factory.push_output(output(0, "WIN01", ""));

    let err = Executor::new()
        .run_batch(&session, &batch)
        .await
        .expect_err("plain text is not an object");

    assert!(
        matches!(err, ExecError::Parse(BatchError::Parse { format: OutputFormat::Object, .. })),
        "unexpected error: {err:?}"
    );
}

#[rstest]
#[tokio::test]
async fn array_batch_round_trips_values(factory: FakeFactory) {
    let session = session(&factory).await;
    let batch = BatchBuilder::new()
        .output_format(OutputFormat::Array)
        .add("Test-Path C:\\app")
        .add("$env:COMPUTERNAME")
        .build();
    factory.push_output(output(0, "[false,\"WIN01\"]\r\n", ""));

    let result = Executor::new()
        .run_batch(&session, &batch)
        .await
        .expect("array batch should decode");

    assert_eq!(result.get(0).expect("first").as_bool(), Some(false));
    assert_eq!(result.get_string(1).expect("second"), "WIN01");
}
