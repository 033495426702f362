//! Process runner abstraction used by the SSH transport.

use std::ffi::OsString;
use std::process::Stdio;

use tokio::process::Command;

use crate::session::{CommandOutput, SessionError, SessionFuture};

/// Abstraction over local process execution to support fakes in tests.
pub trait CommandRunner: Send + Sync + 'static {
    /// Runs `program` with the given arguments, capturing stdout and stderr.
    ///
    /// Dropping the returned future kills the child process.
    fn run<'a>(&'a self, program: &'a str, args: &'a [OsString])
    -> SessionFuture<'a, CommandOutput>;

    /// Runs `program` with stdio detached and reports only its exit status.
    ///
    /// Used for commands that leave a background process behind, which
    /// would otherwise hold captured pipes open.
    fn run_detached<'a>(
        &'a self,
        program: &'a str,
        args: &'a [OsString],
    ) -> SessionFuture<'a, CommandOutput>;
}

/// Real command runner that shells out to the host operating system.
#[derive(Clone, Copy, Debug, Default)]
pub struct ProcessCommandRunner;

impl CommandRunner for ProcessCommandRunner {
    fn run<'a>(
        &'a self,
        program: &'a str,
        args: &'a [OsString],
    ) -> SessionFuture<'a, CommandOutput> {
        Box::pin(async move {
            let output = Command::new(program)
                .args(args)
                .stdin(Stdio::null())
                .kill_on_drop(true)
                .output()
                .await
                .map_err(|err| spawn_error(program, &err))?;

            Ok(CommandOutput {
                code: output.status.code(),
                stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
                stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
            })
        })
    }

    fn run_detached<'a>(
        &'a self,
        program: &'a str,
        args: &'a [OsString],
    ) -> SessionFuture<'a, CommandOutput> {
        Box::pin(async move {
            let status = Command::new(program)
                .args(args)
                .stdin(Stdio::null())
                .stdout(Stdio::null())
                .stderr(Stdio::null())
                .status()
                .await
                .map_err(|err| spawn_error(program, &err))?;

            Ok(CommandOutput {
                code: status.code(),
                ..CommandOutput::default()
            })
        })
    }
}

fn spawn_error(program: &str, err: &std::io::Error) -> SessionError {
    SessionError::Spawn {
        program: program.to_owned(),
        message: err.to_string(),
    }
}
