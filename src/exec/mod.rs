//! Runs commands and batches on a session.
//!
//! [`Executor`] wraps every command in an encoded PowerShell invocation so its
//! content cannot break the command boundary, applies an optional deadline,
//! and turns non-zero exits into [`ExecError::Failed`] carrying the cleaned
//! remote diagnostic. Nothing is retried here.

use std::time::Duration;

use thiserror::Error;
use tokio::time::timeout;
use tracing::debug;

use crate::batch::{BatchError, BatchResult, BatchScript, OutputFormat};
use crate::encoding::encoded_command;
use crate::interpreter::{clean_error_output, extract_primary_error};
use crate::session::{CommandOutput, Session, SessionError};

/// Longest command text, in characters, quoted in error messages.
pub const MAX_COMMAND_DISPLAY: usize = 120;

/// Errors raised while executing a command or batch.
#[derive(Clone, Debug, Error, PartialEq)]
pub enum ExecError {
    /// The remote interpreter reported a non-zero exit.
    #[error("command `{command}` failed with status {}: {message}", status_label(*exit_code))]
    Failed {
        /// Command text, truncated for display.
        command: String,
        /// Exit code reported by the remote side, if available.
        exit_code: Option<i32>,
        /// Captured standard output.
        stdout: String,
        /// Captured standard error, as received.
        stderr: String,
        /// Full cleaned diagnostic text.
        detail: String,
        /// First message segment of the diagnostic.
        message: String,
    },
    /// The session failed while the command was running.
    #[error("transport failure while running `{command}`: {source}")]
    Transport {
        /// Command text, truncated for display.
        command: String,
        /// Underlying session error.
        #[source]
        source: SessionError,
    },
    /// The command did not finish within the configured deadline. The
    /// session's state is unknown afterwards and should be discarded.
    #[error("command `{command}` timed out after {timeout:?}")]
    TimedOut {
        /// Command text, truncated for display.
        command: String,
        /// Deadline that elapsed.
        timeout: Duration,
    },
    /// Batch output could not be decoded under its declared format.
    #[error(transparent)]
    Parse(#[from] BatchError),
}

impl ExecError {
    /// Returns `true` when the session may be broken and should be
    /// discarded rather than returned to its pool.
    #[must_use]
    pub const fn is_transport_level(&self) -> bool {
        matches!(self, Self::Transport { .. } | Self::TimedOut { .. })
    }
}

/// Runs encoded commands against a [`Session`].
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct Executor {
    command_timeout: Option<Duration>,
}

impl Executor {
    /// Creates an executor without a command deadline.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            command_timeout: None,
        }
    }

    /// Fails commands that run longer than `limit`.
    #[must_use]
    pub const fn with_command_timeout(mut self, limit: Duration) -> Self {
        self.command_timeout = Some(limit);
        self
    }

    /// The configured command deadline, if any.
    #[must_use]
    pub const fn command_timeout(&self) -> Option<Duration> {
        self.command_timeout
    }

    /// Runs `command` and returns its output, with `stderr` cleaned of any
    /// serialised stream envelope.
    ///
    /// # Errors
    ///
    /// Returns [`ExecError::Failed`] on a non-zero exit,
    /// [`ExecError::Transport`] when the session fails, or
    /// [`ExecError::TimedOut`] when the deadline elapses.
    pub async fn run<S>(&self, session: &S, command: &str) -> Result<CommandOutput, ExecError>
    where
        S: Session + ?Sized,
    {
        let output = self.execute(session, command).await?;
        if !output.is_success() {
            return Err(failure(command, output));
        }
        Ok(CommandOutput {
            stderr: clean_error_output(&output.stderr),
            ..output
        })
    }

    /// Runs `batch` in one round trip and decodes its results.
    ///
    /// An empty batch returns an empty result without touching the session.
    /// A `Separator` batch that exits non-zero is still decoded when every
    /// command produced its segment, since one failing command does not
    /// invalidate the others; the cleaned error output is then available
    /// from [`BatchResult::diagnostic`].
    ///
    /// # Errors
    ///
    /// Returns [`ExecError::Failed`] when a non-`Separator` batch exits
    /// non-zero or a `Separator` batch stops before its last segment,
    /// [`ExecError::Parse`] when the output does not decode, and the
    /// transport errors of [`Executor::run`].
    pub async fn run_batch<S>(
        &self,
        session: &S,
        batch: &BatchScript,
    ) -> Result<BatchResult, ExecError>
    where
        S: Session + ?Sized,
    {
        if batch.is_empty() {
            return Ok(BatchResult::empty(batch.format()));
        }

        let output = self.execute(session, batch.script()).await?;
        if output.is_success() {
            let result = batch.parse(&output.stdout)?;
            check_segments(batch, &result)?;
            return Ok(result);
        }
        if batch.format() != OutputFormat::Separator {
            return Err(failure(batch.script(), output));
        }

        let result = batch.parse(&output.stdout)?;
        if result.len() != batch.len() {
            debug!(
                expected = batch.len(),
                found = result.len(),
                "separator batch stopped early"
            );
            return Err(failure(batch.script(), output));
        }
        let detail = clean_error_output(&output.stderr);
        debug!(
            status = %output.status_text(),
            error = %extract_primary_error(&detail),
            commands = batch.len(),
            "separator batch reported errors"
        );
        let diagnostic = if detail.trim().is_empty() {
            format!("exited with status {}", output.status_text())
        } else {
            detail
        };
        Ok(result.with_diagnostic(diagnostic))
    }

    async fn execute<S>(&self, session: &S, command: &str) -> Result<CommandOutput, ExecError>
    where
        S: Session + ?Sized,
    {
        let wrapped = encoded_command(command);
        let pending = session.run(&wrapped);
        let result = match self.command_timeout {
            Some(limit) => timeout(limit, pending).await.map_err(|_| {
                debug!(command = %display_command(command), ?limit, "command timed out");
                ExecError::TimedOut {
                    command: display_command(command),
                    timeout: limit,
                }
            })?,
            None => pending.await,
        };
        result.map_err(|source| {
            debug!(command = %display_command(command), error = %source, "command transport failed");
            ExecError::Transport {
                command: display_command(command),
                source,
            }
        })
    }
}

fn failure(command: &str, output: CommandOutput) -> ExecError {
    let detail = clean_error_output(&output.stderr);
    let primary = extract_primary_error(&detail);
    let message = if primary.is_empty() {
        format!("exited with status {}", output.status_text())
    } else {
        primary
    };
    debug!(command = %display_command(command), %message, "command failed");
    ExecError::Failed {
        command: display_command(command),
        exit_code: output.code,
        stdout: output.stdout,
        stderr: output.stderr,
        detail,
        message,
    }
}

fn check_segments(batch: &BatchScript, result: &BatchResult) -> Result<(), BatchError> {
    if batch.format() != OutputFormat::Separator || result.len() == batch.len() {
        return Ok(());
    }
    Err(BatchError::Parse {
        format: OutputFormat::Separator,
        message: format!(
            "expected {} segments, found {}",
            batch.len(),
            result.len()
        ),
    })
}

/// Collapses whitespace and truncates `command` for error messages.
fn display_command(command: &str) -> String {
    let single_line = command.split_whitespace().collect::<Vec<_>>().join(" ");
    match single_line.char_indices().nth(MAX_COMMAND_DISPLAY) {
        Some((cut, _)) => format!("{}...", single_line.get(..cut).unwrap_or_default()),
        None => single_line,
    }
}

fn status_label(code: Option<i32>) -> String {
    code.map_or_else(|| String::from("unknown"), |value| value.to_string())
}

#[cfg(test)]
mod tests;
