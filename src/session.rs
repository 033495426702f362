//! Session abstraction supplied by the transport layer.
//!
//! A [`Session`] is one connected, authenticated execution channel to a
//! remote host. It runs one command at a time and reports captured output.
//! A [`SessionFactory`] opens new sessions on demand; the pool owns
//! lifecycle, not connection details.

use std::future::Future;
use std::pin::Pin;

use thiserror::Error;

/// Future returned by session and factory operations.
pub type SessionFuture<'a, T> = Pin<Box<dyn Future<Output = Result<T, SessionError>> + Send + 'a>>;

/// Output captured from one remote command.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct CommandOutput {
    /// Exit code reported by the remote side, if available.
    pub code: Option<i32>,
    /// Captured standard output.
    pub stdout: String,
    /// Captured standard error.
    pub stderr: String,
}

impl CommandOutput {
    /// Returns `true` when the exit code equals zero.
    #[must_use]
    pub const fn is_success(&self) -> bool {
        matches!(self.code, Some(0))
    }

    /// Human readable representation of the exit status.
    #[must_use]
    pub fn status_text(&self) -> String {
        self.code
            .map_or_else(|| String::from("unknown"), |code| code.to_string())
    }
}

/// Errors raised by a transport while opening or using a session.
#[derive(Clone, Debug, Error, Eq, PartialEq)]
pub enum SessionError {
    /// A local helper process could not be started.
    #[error("failed to spawn {program}: {message}")]
    Spawn {
        /// Program that failed to start.
        program: String,
        /// Operating system error string.
        message: String,
    },
    /// The remote host could not be reached or refused authentication.
    #[error("failed to connect to {target}: {message}")]
    Connect {
        /// Connection target, typically `user@host:port`.
        target: String,
        /// Diagnostic from the transport.
        message: String,
    },
    /// The session has already been closed.
    #[error("session is closed")]
    Closed,
    /// The transport failed mid-command.
    #[error("transport error: {0}")]
    Io(String),
}

/// A live execution channel to one remote host.
///
/// Methods take `&self` so a pool can close a borrowed session on shutdown.
/// Callers must still serialise their own commands on one session.
pub trait Session: Send + Sync + 'static {
    /// Runs `command` verbatim and captures its output.
    ///
    /// A non-zero exit is reported through [`CommandOutput::code`], not as an
    /// error.
    fn run<'a>(&'a self, command: &'a str) -> SessionFuture<'a, CommandOutput>;

    /// Closes the underlying transport. Closing twice is not an error.
    fn close(&self) -> SessionFuture<'_, ()>;
}

/// Opens sessions using connection parameters it owns.
pub trait SessionFactory: Send + Sync + 'static {
    /// Session type produced by this factory.
    type Session: Session;

    /// Opens and authenticates a new session.
    fn create(&self) -> SessionFuture<'_, Self::Session>;
}
