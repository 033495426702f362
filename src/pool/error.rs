//! Errors surfaced to callers borrowing from a [`Pool`](super::Pool).

use std::time::Duration;

use thiserror::Error;

use super::config::PoolConfigError;
use crate::session::SessionError;

/// Failures with no safe fallback inside the pool.
///
/// Unhealthy idle sessions are never reported here; they are discarded and
/// the next candidate is tried.
#[derive(Clone, Debug, Error, Eq, PartialEq)]
pub enum PoolError {
    /// The pool has been closed.
    #[error("session pool is closed")]
    Closed,
    /// The borrower waited longer than the configured wait timeout.
    #[error("timed out after {}ms waiting for a pooled session", waited.as_millis())]
    Timeout {
        /// How long the borrower waited.
        waited: Duration,
    },
    /// The session factory failed to open a new session.
    #[error("failed to create session: {0}")]
    SessionCreation(#[source] SessionError),
    /// The pool configuration is inconsistent.
    #[error(transparent)]
    Config(#[from] PoolConfigError),
}
