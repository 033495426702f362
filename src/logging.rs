//! Tracing subscriber setup for the `shellpool` binary.
//!
//! Library code only emits `tracing` events; installing a subscriber is the
//! binary's decision. `RUST_LOG` overrides the verbosity flag when set.

use thiserror::Error;
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

/// Errors raised while installing the global subscriber.
#[derive(Debug, Error)]
pub enum LoggingError {
    /// A global subscriber was already installed.
    #[error("failed to install tracing subscriber: {0}")]
    Install(String),
}

/// Maps a `-v` count to a level name: warnings by default, then info,
/// debug and trace.
#[must_use]
pub const fn level_for(verbosity: u8) -> &'static str {
    match verbosity {
        0 => "warn",
        1 => "info",
        2 => "debug",
        _ => "trace",
    }
}

/// Builds the event filter for `verbosity`, honouring `RUST_LOG`.
#[must_use]
pub fn filter_for(verbosity: u8) -> EnvFilter {
    EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(format!("shellpool={}", level_for(verbosity))))
}

/// Installs a text subscriber writing to stderr.
///
/// File and line locations are included from debug verbosity upwards.
///
/// # Errors
///
/// Returns [`LoggingError::Install`] when a subscriber is already set.
pub fn init_logging(verbosity: u8) -> Result<(), LoggingError> {
    tracing_subscriber::registry()
        .with(filter_for(verbosity))
        .with(
            fmt::layer()
                .with_writer(std::io::stderr)
                .with_target(true)
                .with_file(verbosity >= 2)
                .with_line_number(verbosity >= 2),
        )
        .try_init()
        .map_err(|err| LoggingError::Install(err.to_string()))
}
