//! Pool sizing and health-check settings.
//!
//! [`PoolConfig`] is loaded via `ortho-config`, which merges defaults,
//! configuration files, and environment variables. Durations are expressed
//! in milliseconds so short values remain representable in tests.

use std::time::Duration;

use ortho_config::OrthoConfig;
use serde::Deserialize;
use thiserror::Error;

/// Default number of idle sessions retained.
pub const DEFAULT_MAX_IDLE: usize = 4;

/// Default ceiling on sessions held by the pool at once.
pub const DEFAULT_MAX_ACTIVE: usize = 8;

/// Default idle lifetime before eviction (five minutes).
pub const DEFAULT_IDLE_TIMEOUT_MS: u64 = 300_000;

/// Default time a borrower waits when the pool is saturated.
pub const DEFAULT_WAIT_TIMEOUT_MS: u64 = 30_000;

/// Default minimum spacing between health probes of one session.
pub const DEFAULT_TEST_INTERVAL_MS: u64 = 30_000;

/// Default period of the background idle sweep.
pub const DEFAULT_SWEEP_INTERVAL_MS: u64 = 30_000;

/// Default command used to probe session health.
pub const DEFAULT_PROBE_COMMAND: &str = "echo ok";

/// Immutable pool settings.
#[derive(Clone, Debug, Deserialize, OrthoConfig, PartialEq, Eq)]
#[ortho_config(
    prefix = "SHELLPOOL_POOL",
    discovery(
        app_name = "shellpool",
        env_var = "SHELLPOOL_CONFIG_PATH",
        config_file_name = "shellpool.toml",
        dotfile_name = ".shellpool.toml",
        project_file_name = "shellpool.toml"
    )
)]
pub struct PoolConfig {
    /// Idle sessions retained for reuse; extra returned sessions are closed.
    #[ortho_config(default = DEFAULT_MAX_IDLE)]
    pub max_idle: usize,
    /// Ceiling on borrowed plus in-flight sessions. Zero means unlimited.
    #[ortho_config(default = DEFAULT_MAX_ACTIVE)]
    pub max_active: usize,
    /// Idle time after which the sweep closes a session.
    #[ortho_config(default = DEFAULT_IDLE_TIMEOUT_MS)]
    pub idle_timeout_ms: u64,
    /// Time a borrower waits for a session when the pool is saturated. Zero
    /// fails immediately instead of queueing.
    #[ortho_config(default = DEFAULT_WAIT_TIMEOUT_MS)]
    pub wait_timeout_ms: u64,
    /// Whether idle sessions are probed before being lent out.
    #[ortho_config(default = true)]
    pub test_on_borrow: bool,
    /// Minimum time between probes of the same session.
    #[ortho_config(default = DEFAULT_TEST_INTERVAL_MS)]
    pub test_interval_ms: u64,
    /// Period of the background idle sweep. Zero disables the sweep task.
    #[ortho_config(default = DEFAULT_SWEEP_INTERVAL_MS)]
    pub sweep_interval_ms: u64,
    /// Cheap command whose success marks a session as healthy.
    #[ortho_config(default = DEFAULT_PROBE_COMMAND.to_owned())]
    pub probe_command: String,
}

/// Errors raised while loading or validating [`PoolConfig`].
#[derive(Clone, Debug, Error, Eq, PartialEq)]
pub enum PoolConfigError {
    /// A field holds a value the pool cannot operate with.
    #[error("invalid {field}: {reason}; set SHELLPOOL_POOL_{env_suffix} or add {field} to [pool] in shellpool.toml", env_suffix = field.to_uppercase())]
    InvalidConfig {
        /// Offending field.
        field: String,
        /// Why the value was rejected.
        reason: String,
    },
    /// Merging configuration layers failed.
    #[error("pool configuration parsing failed: {0}")]
    Parse(String),
}

impl PoolConfig {
    /// Loads configuration from defaults, configuration files, and
    /// environment variables, ignoring process arguments.
    ///
    /// # Errors
    ///
    /// Returns [`PoolConfigError::Parse`] when merging sources fails.
    pub fn load_without_cli_args() -> Result<Self, PoolConfigError> {
        Self::load_from_iter([std::ffi::OsString::from("shellpool")])
            .map_err(|err| PoolConfigError::Parse(err.to_string()))
    }

    /// Checks the settings are internally consistent.
    ///
    /// # Errors
    ///
    /// Returns [`PoolConfigError::InvalidConfig`] when `max_idle` exceeds a
    /// bounded `max_active`, `idle_timeout_ms` is zero, or the probe command
    /// is blank.
    pub fn validate(&self) -> Result<(), PoolConfigError> {
        if self.max_active > 0 && self.max_idle > self.max_active {
            return Err(Self::invalid(
                "max_idle",
                format!("{} exceeds max_active {}", self.max_idle, self.max_active),
            ));
        }
        if self.idle_timeout_ms == 0 {
            return Err(Self::invalid("idle_timeout_ms", String::from("must be positive")));
        }
        if self.probe_command.trim().is_empty() {
            return Err(Self::invalid("probe_command", String::from("must not be blank")));
        }
        Ok(())
    }

    /// Idle lifetime before eviction.
    #[must_use]
    pub const fn idle_timeout(&self) -> Duration {
        Duration::from_millis(self.idle_timeout_ms)
    }

    /// Maximum time a borrower waits when the pool is saturated.
    #[must_use]
    pub const fn wait_timeout(&self) -> Duration {
        Duration::from_millis(self.wait_timeout_ms)
    }

    /// Minimum spacing between probes of one session.
    #[must_use]
    pub const fn test_interval(&self) -> Duration {
        Duration::from_millis(self.test_interval_ms)
    }

    /// Period of the background sweep, or `None` when disabled.
    #[must_use]
    pub const fn sweep_interval(&self) -> Option<Duration> {
        if self.sweep_interval_ms == 0 {
            None
        } else {
            Some(Duration::from_millis(self.sweep_interval_ms))
        }
    }

    fn invalid(field: &str, reason: String) -> PoolConfigError {
        PoolConfigError::InvalidConfig {
            field: field.to_owned(),
            reason,
        }
    }
}
