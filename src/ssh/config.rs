//! SSH connection settings.
//!
//! [`SshConfig`] is loaded via `ortho-config`, which merges defaults,
//! configuration files, and environment variables.

use camino::Utf8PathBuf;
use ortho_config::OrthoConfig;
use serde::Deserialize;
use thiserror::Error;

/// Default SSH port.
pub const DEFAULT_SSH_PORT: u16 = 22;

/// Default remote account; the built-in administrator on Windows hosts.
pub const DEFAULT_SSH_USER: &str = "Administrator";

/// Default directory holding connection-sharing control sockets.
pub const DEFAULT_CONTROL_DIR: &str = "/tmp";

/// Default connection timeout passed to `ssh -o ConnectTimeout`.
pub const DEFAULT_CONNECT_TIMEOUT_SECS: u64 = 10;

/// Connection settings for [`super::SshSessionFactory`].
#[derive(Clone, Debug, Deserialize, OrthoConfig, PartialEq, Eq)]
#[ortho_config(
    prefix = "SHELLPOOL_SSH",
    discovery(
        app_name = "shellpool",
        env_var = "SHELLPOOL_CONFIG_PATH",
        config_file_name = "shellpool.toml",
        dotfile_name = ".shellpool.toml",
        project_file_name = "shellpool.toml"
    )
)]
pub struct SshConfig {
    /// Path to the `ssh` executable.
    #[ortho_config(default = "ssh".to_owned())]
    pub ssh_bin: String,
    /// Remote host name or address. Required.
    pub host: Option<String>,
    /// Remote SSH port.
    #[ortho_config(default = DEFAULT_SSH_PORT)]
    pub port: u16,
    /// Remote user to connect as.
    #[ortho_config(default = DEFAULT_SSH_USER.to_owned())]
    pub user: String,
    /// Private key for authentication; supports `~/` expansion. When absent,
    /// `ssh` falls back to its default key locations.
    pub identity_file: Option<String>,
    /// Whether to force batch mode so `ssh` never prompts.
    #[ortho_config(default = true)]
    pub batch_mode: bool,
    /// Whether to enforce host key checking.
    #[ortho_config(default = false)]
    pub strict_host_key_checking: bool,
    /// Known hosts file override; blank leaves the `ssh` default in place.
    #[ortho_config(default = "/dev/null".to_owned())]
    pub known_hosts_file: String,
    /// Directory for control sockets. Keep the path short; socket paths are
    /// limited to roughly 100 bytes.
    #[ortho_config(default = DEFAULT_CONTROL_DIR.to_owned())]
    pub control_dir: String,
    /// Seconds allowed for connection establishment. Zero leaves the `ssh`
    /// default in place.
    #[ortho_config(default = DEFAULT_CONNECT_TIMEOUT_SECS)]
    pub connect_timeout_secs: u64,
}

/// Errors raised while loading or validating [`SshConfig`].
#[derive(Clone, Debug, Error, Eq, PartialEq)]
pub enum SshConfigError {
    /// A required value is missing or blank. The message explains how to
    /// provide it via environment variable or configuration file.
    #[error("missing {field}: set SHELLPOOL_SSH_{env_suffix} or add {field} to [ssh] in shellpool.toml", env_suffix = field.to_uppercase())]
    InvalidConfig {
        /// Configuration field that failed validation.
        field: String,
    },
    /// Merging configuration layers failed.
    #[error("ssh configuration parsing failed: {0}")]
    Parse(String),
}

impl SshConfig {
    /// Loads configuration from defaults, configuration files, and
    /// environment variables, ignoring process arguments.
    ///
    /// # Errors
    ///
    /// Returns [`SshConfigError::Parse`] when merging sources fails.
    pub fn load_without_cli_args() -> Result<Self, SshConfigError> {
        Self::load_from_iter([std::ffi::OsString::from("shellpool")])
            .map_err(|err| SshConfigError::Parse(err.to_string()))
    }

    /// Ensures required values are present after trimming whitespace.
    ///
    /// # Errors
    ///
    /// Returns [`SshConfigError::InvalidConfig`] naming the first missing
    /// field.
    pub fn validate(&self) -> Result<(), SshConfigError> {
        Self::require(Some(&self.ssh_bin), "ssh_bin")?;
        Self::require(self.host.as_deref(), "host")?;
        Self::require(Some(&self.user), "user")?;
        Self::require(Some(&self.control_dir), "control_dir")?;
        if let Some(identity) = self.identity_file.as_deref() {
            Self::require(Some(identity), "identity_file")?;
        }
        Ok(())
    }

    /// The `user@host` destination passed to `ssh`.
    #[must_use]
    pub fn target(&self) -> String {
        format!("{}@{}", self.user, self.host.as_deref().unwrap_or_default())
    }

    /// A fresh, unique control socket path under `control_dir`.
    #[must_use]
    pub fn control_path(&self) -> Utf8PathBuf {
        Utf8PathBuf::from(expand_tilde(&self.control_dir))
            .join(format!("shellpool-{}.sock", uuid::Uuid::new_v4().simple()))
    }

    fn require(value: Option<&str>, field: &str) -> Result<(), SshConfigError> {
        match value {
            Some(text) if !text.trim().is_empty() => Ok(()),
            _ => Err(SshConfigError::InvalidConfig {
                field: field.to_owned(),
            }),
        }
    }
}

/// Expands a leading `~` or `~/` to the user's home directory.
///
/// If `HOME` is not set, the input is returned unchanged.
///
/// # Examples
///
/// ```
/// # use shellpool::ssh::expand_tilde;
/// let home = std::env::var("HOME").expect("HOME should be set");
/// assert_eq!(expand_tilde("~/.ssh/id_ed25519"), format!("{home}/.ssh/id_ed25519"));
/// assert_eq!(expand_tilde("/absolute/path"), "/absolute/path");
/// ```
#[must_use]
pub fn expand_tilde(path: &str) -> String {
    let rest = if path == "~" {
        ""
    } else if let Some(stripped) = path.strip_prefix("~/") {
        stripped
    } else {
        return path.to_owned();
    };
    match std::env::var_os("HOME") {
        Some(home) if rest.is_empty() => home.to_string_lossy().into_owned(),
        Some(home) => format!("{}/{rest}", home.to_string_lossy()),
        None => path.to_owned(),
    }
}
