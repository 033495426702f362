//! OpenSSH transport for remote PowerShell sessions.
//!
//! Each [`SshSession`] owns one multiplexing control master: creating the
//! session authenticates once and leaves a background `ssh` process behind
//! a private control socket, every command then rides that connection, and
//! closing the session asks the master to exit.

use std::ffi::OsString;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use camino::{Utf8Path, Utf8PathBuf};
use tracing::debug;

use crate::session::{CommandOutput, Session, SessionError, SessionFactory, SessionFuture};

mod config;
mod runner;

pub use config::{
    DEFAULT_CONNECT_TIMEOUT_SECS, DEFAULT_CONTROL_DIR, DEFAULT_SSH_PORT, DEFAULT_SSH_USER,
    SshConfig, SshConfigError, expand_tilde,
};
pub use runner::{CommandRunner, ProcessCommandRunner};

/// Exit status `ssh` reserves for its own failures.
pub const SSH_TRANSPORT_FAILURE: i32 = 255;

/// Opens [`SshSession`]s against one configured host.
#[derive(Debug)]
pub struct SshSessionFactory<R: CommandRunner> {
    config: Arc<SshConfig>,
    runner: Arc<R>,
}

impl<R: CommandRunner> Clone for SshSessionFactory<R> {
    fn clone(&self) -> Self {
        Self {
            config: Arc::clone(&self.config),
            runner: Arc::clone(&self.runner),
        }
    }
}

impl SshSessionFactory<ProcessCommandRunner> {
    /// Convenience constructor that wires the real process runner.
    ///
    /// # Errors
    ///
    /// Returns [`SshConfigError::InvalidConfig`] when validation fails.
    pub fn with_process_runner(config: SshConfig) -> Result<Self, SshConfigError> {
        Self::new(config, ProcessCommandRunner)
    }
}

impl<R: CommandRunner> SshSessionFactory<R> {
    /// Creates a factory using the provided runner and configuration.
    ///
    /// # Errors
    ///
    /// Returns [`SshConfigError::InvalidConfig`] when configuration
    /// validation fails.
    pub fn new(config: SshConfig, runner: R) -> Result<Self, SshConfigError> {
        config.validate()?;
        Ok(Self {
            config: Arc::new(config),
            runner: Arc::new(runner),
        })
    }

    /// Returns a reference to the underlying configuration.
    #[must_use]
    pub fn config(&self) -> &SshConfig {
        &self.config
    }

    fn master_args(&self, control_path: &Utf8Path) -> Vec<OsString> {
        let mut args = common_ssh_options(&self.config);
        args.extend(
            [
                "-M",
                "-N",
                "-f",
                "-o",
                "ControlPersist=yes",
                "-o",
            ]
            .map(OsString::from),
        );
        args.push(OsString::from(format!("ControlPath={control_path}")));
        args.push(OsString::from(self.config.target()));
        args
    }
}

impl<R: CommandRunner> SessionFactory for SshSessionFactory<R> {
    type Session = SshSession<R>;

    fn create(&self) -> SessionFuture<'_, Self::Session> {
        Box::pin(async move {
            let control_path = self.config.control_path();
            let args = self.master_args(&control_path);
            let output = self.runner.run_detached(&self.config.ssh_bin, &args).await?;
            if !output.is_success() {
                return Err(SessionError::Connect {
                    target: format!("{}:{}", self.config.target(), self.config.port),
                    message: format!("control master exited with status {}", output.status_text()),
                });
            }

            debug!(target_host = %self.config.target(), %control_path, "ssh control master started");
            Ok(SshSession {
                config: Arc::clone(&self.config),
                runner: Arc::clone(&self.runner),
                control_path,
                closed: AtomicBool::new(false),
            })
        })
    }
}

/// One multiplexed SSH connection.
#[derive(Debug)]
pub struct SshSession<R: CommandRunner> {
    config: Arc<SshConfig>,
    runner: Arc<R>,
    control_path: Utf8PathBuf,
    closed: AtomicBool,
}

impl<R: CommandRunner> SshSession<R> {
    /// Control socket shared by commands on this session.
    #[must_use]
    pub fn control_path(&self) -> &Utf8Path {
        &self.control_path
    }

    fn control_args(&self) -> Vec<OsString> {
        vec![
            OsString::from("-S"),
            OsString::from(self.control_path.as_str()),
        ]
    }
}

impl<R: CommandRunner> Session for SshSession<R> {
    fn run<'a>(&'a self, command: &'a str) -> SessionFuture<'a, CommandOutput> {
        Box::pin(async move {
            if self.closed.load(Ordering::Acquire) {
                return Err(SessionError::Closed);
            }
            let mut args = common_ssh_options(&self.config);
            args.extend(self.control_args());
            args.push(OsString::from(self.config.target()));
            args.push(OsString::from(command));

            let output = self.runner.run(&self.config.ssh_bin, &args).await?;
            if output.code == Some(SSH_TRANSPORT_FAILURE) {
                return Err(SessionError::Io(output.stderr.trim().to_owned()));
            }
            Ok(output)
        })
    }

    fn close(&self) -> SessionFuture<'_, ()> {
        Box::pin(async move {
            if self.closed.swap(true, Ordering::AcqRel) {
                return Ok(());
            }
            let mut args = self.control_args();
            args.extend(["-O", "exit"].map(OsString::from));
            args.push(OsString::from(self.config.target()));

            let output = self.runner.run(&self.config.ssh_bin, &args).await?;
            if output.is_success() {
                debug!(control_path = %self.control_path, "ssh control master stopped");
                Ok(())
            } else {
                Err(SessionError::Io(format!(
                    "control master exit request failed with status {}: {}",
                    output.status_text(),
                    output.stderr.trim()
                )))
            }
        })
    }
}

fn common_ssh_options(config: &SshConfig) -> Vec<OsString> {
    let mut args = vec![OsString::from("-p"), OsString::from(config.port.to_string())];

    if let Some(ref identity_file) = config.identity_file {
        args.push(OsString::from("-i"));
        args.push(OsString::from(expand_tilde(identity_file)));
    }

    if config.batch_mode {
        args.push(OsString::from("-o"));
        args.push(OsString::from("BatchMode=yes"));
    }

    if !config.strict_host_key_checking {
        args.push(OsString::from("-o"));
        args.push(OsString::from("StrictHostKeyChecking=no"));
    }

    if !config.known_hosts_file.trim().is_empty() {
        args.push(OsString::from("-o"));
        args.push(OsString::from(format!(
            "UserKnownHostsFile={}",
            config.known_hosts_file
        )));
    }

    if config.connect_timeout_secs > 0 {
        args.push(OsString::from("-o"));
        args.push(OsString::from(format!(
            "ConnectTimeout={}",
            config.connect_timeout_secs
        )));
    }

    args
}

#[cfg(test)]
mod tests;
