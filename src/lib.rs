//! Core library for the `shellpool` remote execution engine.
//!
//! The crate runs PowerShell on remote Windows hosts over pooled SSH
//! sessions. Commands are quoted and encoded by [`encoding`], grouped into
//! single round trips by [`batch`], executed through [`exec`], and their
//! error streams decoded by [`interpreter`]. Sessions are borrowed from a
//! bounded, health-checked [`pool`] backed by the OpenSSH transport in
//! [`ssh`].

pub mod batch;
pub mod encoding;
pub mod exec;
pub mod interpreter;
pub mod logging;
pub mod pool;
pub mod session;
pub mod ssh;
pub mod test_support;

pub use batch::{BatchBuilder, BatchError, BatchResult, BatchScript, BatchValue, OutputFormat};
pub use exec::{ExecError, Executor};
pub use interpreter::{clean_error_output, extract_primary_error};
pub use pool::{Lease, Pool, PoolConfig, PoolConfigError, PoolError, PoolStats};
pub use session::{CommandOutput, Session, SessionError, SessionFactory};
pub use ssh::{SshConfig, SshSession, SshSessionFactory};
