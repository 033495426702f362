//! Command-line interface definitions for the `shellpool` binary.
//!
//! This module centralises the clap parser structures so both the main binary
//! and the build script can reuse them when generating the manual page.

use clap::{ArgAction, Parser, Subcommand};

/// Output framings accepted by `shellpool batch`.
pub(crate) const BATCH_FORMATS: [&str; 5] = ["none", "array", "object", "raw", "separator"];

/// Top-level CLI for the `shellpool` binary.
#[derive(Debug, Parser)]
#[command(
    name = "shellpool",
    about = "Run PowerShell commands on a remote Windows host over pooled SSH sessions",
    arg_required_else_help = true
)]
pub(crate) struct Cli {
    /// Increase log verbosity (-v info, -vv debug, -vvv trace).
    #[arg(short, long, action = ArgAction::Count, global = true)]
    pub(crate) verbose: u8,
    /// Fail a command that runs longer than this many seconds.
    #[arg(long, value_name = "SECONDS", global = true)]
    pub(crate) timeout: Option<u64>,
    /// Subcommand to run.
    #[command(subcommand)]
    pub(crate) command: Command,
}

/// Subcommands of the `shellpool` binary.
#[derive(Debug, Subcommand)]
pub(crate) enum Command {
    /// Run one command and exit with its remote status.
    #[command(name = "run", about = "Run one command and exit with its remote status")]
    Run(RunCommand),
    /// Run several commands in one round trip and print their results.
    #[command(
        name = "batch",
        about = "Run several commands in one round trip and print their results"
    )]
    Batch(BatchCommand),
}

/// Arguments for the `shellpool run` subcommand.
#[derive(Debug, Parser)]
pub(crate) struct RunCommand {
    /// Command to execute on the remote host (use -- to separate flags).
    #[arg(required = true, trailing_var_arg = true)]
    pub(crate) command: Vec<String>,
}

/// Arguments for the `shellpool batch` subcommand.
#[derive(Debug, Parser)]
pub(crate) struct BatchCommand {
    /// How results are framed in the combined output.
    #[arg(long, value_name = "FORMAT", default_value = "separator", value_parser = BATCH_FORMATS)]
    pub(crate) format: String,
    /// Commands to execute, one result per command.
    #[arg(required = true)]
    pub(crate) commands: Vec<String>,
}
