//! Binary entry point for the `shellpool` CLI.

use std::env;
use std::io::{self, Write};
use std::process;
use std::time::Duration;

use clap::Parser;
use thiserror::Error;

use shellpool::batch::{BatchBuilder, BatchError, BatchResult, BatchValue, OutputFormat};
use shellpool::exec::{ExecError, Executor};
use shellpool::logging::{LoggingError, init_logging};
use shellpool::pool::{Lease, Pool, PoolConfig, PoolError};
use shellpool::session::{CommandOutput, SessionFactory};
use shellpool::ssh::{ProcessCommandRunner, SshConfig, SshSessionFactory};
use shellpool::test_support::FakeFactory;

mod cli;

use cli::{BatchCommand, Cli, Command, RunCommand};

/// Replaces SSH with in-memory sessions: `ok` succeeds, `fail` fails the
/// first command with status 7.
const FAKE_SESSIONS_ENV: &str = "SHELLPOOL_FAKE_SESSIONS";

const FAKE_FAILURE_ENVELOPE: &str = concat!(
    "#< CLIXML\r\n",
    "<Objs Version=\"1.1.0.1\"><S S=\"Error\">Invoke-Thing : Boom_x000D__x000A_</S></Objs>"
);

#[derive(Debug, Error)]
enum CliError {
    #[error("configuration error: {0}")]
    Config(String),
    #[error("logging setup failed: {0}")]
    Logging(#[from] LoggingError),
    #[error("session pool error: {0}")]
    Pool(#[from] PoolError),
    #[error(transparent)]
    Exec(#[from] ExecError),
    #[error("invalid batch: {0}")]
    Batch(#[from] BatchError),
    #[error("remote command terminated without an exit status")]
    MissingExitCode,
    #[error("invalid command argument: {0}")]
    InvalidCommand(String),
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    let exit_code = match dispatch(cli).await {
        Ok(code) => code,
        Err(err) => {
            report_error(&err);
            1
        }
    };

    process::exit(exit_code);
}

async fn dispatch(cli: Cli) -> Result<i32, CliError> {
    init_logging(cli.verbose)?;
    let executor = executor_for(cli.timeout);
    let mut stdout = io::stdout();
    let mut stderr = io::stderr();

    if let Ok(mode) = env::var(FAKE_SESSIONS_ENV) {
        let pool = fake_pool(&mode)?;
        return execute(&pool, &executor, &cli.command, &mut stdout, &mut stderr).await;
    }
    let pool = ssh_pool()?;
    execute(&pool, &executor, &cli.command, &mut stdout, &mut stderr).await
}

fn executor_for(timeout_secs: Option<u64>) -> Executor {
    match timeout_secs {
        Some(secs) => Executor::new().with_command_timeout(Duration::from_secs(secs)),
        None => Executor::new(),
    }
}

fn ssh_pool() -> Result<Pool<SshSessionFactory<ProcessCommandRunner>>, CliError> {
    let ssh_config =
        SshConfig::load_without_cli_args().map_err(|err| CliError::Config(err.to_string()))?;
    let factory = SshSessionFactory::with_process_runner(ssh_config)
        .map_err(|err| CliError::Config(err.to_string()))?;
    Ok(Pool::new(load_pool_config()?, factory)?)
}

fn fake_pool(mode: &str) -> Result<Pool<FakeFactory>, CliError> {
    let factory = FakeFactory::new();
    match mode {
        "ok" => {}
        "fail" => factory.push_output(CommandOutput {
            code: Some(7),
            stdout: String::from("partial\n"),
            stderr: String::from(FAKE_FAILURE_ENVELOPE),
        }),
        other => {
            return Err(CliError::Config(format!(
                "unknown {FAKE_SESSIONS_ENV} mode: {other}"
            )));
        }
    }
    Ok(Pool::new(load_pool_config()?, factory)?)
}

fn load_pool_config() -> Result<PoolConfig, CliError> {
    PoolConfig::load_without_cli_args().map_err(|err| CliError::Config(err.to_string()))
}

async fn execute<F: SessionFactory>(
    pool: &Pool<F>,
    executor: &Executor,
    command: &Command,
    out: &mut impl Write,
    err: &mut impl Write,
) -> Result<i32, CliError> {
    let outcome = match command {
        Command::Run(args) => run_command(pool, executor, args, out, err).await,
        Command::Batch(args) => run_batch(pool, executor, args, out, err).await,
    };
    pool.close().await;
    outcome
}

async fn run_command<F: SessionFactory>(
    pool: &Pool<F>,
    executor: &Executor,
    args: &RunCommand,
    out: &mut impl Write,
    err: &mut impl Write,
) -> Result<i32, CliError> {
    validate_command_args(&args.command)?;
    let command = args.command.join(" ");
    let lease = pool.get().await?;
    let result = executor.run(&*lease, &command).await;
    settle(lease, &result).await;

    match result {
        Ok(output) => {
            out.write_all(output.stdout.as_bytes()).ok();
            err.write_all(output.stderr.as_bytes()).ok();
            Ok(0)
        }
        Err(ExecError::Failed {
            exit_code,
            stdout,
            message,
            ..
        }) => {
            out.write_all(stdout.as_bytes()).ok();
            writeln!(err, "{message}").ok();
            exit_code.ok_or(CliError::MissingExitCode)
        }
        Err(other) => Err(other.into()),
    }
}

async fn run_batch<F: SessionFactory>(
    pool: &Pool<F>,
    executor: &Executor,
    args: &BatchCommand,
    out: &mut impl Write,
    err: &mut impl Write,
) -> Result<i32, CliError> {
    let format = args.format.parse::<OutputFormat>()?;
    validate_command_args(&args.commands)?;
    let script = BatchBuilder::new()
        .output_format(format)
        .add_all(&args.commands)
        .build();

    let lease = pool.get().await?;
    let result = executor.run_batch(&*lease, &script).await;
    settle(lease, &result).await;

    let results = result?;
    for line in render_results(&results) {
        writeln!(out, "{line}").ok();
    }
    let Some(diagnostic) = results.diagnostic() else {
        return Ok(0);
    };
    writeln!(err, "{diagnostic}").ok();
    Ok(1)
}

/// Returns the session to the pool, or closes it after a transport failure.
async fn settle<F: SessionFactory, T>(lease: Lease<F>, result: &Result<T, ExecError>) {
    if result
        .as_ref()
        .is_err_and(|failure| failure.is_transport_level())
    {
        lease.discard().await;
    } else {
        lease.release().await;
    }
}

fn render_results(result: &BatchResult) -> Vec<String> {
    if result.format() == OutputFormat::Object {
        return result
            .fields()
            .iter()
            .map(|(key, value)| format!("{key}={}", value.to_text()))
            .collect();
    }
    result.values().iter().map(BatchValue::to_text).collect()
}

fn validate_command_args(args: &[String]) -> Result<(), CliError> {
    for arg in args {
        if arg
            .chars()
            .any(|ch| matches!(ch, '\u{0000}'..='\u{001F}' | '\u{007F}'))
        {
            return Err(CliError::InvalidCommand(String::from(concat!(
                "command arguments must not contain control characters (ASCII ",
                "0x00-0x1F or 0x7F, e.g. newline, carriage return, tab, NUL)"
            ))));
        }
    }
    Ok(())
}

fn report_error(err: &CliError) {
    write_error(io::stderr(), err);
}

fn write_error(mut target: impl Write, err: &CliError) {
    writeln!(target, "{err}").ok();
}
