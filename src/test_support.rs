//! Test support utilities shared across unit and integration tests.

use std::collections::{BTreeSet, HashSet, VecDeque};
use std::env;
use std::ffi::OsString;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

use tokio::sync::{Mutex, MutexGuard};

use crate::session::{CommandOutput, Session, SessionError, SessionFactory, SessionFuture};
use crate::ssh::CommandRunner;

type Response = Result<CommandOutput, SessionError>;

/// Scripted command runner that returns pre-seeded outputs in FIFO order.
///
/// Used to drive deterministic `ssh` outcomes without spawning processes.
#[derive(Clone, Debug, Default)]
pub struct ScriptedRunner {
    responses: Arc<parking_lot::Mutex<VecDeque<Response>>>,
    invocations: Arc<parking_lot::Mutex<Vec<CommandInvocation>>>,
}

/// Records a single invocation made through [`ScriptedRunner`].
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct CommandInvocation {
    /// Program name as passed to the runner.
    pub program: String,
    /// Arguments passed to the program.
    pub args: Vec<OsString>,
    /// Whether the program was started with detached stdio.
    pub detached: bool,
}

impl CommandInvocation {
    /// Returns a shell-like command string for assertions.
    #[must_use]
    pub fn command_string(&self) -> String {
        let mut parts = Vec::with_capacity(self.args.len().saturating_add(1));
        parts.push(self.program.clone());
        parts.extend(
            self.args
                .iter()
                .map(|arg| arg.to_string_lossy().into_owned()),
        );
        parts.join(" ")
    }
}

impl ScriptedRunner {
    /// Creates a new runner with no queued responses.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns a snapshot of all invocations recorded so far.
    #[must_use]
    pub fn invocations(&self) -> Vec<CommandInvocation> {
        self.invocations.lock().clone()
    }

    /// Pushes a successful exit status with no output.
    pub fn push_success(&self) {
        self.push_output(Some(0), "", "");
    }

    /// Pushes a failing exit code with stderr text.
    pub fn push_failure(&self, code: i32) {
        self.push_output(Some(code), "", "simulated failure");
    }

    /// Pushes a response with no exit code to simulate abnormal termination.
    pub fn push_missing_exit_code(&self) {
        self.push_output(None, "", "");
    }

    /// Pushes an explicit command output response.
    pub fn push_output(
        &self,
        code: Option<i32>,
        stdout: impl Into<String>,
        stderr: impl Into<String>,
    ) {
        self.responses.lock().push_back(Ok(CommandOutput {
            code,
            stdout: stdout.into(),
            stderr: stderr.into(),
        }));
    }

    /// Pushes a runner error, such as a spawn failure.
    pub fn push_error(&self, error: SessionError) {
        self.responses.lock().push_back(Err(error));
    }

    fn next(&self, program: &str, args: &[OsString], detached: bool) -> Response {
        self.invocations.lock().push(CommandInvocation {
            program: program.to_owned(),
            args: args.to_vec(),
            detached,
        });
        self.responses
            .lock()
            .pop_front()
            .unwrap_or_else(|| {
                Err(SessionError::Spawn {
                    program: program.to_owned(),
                    message: String::from("no scripted response available"),
                })
            })
    }
}

impl CommandRunner for ScriptedRunner {
    fn run<'a>(
        &'a self,
        program: &'a str,
        args: &'a [OsString],
    ) -> SessionFuture<'a, CommandOutput> {
        let response = self.next(program, args, false);
        Box::pin(async move { response })
    }

    fn run_detached<'a>(
        &'a self,
        program: &'a str,
        args: &'a [OsString],
    ) -> SessionFuture<'a, CommandOutput> {
        let response = self.next(program, args, true);
        Box::pin(async move { response })
    }
}

#[derive(Debug, Default)]
struct FakeState {
    attempts: AtomicUsize,
    created: AtomicUsize,
    closed: AtomicUsize,
    failing_creates: AtomicUsize,
    create_delay: parking_lot::Mutex<Option<Duration>>,
    run_delay: parking_lot::Mutex<Option<Duration>>,
    close_delay: parking_lot::Mutex<Option<Duration>>,
    unhealthy: parking_lot::Mutex<HashSet<usize>>,
    responses: parking_lot::Mutex<VecDeque<Response>>,
    commands: parking_lot::Mutex<Vec<(usize, String)>>,
}

/// In-memory [`SessionFactory`] for exercising the pool and executor.
///
/// Sessions are numbered from 1 in creation order. Commands succeed with
/// `ok` unless a response has been queued or the session was marked
/// unhealthy.
#[derive(Clone, Debug, Default)]
pub struct FakeFactory {
    state: Arc<FakeState>,
}

impl FakeFactory {
    /// Creates a factory whose sessions always succeed.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Delays every session creation by `delay`.
    #[must_use]
    pub fn with_create_delay(self, delay: Duration) -> Self {
        *self.state.create_delay.lock() = Some(delay);
        self
    }

    /// Delays every command by `delay`.
    #[must_use]
    pub fn with_run_delay(self, delay: Duration) -> Self {
        *self.state.run_delay.lock() = Some(delay);
        self
    }

    /// Delays every session close by `delay`.
    #[must_use]
    pub fn with_close_delay(self, delay: Duration) -> Self {
        *self.state.close_delay.lock() = Some(delay);
        self
    }

    /// Makes the next `count` creations fail with a connect error.
    pub fn fail_next_creates(&self, count: usize) {
        self.state.failing_creates.store(count, Ordering::SeqCst);
    }

    /// Makes every command on the session with `serial` exit with status 1.
    pub fn mark_unhealthy(&self, serial: usize) {
        self.state.unhealthy.lock().insert(serial);
    }

    /// Queues the output of the next command run on any healthy session.
    pub fn push_output(&self, output: CommandOutput) {
        self.state.responses.lock().push_back(Ok(output));
    }

    /// Queues a transport error for the next command.
    pub fn push_error(&self, error: SessionError) {
        self.state.responses.lock().push_back(Err(error));
    }

    /// Number of creations started, including failed ones.
    #[must_use]
    pub fn create_attempts(&self) -> usize {
        self.state.attempts.load(Ordering::SeqCst)
    }

    /// Number of sessions successfully created.
    #[must_use]
    pub fn created(&self) -> usize {
        self.state.created.load(Ordering::SeqCst)
    }

    /// Number of sessions closed.
    #[must_use]
    pub fn closed(&self) -> usize {
        self.state.closed.load(Ordering::SeqCst)
    }

    /// Commands run so far as `(session serial, command)` pairs.
    #[must_use]
    pub fn commands(&self) -> Vec<(usize, String)> {
        self.state.commands.lock().clone()
    }
}

impl SessionFactory for FakeFactory {
    type Session = FakeSession;

    fn create(&self) -> SessionFuture<'_, Self::Session> {
        Box::pin(async move {
            self.state.attempts.fetch_add(1, Ordering::SeqCst);
            let delay = *self.state.create_delay.lock();
            if let Some(pause) = delay {
                tokio::time::sleep(pause).await;
            }
            let should_fail = self
                .state
                .failing_creates
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |left| {
                    left.checked_sub(1)
                })
                .is_ok();
            if should_fail {
                return Err(SessionError::Connect {
                    target: String::from("fake"),
                    message: String::from("simulated connect failure"),
                });
            }
            let id = self.state.created.fetch_add(1, Ordering::SeqCst).saturating_add(1);
            Ok(FakeSession {
                id,
                state: Arc::clone(&self.state),
                closed: AtomicBool::new(false),
            })
        })
    }
}

/// Session produced by [`FakeFactory`].
#[derive(Debug)]
pub struct FakeSession {
    id: usize,
    state: Arc<FakeState>,
    closed: AtomicBool,
}

impl FakeSession {
    /// Creation-order serial number, starting at 1.
    #[must_use]
    pub const fn serial(&self) -> usize {
        self.id
    }

    /// Returns `true` once the session has been closed.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

impl Session for FakeSession {
    fn run<'a>(&'a self, command: &'a str) -> SessionFuture<'a, CommandOutput> {
        Box::pin(async move {
            if self.is_closed() {
                return Err(SessionError::Closed);
            }
            self.state.commands.lock().push((self.id, command.to_owned()));
            let delay = *self.state.run_delay.lock();
            if let Some(pause) = delay {
                tokio::time::sleep(pause).await;
            }
            if self.state.unhealthy.lock().contains(&self.id) {
                return Ok(CommandOutput {
                    code: Some(1),
                    stdout: String::new(),
                    stderr: String::from("session unhealthy"),
                });
            }
            let queued = self.state.responses.lock().pop_front();
            queued.unwrap_or_else(|| {
                Ok(CommandOutput {
                    code: Some(0),
                    stdout: String::from("ok\n"),
                    stderr: String::new(),
                })
            })
        })
    }

    fn close(&self) -> SessionFuture<'_, ()> {
        Box::pin(async move {
            let delay = *self.state.close_delay.lock();
            if let Some(pause) = delay {
                tokio::time::sleep(pause).await;
            }
            if !self.closed.swap(true, Ordering::SeqCst) {
                self.state.closed.fetch_add(1, Ordering::SeqCst);
            }
            Ok(())
        })
    }
}

/// Global mutex used to serialise environment mutation in tests.
pub static ENV_LOCK: Mutex<()> = Mutex::const_new(());

/// Guard that holds the env mutex and restores variables on drop.
pub struct EnvGuard {
    previous: Vec<(String, Option<OsString>)>,
    _guard: MutexGuard<'static, ()>,
}

impl EnvGuard {
    /// Sets multiple environment variables while holding a global mutex.
    pub async fn set_vars(pairs: &[(&str, &str)]) -> Self {
        debug_assert!(
            {
                let mut seen = BTreeSet::new();
                pairs.iter().all(|(key, _)| seen.insert(*key))
            },
            "duplicate environment variable keys passed to EnvGuard::set_vars"
        );

        let guard = ENV_LOCK.lock().await;
        let mut previous = Vec::with_capacity(pairs.len());
        for (key, value) in pairs {
            let old = env::var_os(key);
            // SAFETY: Environment mutation is serialised by `ENV_LOCK`, preventing races.
            unsafe { env::set_var(key, value) };
            previous.push(((*key).to_owned(), old));
        }

        Self {
            previous,
            _guard: guard,
        }
    }
}

impl Drop for EnvGuard {
    fn drop(&mut self) {
        for (key, old) in &self.previous {
            // SAFETY: Environment mutation is serialised by holding `_guard`.
            unsafe {
                match old {
                    Some(val) => env::set_var(key, val),
                    None => env::remove_var(key),
                }
            }
        }
    }
}
