//! Bounded, shareable pool of remote sessions.
//!
//! The pool keeps three disjoint collections: an idle stack (most recently
//! returned on top), the set of lent-out sessions, and a FIFO queue of
//! borrowers waiting for capacity. A session is in exactly one of them, or
//! in flight to a waiter, at any instant. All bookkeeping happens under one
//! short-lived lock; commands, probes, and closes always run outside it.
//!
//! Borrowing returns a [`Lease`]. Releasing it explicitly with
//! [`Lease::release`] returns the session to the pool; dropping it does the
//! same as a fallback, so every exit path gives the session back.

use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::mem;
use std::ops::Deref;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::runtime::Handle;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior, interval_at, timeout};
use tracing::{debug, info, warn};

use crate::session::{Session, SessionFactory};

mod config;
mod error;
mod stats;

pub use config::{
    DEFAULT_IDLE_TIMEOUT_MS, DEFAULT_MAX_ACTIVE, DEFAULT_MAX_IDLE, DEFAULT_PROBE_COMMAND,
    DEFAULT_SWEEP_INTERVAL_MS, DEFAULT_TEST_INTERVAL_MS, DEFAULT_WAIT_TIMEOUT_MS, PoolConfig,
    PoolConfigError,
};
pub use error::PoolError;
pub use stats::PoolStats;

use stats::Counters;

/// Pool bookkeeping for one session.
struct Entry<S> {
    id: u64,
    session: Arc<S>,
    created_at: Instant,
    last_used_at: Instant,
    last_checked_at: Instant,
    use_count: u64,
    borrowed: bool,
}

impl<S> Entry<S> {
    fn new(id: u64, session: Arc<S>, now: Instant) -> Self {
        Self {
            id,
            session,
            created_at: now,
            last_used_at: now,
            last_checked_at: now,
            use_count: 1,
            borrowed: true,
        }
    }

    fn lend(&mut self, now: Instant) {
        self.borrowed = true;
        self.use_count = self.use_count.saturating_add(1);
        self.last_used_at = now;
    }
}

/// What a queued borrower receives.
enum Handoff<S> {
    /// A returned session, already recorded as lent out.
    Session { id: u64, session: Arc<S> },
    /// Freed capacity; the receiver owns a creation reservation.
    Slot,
}

struct Waiter<S> {
    id: u64,
    sender: oneshot::Sender<Handoff<S>>,
}

enum CheckIn<S> {
    Idle,
    Delivered,
    Close(Arc<S>),
    Unknown,
}

struct State<S> {
    closed: bool,
    idle: Vec<Entry<S>>,
    active: HashMap<u64, Entry<S>>,
    waiting: VecDeque<Waiter<S>>,
    creating: usize,
    next_session_id: u64,
    next_waiter_id: u64,
    counters: Counters,
}

impl<S> State<S> {
    fn new() -> Self {
        Self {
            closed: false,
            idle: Vec::new(),
            active: HashMap::new(),
            waiting: VecDeque::new(),
            creating: 0,
            next_session_id: 1,
            next_waiter_id: 1,
            counters: Counters::default(),
        }
    }

    fn at_capacity(&self, max_active: usize) -> bool {
        max_active > 0 && self.active.len().saturating_add(self.creating) >= max_active
    }

    /// Passes freed capacity to the oldest borrower still waiting.
    fn hand_off_slot(&mut self) {
        while let Some(waiter) = self.waiting.pop_front() {
            self.creating = self.creating.saturating_add(1);
            if waiter.sender.send(Handoff::Slot).is_ok() {
                return;
            }
            self.creating = self.creating.saturating_sub(1);
        }
    }

    fn check_in(&mut self, id: u64, max_idle: usize, now: Instant) -> CheckIn<S> {
        let Some(mut entry) = self.active.remove(&id) else {
            return CheckIn::Unknown;
        };
        debug_assert!(entry.borrowed, "active sessions are always borrowed");
        if self.closed {
            self.counters.record_closed(1);
            return CheckIn::Close(entry.session);
        }

        while let Some(waiter) = self.waiting.pop_front() {
            if waiter.sender.is_closed() {
                continue;
            }
            entry.lend(now);
            let session = Arc::clone(&entry.session);
            self.active.insert(id, entry);
            if waiter.sender.send(Handoff::Session { id, session }).is_ok() {
                return CheckIn::Delivered;
            }
            match self.active.remove(&id) {
                Some(reclaimed) => entry = reclaimed,
                None => return CheckIn::Delivered,
            }
        }

        entry.borrowed = false;
        entry.last_used_at = now;
        if self.idle.len() < max_idle {
            self.idle.push(entry);
            CheckIn::Idle
        } else {
            self.counters.record_closed(1);
            CheckIn::Close(entry.session)
        }
    }

    fn retire(&mut self, id: u64) {
        if self.active.remove(&id).is_none() {
            return;
        }
        self.counters.record_closed(1);
        if !self.closed {
            self.hand_off_slot();
        }
    }

    /// Drops a session that failed its probe, converting its capacity into
    /// a creation reservation for the same borrower. Returns `false` when
    /// nothing was reserved.
    fn retire_unhealthy(&mut self, id: u64) -> bool {
        if self.active.remove(&id).is_none() {
            return false;
        }
        self.counters.record_closed(1);
        self.counters.health_check_failures =
            self.counters.health_check_failures.saturating_add(1);
        if self.closed {
            return false;
        }
        self.creating = self.creating.saturating_add(1);
        true
    }
}

struct Shared<F: SessionFactory> {
    factory: F,
    config: PoolConfig,
    state: Mutex<State<F::Session>>,
    sweeper: Mutex<Option<JoinHandle<()>>>,
}

impl<F: SessionFactory> Drop for Shared<F> {
    fn drop(&mut self) {
        if let Some(task) = self.sweeper.get_mut().take() {
            task.abort();
        }
        let state = self.state.get_mut();
        if state.closed {
            return;
        }
        for entry in state.idle.drain(..) {
            close_detached(entry.session);
        }
    }
}

/// A bounded pool of sessions produced by a [`SessionFactory`].
///
/// `Pool` is a cheap handle; clones share the same sessions.
pub struct Pool<F: SessionFactory> {
    shared: Arc<Shared<F>>,
}

impl<F: SessionFactory> Clone for Pool<F> {
    fn clone(&self) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
        }
    }
}

impl<F: SessionFactory> fmt::Debug for Pool<F> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Pool")
            .field("config", &self.shared.config)
            .field("stats", &self.stats())
            .finish_non_exhaustive()
    }
}

enum Step<F: SessionFactory> {
    Ready(Lease<F>),
    Probe(Lease<F>),
    Create(Reservation<F>),
    Wait(WaitGuard<F>),
}

impl<F: SessionFactory> Pool<F> {
    /// Creates a pool and, when configured, starts the background idle
    /// sweep on the current Tokio runtime.
    ///
    /// # Errors
    ///
    /// Returns [`PoolError::Config`] when the configuration is inconsistent.
    pub fn new(config: PoolConfig, factory: F) -> Result<Self, PoolError> {
        config.validate()?;
        let sweep_interval = config.sweep_interval();
        let pool = Self {
            shared: Arc::new(Shared {
                factory,
                config,
                state: Mutex::new(State::new()),
                sweeper: Mutex::new(None),
            }),
        };
        if let Some(period) = sweep_interval {
            pool.spawn_sweeper(period);
        }
        Ok(pool)
    }

    /// The configuration the pool was built with.
    #[must_use]
    pub fn config(&self) -> &PoolConfig {
        &self.shared.config
    }

    /// The factory used to open sessions.
    #[must_use]
    pub fn factory(&self) -> &F {
        &self.shared.factory
    }

    /// Borrows a session.
    ///
    /// Idle sessions are reused most-recent first, probed beforehand when
    /// `test_on_borrow` is set and the last probe is older than
    /// `test_interval`. Unhealthy candidates are discarded silently. When no
    /// idle session survives and the pool is at `max_active`, the caller
    /// queues until a session is returned, `wait_timeout` elapses, or the
    /// pool closes. Otherwise a new session is opened. Dropping the returned
    /// future cancels only this borrower.
    ///
    /// # Errors
    ///
    /// Returns [`PoolError::Closed`] after [`Pool::close`],
    /// [`PoolError::Timeout`] when the wait expires, or
    /// [`PoolError::SessionCreation`] when the factory fails. Creation is
    /// never retried here.
    pub async fn get(&self) -> Result<Lease<F>, PoolError> {
        let mut held = None;
        loop {
            match self.next_step(held.take())? {
                Step::Ready(lease) => return Ok(lease),
                Step::Probe(lease) => {
                    if self.probe(&lease).await {
                        return self.confirm_probe(lease);
                    }
                    held = lease.replace().await;
                }
                Step::Create(reservation) => return self.open(reservation).await,
                Step::Wait(guard) => return self.wait(guard).await,
            }
        }
    }

    /// Closes every idle session whose idle time exceeds `idle_timeout`.
    ///
    /// The background sweep calls this periodically; it may also be called
    /// directly. Returns the number of sessions evicted.
    pub async fn sweep_idle(&self) -> usize {
        let limit = self.shared.config.idle_timeout();
        let now = Instant::now();
        let expired = {
            let mut state = self.shared.state.lock();
            if state.closed {
                return 0;
            }
            let (fresh, expired): (Vec<_>, Vec<_>) = mem::take(&mut state.idle)
                .into_iter()
                .partition(|entry| now.saturating_duration_since(entry.last_used_at) <= limit);
            state.idle = fresh;
            state.counters.record_closed(expired.len());
            expired
        };

        for entry in &expired {
            debug!(
                session_id = entry.id,
                uses = entry.use_count,
                age_ms = now.saturating_duration_since(entry.created_at).as_millis(),
                "evicting idle session"
            );
            close_quietly(entry.session.as_ref()).await;
        }
        expired.len()
    }

    /// Closes the pool.
    ///
    /// Stops the sweep, wakes every queued borrower with
    /// [`PoolError::Closed`], and closes idle and lent-out sessions alike.
    /// Holders of a lent-out session will see transport errors from then on.
    /// Calling this more than once has no further effect.
    pub async fn close(&self) {
        let (sessions, waiters) = {
            let mut state = self.shared.state.lock();
            if state.closed {
                return;
            }
            state.closed = true;
            let waiters = mem::take(&mut state.waiting);
            let mut sessions = state
                .idle
                .drain(..)
                .map(|entry| entry.session)
                .collect::<Vec<_>>();
            sessions.extend(state.active.drain().map(|(_, entry)| entry.session));
            state.counters.record_closed(sessions.len());
            (sessions, waiters)
        };

        if let Some(task) = self.shared.sweeper.lock().take() {
            task.abort();
        }
        let woken = waiters.len();
        drop(waiters);
        for session in &sessions {
            close_quietly(session.as_ref()).await;
        }
        info!(
            closed_sessions = sessions.len(),
            woken_waiters = woken,
            "session pool closed"
        );
    }

    /// Returns `true` once [`Pool::close`] has been called.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.shared.state.lock().closed
    }

    /// Returns a point-in-time snapshot of pool usage.
    #[must_use]
    pub fn stats(&self) -> PoolStats {
        let state = self.shared.state.lock();
        let counters = state.counters;
        PoolStats {
            active: state.active.len(),
            idle: state.idle.len(),
            total: state.active.len().saturating_add(state.idle.len()),
            waiting: state.waiting.len(),
            connections_created: counters.created,
            connections_closed: counters.closed,
            wait_count: counters.waits,
            wait_duration: counters.wait_duration,
            health_check_failures: counters.health_check_failures,
        }
    }

    /// Decides how to serve a borrower. `held` is capacity kept from a
    /// session that just failed its probe; it is used instead of queueing.
    fn next_step(&self, held: Option<Reservation<F>>) -> Result<Step<F>, PoolError> {
        let config = &self.shared.config;
        let now = Instant::now();
        let mut state = self.shared.state.lock();
        if state.closed {
            drop(state);
            drop(held);
            return Err(PoolError::Closed);
        }

        if let Some(mut entry) = state.idle.pop() {
            let needs_probe = config.test_on_borrow
                && now.saturating_duration_since(entry.last_checked_at) >= config.test_interval();
            entry.lend(now);
            let id = entry.id;
            let session = Arc::clone(&entry.session);
            state.active.insert(id, entry);
            drop(state);
            drop(held);

            debug!(session_id = id, needs_probe, "reusing idle session");
            let lease = Lease::new(self.clone(), id, session);
            return Ok(if needs_probe {
                Step::Probe(lease)
            } else {
                Step::Ready(lease)
            });
        }

        if let Some(reservation) = held {
            drop(state);
            return Ok(Step::Create(reservation));
        }

        if state.at_capacity(config.max_active) {
            if config.wait_timeout_ms == 0 {
                return Err(PoolError::Timeout {
                    waited: Duration::ZERO,
                });
            }
            let (sender, receiver) = oneshot::channel();
            let id = state.next_waiter_id;
            state.next_waiter_id = state.next_waiter_id.saturating_add(1);
            state.waiting.push_back(Waiter { id, sender });
            drop(state);

            return Ok(Step::Wait(WaitGuard {
                pool: self.clone(),
                id,
                receiver,
                started: now,
                armed: true,
            }));
        }

        state.creating = state.creating.saturating_add(1);
        drop(state);
        Ok(Step::Create(Reservation {
            pool: self.clone(),
            armed: true,
        }))
    }

    async fn probe(&self, lease: &Lease<F>) -> bool {
        match lease.run(&self.shared.config.probe_command).await {
            Ok(output) if output.is_success() => true,
            Ok(output) => {
                warn!(
                    session_id = lease.id,
                    status = %output.status_text(),
                    "health probe failed; discarding session"
                );
                false
            }
            Err(err) => {
                warn!(
                    session_id = lease.id,
                    error = %err,
                    "health probe failed; discarding session"
                );
                false
            }
        }
    }

    fn confirm_probe(&self, lease: Lease<F>) -> Result<Lease<F>, PoolError> {
        let mut state = self.shared.state.lock();
        if state.closed {
            drop(state);
            return Err(PoolError::Closed);
        }
        if let Some(entry) = state.active.get_mut(&lease.id) {
            entry.last_checked_at = Instant::now();
        }
        drop(state);
        Ok(lease)
    }

    async fn open(&self, mut reservation: Reservation<F>) -> Result<Lease<F>, PoolError> {
        let session = match self.shared.factory.create().await {
            Ok(session) => Arc::new(session),
            Err(err) => {
                warn!(error = %err, "failed to open session");
                drop(reservation);
                return Err(PoolError::SessionCreation(err));
            }
        };

        let admitted = {
            let mut state = self.shared.state.lock();
            reservation.armed = false;
            state.creating = state.creating.saturating_sub(1);
            state.counters.created = state.counters.created.saturating_add(1);
            if state.closed {
                state.counters.record_closed(1);
                None
            } else {
                let id = state.next_session_id;
                state.next_session_id = state.next_session_id.saturating_add(1);
                state
                    .active
                    .insert(id, Entry::new(id, Arc::clone(&session), Instant::now()));
                Some(id)
            }
        };

        if let Some(id) = admitted {
            debug!(session_id = id, "opened new session");
            Ok(Lease::new(self.clone(), id, session))
        } else {
            close_quietly(session.as_ref()).await;
            Err(PoolError::Closed)
        }
    }

    async fn wait(&self, mut guard: WaitGuard<F>) -> Result<Lease<F>, PoolError> {
        debug!(waiter_id = guard.id, "pool saturated; waiting for a session");
        let outcome = timeout(self.shared.config.wait_timeout(), &mut guard.receiver).await;
        let waited = guard.started.elapsed();
        self.shared.state.lock().counters.record_wait(waited);

        match outcome {
            Ok(Ok(handoff)) => {
                guard.armed = false;
                self.accept(handoff).await
            }
            Ok(Err(_)) => {
                guard.armed = false;
                Err(PoolError::Closed)
            }
            Err(_) => {
                let handoff = self.give_up(&mut guard, waited)?;
                self.accept(handoff).await
            }
        }
    }

    /// Leaves the queue after the wait expired. A hand-off that raced the
    /// deadline is still honoured; a pool that closed meanwhile reports
    /// [`PoolError::Closed`].
    fn give_up(
        &self,
        guard: &mut WaitGuard<F>,
        waited: Duration,
    ) -> Result<Handoff<F::Session>, PoolError> {
        if let Some(handoff) = guard.abandon() {
            return Ok(handoff);
        }
        if self.shared.state.lock().closed {
            return Err(PoolError::Closed);
        }
        debug!(waiter_id = guard.id, "gave up waiting for a session");
        Err(PoolError::Timeout { waited })
    }

    async fn accept(&self, handoff: Handoff<F::Session>) -> Result<Lease<F>, PoolError> {
        match handoff {
            Handoff::Session { id, session } => Ok(Lease::new(self.clone(), id, session)),
            Handoff::Slot => {
                self.open(Reservation {
                    pool: self.clone(),
                    armed: true,
                })
                .await
            }
        }
    }

    fn check_in(&self, id: u64, session: Arc<F::Session>) -> Option<Arc<F::Session>> {
        let outcome = {
            let mut state = self.shared.state.lock();
            state.check_in(id, self.shared.config.max_idle, Instant::now())
        };
        match outcome {
            CheckIn::Idle => {
                debug!(session_id = id, "session returned to idle");
                None
            }
            CheckIn::Delivered => {
                debug!(session_id = id, "session handed to waiting borrower");
                None
            }
            CheckIn::Close(stale) => {
                debug!(session_id = id, "no idle capacity; closing returned session");
                Some(stale)
            }
            CheckIn::Unknown => {
                debug!(session_id = id, "released session not owned by pool; closing");
                Some(session)
            }
        }
    }

    fn spawn_sweeper(&self, period: Duration) {
        let Ok(runtime) = Handle::try_current() else {
            warn!("no Tokio runtime available; idle sessions are only swept on demand");
            return;
        };
        let shared = Arc::downgrade(&self.shared);
        let task = runtime.spawn(async move {
            let mut ticker = interval_at(Instant::now() + period, period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                let Some(strong) = shared.upgrade() else {
                    break;
                };
                let evicted = Self { shared: strong }.sweep_idle().await;
                if evicted > 0 {
                    debug!(evicted, "idle sweep closed sessions");
                }
            }
        });
        *self.shared.sweeper.lock() = Some(task);
    }
}

/// A borrowed session.
///
/// Dereferences to the underlying [`Session`]. Call [`Lease::release`] to
/// return it, or [`Lease::discard`] to close it after a transport failure.
/// Dropping an unreleased lease returns the session as well.
pub struct Lease<F: SessionFactory> {
    pool: Pool<F>,
    id: u64,
    session: Arc<F::Session>,
    released: bool,
}

impl<F: SessionFactory> Lease<F> {
    const fn new(pool: Pool<F>, id: u64, session: Arc<F::Session>) -> Self {
        Self {
            pool,
            id,
            session,
            released: false,
        }
    }

    /// Pool-assigned identifier of the borrowed session.
    #[must_use]
    pub const fn id(&self) -> u64 {
        self.id
    }

    /// Returns the session to the pool.
    ///
    /// A queued borrower receives it directly; otherwise it joins the idle
    /// stack, or is closed when the idle stack is full or the pool closed.
    pub async fn release(mut self) {
        self.released = true;
        if let Some(stale) = self.pool.check_in(self.id, Arc::clone(&self.session)) {
            close_quietly(stale.as_ref()).await;
        }
    }

    /// Closes the session instead of returning it, freeing its capacity.
    pub async fn discard(mut self) {
        self.released = true;
        self.pool.shared.state.lock().retire(self.id);
        close_quietly(self.session.as_ref()).await;
    }

    /// Closes a session that failed its probe. Its capacity comes back as
    /// a reservation, which passes to the next waiter if this borrower is
    /// cancelled before using it.
    async fn replace(mut self) -> Option<Reservation<F>> {
        self.released = true;
        let reserved = self.pool.shared.state.lock().retire_unhealthy(self.id);
        let reservation = reserved.then(|| Reservation {
            pool: self.pool.clone(),
            armed: true,
        });
        close_quietly(self.session.as_ref()).await;
        reservation
    }
}

impl<F: SessionFactory> Deref for Lease<F> {
    type Target = F::Session;

    fn deref(&self) -> &Self::Target {
        &self.session
    }
}

impl<F: SessionFactory> Drop for Lease<F> {
    fn drop(&mut self) {
        if self.released {
            return;
        }
        if let Some(stale) = self.pool.check_in(self.id, Arc::clone(&self.session)) {
            close_detached(stale);
        }
    }
}

impl<F: SessionFactory> fmt::Debug for Lease<F> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Lease")
            .field("id", &self.id)
            .field("released", &self.released)
            .finish_non_exhaustive()
    }
}

/// Capacity held for a session being opened.
struct Reservation<F: SessionFactory> {
    pool: Pool<F>,
    armed: bool,
}

impl<F: SessionFactory> Drop for Reservation<F> {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        let mut state = self.pool.shared.state.lock();
        state.creating = state.creating.saturating_sub(1);
        if !state.closed {
            state.hand_off_slot();
        }
    }
}

/// A queued borrower's place in line.
struct WaitGuard<F: SessionFactory> {
    pool: Pool<F>,
    id: u64,
    receiver: oneshot::Receiver<Handoff<F::Session>>,
    started: Instant,
    armed: bool,
}

impl<F: SessionFactory> WaitGuard<F> {
    /// Leaves the queue, returning any hand-off that raced the departure.
    fn abandon(&mut self) -> Option<Handoff<F::Session>> {
        self.armed = false;
        {
            let mut state = self.pool.shared.state.lock();
            if let Some(position) = state.waiting.iter().position(|waiter| waiter.id == self.id) {
                state.waiting.remove(position);
                return None;
            }
        }
        self.receiver.close();
        self.receiver.try_recv().ok()
    }
}

impl<F: SessionFactory> Drop for WaitGuard<F> {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        match self.abandon() {
            Some(Handoff::Session { id, session }) => {
                drop(Lease::new(self.pool.clone(), id, session));
            }
            Some(Handoff::Slot) => {
                drop(Reservation {
                    pool: self.pool.clone(),
                    armed: true,
                });
            }
            None => {}
        }
    }
}

async fn close_quietly<S: Session>(session: &S) {
    if let Err(err) = session.close().await {
        debug!(error = %err, "session close reported an error");
    }
}

fn close_detached<S: Session>(session: Arc<S>) {
    match Handle::try_current() {
        Ok(runtime) => {
            runtime.spawn(async move {
                close_quietly(session.as_ref()).await;
            });
        }
        Err(_) => warn!("no Tokio runtime available; session dropped without closing"),
    }
}

#[cfg(test)]
mod tests;
