//! Bounded, thread-safe connection pool for one source.
//!
//! The pool keeps up to `max_size` connections open. An acquire takes an idle
//! connection, opens a new one while below the maximum, or waits (bounded by
//! the acquire timeout) for another caller to return one. Closing or dropping
//! a [`PooledConnection`] hands the underlying connection back instead of
//! closing it.
//!
//! # Run States
//!
//! ```text
//! Running --shutdown()--> Shutdown --last connection returned--> Terminated
//! ```
//!
//! After shutdown every acquire fails with `SourceError::PoolShutdown`.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use weave_core::{CachePolicy, CancellationToken, PoolConfig, SourceError, SourceResult};

use crate::command::{Command, CommandOutcome};
use crate::connection::{Connection, RepositorySource};

/// How often a cancellable acquire re-checks its token while waiting.
const CANCEL_POLL_INTERVAL: Duration = Duration::from_millis(10);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunState {
    Running,
    Shutdown,
    Terminated,
}

struct PoolState {
    idle: VecDeque<Box<dyn Connection>>,
    /// Open connections, idle or checked out, plus slots reserved for
    /// connections being opened.
    open: usize,
    in_use: usize,
    core_size: usize,
    max_size: usize,
    run_state: RunState,
}

struct PoolInner {
    source: Arc<dyn RepositorySource>,
    config: PoolConfig,
    state: Mutex<PoolState>,
    available: Condvar,
    terminated: Condvar,
    total_created: AtomicU64,
    total_used: AtomicU64,
}

enum Slot {
    Idle(Box<dyn Connection>),
    Reserved,
}

/// Connection pool for a single [`RepositorySource`].
///
/// Cloning the pool shares it.
#[derive(Clone)]
pub struct ConnectionPool {
    inner: Arc<PoolInner>,
}

impl std::fmt::Debug for ConnectionPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionPool")
            .field("source", &self.inner.source.name())
            .field("pool_size", &self.pool_size())
            .field("in_use", &self.in_use_count())
            .finish()
    }
}

impl ConnectionPool {
    pub fn new(source: Arc<dyn RepositorySource>, config: PoolConfig) -> Self {
        let max_size = config.max_size.max(1);
        let state = PoolState {
            idle: VecDeque::new(),
            open: 0,
            in_use: 0,
            core_size: config.core_size.min(max_size),
            max_size,
            run_state: RunState::Running,
        };
        Self {
            inner: Arc::new(PoolInner {
                source,
                config,
                state: Mutex::new(state),
                available: Condvar::new(),
                terminated: Condvar::new(),
                total_created: AtomicU64::new(0),
                total_used: AtomicU64::new(0),
            }),
        }
    }

    pub fn source_name(&self) -> &str {
        self.inner.source.name()
    }

    pub fn config(&self) -> &PoolConfig {
        &self.inner.config
    }

    pub fn default_cache_policy(&self) -> Option<CachePolicy> {
        self.inner.source.default_cache_policy()
    }

    // ========================================================================
    // ACQUIRE
    // ========================================================================

    /// Check out a connection, waiting up to the configured acquire timeout.
    pub fn acquire(&self) -> SourceResult<PooledConnection> {
        self.acquire_inner(None)
    }

    /// Like [`acquire`](Self::acquire), but gives up with
    /// `SourceError::Cancelled` once `token` is cancelled.
    pub fn acquire_cancellable(&self, token: &CancellationToken) -> SourceResult<PooledConnection> {
        self.acquire_inner(Some(token))
    }

    fn acquire_inner(&self, token: Option<&CancellationToken>) -> SourceResult<PooledConnection> {
        let config = &self.inner.config;
        let deadline = Instant::now() + config.acquire_timeout();
        let mut failed_attempts = 0u32;

        loop {
            let slot = self.reserve(deadline, token)?;
            let mut connection = match slot {
                Slot::Idle(connection) => connection,
                Slot::Reserved => match self.inner.source.get_connection() {
                    Ok(connection) => {
                        let created = self.inner.total_created.fetch_add(1, Ordering::SeqCst) + 1;
                        tracing::debug!(
                            source = %self.source_name(),
                            total_created = created,
                            "Opened pooled connection"
                        );
                        connection
                    }
                    Err(e) => {
                        self.inner.release_slot();
                        return Err(e);
                    }
                },
            };

            if config.validate_before_use && !connection.ping(config.ping_timeout()) {
                connection.close();
                self.inner.release_slot();
                failed_attempts += 1;
                tracing::warn!(
                    source = %self.source_name(),
                    failed_attempts,
                    "Pooled connection failed validation"
                );
                if failed_attempts >= config.max_failed_attempts {
                    return Err(SourceError::Unavailable {
                        source_name: self.source_name().to_string(),
                        reason: format!(
                            "no valid connection after {} attempts",
                            failed_attempts
                        ),
                    });
                }
                continue;
            }

            self.inner.total_used.fetch_add(1, Ordering::SeqCst);
            return Ok(PooledConnection {
                source_name: self.source_name().to_string(),
                connection: Some(connection),
                pool: Arc::clone(&self.inner),
            });
        }
    }

    /// Take an idle connection or reserve room for a new one.
    fn reserve(&self, deadline: Instant, token: Option<&CancellationToken>) -> SourceResult<Slot> {
        let mut state = self.inner.lock_state()?;
        loop {
            if state.run_state != RunState::Running {
                return Err(SourceError::PoolShutdown {
                    source_name: self.source_name().to_string(),
                });
            }
            if token.is_some_and(|t| t.is_cancelled()) {
                return Err(SourceError::Cancelled {
                    source_name: self.source_name().to_string(),
                });
            }
            if let Some(connection) = state.idle.pop_front() {
                state.in_use += 1;
                return Ok(Slot::Idle(connection));
            }
            if state.open < state.max_size {
                state.open += 1;
                state.in_use += 1;
                return Ok(Slot::Reserved);
            }

            let now = Instant::now();
            if now >= deadline {
                return Err(SourceError::Unavailable {
                    source_name: self.source_name().to_string(),
                    reason: format!(
                        "timed out after {:?} waiting for a connection ({} in use)",
                        self.inner.config.acquire_timeout(),
                        state.in_use
                    ),
                });
            }
            let mut wait = deadline - now;
            if token.is_some() {
                wait = wait.min(CANCEL_POLL_INTERVAL);
            }
            state = self
                .inner
                .available
                .wait_timeout(state, wait)
                .map_err(|_| self.inner.poisoned())?
                .0;
        }
    }

    // ========================================================================
    // SIZING
    // ========================================================================

    /// Open connections until the pool holds its core size.
    ///
    /// Returns the number of connections opened.
    pub fn prestart_core_connections(&self) -> SourceResult<usize> {
        let mut started = 0;
        loop {
            {
                let mut state = self.inner.lock_state()?;
                if state.run_state != RunState::Running || state.open >= state.core_size {
                    return Ok(started);
                }
                state.open += 1;
            }
            match self.inner.source.get_connection() {
                Ok(connection) => {
                    self.inner.total_created.fetch_add(1, Ordering::SeqCst);
                    let mut state = self.inner.lock_state()?;
                    state.idle.push_back(connection);
                    started += 1;
                    self.inner.available.notify_one();
                }
                Err(e) => {
                    let mut state = self.inner.lock_state()?;
                    state.open -= 1;
                    return Err(e);
                }
            }
        }
    }

    /// Change the maximum size, closing idle connections above it.
    ///
    /// A size of zero is treated as one.
    pub fn set_maximum_size(&self, max_size: usize) -> SourceResult<()> {
        let max_size = max_size.max(1);
        let mut surplus = Vec::new();
        {
            let mut state = self.inner.lock_state()?;
            state.max_size = max_size;
            state.core_size = state.core_size.min(max_size);
            while state.open > state.max_size {
                match state.idle.pop_back() {
                    Some(connection) => {
                        state.open -= 1;
                        surplus.push(connection);
                    }
                    None => break,
                }
            }
            self.inner.available.notify_all();
        }
        for mut connection in surplus {
            connection.close();
        }
        Ok(())
    }

    // ========================================================================
    // SHUTDOWN
    // ========================================================================

    /// Stop handing out connections and close the idle ones.
    ///
    /// Connections still checked out are closed as they come back.
    pub fn shutdown(&self) {
        let drained: Vec<Box<dyn Connection>> = {
            let mut state = self.inner.lock_state_recovering();
            if state.run_state == RunState::Running {
                state.run_state = RunState::Shutdown;
            }
            let drained: Vec<_> = state.idle.drain(..).collect();
            state.open -= drained.len();
            if state.open == 0 {
                state.run_state = RunState::Terminated;
                self.inner.terminated.notify_all();
            }
            self.inner.available.notify_all();
            drained
        };
        tracing::info!(
            source = %self.source_name(),
            closed = drained.len(),
            "Connection pool shut down"
        );
        for mut connection in drained {
            connection.close();
        }
    }

    /// Wait until every connection has been returned after shutdown.
    ///
    /// Returns `false` on timeout.
    pub fn await_termination(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut state = self.inner.lock_state_recovering();
        while state.run_state != RunState::Terminated {
            let now = Instant::now();
            if now >= deadline {
                return false;
            }
            state = self
                .inner
                .terminated
                .wait_timeout(state, deadline - now)
                .unwrap_or_else(PoisonError::into_inner)
                .0;
        }
        true
    }

    // ========================================================================
    // STATISTICS
    // ========================================================================

    pub fn run_state(&self) -> RunState {
        self.inner.lock_state_recovering().run_state
    }

    pub fn is_shutdown(&self) -> bool {
        self.run_state() != RunState::Running
    }

    pub fn is_terminated(&self) -> bool {
        self.run_state() == RunState::Terminated
    }

    /// Open connections, idle or in use.
    pub fn pool_size(&self) -> usize {
        self.inner.lock_state_recovering().open
    }

    pub fn idle_count(&self) -> usize {
        self.inner.lock_state_recovering().idle.len()
    }

    pub fn in_use_count(&self) -> usize {
        self.inner.lock_state_recovering().in_use
    }

    pub fn maximum_size(&self) -> usize {
        self.inner.lock_state_recovering().max_size
    }

    pub fn total_created(&self) -> u64 {
        self.inner.total_created.load(Ordering::SeqCst)
    }

    pub fn total_used(&self) -> u64 {
        self.inner.total_used.load(Ordering::SeqCst)
    }
}

impl PoolInner {
    fn poisoned(&self) -> SourceError {
        SourceError::LockPoisoned {
            source_name: self.source.name().to_string(),
        }
    }

    fn lock_state(&self) -> SourceResult<MutexGuard<'_, PoolState>> {
        self.state.lock().map_err(|_| self.poisoned())
    }

    /// Lock for paths that cannot report errors (returns, drops, statistics).
    fn lock_state_recovering(&self) -> MutexGuard<'_, PoolState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Give back a reserved or checked-out slot whose connection was discarded.
    fn release_slot(&self) {
        let mut state = self.lock_state_recovering();
        state.open -= 1;
        state.in_use -= 1;
        self.after_release(&mut state);
    }

    /// Idle connections always sit on the default workspace.
    fn return_connection(&self, mut connection: Box<dyn Connection>) {
        let reusable = connection.workspace().is_none() || connection.set_workspace(None).is_ok();
        let mut state = self.lock_state_recovering();
        state.in_use -= 1;
        if reusable && state.run_state == RunState::Running && state.open <= state.max_size {
            state.idle.push_back(connection);
            self.after_release(&mut state);
            return;
        }
        state.open -= 1;
        self.after_release(&mut state);
        drop(state);
        connection.close();
    }

    fn after_release(&self, state: &mut PoolState) {
        if state.run_state == RunState::Shutdown && state.open == 0 {
            state.run_state = RunState::Terminated;
            self.terminated.notify_all();
        }
        self.available.notify_one();
    }
}

// ============================================================================
// POOLED CONNECTION
// ============================================================================

/// A connection checked out of a [`ConnectionPool`].
///
/// `close` (or drop) returns the underlying connection to its pool.
pub struct PooledConnection {
    source_name: String,
    connection: Option<Box<dyn Connection>>,
    pool: Arc<PoolInner>,
}

impl PooledConnection {
    pub fn is_closed(&self) -> bool {
        self.connection.is_none()
    }

    fn open(&self) -> SourceResult<&dyn Connection> {
        self.connection
            .as_deref()
            .ok_or_else(|| SourceError::ConnectionClosed {
                source_name: self.source_name.clone(),
            })
    }
}

impl std::fmt::Debug for PooledConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PooledConnection")
            .field("source_name", &self.source_name)
            .field("closed", &self.is_closed())
            .finish()
    }
}

impl Connection for PooledConnection {
    fn source_name(&self) -> &str {
        &self.source_name
    }

    fn default_cache_policy(&self) -> Option<CachePolicy> {
        self.connection
            .as_ref()
            .and_then(|c| c.default_cache_policy())
    }

    fn execute(&self, command: &Command) -> SourceResult<CommandOutcome> {
        self.open()?.execute(command)
    }

    fn execute_batch(&self, commands: &[Command]) -> SourceResult<Vec<CommandOutcome>> {
        self.open()?.execute_batch(commands)
    }

    fn workspace(&self) -> Option<&str> {
        self.connection.as_ref().and_then(|c| c.workspace())
    }

    fn set_workspace(&mut self, workspace: Option<&str>) -> SourceResult<()> {
        match self.connection.as_mut() {
            Some(connection) => connection.set_workspace(workspace),
            None => Err(SourceError::ConnectionClosed {
                source_name: self.source_name.clone(),
            }),
        }
    }

    fn ping(&self, timeout: Duration) -> bool {
        self.open().map(|c| c.ping(timeout)).unwrap_or(false)
    }

    fn close(&mut self) {
        if let Some(connection) = self.connection.take() {
            self.pool.return_connection(connection);
        }
    }
}

impl Drop for PooledConnection {
    fn drop(&mut self) {
        self.close();
    }
}
