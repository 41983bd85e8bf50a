//! # Connection Pool
//!
//! Purpose: Keep a bounded set of connections to one `ip:port` so calls reuse
//! established sockets instead of dialing per request.
//!
//! ## Design Principles
//! 1. **Object Pool Pattern**: Idle connections sit in a FIFO; the pool counts
//!    idle and checked-out connections together against `max_size`.
//! 2. **Minimal Locking**: The mutex is held only to move connections and
//!    adjust the count, never across a dial.
//! 3. **Reserve Before Dial**: A slot is counted before the factory runs and
//!    handed back if the dial fails, so concurrent acquirers can never
//!    overshoot `max_size`.
//! 4. **Check On Acquire**: Released connections go back unconditionally;
//!    closed or expired ones are weeded out (and uncounted exactly once) the
//!    next time they are popped.
//! 5. **Bounded Wait**: An exhausted pool waits at most `wait_timeout`.

use std::collections::VecDeque;
use std::io;
use std::sync::Arc;
use std::time::{Duration, Instant};

use ecall_common::config::duration_ms;
use ecall_common::connection::Connection;
use ecall_common::error::{RpcError, ERROR_CONNECT_FAILED, ERROR_POOL_EXHAUSTED};
use futures::future::{join_all, BoxFuture};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::Notify;
use tracing::{debug, warn};

/// Connections pre-dialed per endpoint.
pub const DEFAULT_POOL_MIN_SIZE: usize = 10;
/// Upper bound on connections per endpoint.
pub const DEFAULT_POOL_MAX_SIZE: usize = 16;
/// Age after which a pooled connection is retired.
pub const DEFAULT_POOL_LIFETIME: Duration = Duration::from_secs(1800);
/// How long `acquire` waits on an exhausted pool.
pub const DEFAULT_POOL_WAIT: Duration = Duration::from_secs(5);

/// Pool sizing and recycling policy.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PoolConfig {
    /// Connections dialed eagerly at construction.
    pub min_size: usize,
    /// Maximum connections (idle + checked out).
    pub max_size: usize,
    /// Maximum connection age; zero disables recycling.
    #[serde(with = "duration_ms")]
    pub lifetime: Duration,
    /// Bound on waiting for a connection when the pool is full.
    #[serde(with = "duration_ms")]
    pub wait_timeout: Duration,
}

impl Default for PoolConfig {
    fn default() -> Self {
        PoolConfig {
            min_size: DEFAULT_POOL_MIN_SIZE,
            max_size: DEFAULT_POOL_MAX_SIZE,
            lifetime: DEFAULT_POOL_LIFETIME,
            wait_timeout: DEFAULT_POOL_WAIT,
        }
    }
}

impl PoolConfig {
    /// Raises `max_size` to `min_size` when it is zero or smaller.
    pub fn normalized(mut self) -> Self {
        if self.max_size == 0 || self.min_size > self.max_size {
            self.max_size = self.min_size;
        }
        self
    }
}

#[derive(Debug, Error)]
pub enum PoolError {
    #[error("pool has been shut down")]
    Shutdown,

    #[error("no connection available within {0:?}")]
    Exhausted(Duration),

    #[error("connect failed: {0}")]
    Connect(#[from] io::Error),
}

pub type PoolResult<T> = Result<T, PoolError>;

impl From<PoolError> for RpcError {
    fn from(err: PoolError) -> Self {
        match err {
            PoolError::Shutdown => RpcError::internal(err.to_string()),
            PoolError::Exhausted(_) => RpcError::system(ERROR_POOL_EXHAUSTED, err.to_string()),
            PoolError::Connect(_) => RpcError::system(ERROR_CONNECT_FAILED, err.to_string()),
        }
    }
}

/// What the pool needs to know about a pooled resource.
pub trait Poolable: Clone + Send + Sync + 'static {
    fn is_closed(&self) -> bool;
    fn created_at(&self) -> Instant;
    fn close(&self);
}

impl Poolable for Arc<Connection> {
    fn is_closed(&self) -> bool {
        Connection::is_closed(self)
    }

    fn created_at(&self) -> Instant {
        Connection::created_at(self)
    }

    fn close(&self) {
        Connection::close(self)
    }
}

/// Dials one new connection.
pub type Factory<C> = Arc<dyn Fn() -> BoxFuture<'static, io::Result<C>> + Send + Sync>;

struct PoolState<C> {
    idle: VecDeque<C>,
    size: usize,
    shutdown: bool,
}

enum Step<C> {
    Check(C),
    Create,
    Wait,
}

/// Bounded pool of connections to a single endpoint.
pub struct ConnectionPool<C: Poolable> {
    config: PoolConfig,
    factory: Factory<C>,
    state: Mutex<PoolState<C>>,
    available: Notify,
}

impl<C: Poolable> ConnectionPool<C> {
    /// Builds the pool and pre-dials `min_size` connections.
    ///
    /// The pre-warm dials run concurrently, each bounded by `wait_timeout`,
    /// so construction never takes much longer than one wait bound. Failed
    /// or timed-out dials are logged and skipped; the pool simply starts
    /// smaller and grows on demand.
    pub async fn new(config: PoolConfig, factory: Factory<C>) -> Self {
        let config = config.normalized();
        let pool = ConnectionPool {
            state: Mutex::new(PoolState {
                idle: VecDeque::with_capacity(config.max_size),
                size: 0,
                shutdown: false,
            }),
            available: Notify::new(),
            factory,
            config,
        };
        pool.prewarm().await;
        pool
    }

    async fn prewarm(&self) {
        let dials: Vec<_> = (0..self.config.min_size)
            .take_while(|_| self.try_reserve())
            .map(|_| self.prewarm_one())
            .collect();
        join_all(dials).await;
    }

    async fn prewarm_one(&self) {
        match tokio::time::timeout(self.config.wait_timeout, (self.factory)()).await {
            Ok(Ok(conn)) => self.release(conn),
            Ok(Err(err)) => {
                self.release_slot();
                warn!(error = %err, "pool pre-warm dial failed");
            }
            Err(_) => {
                self.release_slot();
                warn!(timeout = ?self.config.wait_timeout, "pool pre-warm dial timed out");
            }
        }
    }

    pub fn config(&self) -> &PoolConfig {
        &self.config
    }

    /// Connections currently counted (idle + checked out).
    pub fn size(&self) -> usize {
        self.state.lock().size
    }

    pub fn idle_len(&self) -> usize {
        self.state.lock().idle.len()
    }

    pub fn is_shutdown(&self) -> bool {
        self.state.lock().shutdown
    }

    /// Returns a live, unexpired connection.
    ///
    /// **Logic**:
    /// 1. Pop an idle connection; drop it and retry if closed or expired.
    /// 2. Otherwise reserve a slot and dial if below `max_size`.
    /// 3. Otherwise wait for a release until `wait_timeout` runs out.
    pub async fn acquire(&self) -> PoolResult<C> {
        let deadline = tokio::time::Instant::now() + self.config.wait_timeout;
        loop {
            let notified = self.available.notified();
            tokio::pin!(notified);
            // Register before inspecting state so a release in between is not missed.
            notified.as_mut().enable();

            let step = {
                let mut state = self.state.lock();
                if state.shutdown {
                    return Err(PoolError::Shutdown);
                }
                if let Some(conn) = state.idle.pop_front() {
                    Step::Check(conn)
                } else if state.size < self.config.max_size {
                    state.size += 1;
                    Step::Create
                } else {
                    Step::Wait
                }
            };

            match step {
                Step::Check(conn) => {
                    if self.is_usable(&conn) {
                        return Ok(conn);
                    }
                    self.discard(conn);
                }
                Step::Create => return self.create().await,
                Step::Wait => {
                    if tokio::time::timeout_at(deadline, notified).await.is_err() {
                        return Err(PoolError::Exhausted(self.config.wait_timeout));
                    }
                }
            }
        }
    }

    async fn create(&self) -> PoolResult<C> {
        let conn = match (self.factory)().await {
            Ok(conn) => conn,
            Err(err) => {
                self.release_slot();
                return Err(err.into());
            }
        };
        if self.is_shutdown() {
            self.discard(conn);
            return Err(PoolError::Shutdown);
        }
        Ok(conn)
    }

    fn is_usable(&self, conn: &C) -> bool {
        if conn.is_closed() {
            return false;
        }
        self.config.lifetime.is_zero() || conn.created_at().elapsed() < self.config.lifetime
    }

    /// Hands a connection back to the idle set.
    ///
    /// No health check here; stale connections are caught by `acquire`.
    pub fn release(&self, conn: C) {
        let mut state = self.state.lock();
        if state.shutdown {
            drop(state);
            self.discard(conn);
            return;
        }
        state.idle.push_back(conn);
        drop(state);
        self.available.notify_one();
    }

    /// Closes a connection and frees its slot.
    pub fn discard(&self, conn: C) {
        conn.close();
        self.release_slot();
        debug!("pooled connection discarded");
    }

    /// Closes every idle connection and fails all further acquires.
    pub fn shutdown(&self) -> PoolResult<()> {
        let drained: Vec<C> = {
            let mut state = self.state.lock();
            if state.shutdown {
                return Err(PoolError::Shutdown);
            }
            state.shutdown = true;
            let drained: Vec<C> = state.idle.drain(..).collect();
            state.size = state.size.saturating_sub(drained.len());
            drained
        };
        for conn in drained {
            conn.close();
        }
        self.available.notify_waiters();
        Ok(())
    }

    fn try_reserve(&self) -> bool {
        let mut state = self.state.lock();
        if state.shutdown || state.size >= self.config.max_size {
            return false;
        }
        state.size += 1;
        true
    }

    fn release_slot(&self) {
        let mut state = self.state.lock();
        state.size = state.size.saturating_sub(1);
        drop(state);
        self.available.notify_one();
    }
}
