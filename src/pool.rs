//! Connection pool.
//!
//! This module provides the pool behind `Client`:
//! - Bounded concurrency through a semaphore, with a LIFO idle list
//! - Lazily (re)connecting holders with a retrying connect loop
//! - The retrying transaction loop
//! - Graceful `close()` and immediate `terminate()`
//!
//! A physical connection is only ever reachable through one holder, so
//! it never sees two requests at once.

use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use rand::Rng;
use tokio::runtime::Handle;
use tokio::sync::{Notify, OwnedSemaphorePermit, Semaphore};
use tracing::{debug, info, warn};

use crate::codec::{CodecRegistry, Value};
use crate::error::{Error, ErrorKind, Result, Tag};
use crate::options::Options;
use crate::transaction::Transaction;
use crate::wire::{ConnectConfig, QueryRequest, RawConnection};

/// Minimum time between two "still reconnecting" warnings.
const RECONNECT_WARNING_INTERVAL: Duration = Duration::from_secs(5);

// ============================================================================
// Pool Configuration
// ============================================================================

/// Connection pool configuration.
#[derive(Debug, Clone, Default)]
pub struct PoolConfig {
    /// Where and how to connect
    pub connect: ConnectConfig,
    /// Maximum number of connections; the server's suggestion when unset
    pub concurrency: Option<usize>,
    /// Limit on waiting for a free connection; unbounded when unset
    pub acquire_timeout: Option<Duration>,
}

impl PoolConfig {
    /// Create a new pool configuration.
    pub fn new(connect: ConnectConfig) -> Self {
        Self {
            connect,
            concurrency: None,
            acquire_timeout: None,
        }
    }

    /// Set the maximum number of connections.
    pub fn concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = Some(concurrency.max(1));
        self
    }

    /// Set how long `acquire` may wait for a free connection.
    pub fn acquire_timeout(mut self, timeout: Duration) -> Self {
        self.acquire_timeout = Some(timeout);
        self
    }
}

// ============================================================================
// Connection Holder
// ============================================================================

/// A lease on one pool slot.
///
/// The holder owns at most one connection and reconnects lazily when it
/// has none or its connection is unusable. Dropping it returns an idle
/// connection to the pool; use [`ConnectionHolder::release`] to roll back
/// an open transaction first.
pub struct ConnectionHolder {
    conn: Option<RawConnection>,
    pool: Arc<PoolInner>,
    _permit: OwnedSemaphorePermit,
}

impl ConnectionHolder {
    /// The leased connection, connecting first if needed.
    pub async fn connection(&mut self) -> Result<&mut RawConnection> {
        if self.conn.as_ref().map_or(true, RawConnection::is_closed) {
            if let Some(mut stale) = self.conn.take() {
                stale.close().await;
            }
            let conn = self.pool.connect_with_retry().await?;
            self.pool
                .grow(conn.server_settings().suggested_pool_concurrency);
            self.conn = Some(conn);
        }
        self.conn.as_mut().ok_or_else(|| {
            Error::new(ErrorKind::InternalClientError, "holder lost its connection")
        })
    }

    /// The current connection, without reconnecting.
    pub fn existing(&mut self) -> Result<&mut RawConnection> {
        self.conn.as_mut().ok_or_else(|| {
            Error::new(
                ErrorKind::ClientConnectionClosedError,
                "the connection was lost",
            )
        })
    }

    pub fn peek(&self) -> Option<&RawConnection> {
        self.conn.as_ref()
    }

    /// Run a query, retrying read-only queries and transaction conflicts.
    pub async fn retrying_fetch(&mut self, req: &QueryRequest<'_>) -> Result<Vec<Value>> {
        let mut attempt: u32 = 0;
        loop {
            attempt += 1;
            let err = match self.connection().await?.fetch(req).await {
                Ok(rows) => return Ok(rows),
                Err(e) => e,
            };

            let read_only = self.conn.as_ref().and_then(|c| {
                c.query_capabilities(req.query, req.output_format, req.expected_cardinality)
            }) == Some(0);
            if !err.has_tag(Tag::ShouldRetry)
                || !(read_only || err.is(ErrorKind::TransactionConflictError))
            {
                return Err(err);
            }
            let rule = req.options.retry.rule_for(&err);
            if attempt >= rule.attempts {
                return Err(err);
            }
            let delay = rule.backoff(attempt);
            debug!(attempt, ?delay, error = %err, "retrying query");
            tokio::time::sleep(delay).await;
        }
    }

    /// Roll back leftover transaction state and return the slot.
    pub async fn release(mut self) {
        if let Some(conn) = self.conn.as_mut() {
            if let Err(e) = conn.reset_state().await {
                debug!(error = %e, "discarding connection that failed to reset");
            }
        }
    }
}

impl Drop for ConnectionHolder {
    fn drop(&mut self) {
        if let Some(mut conn) = self.conn.take() {
            let closed = self.pool.closed.load(Ordering::SeqCst);
            if conn.is_reusable() && !closed {
                self.pool.idle.lock().push(conn);
            } else if !conn.is_closed() {
                // still inside a transaction, or the pool is gone
                if let Ok(handle) = Handle::try_current() {
                    handle.spawn(async move { conn.close().await });
                }
            }
        }
        self.pool.leased.fetch_sub(1, Ordering::SeqCst);
        self.pool.released.notify_waiters();
    }
}

// ============================================================================
// Pool Inner
// ============================================================================

/// Internal pool state.
struct PoolInner {
    config: PoolConfig,
    /// Shared descriptor codecs
    registry: Arc<CodecRegistry>,
    /// Idle connections, most recently used last
    idle: Mutex<Vec<RawConnection>>,
    /// One permit per pool slot
    semaphore: Arc<Semaphore>,
    size: AtomicUsize,
    grown: AtomicBool,
    closing: AtomicBool,
    closed: AtomicBool,
    leased: AtomicUsize,
    released: Notify,
    last_reconnect_warning: Mutex<Option<Instant>>,
}

impl PoolInner {
    fn check_open(&self) -> Result<()> {
        if self.closed.load(Ordering::SeqCst) {
            Err(Error::new(ErrorKind::InterfaceError, "The client is closed"))
        } else if self.closing.load(Ordering::SeqCst) {
            Err(Error::new(ErrorKind::InterfaceError, "The client is closing"))
        } else {
            Ok(())
        }
    }

    /// Adopt the server's suggested concurrency once, unless configured.
    fn grow(&self, suggested: Option<usize>) {
        let Some(suggested) = suggested else {
            return;
        };
        if self.config.concurrency.is_some() || self.grown.swap(true, Ordering::SeqCst) {
            return;
        }
        let current = self.size.load(Ordering::SeqCst);
        if suggested > current {
            self.semaphore.add_permits(suggested - current);
            self.size.store(suggested, Ordering::SeqCst);
            info!(
                concurrency = suggested,
                "pool resized to the server's suggested concurrency"
            );
        }
    }

    /// Connect, retrying transient failures until `wait_until_available`.
    async fn connect_with_retry(&self) -> Result<RawConnection> {
        let deadline = Instant::now() + self.config.connect.wait_until_available;
        loop {
            match RawConnection::connect(&self.config.connect, Arc::clone(&self.registry)).await {
                Ok(conn) => return Ok(conn),
                Err(e) if e.has_tag(Tag::ShouldReconnect) && Instant::now() < deadline => {
                    self.warn_reconnecting(&e);
                    let pause = rand::thread_rng().gen_range(10..=210);
                    tokio::time::sleep(Duration::from_millis(pause)).await;
                }
                Err(e) => return Err(e),
            }
        }
    }

    fn warn_reconnecting(&self, err: &Error) {
        let mut last = self.last_reconnect_warning.lock();
        if last.map_or(true, |at| at.elapsed() >= RECONNECT_WARNING_INTERVAL) {
            warn!(
                host = %self.config.connect.host,
                port = self.config.connect.port,
                error = %err,
                "a connection attempt failed, retrying"
            );
            *last = Some(Instant::now());
        } else {
            debug!(error = %err, "connection attempt failed, retrying");
        }
    }
}

// ============================================================================
// Connection Pool
// ============================================================================

/// A pool of Gel connections.
///
/// Cloning is cheap; clones share the same connections.
#[derive(Clone)]
pub struct Pool {
    inner: Arc<PoolInner>,
}

impl Pool {
    /// Create a pool. No connection is opened until first use.
    pub fn new(config: PoolConfig) -> Self {
        let size = config.concurrency.unwrap_or(1);
        Self {
            inner: Arc::new(PoolInner {
                semaphore: Arc::new(Semaphore::new(size)),
                size: AtomicUsize::new(size),
                config,
                registry: Arc::new(CodecRegistry::new()),
                idle: Mutex::new(Vec::new()),
                grown: AtomicBool::new(false),
                closing: AtomicBool::new(false),
                closed: AtomicBool::new(false),
                leased: AtomicUsize::new(0),
                released: Notify::new(),
                last_reconnect_warning: Mutex::new(None),
            }),
        }
    }

    /// Open one connection now, surfacing configuration errors early.
    pub async fn ensure_connected(&self) -> Result<()> {
        let mut holder = self.acquire().await?;
        let result = holder.connection().await.map(|_| ());
        holder.release().await;
        result
    }

    /// Lease a pool slot, waiting while all slots are in use.
    pub async fn acquire(&self) -> Result<ConnectionHolder> {
        self.inner.check_open()?;
        let permit = Arc::clone(&self.inner.semaphore).acquire_owned();
        let permit = match self.inner.config.acquire_timeout {
            Some(timeout) => tokio::time::timeout(timeout, permit).await.map_err(|_| {
                Error::new(
                    ErrorKind::ClientConnectionTimeoutError,
                    format!("timed out after {:?} waiting for a free connection", timeout),
                )
            })?,
            None => permit.await,
        };
        let permit = match permit {
            Ok(permit) => permit,
            Err(_) => {
                return Err(self
                    .inner
                    .check_open()
                    .err()
                    .unwrap_or_else(|| Error::new(ErrorKind::InterfaceError, "The client is closing")))
            }
        };

        self.inner.leased.fetch_add(1, Ordering::SeqCst);
        let conn = self.inner.idle.lock().pop();
        Ok(ConnectionHolder {
            conn,
            pool: Arc::clone(&self.inner),
            _permit: permit,
        })
    }

    /// Run `body` inside a transaction, retrying it on retriable errors.
    ///
    /// The body may be invoked several times and must be safe to re-run.
    /// Each attempt gets a fresh transaction; the value of the first
    /// attempt that commits is returned.
    pub async fn transaction<T, F, Fut>(&self, options: &Options, mut body: F) -> Result<T>
    where
        F: FnMut(Transaction) -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let mut attempt: u32 = 0;
        loop {
            attempt += 1;
            let holder = self.acquire().await?;
            let tx = Transaction::start(holder, options.clone()).await?;

            let mut commit_failed = false;
            let outcome = match body(tx.clone()).await {
                Ok(value) => match tx.commit().await {
                    Ok(()) => Ok(value),
                    Err(e) => {
                        commit_failed = true;
                        Err(e)
                    }
                },
                Err(e) => Err(e),
            };
            let err = match outcome {
                Ok(value) => {
                    tx.finish().await;
                    return Ok(value);
                }
                Err(e) => e,
            };

            if !commit_failed {
                if let Err(e) = tx.rollback().await {
                    debug!(error = %e, "rollback after a failed transaction block failed");
                }
            }
            tx.finish().await;

            if !err.has_tag(Tag::ShouldRetry)
                || (commit_failed && err.is(ErrorKind::ClientConnectionError))
            {
                return Err(err);
            }
            let rule = options.retry.rule_for(&err);
            if attempt >= rule.attempts {
                return Err(err);
            }
            let delay = rule.backoff(attempt);
            debug!(attempt, ?delay, error = %err, "retrying transaction");
            tokio::time::sleep(delay).await;
        }
    }

    /// Stop handing out connections, wait for leased ones, close all.
    pub async fn close(&self) {
        if self.inner.closed.load(Ordering::SeqCst) {
            return;
        }
        self.inner.closing.store(true, Ordering::SeqCst);
        self.inner.semaphore.close();

        loop {
            let notified = self.inner.released.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if self.inner.leased.load(Ordering::SeqCst) == 0 {
                break;
            }
            notified.await;
        }

        self.inner.closed.store(true, Ordering::SeqCst);
        let connections = std::mem::take(&mut *self.inner.idle.lock());
        for mut conn in connections {
            conn.close().await;
        }
        debug!("pool closed");
    }

    /// Close immediately, dropping idle connections. Leased connections
    /// are closed as their holders are released.
    pub fn terminate(&self) {
        self.inner.closing.store(true, Ordering::SeqCst);
        self.inner.closed.store(true, Ordering::SeqCst);
        self.inner.semaphore.close();
        let connections = std::mem::take(&mut *self.inner.idle.lock());
        debug!(idle = connections.len(), "pool terminated");
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closing.load(Ordering::SeqCst)
    }

    /// Current maximum number of connections.
    pub fn size(&self) -> usize {
        self.inner.size.load(Ordering::SeqCst)
    }

    /// Number of slots currently leased.
    pub fn leased(&self) -> usize {
        self.inner.leased.load(Ordering::SeqCst)
    }

    /// Get the current number of idle connections.
    pub fn idle_count(&self) -> usize {
        self.inner.idle.lock().len()
    }

    /// Get the pool configuration.
    pub fn config(&self) -> &PoolConfig {
        &self.inner.config
    }
}
