//! Connection pool management.
//!
//! One [`PoolManager`] owns the physical connections for one [`PoolConfig`].
//! Leases are bounded by a FIFO-fair semaphore with `max_connections`
//! permits; idle connections are reused before new ones are opened and are
//! evicted by a background reaper once they sit unused past the idle timeout.
//!
//! # Concurrency Safety
//!
//! - The idle list is guarded by a `std::sync::Mutex` that is never held
//!   across an await point.
//! - A lease owns its semaphore permit, so capacity is returned exactly once,
//!   whether the lease is released explicitly or dropped.
//! - The reaper holds a `Weak` reference and exits once the pool is dropped.

use crate::config::PoolConfig;
use crate::db::connector::{Connection, Connector};
use crate::error::{BridgeError, BridgeResult, DriverError, codes};
use crate::models::RawResult;
use futures_util::future::join_all;
use serde::Serialize;
use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::Duration;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// How often the reaper looks for idle connections to evict.
const REAPER_INTERVAL: Duration = Duration::from_millis(1_000);

struct IdleConnection {
    conn: Box<dyn Connection>,
    idle_since: Instant,
}

/// Point-in-time pool accounting.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct PoolStatus {
    /// Open physical connections, idle or leased.
    pub size: usize,
    pub idle: usize,
    /// Leases currently held (including ones still connecting).
    pub leased: usize,
    pub max: usize,
}

/// Shared pool for one target database.
pub struct PoolManager {
    id: String,
    config: Arc<PoolConfig>,
    connector: Arc<dyn Connector>,
    permits: Arc<Semaphore>,
    idle: Mutex<Vec<IdleConnection>>,
    size: AtomicUsize,
    closed: AtomicBool,
    reaper: Mutex<Option<JoinHandle<()>>>,
}

impl std::fmt::Debug for PoolManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PoolManager")
            .field("id", &self.id)
            .field("config", &self.config)
            .field("status", &self.status())
            .field("closed", &self.is_closed())
            .finish_non_exhaustive()
    }
}

impl PoolManager {
    /// Create a pool. No connection is opened until the first acquire.
    ///
    /// When called inside a Tokio runtime the idle reaper is started as well.
    pub fn initialize(
        config: PoolConfig,
        connector: Arc<dyn Connector>,
    ) -> BridgeResult<Arc<Self>> {
        config.validate()?;

        let max = config.max_connections as usize;
        let pool = Arc::new(Self {
            id: uuid::Uuid::new_v4().simple().to_string(),
            config: Arc::new(config),
            connector,
            permits: Arc::new(Semaphore::new(max)),
            idle: Mutex::new(Vec::with_capacity(max)),
            size: AtomicUsize::new(0),
            closed: AtomicBool::new(false),
            reaper: Mutex::new(None),
        });

        if let Ok(runtime) = tokio::runtime::Handle::try_current() {
            let weak_pool = Arc::downgrade(&pool);
            let idle_timeout = pool.config.idle_timeout();
            let handle = runtime.spawn(async move {
                Self::reaper_task(weak_pool, REAPER_INTERVAL, idle_timeout).await;
            });
            *lock(&pool.reaper) = Some(handle);
        } else {
            debug!("No runtime available, idle reaper not started");
        }

        info!(
            pool_id = %pool.id,
            target = %pool.config.target(),
            max = max,
            "Connection pool created"
        );

        Ok(pool)
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn config(&self) -> &PoolConfig {
        &self.config
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    pub fn status(&self) -> PoolStatus {
        let max = self.config.max_connections as usize;
        PoolStatus {
            size: self.size.load(Ordering::Acquire),
            idle: lock(&self.idle).len(),
            leased: max.saturating_sub(self.permits.available_permits()),
            max,
        }
    }

    /// Lease a connection.
    ///
    /// Waits in FIFO order for a free slot, bounded by the connect timeout,
    /// then reuses an idle connection or opens a new one.
    pub async fn acquire(self: &Arc<Self>) -> BridgeResult<PooledConnection> {
        if self.is_closed() {
            return Err(BridgeError::pool_closed());
        }

        let timeout = self.config.connect_timeout();
        let waited_ms = timeout.map_or(0, |t| t.as_millis() as u64);
        let deadline = timeout.map(|t| Instant::now() + t);

        let permit = match run_until(deadline, Arc::clone(&self.permits).acquire_owned()).await {
            Some(Ok(permit)) => permit,
            Some(Err(_)) => return Err(BridgeError::pool_closed()),
            None => {
                debug!(pool_id = %self.id, "Timed out waiting for a free connection");
                return Err(BridgeError::connection_timeout(waited_ms));
            }
        };

        // Shutdown may have started while this caller was queued.
        if self.is_closed() {
            return Err(BridgeError::pool_closed());
        }

        if let Some(conn) = self.take_idle() {
            debug!(pool_id = %self.id, "Reusing idle connection");
            return Ok(PooledConnection::new(Arc::clone(self), conn, permit));
        }

        self.size.fetch_add(1, Ordering::AcqRel);
        match run_until(deadline, self.connector.connect(&self.config)).await {
            Some(Ok(conn)) => {
                debug!(pool_id = %self.id, "Opened new connection");
                Ok(PooledConnection::new(Arc::clone(self), conn, permit))
            }
            Some(Err(e)) => {
                self.decrement_size();
                warn!(pool_id = %self.id, code = %e.code, error = %e, "Failed to open connection");
                Err(BridgeError::connect_failed(e))
            }
            None => {
                self.decrement_size();
                Err(BridgeError::connection_timeout(waited_ms))
            }
        }
    }

    /// Return a lease to the pool. Releasing an already released lease is a no-op.
    pub fn release(&self, lease: &mut PooledConnection) {
        lease.release();
    }

    /// Close the pool.
    ///
    /// New acquires fail immediately. Leases in flight are waited for, never
    /// interrupted; then every idle connection is closed. Only the first call
    /// does any work.
    pub async fn shutdown(&self) -> BridgeResult<()> {
        if self.closed.swap(true, Ordering::AcqRel) {
            debug!(pool_id = %self.id, "Pool already shut down");
            return Ok(());
        }

        info!(
            pool_id = %self.id,
            target = %self.config.target(),
            "Closing connection pool"
        );

        if let Some(handle) = lock(&self.reaper).take() {
            handle.abort();
        }

        // Every permit back in hand means no lease is outstanding.
        let leased = self.status().leased;
        if leased > 0 {
            info!(pool_id = %self.id, leased = leased, "Waiting for in-flight queries");
        }
        match self.permits.acquire_many(self.config.max_connections).await {
            Ok(all) => {
                self.permits.close();
                drop(all);
            }
            Err(_) => self.permits.close(),
        }

        let idle: Vec<IdleConnection> = lock(&self.idle).drain(..).collect();
        let total = idle.len();
        let results = join_all(idle.into_iter().map(|entry| entry.conn.close())).await;
        for _ in 0..total {
            self.decrement_size();
        }

        let failures: Vec<DriverError> = results.into_iter().filter_map(Result::err).collect();
        if failures.is_empty() {
            info!(pool_id = %self.id, closed = total, "Connection pool closed");
            return Ok(());
        }

        for e in &failures {
            warn!(pool_id = %self.id, error = %e, "Failed to close connection");
        }
        Err(BridgeError::shutdown(
            format!(
                "{} of {} connection(s) failed to close for {}",
                failures.len(),
                total,
                self.config.target()
            ),
            failures.len(),
        ))
    }

    fn take_idle(&self) -> Option<Box<dyn Connection>> {
        lock(&self.idle).pop().map(|entry| entry.conn)
    }

    fn return_idle(&self, conn: Box<dyn Connection>) {
        lock(&self.idle).push(IdleConnection {
            conn,
            idle_since: Instant::now(),
        });
    }

    fn discard(&self, conn: Box<dyn Connection>) {
        self.decrement_size();
        debug!(pool_id = %self.id, "Discarding connection");
        match tokio::runtime::Handle::try_current() {
            Ok(runtime) => {
                runtime.spawn(async move {
                    let _ = conn.close().await;
                });
            }
            Err(_) => drop(conn),
        }
    }

    /// Saturates at 0.
    fn decrement_size(&self) {
        let result = self
            .size
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| Some(n.saturating_sub(1)));
        if let Ok(0) = result {
            warn!(pool_id = %self.id, "Connection count underflow detected");
        }
    }

    /// Evict connections that sat idle past `idle_timeout`.
    async fn reaper_task(weak_pool: Weak<Self>, interval: Duration, idle_timeout: Duration) {
        let mut ticker = tokio::time::interval(interval);

        loop {
            ticker.tick().await;

            let Some(pool) = weak_pool.upgrade() else {
                debug!("Pool dropped, idle reaper exiting");
                return;
            };
            if pool.is_closed() {
                return;
            }

            let now = Instant::now();
            let keep = pool.config.min_idle() as usize;
            let expired: Vec<IdleConnection> = {
                let mut idle = lock(&pool.idle);
                let mut expired = Vec::new();
                let mut i = 0;
                while i < idle.len() && idle.len() > keep {
                    if now.saturating_duration_since(idle[i].idle_since) >= idle_timeout {
                        expired.push(idle.remove(i));
                    } else {
                        i += 1;
                    }
                }
                expired
            };

            if expired.is_empty() {
                continue;
            }

            debug!(pool_id = %pool.id, evicted = expired.len(), "Evicting idle connections");
            for entry in expired {
                pool.decrement_size();
                if let Err(e) = entry.conn.close().await {
                    debug!(pool_id = %pool.id, error = %e, "Error closing idle connection");
                }
            }
        }
    }
}

impl Drop for PoolManager {
    fn drop(&mut self) {
        if let Some(handle) = lock(&self.reaper).take() {
            handle.abort();
        }
    }
}

/// A leased connection.
///
/// Call [`PooledConnection::release`] when done. A lease dropped without
/// release still frees its slot, but its connection is discarded since the
/// state of an interrupted request is unknown.
pub struct PooledConnection {
    pool: Arc<PoolManager>,
    conn: Option<Box<dyn Connection>>,
    permit: Option<OwnedSemaphorePermit>,
    broken: bool,
}

impl std::fmt::Debug for PooledConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PooledConnection")
            .field("pool_id", &self.pool.id)
            .field("released", &self.is_released())
            .field("broken", &self.broken)
            .finish_non_exhaustive()
    }
}

impl PooledConnection {
    fn new(pool: Arc<PoolManager>, conn: Box<dyn Connection>, permit: OwnedSemaphorePermit) -> Self {
        Self {
            pool,
            conn: Some(conn),
            permit: Some(permit),
            broken: false,
        }
    }

    /// Run a batch on the leased connection.
    pub async fn query(&mut self, sql: &str) -> Result<RawResult, DriverError> {
        let conn = self.conn.as_mut().ok_or_else(released_error)?;
        let result = conn.query(sql).await;
        if let Err(e) = &result {
            if e.breaks_connection() {
                self.broken = true;
            }
        }
        result
    }

    /// Ask the connection to abandon an interrupted request.
    pub async fn cancel(&mut self) -> Result<(), DriverError> {
        let conn = self.conn.as_mut().ok_or_else(released_error)?;
        conn.cancel().await
    }

    /// Do not return this connection to the pool on release.
    pub fn mark_broken(&mut self) {
        self.broken = true;
    }

    pub fn is_broken(&self) -> bool {
        self.broken
    }

    pub fn is_released(&self) -> bool {
        self.conn.is_none()
    }

    /// Return the connection to the pool, or discard it when broken.
    ///
    /// Idempotent: only the first call has any effect.
    pub fn release(&mut self) {
        let reuse = !self.broken;
        self.finish(reuse);
    }

    fn finish(&mut self, reuse: bool) {
        let Some(conn) = self.conn.take() else {
            debug!(pool_id = %self.pool.id, "Connection already released");
            return;
        };

        if reuse {
            self.pool.return_idle(conn);
        } else {
            self.pool.discard(conn);
        }

        // Free the slot only after the connection is back in the idle list,
        // so the next waiter finds it.
        drop(self.permit.take());
    }
}

impl Drop for PooledConnection {
    fn drop(&mut self) {
        if self.conn.is_some() {
            warn!(
                pool_id = %self.pool.id,
                "Connection dropped without release - discarding it"
            );
            self.finish(false);
        }
    }
}

fn released_error() -> DriverError {
    DriverError::connection(codes::ECONNCLOSED, "Connection already released")
}

/// Await `fut` until `deadline`, or without limit when there is none.
///
/// Returns `None` when the deadline passed first.
pub(crate) async fn run_until<F: Future>(deadline: Option<Instant>, fut: F) -> Option<F::Output> {
    match deadline {
        Some(deadline) => tokio::time::timeout_at(deadline, fut).await.ok(),
        None => Some(fut.await),
    }
}

/// Lock a std mutex, recovering the data if a holder panicked.
fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}
