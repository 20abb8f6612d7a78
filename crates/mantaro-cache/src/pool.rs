//! Pooled connection accessor.
//!
//! [`CachePool`] owns an `r2d2` pool and hands connections out through
//! [`CachePool::access`], which guarantees the connection goes back to the
//! pool on every exit path, including errors and panics.

use std::fmt;
use std::ops::{Deref, DerefMut};
use std::sync::Arc;
use std::time::{Duration, Instant};

use r2d2::{HandleError, ManageConnection, Pool, PooledConnection};
use tracing::{debug, info, warn};

use mantaro_core::config::cache::PoolConfig;
use mantaro_core::error::{AppError, ErrorKind};
use mantaro_core::result::AppResult;

use crate::sweeper::IdleSweeper;
use crate::tracked::TrackedManager;

/// Snapshot of pool occupancy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolStatus {
    /// Open connections, borrowed and idle.
    pub connections: u32,
    /// Connections sitting idle in the pool.
    pub idle_connections: u32,
    /// Configured upper bound on `connections`.
    pub max_size: u32,
}

impl PoolStatus {
    /// Connections currently borrowed.
    pub fn in_use(&self) -> u32 {
        self.connections.saturating_sub(self.idle_connections)
    }

    /// Whether a borrow would have to wait for a connection to be returned.
    pub fn is_exhausted(&self) -> bool {
        self.connections >= self.max_size && self.idle_connections == 0
    }
}

/// A borrowed connection. Goes back to the pool when dropped.
pub struct CacheConnection<M: ManageConnection> {
    inner: PooledConnection<TrackedManager<M>>,
}

impl<M: ManageConnection> Deref for CacheConnection<M> {
    type Target = M::Connection;

    fn deref(&self) -> &M::Connection {
        &self.inner.conn
    }
}

impl<M: ManageConnection> DerefMut for CacheConnection<M> {
    fn deref_mut(&mut self) -> &mut M::Connection {
        &mut self.inner.conn
    }
}

impl<M: ManageConnection> Drop for CacheConnection<M> {
    fn drop(&mut self) {
        self.inner.idle_since = Instant::now();
    }
}

impl<M: ManageConnection> fmt::Debug for CacheConnection<M> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CacheConnection")
            .field("id", &self.inner.id)
            .field("lent", &self.inner.lent)
            .finish()
    }
}

/// Shared handle to a pool of cache connections.
///
/// Cloning is cheap; all clones share the same connections. The idle
/// sweeper stops when [`CachePool::shutdown`] is called or the last clone
/// is dropped.
pub struct CachePool<M: ManageConnection = redis::Client> {
    pool: Pool<TrackedManager<M>>,
    manager: TrackedManager<M>,
    config: Arc<PoolConfig>,
    sweeper: Arc<IdleSweeper>,
}

impl<M: ManageConnection> Clone for CachePool<M> {
    fn clone(&self) -> Self {
        Self {
            pool: self.pool.clone(),
            manager: self.manager.clone(),
            config: Arc::clone(&self.config),
            sweeper: Arc::clone(&self.sweeper),
        }
    }
}

impl<M: ManageConnection> fmt::Debug for CachePool<M> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CachePool")
            .field("status", &self.status())
            .field("config", &self.config)
            .finish()
    }
}

impl<M: ManageConnection> CachePool<M> {
    /// Build a pool around `manager` with the given tuning.
    ///
    /// No connection is opened here. The pool grows on demand and the idle
    /// sweeper tops it up to `min_idle` on each run.
    pub fn with_manager(manager: M, config: PoolConfig) -> AppResult<Self> {
        config.validate()?;
        if config.max_idle < config.max_total {
            warn!(
                max_idle = config.max_idle,
                max_total = config.max_total,
                "Idle connections are bounded by max_total only"
            );
        }

        // Validation, eviction and min_idle upkeep are done here and in the
        // sweeper, so r2d2 only bounds the pool size.
        let manager = TrackedManager::new(manager, config.test_on_return);
        let pool = Pool::builder()
            .max_size(config.max_total)
            .min_idle(Some(0))
            .test_on_check_out(false)
            .idle_timeout(None)
            .max_lifetime(None)
            .connection_timeout(config.acquire_timeout())
            .error_handler(Box::new(TracingErrorHandler))
            .build_unchecked(manager.clone());

        let sweeper = IdleSweeper::spawn(pool.clone(), manager.clone(), &config);

        info!(
            max_total = config.max_total,
            min_idle = config.min_idle,
            eviction_interval_s = config.eviction_interval_seconds,
            "Cache connection pool created"
        );

        Ok(Self {
            pool,
            manager,
            config: Arc::new(config),
            sweeper: Arc::new(sweeper),
        })
    }

    /// Borrow a connection, run `f` with it, and return it to the pool.
    ///
    /// Errors from `f` are returned unchanged. Borrow failures are
    /// converted from [`AppError`].
    pub fn access<T, E, F>(&self, f: F) -> Result<T, E>
    where
        F: FnOnce(&mut M::Connection) -> Result<T, E>,
        E: From<AppError>,
    {
        let mut conn = self.borrow()?;
        debug!("Accessing redis instance");
        f(&mut *conn)
    }

    /// Run [`CachePool::access`] on tokio's blocking thread pool.
    ///
    /// A panic inside `f` resumes on the awaiting task, as it would with
    /// [`CachePool::access`].
    pub async fn access_async<T, E, F>(&self, f: F) -> Result<T, E>
    where
        F: FnOnce(&mut M::Connection) -> Result<T, E> + Send + 'static,
        T: Send + 'static,
        E: From<AppError> + Send + 'static,
    {
        let pool = self.clone();
        match tokio::task::spawn_blocking(move || pool.access(f)).await {
            Ok(result) => result,
            Err(e) if e.is_panic() => std::panic::resume_unwind(e.into_panic()),
            Err(e) => Err(E::from(AppError::with_source(
                ErrorKind::Internal,
                "Cache access task failed",
                e,
            ))),
        }
    }

    /// Borrow a connection directly. It returns to the pool when dropped.
    ///
    /// Blocks while the pool is exhausted, for at most `max_wait` if one is
    /// configured. With `test_on_borrow`, a stale idle connection is
    /// discarded and another one taken.
    pub fn borrow(&self) -> AppResult<CacheConnection<M>> {
        let started = Instant::now();
        let max_wait = self.config.max_wait();

        loop {
            if !self.config.block_when_exhausted && self.status().is_exhausted() {
                return Err(AppError::pool_exhausted(format!(
                    "all {} cache connections are in use",
                    self.config.max_total
                )));
            }

            let attempt = match max_wait {
                Some(max) => {
                    let remaining = max.saturating_sub(started.elapsed());
                    if remaining.is_zero() {
                        return Err(self.wait_expired(max));
                    }
                    remaining.min(self.config.acquire_timeout())
                }
                None => self.config.acquire_timeout(),
            };

            match self.pool.get_timeout(attempt) {
                Ok(conn) => {
                    if let Some(conn) = self.check_out(conn)? {
                        return Ok(conn);
                    }
                }
                Err(e) if self.status().is_exhausted() => {
                    debug!(
                        waited_ms = started.elapsed().as_millis() as u64,
                        error = %e,
                        "Cache pool exhausted, waiting for a connection"
                    );
                }
                Err(e) => {
                    return Err(AppError::with_source(
                        ErrorKind::Cache,
                        format!("Failed to obtain cache connection: {e}"),
                        e,
                    ));
                }
            }
        }
    }

    /// Validate a connection about to be lent. `None` means it was stale
    /// and has been discarded.
    fn check_out(
        &self,
        mut conn: PooledConnection<TrackedManager<M>>,
    ) -> AppResult<Option<CacheConnection<M>>> {
        if self.config.test_on_borrow {
            if let Err(e) = self.manager.validate(&mut conn) {
                if conn.lent == 0 {
                    return Err(AppError::cache(format!(
                        "New cache connection failed validation: {e}"
                    )));
                }
                debug!(id = conn.id, "Discarded stale cache connection");
                return Ok(None);
            }
        }
        conn.lent += 1;
        Ok(Some(CacheConnection { inner: conn }))
    }

    /// Current occupancy.
    pub fn status(&self) -> PoolStatus {
        let state = self.pool.state();
        PoolStatus {
            connections: state.connections,
            idle_connections: state.idle_connections,
            max_size: self.pool.max_size(),
        }
    }

    /// Tuning this pool was built with.
    pub fn config(&self) -> &PoolConfig {
        &self.config
    }

    /// Whether the idle sweeper thread is alive.
    pub fn sweeper_running(&self) -> bool {
        self.sweeper.is_running()
    }

    /// Stop the idle sweeper. Borrowed connections stay usable.
    pub fn shutdown(&self) {
        self.sweeper.stop();
        info!("Cache connection pool shut down");
    }

    fn wait_expired(&self, max: Duration) -> AppError {
        AppError::pool_exhausted(format!(
            "no cache connection became available within {}ms",
            max.as_millis()
        ))
    }
}

/// Routes background connection errors into tracing.
#[derive(Debug)]
struct TracingErrorHandler;

impl<E: fmt::Display> HandleError<E> for TracingErrorHandler {
    fn handle_error(&self, error: E) {
        warn!(error = %error, "Cache connection error");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_exhausted_only_when_full_and_no_idle() {
        let full = PoolStatus {
            connections: 4,
            idle_connections: 0,
            max_size: 4,
        };
        assert!(full.is_exhausted());
        assert_eq!(full.in_use(), 4);

        let idle = PoolStatus {
            idle_connections: 1,
            ..full
        };
        assert!(!idle.is_exhausted());

        let growing = PoolStatus {
            connections: 3,
            idle_connections: 0,
            max_size: 4,
        };
        assert!(!growing.is_exhausted());
    }
}
