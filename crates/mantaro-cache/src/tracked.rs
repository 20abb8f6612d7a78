//! Per-connection bookkeeping.
//!
//! The r2d2 pool only ever sees [`TrackedManager`], which wraps the real
//! manager and stamps each connection with when it went idle and when it
//! was last validated. Validation on borrow and while idle both go through
//! [`TrackedManager::validate`]; a connection that fails it is flagged and
//! dropped by the pool when it is handed back.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

use r2d2::ManageConnection;
use tracing::debug;

/// A pooled connection plus the state the pool keeps about it.
#[derive(Debug)]
pub(crate) struct Tracked<C> {
    pub(crate) conn: C,
    pub(crate) id: u64,
    /// Last time a caller handed the connection back (creation time if never lent).
    pub(crate) idle_since: Instant,
    /// Last successful validation (creation time if never validated).
    pub(crate) validated_at: Instant,
    /// Number of times the connection has been lent to a caller.
    pub(crate) lent: u64,
    pub(crate) broken: bool,
}

pub(crate) struct TrackedManager<M> {
    inner: Arc<M>,
    next_id: Arc<AtomicU64>,
    test_on_return: bool,
}

impl<M> Clone for TrackedManager<M> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
            next_id: Arc::clone(&self.next_id),
            test_on_return: self.test_on_return,
        }
    }
}

impl<M: ManageConnection> TrackedManager<M> {
    pub(crate) fn new(inner: M, test_on_return: bool) -> Self {
        Self {
            inner: Arc::new(inner),
            next_id: Arc::new(AtomicU64::new(0)),
            test_on_return,
        }
    }

    /// Run the wrapped manager's validation, flagging the connection on failure.
    pub(crate) fn validate(&self, tracked: &mut Tracked<M::Connection>) -> Result<(), M::Error> {
        match self.inner.is_valid(&mut tracked.conn) {
            Ok(()) => {
                tracked.validated_at = Instant::now();
                Ok(())
            }
            Err(e) => {
                debug!(id = tracked.id, error = %e, "Cache connection failed validation");
                tracked.broken = true;
                Err(e)
            }
        }
    }
}

impl<M: ManageConnection> ManageConnection for TrackedManager<M> {
    type Connection = Tracked<M::Connection>;
    type Error = M::Error;

    fn connect(&self) -> Result<Self::Connection, Self::Error> {
        let conn = self.inner.connect()?;
        let now = Instant::now();
        Ok(Tracked {
            conn,
            id: self.next_id.fetch_add(1, Ordering::Relaxed),
            idle_since: now,
            validated_at: now,
            lent: 0,
            broken: false,
        })
    }

    fn is_valid(&self, conn: &mut Self::Connection) -> Result<(), Self::Error> {
        self.validate(conn)
    }

    fn has_broken(&self, conn: &mut Self::Connection) -> bool {
        conn.broken || (self.test_on_return && self.inner.has_broken(&mut conn.conn))
    }
}
