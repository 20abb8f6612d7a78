//! Background maintenance of idle pool connections.
//!
//! Every eviction interval the sweeper takes the whole idle set out of the
//! pool and:
//!
//! 1. closes connections idle for at least `min_evictable_idle_seconds`,
//!    oldest first, while more than `min_idle` remain;
//! 2. if `test_while_idle` is set, validates the `tests_per_eviction_run`
//!    connections whose last validation is oldest, so successive sweeps
//!    walk the idle set round-robin;
//! 3. hands the rest back and opens connections until `min_idle` are idle.
//!
//! Handing a connection back does not touch its idle clock, so a swept
//! connection still expires on schedule.

use std::sync::Mutex;
use std::sync::mpsc::{self, RecvTimeoutError, Sender};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use r2d2::{ManageConnection, Pool};
use tracing::{debug, warn};

use mantaro_core::config::cache::PoolConfig;

use crate::tracked::TrackedManager;

/// Handle to the sweeper thread.
#[derive(Debug, Default)]
pub(crate) struct IdleSweeper {
    stop: Mutex<Option<Sender<()>>>,
    handle: Mutex<Option<JoinHandle<()>>>,
}

/// What a single sweep is allowed to do.
#[derive(Debug, Clone, Copy)]
pub(crate) struct SweepPolicy {
    pub(crate) test_while_idle: bool,
    pub(crate) tests: u32,
    pub(crate) min_idle: u32,
    pub(crate) evict_after: Duration,
    pub(crate) fill_timeout: Duration,
}

impl SweepPolicy {
    pub(crate) fn from_config(config: &PoolConfig) -> Self {
        Self {
            test_while_idle: config.test_while_idle,
            tests: config.tests_per_eviction_run,
            min_idle: config.min_idle,
            evict_after: config.min_evictable_idle(),
            fill_timeout: config.acquire_timeout(),
        }
    }
}

/// Outcome of one sweep.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub(crate) struct SweepReport {
    pub(crate) evicted: usize,
    pub(crate) validated: usize,
    pub(crate) discarded: usize,
    pub(crate) opened: u32,
}

impl IdleSweeper {
    /// Start maintaining `pool` every eviction interval.
    pub(crate) fn spawn<M: ManageConnection>(
        pool: Pool<TrackedManager<M>>,
        manager: TrackedManager<M>,
        config: &PoolConfig,
    ) -> Self {
        let (tx, rx) = mpsc::channel::<()>();
        let interval = config.eviction_interval();
        let policy = SweepPolicy::from_config(config);

        let spawned = thread::Builder::new()
            .name("cache-idle-sweeper".to_string())
            .spawn(move || {
                loop {
                    match rx.recv_timeout(interval) {
                        Err(RecvTimeoutError::Timeout) => {
                            sweep(&pool, &manager, &policy);
                        }
                        Ok(()) | Err(RecvTimeoutError::Disconnected) => break,
                    }
                }
                debug!("Idle sweeper stopped");
            });

        match spawned {
            Ok(handle) => Self {
                stop: Mutex::new(Some(tx)),
                handle: Mutex::new(Some(handle)),
            },
            Err(e) => {
                warn!(error = %e, "Failed to start idle sweeper");
                Self::default()
            }
        }
    }

    /// Signal the thread and wait for it to exit.
    pub(crate) fn stop(&self) {
        if let Ok(mut stop) = self.stop.lock() {
            stop.take();
        }
        let handle = self.handle.lock().ok().and_then(|mut h| h.take());
        if let Some(handle) = handle {
            if handle.join().is_err() {
                warn!("Idle sweeper panicked");
            }
        }
    }

    pub(crate) fn is_running(&self) -> bool {
        self.handle
            .lock()
            .map(|h| h.as_ref().is_some_and(|h| !h.is_finished()))
            .unwrap_or(false)
    }
}

impl Drop for IdleSweeper {
    fn drop(&mut self) {
        // Dropping the sender wakes the thread; it exits on its own.
        if let Ok(mut stop) = self.stop.lock() {
            stop.take();
        }
    }
}

/// Evict, validate and top up the idle connections of `pool`.
pub(crate) fn sweep<M: ManageConnection>(
    pool: &Pool<TrackedManager<M>>,
    manager: &TrackedManager<M>,
    policy: &SweepPolicy,
) -> SweepReport {
    let mut report = SweepReport::default();

    let mut idle = Vec::new();
    while let Some(conn) = pool.try_get() {
        idle.push(conn);
    }

    idle.sort_by_key(|conn| (conn.idle_since, conn.id));
    let mut remaining = idle.len();
    for conn in idle.iter_mut() {
        if remaining <= policy.min_idle as usize || conn.idle_since.elapsed() < policy.evict_after {
            break;
        }
        conn.broken = true;
        remaining -= 1;
        report.evicted += 1;
    }
    let (evicted, mut live): (Vec<_>, Vec<_>) = idle.into_iter().partition(|conn| conn.broken);
    drop(evicted);

    if policy.test_while_idle {
        live.sort_by_key(|conn| (conn.validated_at, conn.id));
        let untested = live.split_off(live.len().min(policy.tests as usize));
        drop(untested);

        for conn in live.iter_mut() {
            report.validated += 1;
            if manager.validate(conn).is_err() {
                report.discarded += 1;
            }
        }
    }
    drop(live);

    report.opened = fill_min_idle(pool, policy);

    debug!(
        evicted = report.evicted,
        validated = report.validated,
        discarded = report.discarded,
        opened = report.opened,
        connections = pool.state().connections,
        "Idle connection sweep complete"
    );
    report
}

/// Open connections until `min_idle` sit idle or the pool is full.
fn fill_min_idle<M: ManageConnection>(pool: &Pool<TrackedManager<M>>, policy: &SweepPolicy) -> u32 {
    let before = pool.state().connections;
    let mut held = Vec::new();

    loop {
        let state = pool.state();
        if state.idle_connections as usize + held.len() >= policy.min_idle as usize {
            break;
        }
        if state.idle_connections == 0 && state.connections >= pool.max_size() {
            break;
        }
        match pool.get_timeout(policy.fill_timeout) {
            Ok(conn) => held.push(conn),
            Err(e) => {
                warn!(error = %e, "Failed to open idle cache connections");
                break;
            }
        }
    }

    drop(held);
    pool.state().connections.saturating_sub(before)
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeSet;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::{Arc, Mutex};

    use super::*;

    #[derive(Debug)]
    struct Stale;

    impl std::fmt::Display for Stale {
        fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
            write!(f, "stale")
        }
    }

    impl std::error::Error for Stale {}

    /// Numbers its connections and records every validation.
    #[derive(Debug, Clone, Default)]
    struct LedgerManager {
        created: Arc<AtomicUsize>,
        stale: Arc<Mutex<BTreeSet<usize>>>,
        validated: Arc<Mutex<Vec<usize>>>,
    }

    impl LedgerManager {
        fn mark_stale(&self, ids: impl IntoIterator<Item = usize>) {
            self.stale.lock().expect("lock").extend(ids);
        }

        fn validated(&self) -> BTreeSet<usize> {
            self.validated.lock().expect("lock").iter().copied().collect()
        }
    }

    impl ManageConnection for LedgerManager {
        type Connection = usize;
        type Error = Stale;

        fn connect(&self) -> Result<usize, Stale> {
            Ok(self.created.fetch_add(1, Ordering::SeqCst))
        }

        fn is_valid(&self, conn: &mut usize) -> Result<(), Stale> {
            self.validated.lock().expect("lock").push(*conn);
            if self.stale.lock().expect("lock").contains(conn) {
                Err(Stale)
            } else {
                Ok(())
            }
        }

        fn has_broken(&self, _conn: &mut usize) -> bool {
            false
        }
    }

    type LedgerPool = Pool<TrackedManager<LedgerManager>>;

    fn setup(ledger: &LedgerManager, size: u32) -> (LedgerPool, TrackedManager<LedgerManager>) {
        let manager = TrackedManager::new(ledger.clone(), true);
        let pool = Pool::builder()
            .max_size(size)
            .min_idle(Some(0))
            .test_on_check_out(false)
            .build_unchecked(manager.clone());
        (pool, manager)
    }

    fn fill(pool: &LedgerPool, count: usize) {
        let held: Vec<_> = (0..count).map(|_| pool.get().expect("connect")).collect();
        drop(held);
    }

    fn policy(tests: u32) -> SweepPolicy {
        SweepPolicy {
            test_while_idle: true,
            tests,
            min_idle: 0,
            evict_after: Duration::from_secs(60),
            fill_timeout: Duration::from_millis(200),
        }
    }

    #[test]
    fn test_sweep_keeps_healthy_connections() {
        let ledger = LedgerManager::default();
        let (pool, manager) = setup(&ledger, 4);
        fill(&pool, 2);

        let report = sweep(&pool, &manager, &policy(3));

        assert_eq!(report.validated, 2);
        assert_eq!(report.discarded, 0);
        assert_eq!(pool.state().connections, 2);
        assert_eq!(pool.state().idle_connections, 2);
    }

    #[test]
    fn test_sweeps_walk_the_whole_idle_set() {
        let ledger = LedgerManager::default();
        let (pool, manager) = setup(&ledger, 8);
        fill(&pool, 6);
        ledger.mark_stale([0, 1]);

        let first = sweep(&pool, &manager, &policy(3));
        let second = sweep(&pool, &manager, &policy(3));

        assert_eq!(first.validated, 3);
        assert_eq!(second.validated, 3);
        assert_eq!(ledger.validated(), (0..6).collect());
        assert_eq!(first.discarded + second.discarded, 2);
        assert_eq!(pool.state().connections, 4);
    }

    #[test]
    fn test_stale_connections_removed_over_repeated_sweeps() {
        let ledger = LedgerManager::default();
        let (pool, manager) = setup(&ledger, 8);
        fill(&pool, 6);
        ledger.mark_stale([3, 4, 5]);

        for _ in 0..4 {
            sweep(&pool, &manager, &policy(3));
        }

        assert_eq!(pool.state().connections, 3);
        let held: Vec<_> = (0..3)
            .map(|_| pool.try_get().expect("idle connection"))
            .collect();
        let survivors: BTreeSet<usize> = held.iter().map(|conn| conn.conn).collect();
        assert_eq!(survivors, (0..3).collect());
    }

    #[test]
    fn test_swept_connections_still_expire() {
        let ledger = LedgerManager::default();
        let (pool, manager) = setup(&ledger, 4);
        fill(&pool, 3);
        let policy = SweepPolicy {
            min_idle: 1,
            evict_after: Duration::from_millis(100),
            ..policy(3)
        };

        let fresh = sweep(&pool, &manager, &policy);
        assert_eq!(fresh.evicted, 0);
        assert_eq!(fresh.validated, 3);

        thread::sleep(Duration::from_millis(150));
        let expired = sweep(&pool, &manager, &policy);

        assert_eq!(expired.evicted, 2);
        assert_eq!(pool.state().connections, 1);
    }

    #[test]
    fn test_validation_skipped_when_idle_testing_off() {
        let ledger = LedgerManager::default();
        let (pool, manager) = setup(&ledger, 4);
        fill(&pool, 2);
        ledger.mark_stale([0, 1]);

        let report = sweep(
            &pool,
            &manager,
            &SweepPolicy {
                test_while_idle: false,
                ..policy(3)
            },
        );

        assert_eq!(report.validated, 0);
        assert!(ledger.validated().is_empty());
        assert_eq!(pool.state().connections, 2);
    }

    #[test]
    fn test_sweep_opens_connections_up_to_min_idle() {
        let ledger = LedgerManager::default();
        let (pool, manager) = setup(&ledger, 4);
        fill(&pool, 1);

        let report = sweep(
            &pool,
            &manager,
            &SweepPolicy {
                min_idle: 3,
                ..policy(3)
            },
        );

        assert_eq!(report.opened, 2);
        assert_eq!(pool.state().idle_connections, 3);
    }

    #[test]
    fn test_stop_joins_thread() {
        let ledger = LedgerManager::default();
        let (pool, manager) = setup(&ledger, 1);
        let sweeper = IdleSweeper::spawn(pool, manager, &PoolConfig::default());
        assert!(sweeper.is_running());
        sweeper.stop();
        assert!(!sweeper.is_running());
    }
}
