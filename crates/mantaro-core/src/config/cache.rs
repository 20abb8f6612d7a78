//! Cache connection pool configuration.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::AppError;
use crate::result::AppResult;

/// Top-level cache configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheConfig {
    /// Redis connection URL.
    #[serde(default = "default_redis_url")]
    pub redis_url: String,
    /// Connection pool tuning.
    #[serde(default)]
    pub pool: PoolConfig,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            redis_url: default_redis_url(),
            pool: PoolConfig::default(),
        }
    }
}

/// Connection pool tuning parameters.
///
/// The defaults are the production values; tests shrink them.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PoolConfig {
    /// Maximum number of connections, borrowed and idle combined.
    #[serde(default = "default_max_total")]
    pub max_total: u32,
    /// Maximum number of idle connections kept in the pool.
    #[serde(default = "default_max_idle")]
    pub max_idle: u32,
    /// Number of idle connections the pool keeps open.
    #[serde(default = "default_min_idle")]
    pub min_idle: u32,
    /// Validate a connection with `PING` before handing it out.
    #[serde(default = "default_true")]
    pub test_on_borrow: bool,
    /// Check a connection for breakage when it is returned.
    #[serde(default = "default_true")]
    pub test_on_return: bool,
    /// Periodically validate idle connections.
    #[serde(default = "default_true")]
    pub test_while_idle: bool,
    /// Idle time after which a connection becomes eligible for eviction.
    #[serde(default = "default_min_evictable_idle")]
    pub min_evictable_idle_seconds: u64,
    /// Interval between idle sweeps.
    #[serde(default = "default_eviction_interval")]
    pub eviction_interval_seconds: u64,
    /// Idle connections validated per sweep.
    #[serde(default = "default_tests_per_eviction_run")]
    pub tests_per_eviction_run: u32,
    /// Wait for a free connection instead of failing when the pool is exhausted.
    #[serde(default = "default_true")]
    pub block_when_exhausted: bool,
    /// Upper bound on the wait for a free connection; `None` waits forever.
    #[serde(default)]
    pub max_wait_millis: Option<u64>,
    /// Length of a single acquisition attempt, including opening a new connection.
    #[serde(default = "default_acquire_timeout")]
    pub acquire_timeout_millis: u64,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_total: default_max_total(),
            max_idle: default_max_idle(),
            min_idle: default_min_idle(),
            test_on_borrow: true,
            test_on_return: true,
            test_while_idle: true,
            min_evictable_idle_seconds: default_min_evictable_idle(),
            eviction_interval_seconds: default_eviction_interval(),
            tests_per_eviction_run: default_tests_per_eviction_run(),
            block_when_exhausted: true,
            max_wait_millis: None,
            acquire_timeout_millis: default_acquire_timeout(),
        }
    }
}

impl PoolConfig {
    /// Reject combinations the pool cannot be built with.
    pub fn validate(&self) -> AppResult<()> {
        if self.max_total == 0 {
            return Err(AppError::configuration("pool max_total must be positive"));
        }
        if self.min_idle > self.max_idle || self.max_idle > self.max_total {
            return Err(AppError::configuration(format!(
                "pool sizes must satisfy min_idle <= max_idle <= max_total (got {} / {} / {})",
                self.min_idle, self.max_idle, self.max_total
            )));
        }
        if self.min_evictable_idle_seconds == 0 || self.eviction_interval_seconds == 0 {
            return Err(AppError::configuration(
                "pool eviction durations must be positive",
            ));
        }
        if self.acquire_timeout_millis == 0 {
            return Err(AppError::configuration(
                "pool acquire_timeout_millis must be positive",
            ));
        }
        Ok(())
    }

    /// Idle time before eviction.
    pub fn min_evictable_idle(&self) -> Duration {
        Duration::from_secs(self.min_evictable_idle_seconds)
    }

    /// Interval between idle sweeps.
    pub fn eviction_interval(&self) -> Duration {
        Duration::from_secs(self.eviction_interval_seconds)
    }

    /// Maximum total wait for a connection, if bounded.
    pub fn max_wait(&self) -> Option<Duration> {
        self.max_wait_millis.map(Duration::from_millis)
    }

    /// Length of a single acquisition attempt.
    pub fn acquire_timeout(&self) -> Duration {
        Duration::from_millis(self.acquire_timeout_millis)
    }
}

fn default_redis_url() -> String {
    "redis://localhost".to_string()
}

fn default_max_total() -> u32 {
    128
}

fn default_max_idle() -> u32 {
    128
}

fn default_min_idle() -> u32 {
    16
}

fn default_min_evictable_idle() -> u64 {
    60
}

fn default_eviction_interval() -> u64 {
    30
}

fn default_tests_per_eviction_run() -> u32 {
    3
}

fn default_acquire_timeout() -> u64 {
    5_000
}

fn default_true() -> bool {
    true
}
