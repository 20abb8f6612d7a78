//! # mantaro-cache
//!
//! Pooled access to the Redis cache. [`CachePool`] wraps an `r2d2` pool
//! tuned from [`PoolConfig`](mantaro_core::config::cache::PoolConfig) and
//! exposes scoped connection access through [`CachePool::access`].
//!
//! The pool is generic over the connection manager so it can be exercised
//! with in-process fakes; it defaults to `redis::Client`.

pub mod pool;
pub mod redis;
mod sweeper;
mod tracked;

pub use pool::{CacheConnection, CachePool, PoolStatus};
pub use self::redis::{map_redis_error, mask_redis_url};
