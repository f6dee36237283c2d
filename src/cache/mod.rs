//! Invalidating cache for aggregate reads
//!
//! A pass-through TTL cache keyed by aggregate scope. Readers populate it on
//! miss (see [`crate::reader`]); workers delete the entry for a key after
//! persisting an event for that key. There is no eviction beyond TTL.
//!
//! By default only the per-key entry is invalidated on write. The `ALL` entry
//! is left to expire, so global reads may serve a total that is up to one TTL
//! old. Set [`crate::worker::WorkerConfig::invalidate_global`] to have
//! workers delete it as well.

pub mod keys;
pub mod memory;
pub mod redis;

use async_trait::async_trait;
use std::time::Duration;

use crate::types::Result;

pub use keys::CacheKey;
pub use memory::{spawn_cleanup_task, CacheStats, MemoryCache};
pub use self::redis::RedisCache;

/// Cache configuration
#[derive(Debug, Clone)]
pub struct CacheConfig {
    /// TTL for read-through entries
    pub ttl: Duration,
    /// Interval for sweeping expired entries (memory backend)
    pub cleanup_interval: Duration,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            ttl: Duration::from_secs(60),
            cleanup_interval: Duration::from_secs(60),
        }
    }
}

#[async_trait]
pub trait InvalidatingCache: Send + Sync {
    /// Cached value, or `None` on miss or expiry
    async fn get(&self, key: &str) -> Result<Option<i64>>;

    async fn set(&self, key: &str, value: i64, ttl: Duration) -> Result<()>;

    /// Remove an entry. Deleting a missing key is a no-op.
    async fn delete(&self, key: &str) -> Result<()>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = CacheConfig::default();
        assert_eq!(config.ttl, Duration::from_secs(60));
        assert_eq!(config.cleanup_interval, Duration::from_secs(60));
    }
}
