//! Read-through aggregate queries
//!
//! Serves sliding-window sums from the cache when present and falls back to
//! the store otherwise, populating the cache on the way out. The cache is an
//! optimization only: if it fails, the store answers and the failure is
//! logged.

use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

use crate::cache::{CacheKey, InvalidatingCache};
use crate::store::{AggregateStore, DEFAULT_WINDOW};
use crate::types::{AggregateKey, Result};

#[derive(Clone)]
pub struct AggregateReader {
    store: Arc<dyn AggregateStore>,
    cache: Arc<dyn InvalidatingCache>,
    ttl: Duration,
    window: Duration,
}

impl AggregateReader {
    pub fn new(
        store: Arc<dyn AggregateStore>,
        cache: Arc<dyn InvalidatingCache>,
        ttl: Duration,
    ) -> Self {
        Self {
            store,
            cache,
            ttl,
            window: DEFAULT_WINDOW,
        }
    }

    pub fn with_window(mut self, window: Duration) -> Self {
        self.window = window;
        self
    }

    /// Recent quantity for one key
    pub async fn recent_quantity(&self, key: &str) -> Result<i64> {
        self.quantity(&AggregateKey::key(key)).await
    }

    /// Recent quantity across all keys
    pub async fn all_quantity(&self) -> Result<i64> {
        self.quantity(&AggregateKey::All).await
    }

    pub async fn quantity(&self, scope: &AggregateKey) -> Result<i64> {
        let key = CacheKey::from(scope).to_storage_key();

        match self.cache.get(&key).await {
            Ok(Some(value)) => {
                debug!(key = %key, "Cache hit");
                return Ok(value);
            }
            Ok(None) => debug!(key = %key, "Cache miss"),
            Err(e) => warn!(key = %key, error = %e, "Cache read failed, using store"),
        }

        let value = self.store.sum(scope, self.window).await?;

        if let Err(e) = self.cache.set(&key, value, self.ttl).await {
            warn!(key = %key, error = %e, "Cache write failed");
        }
        Ok(value)
    }
}
