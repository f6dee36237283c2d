//! Aggregate store
//!
//! Append-only quantity events with sliding-window sums computed fresh on
//! every query. There are no running totals, so a sum is only ever as
//! stale as the last committed write.

pub mod sqlite;

use async_trait::async_trait;
use std::time::Duration;

use crate::types::{AggregateKey, NewEvent, QuantityEvent, Result};

pub use sqlite::SqliteStore;

/// Default sliding window
pub const DEFAULT_WINDOW: Duration = Duration::from_secs(60);

#[async_trait]
pub trait AggregateStore: Send + Sync {
    /// Create tables and indexes. Idempotent.
    async fn ensure_schema(&self) -> Result<()>;

    /// Persist one event inside its own transaction.
    ///
    /// On any failure the transaction is rolled back and the error returned;
    /// on success the event is committed before this returns.
    async fn record(&self, event: NewEvent) -> Result<QuantityEvent>;

    /// Sum of quantities for `key` created within `window` of now; 0 if none
    async fn sum_by_key(&self, key: &str, window: Duration) -> Result<i64>;

    /// Sum of quantities across all keys created within `window` of now; 0 if none
    async fn sum_all(&self, window: Duration) -> Result<i64>;

    async fn sum(&self, key: &AggregateKey, window: Duration) -> Result<i64> {
        match key {
            AggregateKey::Key(k) => self.sum_by_key(k, window).await,
            AggregateKey::All => self.sum_all(window).await,
        }
    }
}
