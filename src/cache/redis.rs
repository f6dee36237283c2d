//! Redis cache backend
//!
//! Values are stored as plain integers with a millisecond TTL (`SET .. PX`).
//! Every failure maps to [`TallyError::Cache`], which callers treat as
//! non-fatal.

use async_trait::async_trait;
use redis::aio::MultiplexedConnection;
use std::time::Duration;
use tracing::info;

use super::InvalidatingCache;
use crate::types::{Result, TallyError};

#[derive(Clone)]
pub struct RedisCache {
    conn: MultiplexedConnection,
}

impl RedisCache {
    pub async fn connect(url: &str) -> Result<Self> {
        info!("Connecting to Redis at {}", url);

        let client = redis::Client::open(url)
            .map_err(|e| TallyError::Config(format!("Invalid Redis URL: {}", e)))?;
        let conn = client
            .get_multiplexed_tokio_connection()
            .await
            .map_err(|e| TallyError::Cache(format!("Failed to connect: {}", e)))?;

        info!("Connected to Redis at {}", url);
        Ok(Self { conn })
    }
}

#[async_trait]
impl InvalidatingCache for RedisCache {
    async fn get(&self, key: &str) -> Result<Option<i64>> {
        let value: Option<i64> = redis::cmd("GET")
            .arg(key)
            .query_async(&mut self.conn.clone())
            .await?;
        Ok(value)
    }

    async fn set(&self, key: &str, value: i64, ttl: Duration) -> Result<()> {
        let ttl_ms = u64::try_from(ttl.as_millis()).unwrap_or(u64::MAX).max(1);
        redis::cmd("SET")
            .arg(key)
            .arg(value)
            .arg("PX")
            .arg(ttl_ms)
            .query_async::<_, ()>(&mut self.conn.clone())
            .await?;
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<()> {
        redis::cmd("DEL")
            .arg(key)
            .query_async::<_, ()>(&mut self.conn.clone())
            .await?;
        Ok(())
    }
}
