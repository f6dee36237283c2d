//! SQLite aggregate store
//!
//! One connection behind a mutex, shared by every worker. Blocking SQLite
//! calls run on the blocking pool so workers never stall the runtime.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, Transaction};
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing::{debug, info};

use super::AggregateStore;
use crate::fault::{FaultPolicy, NoFaults};
use crate::types::{NewEvent, QuantityEvent, Result, TallyError};

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS quantity_events (
    id          INTEGER PRIMARY KEY AUTOINCREMENT,
    key         TEXT    NOT NULL,
    quantity    INTEGER NOT NULL CHECK (quantity >= 0),
    created_at  INTEGER NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_quantity_events_key_created
    ON quantity_events (key, created_at);
CREATE INDEX IF NOT EXISTS idx_quantity_events_created
    ON quantity_events (created_at);
"#;

pub struct SqliteStore {
    conn: Arc<Mutex<Connection>>,
    faults: Arc<dyn FaultPolicy>,
}

impl SqliteStore {
    /// Open or create a database file
    pub fn open(path: &Path) -> Result<Self> {
        info!("Opening SQLite database at {:?}", path);

        let conn = Connection::open(path)?;
        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA synchronous=NORMAL;")?;
        conn.busy_timeout(Duration::from_secs(5))?;

        Ok(Self::from_connection(conn))
    }

    /// Open an in-memory database (for testing)
    pub fn open_in_memory() -> Result<Self> {
        debug!("Opening in-memory SQLite database");
        Ok(Self::from_connection(Connection::open_in_memory()?))
    }

    /// Open `path`, treating `:memory:` as an in-memory database
    pub fn open_path(path: &str) -> Result<Self> {
        if path == ":memory:" {
            Self::open_in_memory()
        } else {
            Self::open(Path::new(path))
        }
    }

    fn from_connection(conn: Connection) -> Self {
        Self {
            conn: Arc::new(Mutex::new(conn)),
            faults: Arc::new(NoFaults),
        }
    }

    /// Inject a fault policy consulted on every write
    pub fn with_faults(mut self, faults: Arc<dyn FaultPolicy>) -> Self {
        self.faults = faults;
        self
    }

    /// Run `f` on the blocking pool with exclusive access to the connection
    async fn with_conn<F, T>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&mut Connection) -> Result<T> + Send + 'static,
        T: Send + 'static,
    {
        let conn = Arc::clone(&self.conn);
        tokio::task::spawn_blocking(move || {
            let mut guard = conn
                .lock()
                .map_err(|e| TallyError::Internal(format!("Lock poisoned: {}", e)))?;
            f(&mut guard)
        })
        .await?
    }

    fn cutoff_millis(window: Duration) -> i64 {
        let window = i64::try_from(window.as_millis()).unwrap_or(i64::MAX);
        Utc::now().timestamp_millis().saturating_sub(window)
    }
}

/// Scoped unit of work: commit when `f` succeeds, roll back otherwise
fn unit_of_work<T>(
    conn: &mut Connection,
    f: impl FnOnce(&Transaction<'_>) -> Result<T>,
) -> Result<T> {
    let tx = conn.transaction()?;
    let value = f(&tx)?;
    tx.commit()?;
    Ok(value)
}

#[async_trait]
impl AggregateStore for SqliteStore {
    async fn ensure_schema(&self) -> Result<()> {
        self.with_conn(|conn| {
            conn.execute_batch(SCHEMA)?;
            Ok(())
        })
        .await?;
        info!("Schema ready");
        Ok(())
    }

    async fn record(&self, event: NewEvent) -> Result<QuantityEvent> {
        let latency = self.faults.latency();
        if !latency.is_zero() {
            tokio::time::sleep(latency).await;
        }

        let faults = Arc::clone(&self.faults);
        self.with_conn(move |conn| {
            unit_of_work(conn, |tx| {
                tx.execute(
                    "INSERT INTO quantity_events (key, quantity, created_at) VALUES (?1, ?2, ?3)",
                    params![event.key, event.quantity, event.created_at.timestamp_millis()],
                )?;
                let id = tx.last_insert_rowid();

                if faults.should_time_out() {
                    return Err(TallyError::StoreTimeout(
                        "Database connection timed out".into(),
                    ));
                }

                Ok(QuantityEvent {
                    id,
                    key: event.key,
                    quantity: event.quantity,
                    created_at: DateTime::from_timestamp_millis(event.created_at.timestamp_millis())
                        .unwrap_or(event.created_at),
                })
            })
        })
        .await
    }

    async fn sum_by_key(&self, key: &str, window: Duration) -> Result<i64> {
        let key = key.to_string();
        let cutoff = Self::cutoff_millis(window);
        self.with_conn(move |conn| {
            let total: i64 = conn.query_row(
                "SELECT COALESCE(SUM(quantity), 0) FROM quantity_events
                 WHERE key = ?1 AND created_at > ?2",
                params![key, cutoff],
                |row| row.get(0),
            )?;
            Ok(total)
        })
        .await
    }

    async fn sum_all(&self, window: Duration) -> Result<i64> {
        let cutoff = Self::cutoff_millis(window);
        self.with_conn(move |conn| {
            let total: i64 = conn.query_row(
                "SELECT COALESCE(SUM(quantity), 0) FROM quantity_events WHERE created_at > ?1",
                params![cutoff],
                |row| row.get(0),
            )?;
            Ok(total)
        })
        .await
    }
}
