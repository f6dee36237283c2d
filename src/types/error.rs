//! Error types for Tally
//!
//! An empty receive is not an error (`Ok(None)`), and malformed payloads are
//! decoded permissively, so neither has a variant here.

/// Main error type for pipeline operations
#[derive(Debug, thiserror::Error)]
pub enum TallyError {
    #[error("Store timeout: {0}")]
    StoreTimeout(String),

    #[error("Database error: {0}")]
    Database(String),

    #[error("Cache unavailable: {0}")]
    Cache(String),

    #[error("Transport unavailable: {0}")]
    Transport(String),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl TallyError {
    /// Whether this error ends a worker's loop.
    ///
    /// Only connection-level transport failures do; everything raised while
    /// persisting or invalidating is logged and the worker moves on.
    pub fn is_fatal_to_worker(&self) -> bool {
        matches!(self, Self::Transport(_))
    }

    /// Short label used for metrics and log fields
    pub fn kind(&self) -> &'static str {
        match self {
            Self::StoreTimeout(_) => "store_timeout",
            Self::Database(_) => "database",
            Self::Cache(_) => "cache",
            Self::Transport(_) => "transport",
            Self::Serialization(_) => "serialization",
            Self::Config(_) => "config",
            Self::Internal(_) => "internal",
        }
    }
}

impl From<std::io::Error> for TallyError {
    fn from(err: std::io::Error) -> Self {
        Self::Internal(err.to_string())
    }
}

impl From<serde_json::Error> for TallyError {
    fn from(err: serde_json::Error) -> Self {
        Self::Serialization(err.to_string())
    }
}

impl From<rusqlite::Error> for TallyError {
    fn from(err: rusqlite::Error) -> Self {
        match err {
            rusqlite::Error::SqliteFailure(ref e, _)
                if e.code == rusqlite::ErrorCode::DatabaseBusy
                    || e.code == rusqlite::ErrorCode::DatabaseLocked =>
            {
                Self::StoreTimeout(err.to_string())
            }
            other => Self::Database(other.to_string()),
        }
    }
}

impl From<redis::RedisError> for TallyError {
    fn from(err: redis::RedisError) -> Self {
        Self::Cache(err.to_string())
    }
}

impl From<tokio::task::JoinError> for TallyError {
    fn from(err: tokio::task::JoinError) -> Self {
        Self::Internal(format!("Task failed: {}", err))
    }
}

/// Result type alias for pipeline operations
pub type Result<T> = std::result::Result<T, TallyError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_only_transport_is_fatal() {
        assert!(TallyError::Transport("gone".into()).is_fatal_to_worker());
        assert!(!TallyError::StoreTimeout("slow".into()).is_fatal_to_worker());
        assert!(!TallyError::Cache("down".into()).is_fatal_to_worker());
        assert!(!TallyError::Database("locked".into()).is_fatal_to_worker());
    }

    #[test]
    fn test_busy_sqlite_maps_to_timeout() {
        let err = rusqlite::Error::SqliteFailure(
            rusqlite::ffi::Error::new(rusqlite::ffi::SQLITE_BUSY),
            None,
        );
        assert!(matches!(TallyError::from(err), TallyError::StoreTimeout(_)));
    }
}
