//! Quantity events and aggregate query keys

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// A persisted quantity event. Immutable once written.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QuantityEvent {
    /// Row id assigned by the store
    pub id: i64,
    pub key: String,
    pub quantity: i64,
    pub created_at: DateTime<Utc>,
}

/// An event about to be persisted
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewEvent {
    pub key: String,
    pub quantity: i64,
    pub created_at: DateTime<Utc>,
}

impl NewEvent {
    /// Event stamped with the current time
    pub fn now(key: impl Into<String>, quantity: i64) -> Self {
        Self {
            key: key.into(),
            quantity,
            created_at: Utc::now(),
        }
    }
}

/// Scope of a sliding-window sum: one key, or every key
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum AggregateKey {
    Key(String),
    All,
}

impl AggregateKey {
    pub fn key(key: impl Into<String>) -> Self {
        Self::Key(key.into())
    }
}

impl fmt::Display for AggregateKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Key(k) => write!(f, "{}", k),
            Self::All => write!(f, "ALL"),
        }
    }
}
