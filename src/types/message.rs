//! Queue message format
//!
//! Three shapes share one queue:
//!
//! - the sentinel string `"hello"` (no payload, triggers a simulated pause)
//! - a structured record `{"key": "...", "quantity": n}` (`"fruit"` is accepted
//!   for `"key"` from older producers)
//! - any other string, interpreted as a key with a generated quantity
//!
//! Decoding never fails. Payloads that are not JSON at all are taken as raw
//! text, and a structured quantity that is missing, negative or not an integer
//! is replaced by a generated default.

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::error::Result;

/// Sentinel payload
pub const SENTINEL: &str = "hello";

/// Key used when a structured record carries no key
pub const UNKNOWN_KEY: &str = "unknown";

/// A message travelling over the queue
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    /// The `"hello"` sentinel
    Hello,
    /// Structured record; `quantity` is `None` when absent or unusable
    Quantity { key: String, quantity: Option<i64> },
    /// Unstructured string from legacy clients
    Raw(String),
}

/// What a worker should do with a message
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Interpretation {
    /// Sentinel: no persistence, just pause
    Pause,
    /// Persist one event
    Record { key: String, quantity: i64 },
}

#[derive(Serialize)]
struct WireRecord<'a> {
    key: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    quantity: Option<i64>,
}

#[derive(Deserialize)]
struct LooseRecord {
    #[serde(default, alias = "fruit")]
    key: Option<Value>,
    #[serde(default)]
    quantity: Option<Value>,
}

impl Message {
    /// Structured record with an explicit quantity
    pub fn quantity(key: impl Into<String>, quantity: i64) -> Self {
        Self::Quantity {
            key: key.into(),
            quantity: Some(quantity),
        }
    }

    /// Serialize to the JSON wire form
    pub fn encode(&self) -> Result<Bytes> {
        let body = match self {
            Self::Hello => serde_json::to_vec(SENTINEL)?,
            Self::Quantity { key, quantity } => serde_json::to_vec(&WireRecord {
                key,
                quantity: *quantity,
            })?,
            Self::Raw(text) => serde_json::to_vec(text)?,
        };
        Ok(Bytes::from(body))
    }

    /// Decode a payload. Never fails; see the module docs for the fallbacks.
    pub fn decode(payload: &[u8]) -> Self {
        let value: Value = match serde_json::from_slice(payload) {
            Ok(v) => v,
            Err(_) => return Self::from_text(String::from_utf8_lossy(payload).trim()),
        };

        match value {
            Value::String(s) => Self::from_text(s.trim()),
            Value::Object(_) => match serde_json::from_value::<LooseRecord>(value.clone()) {
                Ok(record) => {
                    let key = match record.key {
                        Some(Value::String(k)) => k,
                        Some(Value::Null) | None => UNKNOWN_KEY.to_string(),
                        Some(other) => other.to_string(),
                    };
                    let quantity = record
                        .quantity
                        .as_ref()
                        .and_then(Value::as_i64)
                        .filter(|q| *q >= 0);
                    Self::Quantity { key, quantity }
                }
                Err(_) => Self::Raw(value.to_string()),
            },
            other => Self::Raw(other.to_string()),
        }
    }

    /// Plain text: the sentinel or an unstructured key
    fn from_text(text: &str) -> Self {
        if text == SENTINEL {
            Self::Hello
        } else {
            Self::Raw(text.to_string())
        }
    }

    /// Resolve the message into an action, drawing a default quantity when needed
    pub fn interpret<F>(&self, default_quantity: F) -> Interpretation
    where
        F: FnOnce() -> i64,
    {
        match self {
            Self::Hello => Interpretation::Pause,
            Self::Raw(text) if text == SENTINEL => Interpretation::Pause,
            Self::Quantity { key, quantity } => Interpretation::Record {
                key: key.clone(),
                quantity: quantity.unwrap_or_else(default_quantity),
            },
            Self::Raw(text) => Interpretation::Record {
                key: text.clone(),
                quantity: default_quantity(),
            },
        }
    }

    /// Label for logs and metrics
    pub fn shape(&self) -> &'static str {
        match self {
            Self::Hello => "sentinel",
            Self::Quantity { .. } => "structured",
            Self::Raw(_) => "unstructured",
        }
    }
}
