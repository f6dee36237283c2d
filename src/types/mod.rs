//! Shared types for the write pipeline

pub mod error;
pub mod event;
pub mod message;

pub use error::{Result, TallyError};
pub use event::{AggregateKey, NewEvent, QuantityEvent};
pub use message::{Interpretation, Message, SENTINEL};
