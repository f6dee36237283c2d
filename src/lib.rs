//! Tally - queue-backed write pipeline with cached sliding-window reads
//!
//! Producers enqueue small quantity messages onto one durable queue. A fixed
//! pool of workers consumes them, appends each as an event to a transactional
//! store and invalidates the cached aggregate for that key. Readers get
//! one-minute sums through a TTL cache.
//!
//! ## Components
//!
//! - **Queue**: NATS JetStream work queue, or an in-process queue
//! - **Store**: SQLite event log with windowed sums and fault injection
//! - **Cache**: Redis or in-memory TTL cache, invalidated on write
//! - **Worker**: consume → persist → invalidate state machine
//! - **Engine**: fixed pool of workers and generators with graceful drain
//! - **Reader**: read-through aggregate queries

pub mod cache;
pub mod config;
pub mod fault;
pub mod logging;
pub mod metrics;
pub mod queue;
pub mod reader;
pub mod store;
pub mod types;
pub mod worker;

pub use config::Args;
pub use reader::AggregateReader;
pub use types::{Result, TallyError};
