//! Queue transport
//!
//! One durable FIFO queue shared by producers and a pool of consumers.
//!
//! - **Producer**: serializes a [`Message`] and enqueues it persistently.
//!   Publishing never waits for a consumer.
//! - **Consumer**: pulls one message at a time with a bounded wait. With
//!   [`AckMode::BeforeProcessing`] (the default) the message is acknowledged
//!   before it is handed to the caller, so the transport never redelivers it
//!   whatever happens next. A failure after that point loses the message.
//!   [`AckMode::AfterProcessing`] leaves settlement to the caller instead.
//!
//! Every worker gets its own consumer and producer; handles are never shared.
//!
//! Backends:
//! - [`jetstream`]: NATS JetStream work queue, file storage
//! - [`memory`]: in-process queue for tests and single-process runs

pub mod jetstream;
pub mod memory;

use async_trait::async_trait;
use bytes::Bytes;
use std::time::Duration;
use tracing::debug;

use crate::types::{Message, Result};

pub use jetstream::JetStreamTransport;
pub use memory::{MemoryTransport, QueueStats};

/// Default queue name
pub const DEFAULT_QUEUE: &str = "task_queue";

/// When a consumed message is acknowledged to the transport
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, clap::ValueEnum)]
pub enum AckMode {
    /// Acknowledge on receipt: at-most-once, a processing failure drops the message
    #[default]
    BeforeProcessing,
    /// Acknowledge after successful processing, requeue on failure: at-least-once
    AfterProcessing,
}

/// Settles a single delivery with the transport
#[async_trait]
pub trait Acker: Send + Sync {
    async fn ack(self: Box<Self>) -> Result<()>;

    /// Return the message to the queue for redelivery
    async fn nak(self: Box<Self>) -> Result<()>;
}

/// A message handed out by a consumer
pub struct Delivery {
    payload: Bytes,
    acker: Option<Box<dyn Acker>>,
}

impl Delivery {
    pub fn new(payload: Bytes, acker: Box<dyn Acker>) -> Self {
        Self {
            payload,
            acker: Some(acker),
        }
    }

    pub fn payload(&self) -> &[u8] {
        &self.payload
    }

    /// Decode the payload (never fails, see [`Message::decode`])
    pub fn message(&self) -> Message {
        Message::decode(&self.payload)
    }

    /// Whether this delivery has already been acked or nacked
    pub fn is_settled(&self) -> bool {
        self.acker.is_none()
    }

    /// Acknowledge. No-op once settled.
    pub async fn ack(&mut self) -> Result<()> {
        match self.acker.take() {
            Some(acker) => acker.ack().await,
            None => Ok(()),
        }
    }

    /// Requeue. No-op once settled.
    pub async fn nak(&mut self) -> Result<()> {
        match self.acker.take() {
            Some(acker) => acker.nak().await,
            None => Ok(()),
        }
    }
}

impl std::fmt::Debug for Delivery {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Delivery")
            .field("payload", &String::from_utf8_lossy(&self.payload))
            .field("settled", &self.is_settled())
            .finish()
    }
}

/// Backend-specific pull of unsettled deliveries
#[async_trait]
pub trait MessageSource: Send + Sync {
    /// Fetch at most one message, waiting up to `timeout`. `Ok(None)` means
    /// nothing arrived in time.
    async fn fetch_one(&mut self, timeout: Duration) -> Result<Option<Delivery>>;

    async fn close(&mut self) -> Result<()> {
        Ok(())
    }
}

#[async_trait]
pub trait Producer: Send + Sync {
    /// Enqueue an already-encoded payload persistently, byte for byte
    async fn publish_payload(&self, payload: Bytes) -> Result<()>;

    /// Enqueue a message persistently
    async fn publish(&self, message: &Message) -> Result<()> {
        self.publish_payload(message.encode()?).await
    }

    async fn close(&self) -> Result<()> {
        Ok(())
    }
}

/// Single-message consumer applying the configured [`AckMode`]
pub struct Consumer {
    source: Box<dyn MessageSource>,
    ack_mode: AckMode,
}

impl Consumer {
    pub fn new(source: Box<dyn MessageSource>, ack_mode: AckMode) -> Self {
        Self { source, ack_mode }
    }

    pub fn ack_mode(&self) -> AckMode {
        self.ack_mode
    }

    /// Next message within `timeout`, or `None` if the queue stayed empty.
    ///
    /// In [`AckMode::BeforeProcessing`] the returned delivery is already
    /// acknowledged.
    pub async fn receive_one(&mut self, timeout: Duration) -> Result<Option<Delivery>> {
        let Some(mut delivery) = self.source.fetch_one(timeout).await? else {
            return Ok(None);
        };

        if self.ack_mode == AckMode::BeforeProcessing {
            delivery.ack().await?;
            debug!("Acknowledged message on receipt");
        }

        Ok(Some(delivery))
    }

    pub async fn close(&mut self) -> Result<()> {
        self.source.close().await
    }
}

/// Factory for per-worker queue handles
#[async_trait]
pub trait Transport: Send + Sync {
    /// A new pull source bound to the shared queue
    async fn source(&self) -> Result<Box<dyn MessageSource>>;

    /// A new producer bound to the shared queue
    async fn producer(&self) -> Result<Box<dyn Producer>>;

    async fn consumer(&self, ack_mode: AckMode) -> Result<Consumer> {
        Ok(Consumer::new(self.source().await?, ack_mode))
    }
}
