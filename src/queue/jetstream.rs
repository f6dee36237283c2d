//! NATS JetStream transport
//!
//! The queue is a JetStream stream with work-queue retention and file
//! storage, so published messages survive a server restart and are removed
//! once acknowledged. All workers pull through one durable consumer, which
//! spreads messages across them; each fetch asks for a single message.

use async_nats::jetstream::{
    self,
    consumer::{pull, AckPolicy, PullConsumer},
    stream::{RetentionPolicy, StorageType, Stream},
    AckKind,
};
use async_nats::ConnectOptions;
use async_trait::async_trait;
use bytes::Bytes;
use futures_util::StreamExt;
use std::time::Duration;
use tracing::{debug, info, warn};

use super::{Acker, Delivery, MessageSource, Producer, Transport};
use crate::config::NatsArgs;
use crate::types::{Result, TallyError};

/// Default ping interval for keep-alive
const DEFAULT_PING_INTERVAL: Duration = Duration::from_secs(120);

/// How long the server waits for an ack before redelivering
const ACK_WAIT: Duration = Duration::from_secs(30);

#[derive(Clone)]
pub struct JetStreamTransport {
    client: async_nats::Client,
    jetstream: jetstream::Context,
    queue: String,
}

impl JetStreamTransport {
    /// Connect and make sure the stream exists
    pub async fn connect(args: &NatsArgs, queue: &str, name: &str) -> Result<Self> {
        info!("Connecting to NATS at {}", args.nats_url);

        let mut options = ConnectOptions::new()
            .name(name)
            .ping_interval(DEFAULT_PING_INTERVAL)
            .connection_timeout(Duration::from_secs(5));

        if let (Some(user), Some(pass)) = (&args.nats_user, &args.nats_password) {
            options = options.user_and_password(user.clone(), pass.clone());
        }

        let client = options
            .connect(&args.nats_url)
            .await
            .map_err(|e| TallyError::Transport(format!("Failed to connect: {}", e)))?;

        info!("Connected to NATS at {}", args.nats_url);

        let transport = Self {
            jetstream: jetstream::new(client.clone()),
            client,
            queue: queue.to_string(),
        };
        transport.ensure_stream().await?;
        Ok(transport)
    }

    fn stream_name(&self) -> String {
        self.queue.to_uppercase()
    }

    fn consumer_name(&self) -> String {
        format!("{}_workers", self.queue)
    }

    /// Ensure the queue stream exists
    async fn ensure_stream(&self) -> Result<Stream> {
        let stream = self
            .jetstream
            .get_or_create_stream(jetstream::stream::Config {
                name: self.stream_name(),
                subjects: vec![self.queue.clone()],
                retention: RetentionPolicy::WorkQueue,
                storage: StorageType::File,
                ..Default::default()
            })
            .await
            .map_err(|e| TallyError::Transport(format!("Failed to create stream: {}", e)))?;

        info!("Using stream {} for queue {}", self.stream_name(), self.queue);
        Ok(stream)
    }

    /// Ensure the shared durable consumer exists
    async fn ensure_consumer(&self) -> Result<PullConsumer> {
        let stream = self.ensure_stream().await?;
        let consumer_name = self.consumer_name();

        let consumer = stream
            .get_or_create_consumer(
                &consumer_name,
                pull::Config {
                    durable_name: Some(consumer_name.clone()),
                    ack_policy: AckPolicy::Explicit,
                    ack_wait: ACK_WAIT,
                    filter_subject: self.queue.clone(),
                    ..Default::default()
                },
            )
            .await
            .map_err(|e| TallyError::Transport(format!("Failed to create consumer: {}", e)))?;

        debug!("Using consumer {}", consumer_name);
        Ok(consumer)
    }
}

#[async_trait]
impl Transport for JetStreamTransport {
    async fn source(&self) -> Result<Box<dyn MessageSource>> {
        Ok(Box::new(JetStreamSource {
            consumer: self.ensure_consumer().await?,
        }))
    }

    async fn producer(&self) -> Result<Box<dyn Producer>> {
        Ok(Box::new(JetStreamProducer {
            jetstream: self.jetstream.clone(),
            client: self.client.clone(),
            subject: self.queue.clone(),
        }))
    }
}

struct JetStreamSource {
    consumer: PullConsumer,
}

#[async_trait]
impl MessageSource for JetStreamSource {
    async fn fetch_one(&mut self, timeout: Duration) -> Result<Option<Delivery>> {
        let mut messages = self
            .consumer
            .fetch()
            .max_messages(1)
            .expires(timeout)
            .messages()
            .await
            .map_err(|e| TallyError::Transport(format!("Failed to fetch messages: {}", e)))?;

        let Some(msg) = fetched(messages.next().await)? else {
            return Ok(None);
        };
        let payload = msg.payload.clone();
        Ok(Some(Delivery::new(payload, Box::new(JetStreamAcker { msg }))))
    }
}

/// Resolve one item of a fetch batch.
///
/// The batch stream already ends quietly on expiry, idle heartbeats and
/// "no messages", so anything it yields as an error (consumer deleted, leader
/// gone, connection lost) is a transport failure.
fn fetched<T, E: std::fmt::Display>(item: Option<std::result::Result<T, E>>) -> Result<Option<T>> {
    match item {
        Some(Ok(msg)) => Ok(Some(msg)),
        Some(Err(e)) => {
            warn!("Error receiving message: {}", e);
            Err(TallyError::Transport(format!("Failed to receive message: {}", e)))
        }
        None => Ok(None),
    }
}

struct JetStreamAcker {
    msg: jetstream::Message,
}

#[async_trait]
impl Acker for JetStreamAcker {
    async fn ack(self: Box<Self>) -> Result<()> {
        self.msg
            .ack()
            .await
            .map_err(|e| TallyError::Transport(format!("Failed to ack message: {}", e)))
    }

    async fn nak(self: Box<Self>) -> Result<()> {
        self.msg
            .ack_with(AckKind::Nak(None))
            .await
            .map_err(|e| TallyError::Transport(format!("Failed to nak message: {}", e)))
    }
}

struct JetStreamProducer {
    jetstream: jetstream::Context,
    client: async_nats::Client,
    subject: String,
}

#[async_trait]
impl Producer for JetStreamProducer {
    async fn publish_payload(&self, payload: Bytes) -> Result<()> {
        let len = payload.len();

        // The second await is the stream's persistence ack, not a consumer's
        self.jetstream
            .publish(self.subject.clone(), payload)
            .await
            .map_err(|e| TallyError::Transport(format!("Publish failed: {}", e)))?
            .await
            .map_err(|e| TallyError::Transport(format!("Publish not persisted: {}", e)))?;

        debug!(subject = %self.subject, bytes = len, "Published message");
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        self.client
            .flush()
            .await
            .map_err(|e| TallyError::Transport(format!("Flush failed: {}", e)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fetched_message() {
        let item: Option<std::result::Result<u8, String>> = Some(Ok(7));
        assert_eq!(fetched(item).unwrap(), Some(7));
    }

    #[test]
    fn test_fetched_end_of_batch_is_empty() {
        let item: Option<std::result::Result<u8, String>> = None;
        assert_eq!(fetched(item).unwrap(), None);
    }

    #[test]
    fn test_fetched_error_is_transport_failure() {
        let item: Option<std::result::Result<u8, std::io::Error>> = Some(Err(std::io::Error::new(
            std::io::ErrorKind::Other,
            "409 Consumer Deleted",
        )));
        let err = fetched(item).unwrap_err();
        assert!(matches!(err, TallyError::Transport(_)));
        assert!(err.is_fatal_to_worker());
    }
}
