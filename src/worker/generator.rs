//! Synthetic load generator
//!
//! Publishes a quantity message for a random key, then sleeps for a random
//! interval. Publish failures are logged and the loop carries on.

use rand::seq::SliceRandom;
use std::sync::Arc;
use tracing::{debug, info, warn};

use super::{PauseRange, QuantitySource, StopHandle};
use crate::metrics::{EventKind, MetricsSink};
use crate::queue::{Producer, Transport};
use crate::types::{Message, Result};

/// Keys the generator picks from by default
pub const POSSIBLE_KEYS: [&str; 5] = ["apples", "oranges", "bananas", "grapes", "pears"];

#[derive(Debug, Clone)]
pub struct GeneratorConfig {
    pub generator_id: String,
    /// Sleep between publishes
    pub interval: PauseRange,
    pub keys: Vec<String>,
}

impl Default for GeneratorConfig {
    fn default() -> Self {
        Self {
            generator_id: "generator-0".to_string(),
            interval: PauseRange::default(),
            keys: POSSIBLE_KEYS.iter().map(|k| k.to_string()).collect(),
        }
    }
}

pub struct Generator {
    config: GeneratorConfig,
    producer: Box<dyn Producer>,
    quantities: Arc<dyn QuantitySource>,
    metrics: Arc<dyn MetricsSink>,
    stop: StopHandle,
}

impl Generator {
    pub fn new(
        config: GeneratorConfig,
        producer: Box<dyn Producer>,
        quantities: Arc<dyn QuantitySource>,
        metrics: Arc<dyn MetricsSink>,
    ) -> Self {
        Self {
            config,
            producer,
            quantities,
            metrics,
            stop: StopHandle::new(),
        }
    }

    pub async fn connect(
        config: GeneratorConfig,
        transport: &dyn Transport,
        quantities: Arc<dyn QuantitySource>,
        metrics: Arc<dyn MetricsSink>,
    ) -> Result<Self> {
        let producer = transport.producer().await?;
        Ok(Self::new(config, producer, quantities, metrics))
    }

    pub fn id(&self) -> &str {
        &self.config.generator_id
    }

    pub fn stop_handle(&self) -> StopHandle {
        self.stop.clone()
    }

    /// Build the next message, `None` if there are no keys to pick from
    fn next_message(&self) -> Option<Message> {
        let key = self.config.keys.choose(&mut rand::thread_rng())?;
        Some(Message::quantity(key.clone(), self.quantities.next_quantity()))
    }

    pub async fn publish_one(&self) -> Result<Option<Message>> {
        let Some(message) = self.next_message() else {
            return Ok(None);
        };
        self.producer.publish(&message).await?;
        Ok(Some(message))
    }

    pub async fn run(self) -> Result<()> {
        info!(generator_id = %self.config.generator_id, "Generator running");

        while !self.stop.is_stopped() {
            match self.publish_one().await {
                Ok(Some(message)) => {
                    self.metrics.record_event(EventKind::GeneratorPublish, &[]);
                    debug!(generator_id = %self.config.generator_id, "Published {:?}", message);
                }
                Ok(None) => {
                    warn!(generator_id = %self.config.generator_id, "No keys configured");
                }
                Err(e) => {
                    self.metrics.record_event(EventKind::GeneratorPublishFailed, &[]);
                    warn!(generator_id = %self.config.generator_id, error = %e, "Publish failed");
                }
            }

            tokio::select! {
                _ = tokio::time::sleep(self.config.interval.sample()) => {}
                _ = self.stop.stopped() => break,
            }
        }

        if let Err(e) = self.producer.close().await {
            warn!(generator_id = %self.config.generator_id, error = %e, "Failed to close producer");
        }
        info!(generator_id = %self.config.generator_id, "Generator stopped");
        Ok(())
    }
}
