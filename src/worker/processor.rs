//! Worker - queue consumer that persists quantity events
//!
//! Each cycle walks `Idle → Receiving → Interpreting → Persisting →
//! Invalidating → Idle`. A stop request is only honoured back at `Idle`.
//!
//! Failure handling:
//! - an empty receive just loops
//! - store failures (including simulated timeouts) are logged and the message
//!   is dropped; with ack-before-processing it has already been acknowledged
//!   and is gone for good
//! - cache failures are logged; the entry will expire on its own
//! - a transport failure ends the loop and `run` returns the error

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use super::{PauseRange, StopHandle, WorkerContext};
use crate::cache::CacheKey;
use crate::metrics::{EventKind, LatencyKind};
use crate::queue::{AckMode, Consumer, Delivery, Producer, Transport};
use crate::types::{Interpretation, NewEvent, QuantityEvent, Result, TallyError};

/// Worker configuration
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    /// Unique worker ID
    pub worker_id: String,
    /// Bounded wait for each receive
    pub receive_timeout: Duration,
    /// Pause taken on the sentinel message
    pub pause: PauseRange,
    /// Also invalidate the global aggregate on every write
    pub invalidate_global: bool,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            worker_id: uuid::Uuid::new_v4().to_string(),
            receive_timeout: Duration::from_secs(1),
            pause: PauseRange::default(),
            invalidate_global: false,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerState {
    Idle,
    Receiving,
    Interpreting,
    Persisting,
    Invalidating,
    Stopped,
    Crashed,
}

/// Result of one pass through the loop
#[derive(Debug)]
pub enum CycleOutcome {
    /// Nothing arrived within the receive timeout
    Empty,
    /// Sentinel handled by pausing
    Paused(Duration),
    /// Event persisted and cache invalidated (or invalidation logged)
    Recorded(QuantityEvent),
    /// Processing failed after the message was acknowledged; it is lost
    Dropped(TallyError),
    /// Processing failed and the message went back to the queue
    Requeued(TallyError),
}

pub struct Worker {
    config: WorkerConfig,
    consumer: Consumer,
    producer: Box<dyn Producer>,
    ctx: WorkerContext,
    stop: StopHandle,
    state: watch::Sender<WorkerState>,
}

impl Worker {
    pub fn new(
        config: WorkerConfig,
        consumer: Consumer,
        producer: Box<dyn Producer>,
        ctx: WorkerContext,
    ) -> Self {
        let (state, _) = watch::channel(WorkerState::Idle);
        Self {
            config,
            consumer,
            producer,
            ctx,
            stop: StopHandle::new(),
            state,
        }
    }

    /// Create a worker with its own consumer and producer handles
    pub async fn connect(
        config: WorkerConfig,
        transport: &dyn Transport,
        ack_mode: AckMode,
        ctx: WorkerContext,
    ) -> Result<Self> {
        let consumer = transport.consumer(ack_mode).await?;
        let producer = transport.producer().await?;
        let worker = Self::new(config, consumer, producer, ctx);
        info!(worker_id = %worker.config.worker_id, ack_mode = ?worker.consumer.ack_mode(), "Worker created");
        Ok(worker)
    }

    pub fn id(&self) -> &str {
        &self.config.worker_id
    }

    pub fn stop_handle(&self) -> StopHandle {
        self.stop.clone()
    }

    /// Watch the worker's state machine
    pub fn state(&self) -> watch::Receiver<WorkerState> {
        self.state.subscribe()
    }

    fn set_state(&self, state: WorkerState) {
        self.state.send_replace(state);
    }

    /// Run until stopped. Returns `Err` if the worker crashed on a transport failure.
    pub async fn run(mut self) -> Result<()> {
        info!(worker_id = %self.config.worker_id, "Worker running");

        while !self.stop.is_stopped() {
            self.ctx
                .metrics
                .record_event(EventKind::WorkerCycle, &[("worker_id", self.id())]);

            match self.run_once().await {
                Ok(CycleOutcome::Empty) => {}
                Ok(outcome) => debug!(worker_id = %self.config.worker_id, ?outcome, "Cycle complete"),
                Err(e) => {
                    error!(worker_id = %self.config.worker_id, error = %e, "Worker crashed");
                    self.release().await;
                    self.set_state(WorkerState::Crashed);
                    return Err(e);
                }
            }
        }

        self.release().await;
        self.set_state(WorkerState::Stopped);
        info!(worker_id = %self.config.worker_id, "Worker stopped");
        Ok(())
    }

    /// One receive/process cycle. `Err` only for failures fatal to the worker.
    pub async fn run_once(&mut self) -> Result<CycleOutcome> {
        self.set_state(WorkerState::Receiving);

        let started = Instant::now();
        let received = self.consumer.receive_one(self.config.receive_timeout).await;
        self.ctx
            .metrics
            .record_latency(LatencyKind::QueueRead, started.elapsed());
        let delivery = match received {
            Ok(Some(delivery)) => delivery,
            Ok(None) => {
                self.set_state(WorkerState::Idle);
                return Ok(CycleOutcome::Empty);
            }
            Err(e) if e.is_fatal_to_worker() => return Err(e),
            Err(e) => {
                warn!(worker_id = %self.config.worker_id, error = %e, "Receive failed");
                self.set_state(WorkerState::Idle);
                return Ok(CycleOutcome::Empty);
            }
        };

        let metrics = Arc::clone(&self.ctx.metrics);
        metrics.record_event(EventKind::Job, &[]);
        metrics.record_event(EventKind::WorkerBusy, &[]);

        let outcome = self.process(delivery).await;

        metrics.record_event(EventKind::WorkerIdle, &[]);
        self.set_state(WorkerState::Idle);
        outcome
    }

    async fn process(&mut self, mut delivery: Delivery) -> Result<CycleOutcome> {
        self.set_state(WorkerState::Interpreting);

        let message = delivery.message();
        debug!(
            worker_id = %self.config.worker_id,
            shape = message.shape(),
            bytes = delivery.payload().len(),
            "Worker working with message {:?}",
            message
        );

        let quantities = Arc::clone(&self.ctx.quantities);
        match message.interpret(|| quantities.next_quantity()) {
            Interpretation::Pause => {
                let pause = self.config.pause.sample();
                self.ctx.metrics.record_event(EventKind::SentinelPause, &[]);
                tokio::time::sleep(pause).await;
                delivery.ack().await?;
                Ok(CycleOutcome::Paused(pause))
            }
            Interpretation::Record { key, quantity } => {
                self.set_state(WorkerState::Persisting);

                let started = Instant::now();
                let recorded = self.ctx.store.record(NewEvent::now(key, quantity)).await;
                self.ctx
                    .metrics
                    .record_latency(LatencyKind::StoreInsert, started.elapsed());

                match recorded {
                    Ok(event) => {
                        self.ctx.metrics.record_event(EventKind::StoreInsert, &[]);
                        self.set_state(WorkerState::Invalidating);
                        self.invalidate(&event.key).await;
                        delivery.ack().await?;
                        Ok(CycleOutcome::Recorded(event))
                    }
                    Err(e) => {
                        self.ctx
                            .metrics
                            .record_event(EventKind::StoreInsertFailed, &[("error", e.kind())]);
                        self.abandon(delivery, e).await
                    }
                }
            }
        }
    }

    /// Settle a delivery whose processing failed
    async fn abandon(&self, mut delivery: Delivery, err: TallyError) -> Result<CycleOutcome> {
        if delivery.is_settled() {
            error!(
                worker_id = %self.config.worker_id,
                error = %err,
                "Dropping acknowledged message"
            );
            self.ctx.metrics.record_event(EventKind::MessageDropped, &[("error", err.kind())]);
            return Ok(CycleOutcome::Dropped(err));
        }

        delivery.nak().await?;
        warn!(
            worker_id = %self.config.worker_id,
            error = %err,
            "Processing failed, message requeued"
        );
        self.ctx.metrics.record_event(EventKind::MessageRequeued, &[("error", err.kind())]);
        Ok(CycleOutcome::Requeued(err))
    }

    /// Delete cached aggregates the write may have changed. Failures are logged only.
    async fn invalidate(&self, key: &str) {
        let mut keys = vec![CacheKey::for_key(key)];
        if self.config.invalidate_global {
            keys.push(CacheKey::all());
        }

        for cache_key in keys {
            let storage_key = cache_key.to_storage_key();
            let started = Instant::now();
            let deleted = self.ctx.cache.delete(&storage_key).await;
            self.ctx
                .metrics
                .record_latency(LatencyKind::CacheDelete, started.elapsed());

            match deleted {
                Ok(()) => self.ctx.metrics.record_event(EventKind::CacheDelete, &[]),
                Err(e) => {
                    warn!(
                        worker_id = %self.config.worker_id,
                        key = %storage_key,
                        error = %e,
                        "Cache invalidation failed"
                    );
                    self.ctx.metrics.record_event(EventKind::CacheDeleteFailed, &[]);
                }
            }
        }
    }

    /// Release queue handles
    async fn release(&mut self) {
        if let Err(e) = self.consumer.close().await {
            warn!(worker_id = %self.config.worker_id, error = %e, "Failed to close consumer");
        }
        if let Err(e) = self.producer.close().await {
            warn!(worker_id = %self.config.worker_id, error = %e, "Failed to close producer");
        }
    }
}
