//! In-process queue
//!
//! Behaves like the broker from a worker's point of view: FIFO, one message
//! per fetch, explicit ack/nak, and an unsettled delivery that is dropped goes
//! back to the head of the queue. [`MemoryTransport::close`] simulates the
//! connection going away.

use async_trait::async_trait;
use bytes::Bytes;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::Notify;
use tokio::time::Instant;
use tracing::debug;

use super::{Acker, Delivery, MessageSource, Producer, Transport};
use crate::fault::{FaultPolicy, NoFaults};
use crate::types::{Result, TallyError};

#[derive(Debug)]
struct Envelope {
    payload: Bytes,
    deliveries: u32,
}

struct Shared {
    queue: Mutex<VecDeque<Envelope>>,
    faults: Arc<dyn FaultPolicy>,
    notify: Notify,
    closed: AtomicBool,
    published: AtomicU64,
    delivered: AtomicU64,
    acked: AtomicU64,
    requeued: AtomicU64,
}

impl Shared {
    fn new(faults: Arc<dyn FaultPolicy>) -> Self {
        Self {
            queue: Mutex::new(VecDeque::new()),
            faults,
            notify: Notify::new(),
            closed: AtomicBool::new(false),
            published: AtomicU64::new(0),
            delivered: AtomicU64::new(0),
            acked: AtomicU64::new(0),
            requeued: AtomicU64::new(0),
        }
    }

    async fn simulate_latency(&self) {
        let latency = self.faults.latency();
        if !latency.is_zero() {
            tokio::time::sleep(latency).await;
        }
    }

    fn check_open(&self) -> Result<()> {
        if self.closed.load(Ordering::SeqCst) {
            Err(TallyError::Transport("Queue connection closed".into()))
        } else {
            Ok(())
        }
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, VecDeque<Envelope>>> {
        self.queue
            .lock()
            .map_err(|e| TallyError::Internal(format!("Lock poisoned: {}", e)))
    }

    fn push_back(&self, envelope: Envelope) -> Result<()> {
        self.lock()?.push_back(envelope);
        self.notify.notify_one();
        Ok(())
    }

    fn requeue(&self, mut envelope: Envelope) {
        envelope.deliveries += 1;
        if let Ok(mut queue) = self.queue.lock() {
            queue.push_front(envelope);
            self.requeued.fetch_add(1, Ordering::Relaxed);
            self.notify.notify_one();
        }
    }
}

/// Counters for the in-process queue
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct QueueStats {
    pub published: u64,
    pub delivered: u64,
    pub acked: u64,
    pub requeued: u64,
    pub pending: usize,
}

#[derive(Clone)]
pub struct MemoryTransport {
    shared: Arc<Shared>,
}

impl Default for MemoryTransport {
    fn default() -> Self {
        Self::with_faults(Arc::new(NoFaults))
    }
}

impl MemoryTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Transport whose publishes and fetches go through `faults`: each gets the
    /// policy's latency, and a publish fails when the policy says it timed out
    pub fn with_faults(faults: Arc<dyn FaultPolicy>) -> Self {
        Self {
            shared: Arc::new(Shared::new(faults)),
        }
    }

    /// Simulate losing the connection: every later fetch, ack and publish fails
    pub fn close(&self) {
        self.shared.closed.store(true, Ordering::SeqCst);
        self.shared.notify.notify_waiters();
    }

    pub fn stats(&self) -> QueueStats {
        let pending = self.shared.queue.lock().map(|q| q.len()).unwrap_or(0);
        QueueStats {
            published: self.shared.published.load(Ordering::Relaxed),
            delivered: self.shared.delivered.load(Ordering::Relaxed),
            acked: self.shared.acked.load(Ordering::Relaxed),
            requeued: self.shared.requeued.load(Ordering::Relaxed),
            pending,
        }
    }
}

#[async_trait]
impl Transport for MemoryTransport {
    async fn source(&self) -> Result<Box<dyn MessageSource>> {
        self.shared.check_open()?;
        Ok(Box::new(MemorySource {
            shared: Arc::clone(&self.shared),
        }))
    }

    async fn producer(&self) -> Result<Box<dyn Producer>> {
        self.shared.check_open()?;
        Ok(Box::new(MemoryProducer {
            shared: Arc::clone(&self.shared),
        }))
    }
}

struct MemorySource {
    shared: Arc<Shared>,
}

#[async_trait]
impl MessageSource for MemorySource {
    async fn fetch_one(&mut self, timeout: Duration) -> Result<Option<Delivery>> {
        let deadline = Instant::now() + timeout;
        self.shared.simulate_latency().await;

        loop {
            self.shared.check_open()?;

            let next = self.shared.lock()?.pop_front();
            if let Some(envelope) = next {
                self.shared.delivered.fetch_add(1, Ordering::Relaxed);
                debug!(deliveries = envelope.deliveries + 1, "Delivering message");
                let payload = envelope.payload.clone();
                let acker = MemoryAcker {
                    shared: Arc::clone(&self.shared),
                    envelope: Some(envelope),
                };
                return Ok(Some(Delivery::new(payload, Box::new(acker))));
            }

            if tokio::time::timeout_at(deadline, self.shared.notify.notified())
                .await
                .is_err()
            {
                return Ok(None);
            }
        }
    }
}

struct MemoryAcker {
    shared: Arc<Shared>,
    envelope: Option<Envelope>,
}

#[async_trait]
impl Acker for MemoryAcker {
    async fn ack(mut self: Box<Self>) -> Result<()> {
        self.shared.check_open()?;
        self.envelope.take();
        self.shared.acked.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    async fn nak(mut self: Box<Self>) -> Result<()> {
        self.shared.check_open()?;
        if let Some(envelope) = self.envelope.take() {
            self.shared.requeue(envelope);
        }
        Ok(())
    }
}

impl Drop for MemoryAcker {
    fn drop(&mut self) {
        if let Some(envelope) = self.envelope.take() {
            self.shared.requeue(envelope);
        }
    }
}

struct MemoryProducer {
    shared: Arc<Shared>,
}

#[async_trait]
impl Producer for MemoryProducer {
    async fn publish_payload(&self, payload: Bytes) -> Result<()> {
        self.shared.simulate_latency().await;
        self.shared.check_open()?;
        if self.shared.faults.should_time_out() {
            return Err(TallyError::Transport("Publish timed out".into()));
        }
        self.shared.push_back(Envelope {
            payload,
            deliveries: 0,
        })?;
        self.shared.published.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }
}
