//! Worker pool
//!
//! - [`processor::Worker`]: consume → interpret → persist → invalidate
//! - [`generator::Generator`]: synthetic producer-only load
//! - [`pool::Engine`]: owns a fixed set of both, starts them together and
//!   drains them on shutdown
//!
//! Stopping is cooperative: each unit checks its [`StopHandle`] once per loop
//! iteration and always finishes the message it is holding.

pub mod generator;
pub mod pool;
pub mod processor;

use rand::Rng;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;

use crate::cache::InvalidatingCache;
use crate::metrics::MetricsSink;
use crate::store::AggregateStore;

pub use generator::{Generator, GeneratorConfig, POSSIBLE_KEYS};
pub use pool::{Engine, EngineConfig, EngineReport, RunningEngine, UnitExit, UnitKind};
pub use processor::{CycleOutcome, Worker, WorkerConfig, WorkerState};

/// Cooperative stop flag
#[derive(Clone, Default)]
pub struct StopHandle {
    inner: Arc<StopInner>,
}

#[derive(Default)]
struct StopInner {
    stopped: AtomicBool,
    notify: Notify,
}

impl StopHandle {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn stop(&self) {
        self.inner.stopped.store(true, Ordering::SeqCst);
        self.inner.notify.notify_waiters();
    }

    pub fn is_stopped(&self) -> bool {
        self.inner.stopped.load(Ordering::SeqCst)
    }

    /// Resolves once [`stop`](Self::stop) has been called
    pub async fn stopped(&self) {
        let notified = self.inner.notify.notified();
        tokio::pin!(notified);
        notified.as_mut().enable();
        if self.is_stopped() {
            return;
        }
        notified.await;
    }
}

/// Source of default quantities for messages that carry none
pub trait QuantitySource: Send + Sync {
    fn next_quantity(&self) -> i64;
}

/// Uniform quantity in `[min, max]`
#[derive(Debug, Clone, Copy)]
pub struct RandomQuantity {
    pub min: i64,
    pub max: i64,
}

impl Default for RandomQuantity {
    fn default() -> Self {
        Self { min: 1, max: 10 }
    }
}

impl QuantitySource for RandomQuantity {
    fn next_quantity(&self) -> i64 {
        if self.max <= self.min {
            return self.min;
        }
        rand::thread_rng().gen_range(self.min..=self.max)
    }
}

/// Always the same quantity
#[derive(Debug, Clone, Copy)]
pub struct FixedQuantity(pub i64);

impl QuantitySource for FixedQuantity {
    fn next_quantity(&self) -> i64 {
        self.0
    }
}

/// Randomized duration in `[min, max]`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PauseRange {
    pub min: Duration,
    pub max: Duration,
}

impl PauseRange {
    pub fn new(min: Duration, max: Duration) -> Self {
        Self { min, max }
    }

    pub fn fixed(pause: Duration) -> Self {
        Self::new(pause, pause)
    }

    pub fn sample(&self) -> Duration {
        if self.max <= self.min {
            return self.min;
        }
        rand::thread_rng().gen_range(self.min..=self.max)
    }
}

impl Default for PauseRange {
    fn default() -> Self {
        Self::new(Duration::from_millis(100), Duration::from_millis(2000))
    }
}

/// Resources every worker shares
#[derive(Clone)]
pub struct WorkerContext {
    pub store: Arc<dyn AggregateStore>,
    pub cache: Arc<dyn InvalidatingCache>,
    pub quantities: Arc<dyn QuantitySource>,
    pub metrics: Arc<dyn MetricsSink>,
}
