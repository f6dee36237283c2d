//! Engine - a fixed pool of workers and generators
//!
//! All units are built before any is started, so a failure to create one
//! leaves nothing running. Shutdown signals every unit, then waits for each
//! to finish the message it holds.

use std::future::Future;
use std::sync::Arc;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{error, info};

use super::{
    Generator, GeneratorConfig, PauseRange, StopHandle, Worker, WorkerConfig, WorkerContext,
    WorkerState,
};
use crate::queue::{AckMode, Transport};
use crate::types::{Result, TallyError};

/// Configuration for the engine
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Number of consuming workers
    pub worker_count: usize,
    /// Number of synthetic producers
    pub generator_count: usize,
    pub ack_mode: AckMode,
    /// Template for every worker; `worker_id` is replaced per worker
    pub worker: WorkerConfig,
    pub generator_interval: PauseRange,
    pub generator_keys: Vec<String>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            worker_count: 20,
            generator_count: 1,
            ack_mode: AckMode::default(),
            worker: WorkerConfig::default(),
            generator_interval: PauseRange::default(),
            generator_keys: GeneratorConfig::default().keys,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnitKind {
    Worker,
    Generator,
}

/// How a unit's task ended
#[derive(Debug)]
pub enum UnitExit {
    Stopped,
    Crashed(TallyError),
}

#[derive(Debug)]
pub struct UnitReport {
    pub name: String,
    pub kind: UnitKind,
    pub exit: UnitExit,
}

#[derive(Debug, Default)]
pub struct EngineReport {
    pub units: Vec<UnitReport>,
}

impl EngineReport {
    pub fn all_stopped(&self) -> bool {
        self.units.iter().all(|u| matches!(u.exit, UnitExit::Stopped))
    }

    pub fn crashed(&self) -> impl Iterator<Item = &UnitReport> {
        self.units.iter().filter(|u| matches!(u.exit, UnitExit::Crashed(_)))
    }
}

enum Unit {
    Worker(Worker),
    Generator(Generator),
}

impl Unit {
    fn name(&self) -> String {
        match self {
            Self::Worker(w) => w.id().to_string(),
            Self::Generator(g) => g.id().to_string(),
        }
    }

    fn kind(&self) -> UnitKind {
        match self {
            Self::Worker(_) => UnitKind::Worker,
            Self::Generator(_) => UnitKind::Generator,
        }
    }

    fn stop_handle(&self) -> StopHandle {
        match self {
            Self::Worker(w) => w.stop_handle(),
            Self::Generator(g) => g.stop_handle(),
        }
    }

    fn spawn(self) -> JoinHandle<Result<()>> {
        match self {
            Self::Worker(w) => tokio::spawn(w.run()),
            Self::Generator(g) => tokio::spawn(g.run()),
        }
    }
}

struct UnitHandle {
    name: String,
    kind: UnitKind,
    stop: StopHandle,
    task: JoinHandle<Result<()>>,
}

pub struct Engine {
    config: EngineConfig,
    transport: Arc<dyn Transport>,
    ctx: WorkerContext,
}

impl Engine {
    pub fn new(config: EngineConfig, transport: Arc<dyn Transport>, ctx: WorkerContext) -> Self {
        Self {
            config,
            transport,
            ctx,
        }
    }

    /// Create every unit, then spawn them all
    pub async fn start(self) -> Result<RunningEngine> {
        self.ctx.store.ensure_schema().await?;

        info!(
            "Starting engine with {} workers and {} generators ({:?})",
            self.config.worker_count, self.config.generator_count, self.config.ack_mode
        );

        let mut units = Vec::with_capacity(self.config.worker_count + self.config.generator_count);
        let mut states = Vec::with_capacity(self.config.worker_count);

        for i in 0..self.config.worker_count {
            let config = WorkerConfig {
                worker_id: format!("worker-{}", i),
                ..self.config.worker.clone()
            };
            let worker = Worker::connect(
                config,
                self.transport.as_ref(),
                self.config.ack_mode,
                self.ctx.clone(),
            )
            .await?;
            states.push((worker.id().to_string(), worker.state()));
            units.push(Unit::Worker(worker));
        }

        for i in 0..self.config.generator_count {
            let config = GeneratorConfig {
                generator_id: format!("generator-{}", i),
                interval: self.config.generator_interval,
                keys: self.config.generator_keys.clone(),
            };
            let generator = Generator::connect(
                config,
                self.transport.as_ref(),
                Arc::clone(&self.ctx.quantities),
                Arc::clone(&self.ctx.metrics),
            )
            .await?;
            units.push(Unit::Generator(generator));
        }

        let handles = units
            .into_iter()
            .map(|unit| UnitHandle {
                name: unit.name(),
                kind: unit.kind(),
                stop: unit.stop_handle(),
                task: unit.spawn(),
            })
            .collect::<Vec<_>>();

        info!("Engine started with {} units", handles.len());
        Ok(RunningEngine { handles, states })
    }

    /// Start, run until `shutdown` resolves, then stop
    pub async fn run_until<F>(self, shutdown: F) -> Result<EngineReport>
    where
        F: Future<Output = ()>,
    {
        let running = self.start().await?;
        shutdown.await;
        info!("Shutdown requested, draining engine");
        Ok(running.stop().await)
    }
}

pub struct RunningEngine {
    handles: Vec<UnitHandle>,
    states: Vec<(String, watch::Receiver<WorkerState>)>,
}

impl RunningEngine {
    pub fn unit_count(&self) -> usize {
        self.handles.len()
    }

    /// Current state of every worker
    pub fn worker_states(&self) -> Vec<(String, WorkerState)> {
        self.states
            .iter()
            .map(|(name, rx)| (name.clone(), *rx.borrow()))
            .collect()
    }

    /// Signal every unit, then wait for each to finish
    pub async fn stop(self) -> EngineReport {
        for handle in &self.handles {
            handle.stop.stop();
        }

        let mut report = EngineReport::default();
        for handle in self.handles {
            let exit = match handle.task.await {
                Ok(Ok(())) => UnitExit::Stopped,
                Ok(Err(e)) => UnitExit::Crashed(e),
                Err(e) => {
                    error!("Unit {} panicked: {}", handle.name, e);
                    UnitExit::Crashed(TallyError::from(e))
                }
            };
            report.units.push(UnitReport {
                name: handle.name,
                kind: handle.kind,
                exit,
            });
        }

        info!(
            "Engine stopped ({} units, {} crashed)",
            report.units.len(),
            report.crashed().count()
        );
        report
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::MemoryCache;
    use crate::metrics::NoopMetrics;
    use crate::queue::MemoryTransport;
    use crate::store::SqliteStore;
    use crate::worker::FixedQuantity;
    use std::time::Duration;

    fn context() -> WorkerContext {
        WorkerContext {
            store: Arc::new(SqliteStore::open_in_memory().unwrap()),
            cache: Arc::new(MemoryCache::with_defaults()),
            quantities: Arc::new(FixedQuantity(1)),
            metrics: Arc::new(NoopMetrics),
        }
    }

    #[test]
    fn test_default_config() {
        let config = EngineConfig::default();
        assert_eq!(config.worker_count, 20);
        assert_eq!(config.generator_count, 1);
        assert_eq!(config.ack_mode, AckMode::BeforeProcessing);
    }

    #[tokio::test]
    async fn test_start_and_stop() {
        let config = EngineConfig {
            worker_count: 3,
            generator_count: 1,
            worker: WorkerConfig {
                receive_timeout: Duration::from_millis(10),
                ..Default::default()
            },
            generator_interval: PauseRange::fixed(Duration::from_millis(5)),
            ..Default::default()
        };
        let engine = Engine::new(config, Arc::new(MemoryTransport::new()), context());

        let running = engine.start().await.unwrap();
        assert_eq!(running.unit_count(), 4);
        assert_eq!(running.worker_states().len(), 3);

        tokio::time::sleep(Duration::from_millis(30)).await;
        let report = running.stop().await;

        assert!(report.all_stopped());
        assert_eq!(report.units.len(), 4);
        assert_eq!(
            report.units.iter().filter(|u| u.kind == UnitKind::Generator).count(),
            1
        );
    }

    #[tokio::test]
    async fn test_start_fails_without_transport() {
        let transport = MemoryTransport::new();
        transport.close();
        let engine = Engine::new(EngineConfig::default(), Arc::new(transport), context());
        assert!(matches!(engine.start().await, Err(TallyError::Transport(_))));
    }

    #[tokio::test]
    async fn test_crashed_worker_reported() {
        let transport = MemoryTransport::new();
        let config = EngineConfig {
            worker_count: 2,
            generator_count: 0,
            worker: WorkerConfig {
                receive_timeout: Duration::from_millis(10),
                ..Default::default()
            },
            ..Default::default()
        };
        let engine = Engine::new(config, Arc::new(transport.clone()), context());
        let running = engine.start().await.unwrap();

        transport.close();
        tokio::time::sleep(Duration::from_millis(50)).await;
        let report = running.stop().await;

        assert_eq!(report.crashed().count(), 2);
    }
}
