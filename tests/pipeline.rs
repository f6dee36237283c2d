//! End-to-end pipeline tests on the in-process queue, SQLite and the
//! in-memory cache.

use async_trait::async_trait;
use bytes::Bytes;
use std::sync::Arc;
use std::time::Duration;

use tally::{
    cache::{CacheKey, InvalidatingCache, MemoryCache},
    fault::{NoFaults, ScriptedFaults},
    metrics::{EventKind, InMemoryMetrics},
    queue::{AckMode, MemoryTransport, Transport},
    store::{AggregateStore, SqliteStore},
    types::{Message, Result, TallyError},
    worker::{
        CycleOutcome, Engine, EngineConfig, FixedQuantity, PauseRange, RandomQuantity,
        UnitKind, Worker, WorkerConfig, WorkerContext, WorkerState,
    },
    AggregateReader,
};

const WINDOW: Duration = Duration::from_secs(60);
const TTL: Duration = Duration::from_secs(60);

struct Pipeline {
    transport: MemoryTransport,
    store: Arc<SqliteStore>,
    cache: Arc<MemoryCache>,
    metrics: Arc<InMemoryMetrics>,
}

impl Pipeline {
    async fn new() -> Self {
        Self::with_store(SqliteStore::open_in_memory().unwrap()).await
    }

    async fn with_faults(faults: ScriptedFaults) -> Self {
        Self::with_store(SqliteStore::open_in_memory().unwrap().with_faults(Arc::new(faults))).await
    }

    async fn with_store(store: SqliteStore) -> Self {
        store.ensure_schema().await.unwrap();
        Self {
            transport: MemoryTransport::new(),
            store: Arc::new(store),
            cache: Arc::new(MemoryCache::with_defaults()),
            metrics: Arc::new(InMemoryMetrics::new()),
        }
    }

    fn context(&self) -> WorkerContext {
        self.context_with_cache(self.cache.clone())
    }

    fn context_with_cache(&self, cache: Arc<dyn InvalidatingCache>) -> WorkerContext {
        WorkerContext {
            store: self.store.clone(),
            cache,
            quantities: Arc::new(RandomQuantity { min: 2, max: 9 }),
            metrics: self.metrics.clone(),
        }
    }

    fn worker_config() -> WorkerConfig {
        WorkerConfig {
            worker_id: "worker-test".into(),
            receive_timeout: Duration::from_millis(20),
            pause: PauseRange::fixed(Duration::from_millis(10)),
            invalidate_global: false,
        }
    }

    async fn worker(&self, ack_mode: AckMode) -> Worker {
        Worker::connect(Self::worker_config(), &self.transport, ack_mode, self.context())
            .await
            .unwrap()
    }

    async fn publish(&self, message: Message) {
        let producer = self.transport.producer().await.unwrap();
        producer.publish(&message).await.unwrap();
    }

    /// Publish `payload` byte for byte, as a foreign producer would
    async fn publish_payload(&self, payload: &str) {
        let producer = self.transport.producer().await.unwrap();
        producer
            .publish_payload(Bytes::from(payload.to_string()))
            .await
            .unwrap();
    }

    fn reader(&self) -> AggregateReader {
        AggregateReader::new(self.store.clone(), self.cache.clone(), TTL)
    }
}

/// Cache whose every operation fails
struct UnreachableCache;

#[async_trait]
impl InvalidatingCache for UnreachableCache {
    async fn get(&self, _key: &str) -> Result<Option<i64>> {
        Err(TallyError::Cache("connection refused".into()))
    }

    async fn set(&self, _key: &str, _value: i64, _ttl: Duration) -> Result<()> {
        Err(TallyError::Cache("connection refused".into()))
    }

    async fn delete(&self, _key: &str) -> Result<()> {
        Err(TallyError::Cache("connection refused".into()))
    }
}

#[tokio::test]
async fn structured_message_is_recorded_and_invalidates_key() {
    let p = Pipeline::new().await;
    let reader = p.reader();

    // warm the cache with the pre-write value
    assert_eq!(reader.recent_quantity("apples").await.unwrap(), 0);
    let key = CacheKey::for_key("apples").to_storage_key();
    assert_eq!(p.cache.get(&key).await.unwrap(), Some(0));

    p.publish_payload(r#"{"key":"apples","quantity":3}"#).await;
    let mut worker = p.worker(AckMode::BeforeProcessing).await;
    assert!(matches!(worker.run_once().await.unwrap(), CycleOutcome::Recorded(_)));

    assert_eq!(p.store.sum_by_key("apples", WINDOW).await.unwrap(), 3);
    assert_eq!(p.cache.get(&key).await.unwrap(), None);
    assert_eq!(reader.recent_quantity("apples").await.unwrap(), 3);
}

#[tokio::test]
async fn sum_increases_by_exactly_the_quantity() {
    let p = Pipeline::new().await;
    let mut worker = p.worker(AckMode::BeforeProcessing).await;

    let mut expected = 0;
    for quantity in [1, 4, 7] {
        p.publish(Message::quantity("pears", quantity)).await;
        worker.run_once().await.unwrap();
        expected += quantity;
        assert_eq!(p.store.sum_by_key("pears", WINDOW).await.unwrap(), expected);
    }
}

#[tokio::test]
async fn legacy_fruit_field_is_accepted() {
    let p = Pipeline::new().await;
    p.publish_payload(r#"{"fruit":"grapes","quantity":5}"#).await;

    let mut worker = p.worker(AckMode::BeforeProcessing).await;
    worker.run_once().await.unwrap();

    assert_eq!(p.store.sum_by_key("grapes", WINDOW).await.unwrap(), 5);
}

#[tokio::test]
async fn store_timeout_drops_message_without_partial_write() {
    let p = Pipeline::with_faults(ScriptedFaults::new([true])).await;
    p.publish(Message::quantity("apples", 3)).await;

    let mut worker = p.worker(AckMode::BeforeProcessing).await;
    assert!(matches!(
        worker.run_once().await.unwrap(),
        CycleOutcome::Dropped(TallyError::StoreTimeout(_))
    ));

    assert_eq!(p.store.sum_by_key("apples", WINDOW).await.unwrap(), 0);
    // not redelivered
    assert!(matches!(worker.run_once().await.unwrap(), CycleOutcome::Empty));
    assert_eq!(p.transport.stats().pending, 0);
    assert_eq!(p.metrics.total(EventKind::MessageDropped), 1);
    assert_eq!(p.metrics.total(EventKind::StoreInsertFailed), 1);
}

#[tokio::test]
async fn after_processing_mode_redelivers_on_timeout() {
    let p = Pipeline::with_faults(ScriptedFaults::always_time_out(2)).await;
    p.publish(Message::quantity("apples", 3)).await;

    let mut worker = p.worker(AckMode::AfterProcessing).await;
    assert!(matches!(worker.run_once().await.unwrap(), CycleOutcome::Requeued(_)));
    assert!(matches!(worker.run_once().await.unwrap(), CycleOutcome::Requeued(_)));
    assert!(matches!(worker.run_once().await.unwrap(), CycleOutcome::Recorded(_)));

    assert_eq!(p.store.sum_by_key("apples", WINDOW).await.unwrap(), 3);
    assert_eq!(p.metrics.total(EventKind::MessageRequeued), 2);
}

#[tokio::test]
async fn sentinel_pauses_without_touching_store_or_cache() {
    let p = Pipeline::new().await;
    p.publish(Message::Hello).await;
    p.publish(Message::quantity("oranges", 2)).await;

    let mut worker = p.worker(AckMode::BeforeProcessing).await;
    assert!(matches!(worker.run_once().await.unwrap(), CycleOutcome::Paused(_)));
    assert_eq!(p.store.sum_all(WINDOW).await.unwrap(), 0);
    assert_eq!(p.cache.stats().deletes, 0);

    // resumes polling after the pause
    assert!(matches!(worker.run_once().await.unwrap(), CycleOutcome::Recorded(_)));
    assert_eq!(p.store.sum_by_key("oranges", WINDOW).await.unwrap(), 2);
}

#[tokio::test]
async fn bare_sentinel_payloads_pause() {
    let p = Pipeline::new().await;
    p.publish_payload("hello").await;
    p.publish_payload("hello\n").await;

    let mut worker = p.worker(AckMode::BeforeProcessing).await;
    assert!(matches!(worker.run_once().await.unwrap(), CycleOutcome::Paused(_)));
    assert!(matches!(worker.run_once().await.unwrap(), CycleOutcome::Paused(_)));

    assert_eq!(p.store.sum_all(WINDOW).await.unwrap(), 0);
    assert_eq!(p.metrics.total(EventKind::SentinelPause), 2);
    assert_eq!(p.transport.stats().pending, 0);
}

#[tokio::test]
async fn unstructured_payload_gets_generated_quantity() {
    let p = Pipeline::new().await;
    p.publish_payload("bananas").await;

    let mut worker = p.worker(AckMode::BeforeProcessing).await;
    let event = match worker.run_once().await.unwrap() {
        CycleOutcome::Recorded(event) => event,
        other => panic!("unexpected outcome {:?}", other),
    };

    assert_eq!(event.key, "bananas");
    assert!((2..=9).contains(&event.quantity));
    assert_eq!(
        p.store.sum_by_key("bananas", WINDOW).await.unwrap(),
        event.quantity
    );
}

#[tokio::test]
async fn cache_failure_is_not_fatal() {
    let p = Pipeline::new().await;
    p.publish(Message::quantity("apples", 3)).await;

    let ctx = p.context_with_cache(Arc::new(UnreachableCache));
    let mut worker = Worker::connect(Pipeline::worker_config(), &p.transport, AckMode::BeforeProcessing, ctx)
        .await
        .unwrap();

    assert!(matches!(worker.run_once().await.unwrap(), CycleOutcome::Recorded(_)));
    assert_eq!(p.store.sum_by_key("apples", WINDOW).await.unwrap(), 3);
    assert_eq!(p.metrics.total(EventKind::CacheDeleteFailed), 1);

    let reader = AggregateReader::new(p.store.clone(), Arc::new(UnreachableCache), TTL);
    assert_eq!(reader.recent_quantity("apples").await.unwrap(), 3);
}

#[tokio::test]
async fn transport_loss_crashes_worker() {
    let p = Pipeline::new().await;
    let worker = p.worker(AckMode::BeforeProcessing).await;
    let state = worker.state();

    let handle = tokio::spawn(worker.run());
    tokio::time::sleep(Duration::from_millis(30)).await;
    p.transport.close();

    let result = tokio::time::timeout(Duration::from_secs(2), handle)
        .await
        .expect("worker should exit")
        .unwrap();

    assert!(matches!(result, Err(TallyError::Transport(_))));
    assert_eq!(*state.borrow(), WorkerState::Crashed);
}

#[tokio::test]
async fn global_entry_stays_stale_by_default() {
    let p = Pipeline::new().await;
    let reader = p.reader();
    assert_eq!(reader.all_quantity().await.unwrap(), 0);

    p.publish(Message::quantity("apples", 3)).await;
    let mut worker = p.worker(AckMode::BeforeProcessing).await;
    worker.run_once().await.unwrap();

    assert_eq!(reader.all_quantity().await.unwrap(), 0);
    assert_eq!(p.store.sum_all(WINDOW).await.unwrap(), 3);
}

#[tokio::test]
async fn global_entry_invalidated_when_enabled() {
    let p = Pipeline::new().await;
    let reader = p.reader();
    assert_eq!(reader.all_quantity().await.unwrap(), 0);

    p.publish(Message::quantity("apples", 3)).await;
    let config = WorkerConfig {
        invalidate_global: true,
        ..Pipeline::worker_config()
    };
    let mut worker = Worker::connect(config, &p.transport, AckMode::BeforeProcessing, p.context())
        .await
        .unwrap();
    worker.run_once().await.unwrap();

    assert_eq!(reader.all_quantity().await.unwrap(), 3);
}

#[tokio::test]
async fn cache_delete_is_idempotent_and_ttl_expires() {
    let cache = MemoryCache::with_defaults();
    let key = CacheKey::for_key("apples").to_storage_key();

    assert_eq!(cache.get(&key).await.unwrap(), None);
    cache.set(&key, 7, TTL).await.unwrap();
    cache.delete(&key).await.unwrap();
    cache.delete(&key).await.unwrap();
    assert_eq!(cache.get(&key).await.unwrap(), None);

    cache.set(&key, 7, Duration::from_millis(20)).await.unwrap();
    assert_eq!(cache.get(&key).await.unwrap(), Some(7));
    tokio::time::sleep(Duration::from_millis(40)).await;
    assert_eq!(cache.get(&key).await.unwrap(), None);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn engine_stop_mid_drain_processes_each_message_at_most_once() {
    let store = SqliteStore::open_in_memory()
        .unwrap()
        .with_faults(Arc::new(ScriptedFaults::default().with_latency(Duration::from_millis(10))));
    let p = Pipeline::with_store(store).await;

    for i in 0..100 {
        p.publish(Message::quantity(format!("key-{}", i), 1)).await;
    }

    let config = EngineConfig {
        worker_count: 5,
        generator_count: 0,
        worker: Pipeline::worker_config(),
        ..Default::default()
    };
    let engine = Engine::new(config, Arc::new(p.transport.clone()), p.context());
    let running = engine.start().await.unwrap();

    tokio::time::sleep(Duration::from_millis(40)).await;
    let report = running.stop().await;

    assert_eq!(report.units.len(), 5);
    assert!(report.units.iter().all(|u| u.kind == UnitKind::Worker));
    assert!(report.all_stopped());

    let processed = p.store.sum_all(WINDOW).await.unwrap();
    for i in 0..100 {
        let sum = p.store.sum_by_key(&format!("key-{}", i), WINDOW).await.unwrap();
        assert!(sum <= 1, "key-{} processed {} times", i, sum);
    }

    // every message was either persisted or is still queued
    let pending = p.transport.stats().pending as i64;
    assert!(processed > 0, "stopped before any work was done");
    assert!(pending > 0, "queue drained before the stop landed");
    assert_eq!(processed + pending, 100);
}

#[tokio::test]
async fn engine_runs_until_shutdown_signal() {
    let p = Pipeline::with_store(SqliteStore::open_in_memory().unwrap().with_faults(Arc::new(NoFaults))).await;
    let config = EngineConfig {
        worker_count: 2,
        generator_count: 1,
        worker: Pipeline::worker_config(),
        generator_interval: PauseRange::fixed(Duration::from_millis(5)),
        ..Default::default()
    };
    let ctx = WorkerContext {
        quantities: Arc::new(FixedQuantity(1)),
        ..p.context()
    };
    let engine = Engine::new(config, Arc::new(p.transport.clone()), ctx);

    let report = engine
        .run_until(tokio::time::sleep(Duration::from_millis(100)))
        .await
        .unwrap();

    assert!(report.all_stopped());
    assert_eq!(report.units.len(), 3);
    assert!(p.metrics.total(EventKind::GeneratorPublish) >= 1);
    assert!(p.store.sum_all(WINDOW).await.unwrap() >= 1);
}
