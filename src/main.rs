//! Tally - queue-backed write pipeline
//!
//! Runs the worker pool (and optional load generators) until Ctrl-C, then
//! drains every unit and prints a summary.

use clap::Parser;
use std::sync::Arc;
use tracing::{error, info, warn};

use tally::{
    cache::{spawn_cleanup_task, InvalidatingCache, MemoryCache, RedisCache},
    config::{Args, TransportKind},
    logging,
    metrics::InMemoryMetrics,
    queue::{JetStreamTransport, MemoryTransport, Transport},
    store::SqliteStore,
    worker::{Engine, UnitExit, WorkerContext},
    AggregateReader,
};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load environment variables from .env file if present
    let _ = dotenvy::dotenv();

    let args = Args::parse();

    logging::init(&args.log_level, args.log_json)?;

    if let Err(e) = args.validate() {
        error!("Configuration error: {}", e);
        std::process::exit(1);
    }

    info!("======================================");
    info!("  Tally - queue-backed write pipeline");
    info!("======================================");
    info!("Transport: {:?} (queue {})", args.transport, args.queue_name);
    if args.transport == TransportKind::Nats {
        info!("NATS: {}", args.nats.nats_url);
    }
    info!("Database: {}", args.database_path);
    info!("Cache: {}", args.redis_url.as_deref().unwrap_or("in-memory"));
    info!("Workers: {} (ack {:?})", args.worker_count, args.ack_mode);
    info!("Generators: {}", args.generator_count);
    info!("Invalidate global: {}", args.invalidate_global);
    info!("======================================");

    let transport: Arc<dyn Transport> = match args.transport {
        TransportKind::Nats => Arc::new(
            JetStreamTransport::connect(&args.nats, &args.queue_name, "tally").await?,
        ),
        TransportKind::Memory => {
            if args.generator_count == 0 {
                warn!("In-memory queue with no generators: nothing will be published");
            }
            Arc::new(MemoryTransport::new())
        }
    };

    let store = Arc::new(
        SqliteStore::open_path(&args.database_path)?.with_faults(Arc::new(args.faults())),
    );

    let cache_config = args.cache_config();
    let cache: Arc<dyn InvalidatingCache> = match &args.redis_url {
        Some(url) => Arc::new(RedisCache::connect(url).await?),
        None => {
            let cache = Arc::new(MemoryCache::new(cache_config.clone()));
            spawn_cleanup_task(Arc::clone(&cache));
            cache
        }
    };

    let metrics = Arc::new(InMemoryMetrics::new());
    let ctx = WorkerContext {
        store: store.clone(),
        cache: cache.clone(),
        quantities: Arc::new(args.quantity_range()),
        metrics: metrics.clone(),
    };

    let engine = Engine::new(args.engine_config(), transport, ctx);
    let report = engine
        .run_until(async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                error!("Failed to listen for shutdown signal: {}", e);
            }
            info!("Received shutdown signal");
        })
        .await?;

    for unit in &report.units {
        match &unit.exit {
            UnitExit::Stopped => info!("{} stopped", unit.name),
            UnitExit::Crashed(e) => error!("{} crashed: {}", unit.name, e),
        }
    }

    for (kind, count) in metrics.summary() {
        info!("{}: {}", kind, count);
    }

    for (kind, stats) in metrics.latency_summary() {
        info!(
            "{}: count={} mean={:?} max={:?}",
            kind,
            stats.count,
            stats.mean(),
            stats.max
        );
    }

    let reader = AggregateReader::new(store, cache, cache_config.ttl).with_window(args.window());
    match reader.all_quantity().await {
        Ok(total) => info!("Recent quantity (ALL): {}", total),
        Err(e) => warn!("Failed to read final total: {}", e),
    }

    if !report.all_stopped() {
        std::process::exit(1);
    }
    Ok(())
}
