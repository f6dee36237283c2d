//! Configuration for Tally
//!
//! CLI arguments and environment variable handling using clap.

use clap::{Parser, ValueEnum};
use std::time::Duration;

use crate::cache::CacheConfig;
use crate::fault::RandomFaults;
use crate::queue::{AckMode, DEFAULT_QUEUE};
use crate::types::{Result, TallyError};
use crate::worker::{EngineConfig, GeneratorConfig, PauseRange, RandomQuantity, WorkerConfig};

/// Upper bound for `CACHE_TTL_SECS` (one day)
pub const MAX_CACHE_TTL_SECS: u64 = 24 * 60 * 60;

/// Which queue backend the engine runs on
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum TransportKind {
    /// NATS JetStream work queue
    Nats,
    /// In-process queue, single process only
    Memory,
}

/// Tally - queue-backed write pipeline with cached sliding-window reads
#[derive(Parser, Debug, Clone)]
#[command(name = "tally")]
#[command(about = "Queue-backed write pipeline with cached sliding-window aggregates")]
pub struct Args {
    /// Queue backend
    #[arg(long, env = "TRANSPORT", value_enum, default_value_t = TransportKind::Nats)]
    pub transport: TransportKind,

    /// NATS configuration
    #[command(flatten)]
    pub nats: NatsArgs,

    /// Name of the single logical queue
    #[arg(long, env = "QUEUE_NAME", default_value = DEFAULT_QUEUE)]
    pub queue_name: String,

    /// SQLite database file (`:memory:` for a throwaway database)
    #[arg(long, env = "DATABASE_PATH", default_value = "tally.db")]
    pub database_path: String,

    /// Redis URL; the in-memory cache is used when unset
    #[arg(long, env = "REDIS_URL")]
    pub redis_url: Option<String>,

    /// TTL for cached aggregates in seconds
    #[arg(long, env = "CACHE_TTL_SECS", default_value = "60")]
    pub cache_ttl_secs: u64,

    /// Sliding window for aggregates in seconds
    #[arg(long, env = "WINDOW_SECS", default_value = "60")]
    pub window_secs: u64,

    /// Number of consuming workers
    #[arg(long, env = "WORKER_COUNT", default_value = "20")]
    pub worker_count: usize,

    /// Number of synthetic load generators
    #[arg(long, env = "GENERATOR_COUNT", default_value = "1")]
    pub generator_count: usize,

    /// Bounded wait for each receive in milliseconds
    #[arg(long, env = "RECEIVE_TIMEOUT_MS", default_value = "1000")]
    pub receive_timeout_ms: u64,

    /// When consumed messages are acknowledged
    #[arg(long, env = "ACK_MODE", value_enum, default_value_t = AckMode::BeforeProcessing)]
    pub ack_mode: AckMode,

    /// Also invalidate the global aggregate on every write
    #[arg(long, env = "INVALIDATE_GLOBAL", default_value = "false")]
    pub invalidate_global: bool,

    /// Smallest generated quantity
    #[arg(long, env = "QUANTITY_MIN", default_value = "1")]
    pub quantity_min: i64,

    /// Largest generated quantity
    #[arg(long, env = "QUANTITY_MAX", default_value = "10")]
    pub quantity_max: i64,

    /// Shortest sentinel pause / generator interval in milliseconds
    #[arg(long, env = "PAUSE_MIN_MS", default_value = "100")]
    pub pause_min_ms: u64,

    /// Longest sentinel pause / generator interval in milliseconds
    #[arg(long, env = "PAUSE_MAX_MS", default_value = "2000")]
    pub pause_max_ms: u64,

    /// Probability that a store write simulates a transient timeout
    #[arg(long, env = "STORE_TIMEOUT_PROBABILITY", default_value = "0.1")]
    pub store_timeout_probability: f64,

    /// Add simulated latency to store writes
    #[arg(long, env = "SIMULATE_LATENCY", default_value = "true", action = clap::ArgAction::Set)]
    pub simulate_latency: bool,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, env = "LOG_LEVEL", default_value = "info")]
    pub log_level: String,

    /// Emit JSON log lines
    #[arg(long, env = "LOG_JSON", default_value = "false")]
    pub log_json: bool,
}

/// NATS connection configuration
#[derive(Parser, Debug, Clone)]
pub struct NatsArgs {
    /// NATS server URL
    #[arg(long, env = "NATS_URL", default_value = "nats://127.0.0.1:4222")]
    pub nats_url: String,

    /// NATS username (optional)
    #[arg(long, env = "NATS_USER")]
    pub nats_user: Option<String>,

    /// NATS password (optional)
    #[arg(long, env = "NATS_PASSWORD")]
    pub nats_password: Option<String>,
}

impl Args {
    pub fn window(&self) -> Duration {
        Duration::from_secs(self.window_secs)
    }

    pub fn pause_range(&self) -> PauseRange {
        PauseRange::new(
            Duration::from_millis(self.pause_min_ms),
            Duration::from_millis(self.pause_max_ms),
        )
    }

    pub fn quantity_range(&self) -> RandomQuantity {
        RandomQuantity {
            min: self.quantity_min,
            max: self.quantity_max,
        }
    }

    pub fn cache_config(&self) -> CacheConfig {
        CacheConfig {
            ttl: Duration::from_secs(self.cache_ttl_secs),
            ..Default::default()
        }
    }

    pub fn faults(&self) -> RandomFaults {
        RandomFaults {
            timeout_probability: self.store_timeout_probability,
            simulate_latency: self.simulate_latency,
        }
    }

    pub fn engine_config(&self) -> EngineConfig {
        EngineConfig {
            worker_count: self.worker_count,
            generator_count: self.generator_count,
            ack_mode: self.ack_mode,
            worker: WorkerConfig {
                receive_timeout: Duration::from_millis(self.receive_timeout_ms),
                pause: self.pause_range(),
                invalidate_global: self.invalidate_global,
                ..Default::default()
            },
            generator_interval: self.pause_range(),
            generator_keys: GeneratorConfig::default().keys,
        }
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<()> {
        if self.worker_count == 0 {
            return Err(config_error("WORKER_COUNT must be at least 1"));
        }

        if self.quantity_min < 0 {
            return Err(config_error("QUANTITY_MIN must not be negative"));
        }

        if self.quantity_min > self.quantity_max {
            return Err(config_error("QUANTITY_MIN must be less than or equal to QUANTITY_MAX"));
        }

        if self.pause_min_ms > self.pause_max_ms {
            return Err(config_error("PAUSE_MIN_MS must be less than or equal to PAUSE_MAX_MS"));
        }

        if !(0.0..=1.0).contains(&self.store_timeout_probability) {
            return Err(config_error("STORE_TIMEOUT_PROBABILITY must be between 0 and 1"));
        }

        if self.cache_ttl_secs > MAX_CACHE_TTL_SECS {
            return Err(config_error("CACHE_TTL_SECS must be at most 86400"));
        }

        if self.receive_timeout_ms == 0 {
            return Err(config_error("RECEIVE_TIMEOUT_MS must be greater than 0"));
        }

        if self.window_secs == 0 {
            return Err(config_error("WINDOW_SECS must be greater than 0"));
        }

        if self.queue_name.trim().is_empty() {
            return Err(config_error("QUEUE_NAME must not be empty"));
        }

        Ok(())
    }
}

fn config_error(msg: &str) -> TallyError {
    TallyError::Config(msg.to_string())
}
