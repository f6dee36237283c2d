//! Tally CLI - publish messages and query aggregates
//!
//! Usage:
//!   tally-cli publish --key apples --quantity 3
//!   tally-cli publish --hello
//!   tally-cli query --key apples
//!   tally-cli query

use bytes::Bytes;
use clap::{Args as ClapArgs, Parser, Subcommand};
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

use tally::{
    cache::{InvalidatingCache, MemoryCache, RedisCache},
    config::NatsArgs,
    logging,
    queue::{JetStreamTransport, Transport, DEFAULT_QUEUE},
    store::{AggregateStore, SqliteStore},
    types::Message,
    AggregateReader,
};

#[derive(Parser, Debug)]
#[command(name = "tally-cli")]
#[command(about = "Publish messages to and query aggregates from a Tally pipeline")]
#[command(version)]
struct Cli {
    /// Log level (trace, debug, info, warn, error)
    #[arg(long, env = "LOG_LEVEL", default_value = "warn", global = true)]
    log_level: String,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Enqueue one message
    Publish(PublishArgs),
    /// Print the recent quantity for a key, or for all keys
    Query(QueryArgs),
}

#[derive(ClapArgs, Debug)]
struct PublishArgs {
    #[command(flatten)]
    nats: NatsArgs,

    #[arg(long, env = "QUEUE_NAME", default_value = DEFAULT_QUEUE)]
    queue_name: String,

    /// Key for a structured message
    #[arg(long, conflicts_with_all = ["hello", "raw"])]
    key: Option<String>,

    /// Quantity; omitted means the worker picks one
    #[arg(long, requires = "key")]
    quantity: Option<i64>,

    /// Send the pause sentinel
    #[arg(long, conflicts_with = "raw")]
    hello: bool,

    /// Send an arbitrary payload byte for byte
    #[arg(long)]
    raw: Option<String>,
}

impl PublishArgs {
    fn message(&self) -> anyhow::Result<Message> {
        if self.hello {
            return Ok(Message::Hello);
        }
        match &self.key {
            Some(key) => Ok(Message::Quantity {
                key: key.clone(),
                quantity: self.quantity,
            }),
            None => anyhow::bail!("one of --key, --hello or --raw is required"),
        }
    }
}

#[derive(ClapArgs, Debug)]
struct QueryArgs {
    /// Key to query; all keys when omitted
    #[arg(long)]
    key: Option<String>,

    #[arg(long, env = "DATABASE_PATH", default_value = "tally.db")]
    database_path: String,

    #[arg(long, env = "REDIS_URL")]
    redis_url: Option<String>,

    #[arg(long, env = "CACHE_TTL_SECS", default_value = "60")]
    cache_ttl_secs: u64,

    #[arg(long, env = "WINDOW_SECS", default_value = "60")]
    window_secs: u64,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let _ = dotenvy::dotenv();
    let cli = Cli::parse();
    logging::init(&cli.log_level, false)?;

    match cli.command {
        Command::Publish(args) => publish(args).await,
        Command::Query(args) => query(args).await,
    }
}

async fn publish(args: PublishArgs) -> anyhow::Result<()> {
    let transport = JetStreamTransport::connect(&args.nats, &args.queue_name, "tally-cli").await?;
    let producer = transport.producer().await?;

    let shape = match &args.raw {
        Some(raw) => {
            producer.publish_payload(Bytes::from(raw.clone())).await?;
            Message::decode(raw.as_bytes()).shape()
        }
        None => {
            let message = args.message()?;
            producer.publish(&message).await?;
            message.shape()
        }
    };
    producer.close().await?;

    info!("Published {} message to {}", shape, args.queue_name);
    println!("published {}", shape);
    Ok(())
}

async fn query(args: QueryArgs) -> anyhow::Result<()> {
    let store = SqliteStore::open_path(&args.database_path)?;
    store.ensure_schema().await?;

    let cache: Arc<dyn InvalidatingCache> = match &args.redis_url {
        Some(url) => Arc::new(RedisCache::connect(url).await?),
        None => Arc::new(MemoryCache::with_defaults()),
    };

    let reader = AggregateReader::new(Arc::new(store), cache, Duration::from_secs(args.cache_ttl_secs))
        .with_window(Duration::from_secs(args.window_secs));

    let (label, total) = match &args.key {
        Some(key) => (key.as_str(), reader.recent_quantity(key).await?),
        None => ("ALL", reader.all_quantity().await?),
    };
    println!("{} {}", label, total);
    Ok(())
}
