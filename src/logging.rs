//! Logging setup
//!
//! `RUST_LOG` takes precedence; otherwise the crate logs at the configured
//! level and everything else at `info`.

use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use crate::types::{Result, TallyError};

/// Default filter directive for a level
pub fn default_directive(level: &str) -> String {
    format!("tally={},info", level)
}

/// Install the global subscriber
pub fn init(level: &str, json: bool) -> Result<()> {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(default_directive(level)));

    let registry = tracing_subscriber::registry().with(filter);
    let result = if json {
        registry.with(tracing_subscriber::fmt::layer().json()).try_init()
    } else {
        registry.with(tracing_subscriber::fmt::layer()).try_init()
    };

    result.map_err(|e| TallyError::Config(format!("Failed to initialize logging: {}", e)))
}
