//! Tracing subscriber setup.
//!
//! `RUST_LOG` always wins; the level passed in is the fallback when it is
//! unset or unparsable.
//!
//! ```bash
//! RUST_LOG=staccato=debug staccato 8080
//! ```

use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

use crate::error::{ServerError, ServerResult};

/// Human-readable output on stdout.
pub fn init_logging(level: &str) -> ServerResult<()> {
    tracing_subscriber::registry()
        .with(filter(level))
        .with(tracing_subscriber::fmt::layer().with_thread_names(true))
        .try_init()
        .map_err(|e| ServerError::Config(format!("logging already initialized: {}", e)))
}

/// One JSON object per line, for log shippers.
pub fn init_logging_json(level: &str) -> ServerResult<()> {
    tracing_subscriber::registry()
        .with(filter(level))
        .with(tracing_subscriber::fmt::layer().json())
        .try_init()
        .map_err(|e| ServerError::Config(format!("logging already initialized: {}", e)))
}

fn filter(level: &str) -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level))
}
