//! Logging bootstrap
//!
//! `RUST_LOG` wins when set; otherwise the configured level applies to the
//! audit crates and HTTP tracing.

use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use crate::{Error, Result};

/// Build the default filter directive for a configured level
pub fn default_directive(level: &str) -> String {
    format!("mta_audit={level},mta_common={level},tower_http={level}")
}

/// Install the global tracing subscriber
pub fn init_tracing(level: &str) -> Result<()> {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(default_directive(level)));

    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer())
        .try_init()
        .map_err(|e| Error::Config(format!("Failed to initialize logging: {}", e)))
}
