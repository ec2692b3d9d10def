//! Console logging for the command-line front end
//!
//! Events go to stderr so the wrapped command owns stdout. `RUST_LOG`
//! overrides the level passed on the command line.

use anyhow::anyhow;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Layer, Registry, fmt};

pub fn init_logging(level: &str) -> anyhow::Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    let console_layer = fmt::layer()
        .with_writer(std::io::stderr)
        .with_target(true)
        .with_filter(filter);

    Registry::default()
        .with(console_layer)
        .try_init()
        .map_err(|e| anyhow!("Failed to initialize logging: {}", e))
}
