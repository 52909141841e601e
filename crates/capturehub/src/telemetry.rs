//! Logging setup for the daemon.

use anyhow::Result;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

const FALLBACK_FILTER: &str = "info,capturehub=debug";

/// Install a fmt subscriber filtered by `log_level` (an EnvFilter directive,
/// already merged with RUST_LOG by config loading).
pub fn init(log_level: &str) -> Result<()> {
    let filter = EnvFilter::try_new(log_level).unwrap_or_else(|e| {
        eprintln!("invalid log level '{}' ({}), using {}", log_level, e, FALLBACK_FILTER);
        EnvFilter::new(FALLBACK_FILTER)
    });

    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().with_target(true))
        .try_init()?;
    Ok(())
}
