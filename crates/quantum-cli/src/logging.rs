//! Tracing subscriber setup.

use anyhow::{Context, Result, anyhow};
use quantum_config::Settings;
use tracing_subscriber::EnvFilter;

/// Filter from `RUST_LOG` when set, else from the configured level.
fn filter(level: &str) -> Result<EnvFilter> {
    match EnvFilter::try_from_default_env() {
        Ok(filter) => Ok(filter),
        Err(_) => EnvFilter::try_new(level).with_context(|| format!("Invalid log level: {}", level)),
    }
}

/// Install the global subscriber: JSON lines in production, human-readable
/// output everywhere else.
pub fn init(settings: &Settings) -> Result<()> {
    let builder = tracing_subscriber::fmt().with_env_filter(filter(&settings.log_level)?);

    let installed = if settings.is_production() {
        builder.json().with_target(true).try_init()
    } else {
        builder.try_init()
    };
    installed.map_err(|e| anyhow!("Failed to install tracing subscriber: {}", e))
}
