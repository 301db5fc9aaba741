//! CLI command implementations.

pub mod serve;

use std::path::Path;

use anyhow::{Context, Result};

pub fn validate(path: Option<&Path>) -> Result<()> {
    let loaded = quantum_config::load(path).context("Configuration error")?;
    let settings = &loaded.settings;

    match &loaded.source {
        Some(source) => println!("Configuration is valid: {}", source.display()),
        None => println!("No configuration file found; defaults are valid"),
    }
    println!("  env:        {}", settings.env);
    println!("  log level:  {}", settings.log_level);
    println!("  listen:     {}", settings.server.listen);
    println!(
        "  scheduler:  {} workers, queue capacity {}, speculation depth {}",
        settings.scheduler.workers,
        settings.scheduler.queue_capacity,
        settings.scheduler.speculation_depth
    );
    match &settings.executor {
        Some(executor) => println!("  executor:   {} `{}`", executor.kind, executor.command),
        None => println!("  executor:   none (serve will refuse to start)"),
    }
    Ok(())
}
