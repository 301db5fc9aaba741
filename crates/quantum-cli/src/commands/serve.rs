//! The `serve` command: scheduler, workers and HTTP API in one process.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use quantum_api::AppState;
use quantum_config::SchedulerSettings;
use quantum_executor::ShellExecutor;
use quantum_scheduler::{Scheduler, SchedulerConfig, SpeculationPolicy};
use tokio::net::TcpListener;
use tracing::{info, warn};

use crate::logging;

pub struct ServeArgs {
    pub config: Option<PathBuf>,
    pub listen: Option<SocketAddr>,
    pub workers: Option<usize>,
}

pub async fn run(args: ServeArgs) -> Result<()> {
    let loaded =
        quantum_config::load(args.config.as_deref()).context("Failed to load configuration")?;
    let mut settings = loaded.settings;
    if let Some(listen) = args.listen {
        settings.server.listen = listen;
    }
    if let Some(workers) = args.workers {
        settings.scheduler.workers = workers;
    }
    settings.validate()?;

    logging::init(&settings)?;
    match &loaded.source {
        Some(path) => info!(path = %path.display(), env = %settings.env, "Loaded configuration"),
        None => info!(env = %settings.env, "No configuration file found, using defaults"),
    }

    let executor_settings = settings
        .executor
        .as_ref()
        .context("No executor configured; add an `executor \"shell\" { command \"...\" }` block")?;
    let executor = Arc::new(ShellExecutor::from_settings(executor_settings));
    info!(command = %executor.command(), "Using shell executor");

    let scheduler = Arc::new(Scheduler::new(
        scheduler_config(&settings.scheduler),
        executor,
    ));
    scheduler.start();

    let listener = TcpListener::bind(settings.server.listen)
        .await
        .with_context(|| format!("Failed to bind {}", settings.server.listen))?;
    quantum_api::serve(listener, AppState::new(scheduler.clone()), shutdown_signal()).await?;

    let report = scheduler.shutdown().await;
    if report.abandoned > 0 {
        warn!(
            abandoned = report.abandoned,
            "Jobs left running; they will not be resumed"
        );
    }
    info!("Shutdown complete");
    Ok(())
}

fn scheduler_config(settings: &SchedulerSettings) -> SchedulerConfig {
    SchedulerConfig {
        workers: settings.workers,
        queue_capacity: settings.queue_capacity,
        enqueue_timeout: settings.enqueue_timeout,
        dequeue_timeout: settings.dequeue_timeout,
        poll_interval: settings.poll_interval,
        speculation: SpeculationPolicy::new(settings.speculation_depth),
        shutdown_grace: settings.shutdown_grace,
    }
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!(error = %e, "Failed to listen for Ctrl-C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                warn!(error = %e, "Failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
    info!("Shutdown signal received");
}
