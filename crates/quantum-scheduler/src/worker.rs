//! Workers that take admissible jobs from the queue and run them.

use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use futures::FutureExt;
use quantum_core::{Executor, Job};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{error, info, warn};

use crate::cascade::{CascadeResolver, Outcome, Settlement};
use crate::queue::AdmissionQueue;
use crate::registry::JobRegistry;

/// Everything a worker needs, shared by the whole pool.
#[derive(Clone)]
pub struct WorkerContext {
    pub registry: Arc<JobRegistry>,
    pub queue: Arc<AdmissionQueue>,
    pub resolver: CascadeResolver,
    pub executor: Arc<dyn Executor>,
    /// How long one dequeue waits before re-checking for shutdown.
    pub dequeue_timeout: Duration,
}

/// A worker that claims and executes jobs.
pub struct Worker {
    id: String,
    ctx: WorkerContext,
}

impl Worker {
    pub fn new(id: impl Into<String>, ctx: WorkerContext) -> Self {
        Self { id: id.into(), ctx }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    /// Run the worker loop until `shutdown` flips or the queue closes.
    ///
    /// A job that has been started always runs to completion; shutdown is
    /// only observed between jobs.
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        info!(worker_id = %self.id, executor = self.ctx.executor.name(), "Starting worker");

        loop {
            if *shutdown.borrow() {
                break;
            }

            let next = tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() {
                        break;
                    }
                    continue;
                }
                job = self.ctx.queue.dequeue(self.ctx.dequeue_timeout) => job,
            };

            match next {
                Some(job) => {
                    self.process(job).await;
                }
                None if self.ctx.queue.is_closed() => break,
                None => {}
            }
        }

        info!(worker_id = %self.id, "Worker stopped");
    }

    /// Claim `job`, run it and settle the result.
    ///
    /// Returns `None` when the job could not be claimed (it was cancelled or
    /// taken in the meantime) or could not be settled.
    pub async fn process(&self, job: Job) -> Option<Settlement> {
        let job = match self.ctx.registry.start(&job.id) {
            Ok(job) => job,
            Err(e) => {
                warn!(worker_id = %self.id, job_id = %job.id, error = %e, "Skipping job");
                return None;
            }
        };

        info!(
            worker_id = %self.id,
            job_id = %job.id,
            pr = %job.pr_number,
            base = %job.base,
            attempt = job.attempt,
            "Running job"
        );

        let run = AssertUnwindSafe(self.ctx.executor.execute(job.pr_number)).catch_unwind();
        let outcome = match run.await {
            Ok(Ok(true)) => Outcome::Passed,
            Ok(Ok(false)) => Outcome::failed(format!("checks failed for PR {}", job.pr_number)),
            Ok(Err(e)) => {
                error!(worker_id = %self.id, job_id = %job.id, error = %e, "Executor error");
                Outcome::failed(format!("executor error: {}", e))
            }
            Err(_) => {
                error!(worker_id = %self.id, job_id = %job.id, "Executor panicked");
                Outcome::failed("executor error: panicked")
            }
        };

        match self.ctx.resolver.complete(&job.id, outcome) {
            Ok(settlement) => Some(settlement),
            Err(e) => {
                error!(worker_id = %self.id, job_id = %job.id, error = %e, "Failed to settle job");
                None
            }
        }
    }
}

/// How a pool shutdown went.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ShutdownReport {
    /// Workers that finished within the grace period.
    pub joined: usize,
    /// Workers aborted at the deadline; their jobs stay `Running`.
    pub abandoned: usize,
}

/// Fixed-size set of workers.
pub struct WorkerPool {
    handles: Vec<JoinHandle<()>>,
    shutdown: watch::Sender<bool>,
    queue: Arc<AdmissionQueue>,
}

impl WorkerPool {
    /// Spawn `size` workers on the current runtime.
    pub fn spawn(size: usize, ctx: WorkerContext) -> Self {
        let (shutdown, signal) = watch::channel(false);
        let queue = ctx.queue.clone();
        let handles = (0..size)
            .map(|n| {
                let worker = Worker::new(format!("worker-{}", n), ctx.clone());
                tokio::spawn(worker.run(signal.clone()))
            })
            .collect();

        info!(workers = size, "Started worker pool");
        Self {
            handles,
            shutdown,
            queue,
        }
    }

    pub fn size(&self) -> usize {
        self.handles.len()
    }

    /// Close the queue, ask every worker to stop and wait up to `grace` for
    /// in-flight jobs.
    pub async fn shutdown(self, grace: Duration) -> ShutdownReport {
        self.queue.close();
        let _ = self.shutdown.send(true);
        let deadline = Instant::now() + grace;

        let mut report = ShutdownReport {
            joined: 0,
            abandoned: 0,
        };
        for mut handle in self.handles {
            match tokio::time::timeout_at(deadline, &mut handle).await {
                Ok(Ok(())) => report.joined += 1,
                Ok(Err(e)) => {
                    error!(error = %e, "Worker task failed");
                    report.joined += 1;
                }
                Err(_) => {
                    handle.abort();
                    report.abandoned += 1;
                }
            }
        }

        if report.abandoned > 0 {
            warn!(
                abandoned = report.abandoned,
                "Abandoned workers with jobs still running"
            );
        }
        info!(joined = report.joined, "Worker pool stopped");
        report
    }
}
