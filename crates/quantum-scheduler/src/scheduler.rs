//! Submission and query facade over the scheduling core.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use quantum_core::{BaseRef, Executor, JobId, JobStatus, JobView, PrNumber, Result};
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::cascade::CascadeResolver;
use crate::policy::SpeculationPolicy;
use crate::queue::AdmissionQueue;
use crate::registry::JobRegistry;
use crate::worker::{ShutdownReport, WorkerContext, WorkerPool};

/// Tuning knobs for the scheduler.
#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    pub workers: usize,
    pub queue_capacity: usize,
    /// How long `submit` waits for room before reporting `QueueFull`.
    pub enqueue_timeout: Duration,
    pub dequeue_timeout: Duration,
    /// Upper bound between admissibility re-checks of an idle worker.
    pub poll_interval: Duration,
    pub speculation: SpeculationPolicy,
    pub shutdown_grace: Duration,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            workers: 4,
            queue_capacity: 100,
            enqueue_timeout: Duration::from_secs(5),
            dequeue_timeout: Duration::from_secs(5),
            poll_interval: Duration::from_secs(1),
            speculation: SpeculationPolicy::default(),
            shutdown_grace: Duration::from_secs(30),
        }
    }
}

/// Point-in-time counters for health reporting.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SchedulerStats {
    pub jobs: usize,
    pub by_status: BTreeMap<&'static str, usize>,
    pub queue_depth: usize,
    pub queue_capacity: usize,
    pub workers: usize,
    pub accepting: bool,
}

/// Lifecycle of the worker pool.
enum PoolState {
    Idle,
    Running(WorkerPool),
    Stopped,
}

/// The scheduler: registry, admission queue, worker pool and cascade
/// resolver wired together.
pub struct Scheduler {
    config: SchedulerConfig,
    registry: Arc<JobRegistry>,
    queue: Arc<AdmissionQueue>,
    resolver: CascadeResolver,
    executor: Arc<dyn Executor>,
    pool: Mutex<PoolState>,
}

impl Scheduler {
    pub fn new(config: SchedulerConfig, executor: Arc<dyn Executor>) -> Self {
        let registry = Arc::new(JobRegistry::new());
        let queue = Arc::new(AdmissionQueue::new(
            registry.clone(),
            config.queue_capacity,
            config.speculation,
            config.poll_interval,
        ));
        let resolver = CascadeResolver::new(registry.clone(), queue.clone());
        Self {
            config,
            registry,
            queue,
            resolver,
            executor,
            pool: Mutex::new(PoolState::Idle),
        }
    }

    pub fn config(&self) -> &SchedulerConfig {
        &self.config
    }

    pub fn registry(&self) -> &Arc<JobRegistry> {
        &self.registry
    }

    pub fn queue(&self) -> &Arc<AdmissionQueue> {
        &self.queue
    }

    /// Spawn the worker pool. Calling it again, or after shutdown, is a no-op.
    pub fn start(&self) {
        let mut pool = self.pool.lock().unwrap_or_else(PoisonError::into_inner);
        if !matches!(*pool, PoolState::Idle) {
            return;
        }
        let ctx = WorkerContext {
            registry: self.registry.clone(),
            queue: self.queue.clone(),
            resolver: self.resolver.clone(),
            executor: self.executor.clone(),
            dequeue_timeout: self.config.dequeue_timeout,
        };
        *pool = PoolState::Running(WorkerPool::spawn(self.config.workers, ctx));
    }

    /// Register a validation job for `pr` on top of `base` and queue it.
    ///
    /// Room in the queue is reserved before the job is created, so a
    /// rejected submission leaves no record. A job whose chain already holds
    /// a failed ancestor is recorded as `Cancelled` and never queued.
    pub async fn submit(&self, pr: PrNumber, base: BaseRef) -> Result<JobId> {
        self.registry.validate(pr, &base)?;
        let slot = self.queue.reserve(self.config.enqueue_timeout).await?;
        let job = self.registry.create(pr, base)?;

        if job.status.is_terminal() {
            info!(job_id = %job.id, reason = ?job.reason, "Job cancelled at submission");
            return Ok(job.id);
        }

        if let Err(e) = slot.fill(&job) {
            self.abandon(&job.id);
            return Err(e);
        }

        info!(job_id = %job.id, pr = %pr, base = %job.base, status = %job.status, "Submitted job");
        Ok(job.id)
    }

    /// Cancel a job that was recorded but never made it into the queue.
    fn abandon(&self, id: &JobId) {
        let reason = Some("scheduler shutting down".to_string());
        if let Err(e) = self.registry.update_status(id, JobStatus::Cancelled, reason) {
            warn!(job_id = %id, error = %e, "Failed to cancel unqueued job");
        }
    }

    pub fn get(&self, id: &JobId) -> Result<JobView> {
        self.registry.get(id).map(JobView::from)
    }

    /// Every job, oldest first.
    pub fn list_all(&self) -> Vec<JobView> {
        self.registry
            .read(|table| table.iter().map(JobView::from).collect())
    }

    /// Put a failed job back in line for another attempt.
    pub async fn retry(&self, id: &JobId) -> Result<JobView> {
        self.registry.get(id)?;
        let slot = self.queue.reserve(self.config.enqueue_timeout).await?;
        let job = self.registry.requeue(id)?;
        slot.fill(&job)?;

        info!(job_id = %job.id, attempt = job.attempt, "Retrying job");
        Ok(job.view())
    }

    pub fn stats(&self) -> SchedulerStats {
        let mut by_status: BTreeMap<&'static str, usize> =
            JobStatus::ALL.iter().map(|s| (s.as_str(), 0)).collect();
        let jobs = self.registry.read(|table| {
            for job in table.iter() {
                *by_status.entry(job.status.as_str()).or_default() += 1;
            }
            table.len()
        });

        let workers = match &*self.pool.lock().unwrap_or_else(PoisonError::into_inner) {
            PoolState::Running(pool) => pool.size(),
            PoolState::Idle | PoolState::Stopped => 0,
        };

        SchedulerStats {
            jobs,
            by_status,
            queue_depth: self.queue.len(),
            queue_capacity: self.queue.capacity(),
            workers,
            accepting: !self.queue.is_closed(),
        }
    }

    /// Stop accepting submissions, then give running jobs the configured
    /// grace period to finish.
    pub async fn shutdown(&self) -> ShutdownReport {
        info!("Shutting down scheduler");
        self.queue.close();

        let previous = std::mem::replace(
            &mut *self.pool.lock().unwrap_or_else(PoisonError::into_inner),
            PoolState::Stopped,
        );
        let idle = ShutdownReport {
            joined: 0,
            abandoned: 0,
        };
        match previous {
            PoolState::Running(pool) => pool.shutdown(self.config.shutdown_grace).await,
            PoolState::Idle => {
                warn!("Scheduler was never started");
                idle
            }
            PoolState::Stopped => {
                debug!("Scheduler already stopped");
                idle
            }
        }
    }
}
