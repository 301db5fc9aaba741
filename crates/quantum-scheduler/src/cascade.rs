//! Settling a finished job and reconciling the speculation stacked on it.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use quantum_core::{Job, JobId, JobStatus, Result};
use tracing::{debug, info, warn};

use crate::queue::AdmissionQueue;
use crate::registry::{JobRegistry, JobTable};

/// What the executor reported for a run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    Passed,
    Failed { reason: String },
}

impl Outcome {
    pub fn failed(reason: impl Into<String>) -> Self {
        Outcome::Failed {
            reason: reason.into(),
        }
    }
}

/// Everything one completion changed, applied atomically.
#[derive(Debug, Clone)]
pub struct Settlement {
    /// The completed job as it ended up.
    pub job: Job,
    pub promoted: Vec<JobId>,
    pub cancelled: Vec<JobId>,
    pub superseded: Vec<JobId>,
}

impl Settlement {
    fn unchanged(job: Job) -> Self {
        Self {
            job,
            promoted: Vec::new(),
            cancelled: Vec::new(),
            superseded: Vec::new(),
        }
    }
}

/// Applies a job's real result to the jobs that bet on it.
#[derive(Debug, Clone)]
pub struct CascadeResolver {
    registry: Arc<JobRegistry>,
    queue: Arc<AdmissionQueue>,
}

impl CascadeResolver {
    pub fn new(registry: Arc<JobRegistry>, queue: Arc<AdmissionQueue>) -> Self {
        Self { registry, queue }
    }

    /// Record the outcome of a running job and propagate it.
    ///
    /// All registry changes happen in one transaction, so a concurrent
    /// listing sees either none or all of them. Queue bookkeeping follows.
    pub fn complete(&self, id: &JobId, outcome: Outcome) -> Result<Settlement> {
        let now = Utc::now();
        let settlement = self
            .registry
            .transaction(|table| settle(table, id, outcome, now))?;

        self.queue.remove(&settlement.cancelled);
        for promoted in &settlement.promoted {
            if let Ok(job) = self.registry.get(promoted) {
                self.queue.reoffer(&job);
            }
        }
        self.queue.notify();

        info!(
            job_id = %settlement.job.id,
            status = %settlement.job.status,
            promoted = settlement.promoted.len(),
            cancelled = settlement.cancelled.len(),
            superseded = settlement.superseded.len(),
            "Settled job"
        );
        Ok(settlement)
    }
}

fn settle(table: &mut JobTable, id: &JobId, outcome: Outcome, now: DateTime<Utc>) -> Result<Settlement> {
    if table.job(id)?.status == JobStatus::Superseded {
        // An ancestor already failed and the cascade ran; the result is moot.
        let job = table.finish_superseded(id, now)?.clone();
        debug!(job_id = %id, ?outcome, "Discarded superseded result");
        return Ok(Settlement::unchanged(job));
    }

    match outcome {
        Outcome::Passed => {
            let job = table.set_status(id, JobStatus::Success, None, now)?.clone();
            let promoted = promote(table, id, now)?;
            Ok(Settlement {
                promoted,
                ..Settlement::unchanged(job)
            })
        }
        Outcome::Failed { reason } => {
            let job = table
                .set_status(id, JobStatus::Failed, Some(reason), now)?
                .clone();
            let (cancelled, superseded) = cancel_descendants(table, id, now)?;
            Ok(Settlement {
                cancelled,
                superseded,
                ..Settlement::unchanged(job)
            })
        }
    }
}

/// Move speculative jobs that no longer rest on an unfinished base to `Pending`.
///
/// That is every direct child of the passed job, plus deeper descendants
/// whose whole chain has now passed (stacks that finished ahead of their
/// root). A grandchild in a plain chain stays speculative until its own base
/// resolves.
fn promote(table: &mut JobTable, id: &JobId, now: DateTime<Utc>) -> Result<Vec<JobId>> {
    let ready: Vec<JobId> = table
        .descendants(id)
        .into_iter()
        .filter(|job| job.status == JobStatus::Speculative)
        .filter(|job| {
            job.base.job() == Some(id)
                || table.lineage(&job.base).is_some_and(|chain| {
                    chain.iter().all(|ancestor| ancestor.status == JobStatus::Success)
                })
        })
        .map(|job| job.id.clone())
        .collect();

    for child in &ready {
        table.set_status(child, JobStatus::Pending, None, now)?;
        debug!(job_id = %child, base = %id, "Promoted speculative job");
    }
    Ok(ready)
}

/// Cancel waiting descendants and supersede running ones.
///
/// Descendants that already finished keep their result.
fn cancel_descendants(
    table: &mut JobTable,
    id: &JobId,
    now: DateTime<Utc>,
) -> Result<(Vec<JobId>, Vec<JobId>)> {
    let affected: Vec<(JobId, JobStatus)> = table
        .descendants(id)
        .into_iter()
        .map(|job| (job.id.clone(), job.status))
        .collect();

    let reason = format!("ancestor {} failed", id);
    let mut cancelled = Vec::new();
    let mut superseded = Vec::new();
    for (descendant, status) in affected {
        match status {
            JobStatus::Pending | JobStatus::Speculative => {
                table.set_status(&descendant, JobStatus::Cancelled, Some(reason.clone()), now)?;
                cancelled.push(descendant);
            }
            JobStatus::Running => {
                table.set_status(&descendant, JobStatus::Superseded, Some(reason.clone()), now)?;
                warn!(job_id = %descendant, ancestor = %id, "Superseded running job");
                superseded.push(descendant);
            }
            _ => {}
        }
    }
    Ok((cancelled, superseded))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::policy::SpeculationPolicy;
    use quantum_core::{BaseRef, PrNumber};
    use std::time::Duration;

    struct Fixture {
        registry: Arc<JobRegistry>,
        queue: Arc<AdmissionQueue>,
        resolver: CascadeResolver,
    }

    fn fixture() -> Fixture {
        let registry = Arc::new(JobRegistry::new());
        let queue = Arc::new(AdmissionQueue::new(
            registry.clone(),
            16,
            SpeculationPolicy::default(),
            Duration::from_secs(1),
        ));
        let resolver = CascadeResolver::new(registry.clone(), queue.clone());
        Fixture {
            registry,
            queue,
            resolver,
        }
    }

    impl Fixture {
        /// A -> B -> C, each queued.
        async fn chain(&self) -> (Job, Job, Job) {
            let a = self.submit(1, BaseRef::Trunk).await;
            let b = self.submit(2, BaseRef::Job(a.id.clone())).await;
            let c = self.submit(3, BaseRef::Job(b.id.clone())).await;
            (a, b, c)
        }

        async fn submit(&self, n: u64, base: BaseRef) -> Job {
            let job = self.registry.create(PrNumber::new(n), base).unwrap();
            self.queue
                .enqueue(&job, Duration::from_millis(10))
                .await
                .unwrap();
            job
        }

        fn status(&self, job: &Job) -> JobStatus {
            self.registry.get(&job.id).unwrap().status
        }
    }

    #[tokio::test]
    async fn test_failure_cancels_the_whole_stack() {
        let fx = fixture();
        let (a, b, c) = fx.chain().await;
        fx.registry.start(&a.id).unwrap();

        let settlement = fx
            .resolver
            .complete(&a.id, Outcome::failed("checks failed for PR 1"))
            .unwrap();

        assert_eq!(settlement.job.status, JobStatus::Failed);
        assert_eq!(settlement.cancelled, vec![b.id.clone(), c.id.clone()]);
        for job in [&b, &c] {
            let job = fx.registry.get(&job.id).unwrap();
            assert_eq!(job.status, JobStatus::Cancelled);
            assert_eq!(job.reason.as_deref(), Some("ancestor pr-1-1 failed"));
            assert!(job.finished_at.is_some());
        }
        assert!(!fx.queue.contains(&b.id));
        assert!(!fx.queue.contains(&c.id));
    }

    #[tokio::test]
    async fn test_running_descendant_is_superseded_not_interrupted() {
        let fx = fixture();
        let (a, b, c) = fx.chain().await;
        fx.registry.start(&a.id).unwrap();
        fx.registry.start(&b.id).unwrap();

        let settlement = fx
            .resolver
            .complete(&a.id, Outcome::failed("boom"))
            .unwrap();
        assert_eq!(settlement.superseded, vec![b.id.clone()]);
        assert_eq!(settlement.cancelled, vec![c.id.clone()]);

        let superseded = fx.registry.get(&b.id).unwrap();
        assert_eq!(superseded.status, JobStatus::Superseded);
        assert!(superseded.finished_at.is_none());

        // The run finishes later; its result is thrown away.
        let settlement = fx.resolver.complete(&b.id, Outcome::Passed).unwrap();
        assert_eq!(settlement.job.status, JobStatus::Superseded);
        assert!(settlement.job.finished_at.is_some());
        assert!(settlement.promoted.is_empty());
    }

    #[tokio::test]
    async fn test_success_promotes_one_tier() {
        let fx = fixture();
        let (a, b, c) = fx.chain().await;
        fx.registry.start(&a.id).unwrap();

        let settlement = fx.resolver.complete(&a.id, Outcome::Passed).unwrap();
        assert_eq!(settlement.promoted, vec![b.id.clone()]);
        assert_eq!(fx.status(&b), JobStatus::Pending);
        assert_eq!(fx.status(&c), JobStatus::Speculative);

        fx.registry.start(&b.id).unwrap();
        fx.resolver.complete(&b.id, Outcome::Passed).unwrap();
        assert_eq!(fx.status(&c), JobStatus::Pending);
    }

    #[tokio::test]
    async fn test_speculative_result_stands_when_base_passes() {
        let fx = fixture();
        let a = fx.submit(1, BaseRef::Trunk).await;
        let b = fx.submit(2, BaseRef::Job(a.id.clone())).await;
        fx.registry.start(&a.id).unwrap();
        fx.registry.start(&b.id).unwrap();

        fx.resolver.complete(&b.id, Outcome::Passed).unwrap();
        let settlement = fx.resolver.complete(&a.id, Outcome::Passed).unwrap();

        assert!(settlement.promoted.is_empty());
        assert_eq!(fx.status(&b), JobStatus::Success);
    }

    #[tokio::test]
    async fn test_early_pass_promotes_its_children() {
        let fx = fixture();
        let a = fx.submit(1, BaseRef::Trunk).await;
        let b = fx.submit(2, BaseRef::Job(a.id.clone())).await;
        let c = fx.submit(3, BaseRef::Job(b.id.clone())).await;
        let d = fx.submit(4, BaseRef::Job(c.id.clone())).await;
        fx.registry.start(&a.id).unwrap();
        fx.registry.start(&b.id).unwrap();

        // B passes while A is still running.
        let settlement = fx.resolver.complete(&b.id, Outcome::Passed).unwrap();
        assert_eq!(settlement.promoted, vec![c.id.clone()]);
        assert_eq!(fx.status(&d), JobStatus::Speculative);

        fx.registry.start(&c.id).unwrap();
        fx.resolver.complete(&c.id, Outcome::Passed).unwrap();
        assert_eq!(fx.status(&d), JobStatus::Pending);

        let settlement = fx.resolver.complete(&a.id, Outcome::Passed).unwrap();
        assert!(settlement.promoted.is_empty());
    }

    #[tokio::test]
    async fn test_finished_descendants_are_left_alone() {
        let fx = fixture();
        let (a, b, c) = fx.chain().await;
        fx.registry.start(&a.id).unwrap();
        fx.registry.start(&b.id).unwrap();
        fx.resolver.complete(&b.id, Outcome::Passed).unwrap();

        let settlement = fx
            .resolver
            .complete(&a.id, Outcome::failed("boom"))
            .unwrap();

        assert_eq!(fx.status(&b), JobStatus::Success);
        assert_eq!(settlement.cancelled, vec![c.id.clone()]);
        assert!(settlement.superseded.is_empty());
    }

    #[tokio::test]
    async fn test_listing_never_sees_a_partial_cascade() {
        let fx = fixture();
        let mut base = BaseRef::Trunk;
        let mut jobs = Vec::new();
        for n in 1..=50 {
            let job = fx.registry.create(PrNumber::new(n), base).unwrap();
            base = BaseRef::Job(job.id.clone());
            jobs.push(job);
        }
        let root = jobs[0].id.clone();
        fx.registry.start(&root).unwrap();

        std::thread::scope(|scope| {
            let observer = scope.spawn(|| {
                for _ in 0..200 {
                    let listing = fx.registry.list_all();
                    let cancelled = listing
                        .iter()
                        .filter(|j| j.status == JobStatus::Cancelled)
                        .count();
                    assert!(cancelled == 0 || cancelled == 49, "saw {cancelled} cancelled");
                }
            });
            fx.resolver
                .complete(&root, Outcome::failed("boom"))
                .unwrap();
            observer.join().unwrap();
        });
    }

    #[tokio::test]
    async fn test_completing_twice_is_rejected() {
        let fx = fixture();
        let a = fx.submit(1, BaseRef::Trunk).await;
        fx.registry.start(&a.id).unwrap();
        fx.resolver.complete(&a.id, Outcome::Passed).unwrap();

        let err = fx
            .resolver
            .complete(&a.id, Outcome::failed("late"))
            .unwrap_err();
        assert!(matches!(err, quantum_core::Error::InvalidTransition { .. }));
        assert_eq!(fx.status(&a), JobStatus::Success);
    }
}
