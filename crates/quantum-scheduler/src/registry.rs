//! In-process job registry.
//!
//! The registry is the single source of truth for job state. Jobs live in an
//! arena keyed by id; each job points at its base and the table keeps the
//! reverse (base -> children) index, so the dependency forest can be walked
//! both ways. Every mutation goes through one `RwLock`.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{PoisonError, RwLock};

use chrono::{DateTime, Utc};
use quantum_core::{BaseRef, Error, Job, JobId, JobStatus, PrNumber, Result};
use tracing::debug;

/// The locked state of the registry.
///
/// Handed out by [`JobRegistry::read`] and [`JobRegistry::transaction`] so
/// that multi-job updates (a whole cascade) are applied in one critical
/// section.
#[derive(Debug, Default)]
pub struct JobTable {
    jobs: HashMap<JobId, Job>,
    children: HashMap<JobId, Vec<JobId>>,
    order: Vec<JobId>,
    positions: HashMap<JobId, usize>,
    revisions: HashMap<PrNumber, u32>,
}

impl JobTable {
    pub fn len(&self) -> usize {
        self.jobs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.jobs.is_empty()
    }

    pub fn get(&self, id: &JobId) -> Option<&Job> {
        self.jobs.get(id)
    }

    pub fn job(&self, id: &JobId) -> Result<&Job> {
        self.jobs.get(id).ok_or_else(|| Error::NotFound(id.clone()))
    }

    /// Index of `id` in creation order.
    pub fn position(&self, id: &JobId) -> Option<usize> {
        self.positions.get(id).copied()
    }

    /// All jobs in creation order.
    pub fn iter(&self) -> impl Iterator<Item = &Job> {
        self.order.iter().filter_map(|id| self.jobs.get(id))
    }

    /// Direct dependents of `id`, in creation order.
    pub fn children(&self, id: &JobId) -> impl Iterator<Item = &Job> {
        self.child_ids(id).filter_map(|child| self.jobs.get(child))
    }

    /// Transitive dependents of `id`, breadth first.
    ///
    /// Never returns `id` itself and never yields more jobs than the table
    /// holds, even if the base relation were corrupted into a loop.
    pub fn descendants(&self, id: &JobId) -> Vec<&Job> {
        let mut result = Vec::new();
        let mut visited: HashSet<&JobId> = HashSet::from([id]);
        let mut queue: VecDeque<&JobId> = self.child_ids(id).collect();

        while let Some(current) = queue.pop_front() {
            if result.len() >= self.jobs.len() {
                break;
            }
            if !visited.insert(current) {
                continue;
            }
            if let Some(job) = self.jobs.get(current) {
                result.push(job);
                queue.extend(self.child_ids(current));
            }
        }

        result
    }

    /// The chain of jobs above `base`, nearest first, stopping at the trunk.
    ///
    /// Returns `None` when the walk takes more steps than there are jobs,
    /// which can only happen if the chain loops.
    pub fn lineage(&self, base: &BaseRef) -> Option<Vec<&Job>> {
        let bound = self.jobs.len();
        let mut chain = Vec::new();
        let mut next = base.job();

        while let Some(id) = next {
            if chain.len() >= bound {
                return None;
            }
            let Some(job) = self.jobs.get(id) else {
                break;
            };
            chain.push(job);
            next = job.base.job();
        }

        Some(chain)
    }

    /// The top-most ancestor that ended without passing, if any.
    pub fn failed_ancestor(&self, base: &BaseRef) -> Option<&Job> {
        self.lineage(base)?
            .into_iter()
            .rev()
            .find(|job| job.status.is_dead())
    }

    /// Check that a job for `pr` may be stacked on `base`.
    ///
    /// The job being created is identified by its PR: stacking a PR on a chain
    /// that already contains that PR would make it depend on itself.
    pub fn validate(&self, pr: PrNumber, base: &BaseRef) -> Result<()> {
        let Some(base_id) = base.job() else {
            return Ok(());
        };
        if !self.jobs.contains_key(base_id) {
            return Err(Error::UnknownBase(base_id.clone()));
        }

        let cyclic = || Error::CyclicDependency {
            pr,
            base: base.clone(),
        };
        let chain = self.lineage(base).ok_or_else(cyclic)?;
        if chain.iter().any(|job| job.pr_number == pr) {
            return Err(cyclic());
        }
        Ok(())
    }

    /// Insert a new job for `pr` stacked on `base`.
    pub fn insert(&mut self, pr: PrNumber, base: BaseRef, now: DateTime<Utc>) -> Result<Job> {
        self.validate(pr, &base)?;

        let failed = self
            .failed_ancestor(&base)
            .map(|ancestor| ancestor.id.clone());
        let status = match (&failed, base.job().and_then(|id| self.jobs.get(id))) {
            (Some(_), _) => JobStatus::Cancelled,
            (None, None) => JobStatus::Pending,
            (None, Some(base_job)) if base_job.status == JobStatus::Success => JobStatus::Pending,
            (None, Some(_)) => JobStatus::Speculative,
        };

        let revision = {
            let revision = self.revisions.entry(pr).or_insert(0);
            *revision += 1;
            *revision
        };
        let id = JobId::for_attempt(pr, revision);
        if self.jobs.contains_key(&id) {
            return Err(Error::Internal(format!("duplicate job id {}", id)));
        }

        let mut job = Job::new(id.clone(), pr, base.clone(), revision, status, now);
        if let Some(ancestor) = failed {
            job.reason = Some(format!("ancestor {} failed", ancestor));
            job.finished_at = Some(now);
        }

        if let Some(base_id) = base.job() {
            self.children
                .entry(base_id.clone())
                .or_default()
                .push(id.clone());
        }
        self.positions.insert(id.clone(), self.order.len());
        self.order.push(id.clone());
        self.jobs.insert(id, job.clone());

        debug!(job_id = %job.id, pr = %pr, base = %base, status = %job.status, "Registered job");
        Ok(job)
    }

    /// Apply a status transition, validating it against the status machine.
    pub fn set_status(
        &mut self,
        id: &JobId,
        to: JobStatus,
        reason: Option<String>,
        now: DateTime<Utc>,
    ) -> Result<&Job> {
        let job = self
            .jobs
            .get_mut(id)
            .ok_or_else(|| Error::NotFound(id.clone()))?;
        job.transition(to, reason, now)?;
        Ok(&*job)
    }

    /// Stamp the end of a superseded run.
    pub fn finish_superseded(&mut self, id: &JobId, now: DateTime<Utc>) -> Result<&Job> {
        let job = self
            .jobs
            .get_mut(id)
            .ok_or_else(|| Error::NotFound(id.clone()))?;
        job.finish_superseded(now);
        Ok(&*job)
    }

    fn child_ids<'a>(&'a self, id: &JobId) -> impl Iterator<Item = &'a JobId> + use<'a> {
        self.children.get(id).into_iter().flatten()
    }
}

/// Thread-safe registry of every job submitted to this process.
#[derive(Debug, Default)]
pub struct JobRegistry {
    table: RwLock<JobTable>,
}

impl JobRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Run `f` against a consistent snapshot of the table.
    pub fn read<R>(&self, f: impl FnOnce(&JobTable) -> R) -> R {
        let table = self.table.read().unwrap_or_else(PoisonError::into_inner);
        f(&table)
    }

    /// Run `f` with exclusive access; everything it changes becomes visible at once.
    pub fn transaction<R>(&self, f: impl FnOnce(&mut JobTable) -> R) -> R {
        let mut table = self.table.write().unwrap_or_else(PoisonError::into_inner);
        f(&mut table)
    }

    pub fn validate(&self, pr: PrNumber, base: &BaseRef) -> Result<()> {
        self.read(|table| table.validate(pr, base))
    }

    pub fn create(&self, pr: PrNumber, base: BaseRef) -> Result<Job> {
        self.transaction(|table| table.insert(pr, base, Utc::now()))
    }

    pub fn get(&self, id: &JobId) -> Result<Job> {
        self.read(|table| table.job(id).cloned())
    }

    pub fn children(&self, id: &JobId) -> Vec<Job> {
        self.read(|table| table.children(id).cloned().collect())
    }

    pub fn descendants(&self, id: &JobId) -> Vec<Job> {
        self.read(|table| table.descendants(id).into_iter().cloned().collect())
    }

    pub fn update_status(
        &self,
        id: &JobId,
        status: JobStatus,
        reason: Option<String>,
    ) -> Result<Job> {
        self.transaction(|table| {
            table
                .set_status(id, status, reason, Utc::now())
                .map(Job::clone)
        })
    }

    /// Hand `id` to a worker. Succeeds for exactly one caller.
    pub fn start(&self, id: &JobId) -> Result<Job> {
        self.update_status(id, JobStatus::Running, None)
    }

    /// Put a failed job back to `Pending` for another attempt.
    pub fn requeue(&self, id: &JobId) -> Result<Job> {
        self.transaction(|table| {
            let base = table.job(id)?.base.clone();
            if let Some(ancestor) = table.failed_ancestor(&base) {
                return Err(Error::AncestorFailed {
                    id: id.clone(),
                    ancestor: ancestor.id.clone(),
                });
            }
            table
                .set_status(id, JobStatus::Pending, None, Utc::now())
                .map(Job::clone)
        })
    }

    /// Every job, ordered by creation.
    pub fn list_all(&self) -> Vec<Job> {
        self.read(|table| table.iter().cloned().collect())
    }

    pub fn len(&self) -> usize {
        self.read(JobTable::len)
    }

    pub fn is_empty(&self) -> bool {
        self.read(JobTable::is_empty)
    }
}
