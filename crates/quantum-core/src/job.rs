//! Job records and their status machine.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::id::{BaseRef, JobId, PrNumber};
use crate::{Error, Result};

/// Status of a validation job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum JobStatus {
    /// Waiting for a worker; its base has passed or it builds on trunk.
    Pending,
    /// Stacked on a base that has not succeeded yet.
    Speculative,
    /// Held by exactly one worker.
    Running,
    Success,
    Failed,
    /// Dropped before it started because an ancestor failed.
    Cancelled,
    /// Was running when an ancestor failed; its result is discarded.
    Superseded,
}

impl JobStatus {
    pub const ALL: [JobStatus; 7] = [
        JobStatus::Pending,
        JobStatus::Speculative,
        JobStatus::Running,
        JobStatus::Success,
        JobStatus::Failed,
        JobStatus::Cancelled,
        JobStatus::Superseded,
    ];

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            JobStatus::Success | JobStatus::Failed | JobStatus::Cancelled | JobStatus::Superseded
        )
    }

    /// Terminal without a passing result. Dependents of such a job can never run.
    pub fn is_dead(&self) -> bool {
        matches!(
            self,
            JobStatus::Failed | JobStatus::Cancelled | JobStatus::Superseded
        )
    }

    /// Still waiting to be handed to a worker.
    pub fn is_waiting(&self) -> bool {
        matches!(self, JobStatus::Pending | JobStatus::Speculative)
    }

    pub fn can_transition_to(&self, to: JobStatus) -> bool {
        use JobStatus::*;
        matches!(
            (self, to),
            (Speculative, Pending | Running | Cancelled)
                | (Pending, Running | Cancelled)
                | (Running, Success | Failed | Superseded)
                | (Failed, Pending)
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Pending => "PENDING",
            JobStatus::Speculative => "SPECULATIVE",
            JobStatus::Running => "RUNNING",
            JobStatus::Success => "SUCCESS",
            JobStatus::Failed => "FAILED",
            JobStatus::Cancelled => "CANCELLED",
            JobStatus::Superseded => "SUPERSEDED",
        }
    }
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A scheduled validation of one pull request revision.
#[derive(Debug, Clone, PartialEq)]
pub struct Job {
    pub id: JobId,
    pub pr_number: PrNumber,
    pub base: BaseRef,
    pub status: JobStatus,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub attempt: u32,
    pub reason: Option<String>,
}

impl Job {
    pub fn new(
        id: JobId,
        pr_number: PrNumber,
        base: BaseRef,
        attempt: u32,
        status: JobStatus,
        created_at: DateTime<Utc>,
    ) -> Self {
        Self {
            id,
            pr_number,
            base,
            status,
            created_at,
            started_at: None,
            finished_at: None,
            attempt,
            reason: None,
        }
    }

    /// Move to `to`, stamping timestamps along the way.
    ///
    /// `Superseded` does not stamp `finished_at`: the run is still in flight
    /// and [`Job::finish_superseded`] records the end once the worker returns.
    pub fn transition(
        &mut self,
        to: JobStatus,
        reason: Option<String>,
        now: DateTime<Utc>,
    ) -> Result<()> {
        if !self.status.can_transition_to(to) {
            return Err(Error::InvalidTransition {
                id: self.id.clone(),
                from: self.status,
                to,
            });
        }

        match to {
            JobStatus::Running => {
                self.started_at = Some(now.max(self.created_at));
            }
            JobStatus::Success | JobStatus::Failed | JobStatus::Cancelled => {
                let floor = self.started_at.unwrap_or(self.created_at);
                self.finished_at = Some(now.max(floor));
            }
            JobStatus::Pending if self.status == JobStatus::Failed => {
                self.attempt += 1;
                self.started_at = None;
                self.finished_at = None;
            }
            _ => {}
        }

        self.status = to;
        self.reason = reason;
        Ok(())
    }

    /// Record the end of a run whose result was discarded by a cascade.
    pub fn finish_superseded(&mut self, now: DateTime<Utc>) {
        if self.status == JobStatus::Superseded && self.finished_at.is_none() {
            let floor = self.started_at.unwrap_or(self.created_at);
            self.finished_at = Some(now.max(floor));
        }
    }

    pub fn view(&self) -> JobView {
        JobView::from(self)
    }
}

/// Read-only snapshot of a job, as served to the query side.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobView {
    pub id: JobId,
    pub pr_number: PrNumber,
    pub base: BaseRef,
    pub status: JobStatus,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub attempt: u32,
    pub reason: Option<String>,
}

impl From<&Job> for JobView {
    fn from(job: &Job) -> Self {
        Self {
            id: job.id.clone(),
            pr_number: job.pr_number,
            base: job.base.clone(),
            status: job.status,
            created_at: job.created_at,
            started_at: job.started_at,
            finished_at: job.finished_at,
            attempt: job.attempt,
            reason: job.reason.clone(),
        }
    }
}

impl From<Job> for JobView {
    fn from(job: Job) -> Self {
        Self::from(&job)
    }
}
