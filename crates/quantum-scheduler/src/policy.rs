//! Speculation policy: how far a job may run ahead of unproven bases.

use quantum_core::{Job, JobId, JobStatus};
use serde::{Deserialize, Serialize};

use crate::registry::JobTable;

/// Result of evaluating a waiting job against the policy.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Admission {
    /// Every ancestor has succeeded (or the job sits on the trunk).
    Ready,
    /// May run now, betting on `depth` unresolved ancestors.
    Speculate { depth: usize },
    /// Too many unresolved ancestors; hold until some of them resolve.
    Deferred { depth: usize },
    /// An ancestor ended without passing; the job can never run.
    Blocked { ancestor: JobId },
}

impl Admission {
    pub fn is_admissible(&self) -> bool {
        matches!(self, Admission::Ready | Admission::Speculate { .. })
    }
}

/// Bounds the number of unproven assumptions a running job may rest on.
///
/// The speculation depth of a job is the number of ancestors between it and
/// the trunk that have not succeeded. With the default `max_depth` of 1 a job
/// may run while its direct base is still pending or running, but a job whose
/// base is itself speculative waits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SpeculationPolicy {
    pub max_depth: usize,
}

impl SpeculationPolicy {
    pub fn new(max_depth: usize) -> Self {
        Self { max_depth }
    }

    /// Never run ahead of an unresolved base.
    pub fn disabled() -> Self {
        Self { max_depth: 0 }
    }

    pub fn evaluate(&self, job: &Job, table: &JobTable) -> Admission {
        let Some(lineage) = table.lineage(&job.base) else {
            return Admission::Blocked {
                ancestor: job.id.clone(),
            };
        };

        if let Some(dead) = lineage.iter().rev().find(|a| a.status.is_dead()) {
            return Admission::Blocked {
                ancestor: dead.id.clone(),
            };
        }

        let depth = lineage
            .iter()
            .filter(|a| a.status != JobStatus::Success)
            .count();

        match depth {
            0 => Admission::Ready,
            d if d <= self.max_depth => Admission::Speculate { depth: d },
            d => Admission::Deferred { depth: d },
        }
    }

    pub fn admits(&self, job: &Job, table: &JobTable) -> bool {
        self.evaluate(job, table).is_admissible()
    }
}

impl Default for SpeculationPolicy {
    fn default() -> Self {
        Self { max_depth: 1 }
    }
}
