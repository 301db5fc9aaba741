//! Error types for quantum-merge.

use std::time::Duration;

use thiserror::Error;

use crate::id::{BaseRef, JobId, PrNumber};
use crate::job::JobStatus;

#[derive(Debug, Error)]
pub enum Error {
    #[error("job not found: {0}")]
    NotFound(JobId),

    #[error("unknown base job: {0}")]
    UnknownBase(JobId),

    #[error("cyclic dependency: PR {pr} cannot be stacked on {base}")]
    CyclicDependency { pr: PrNumber, base: BaseRef },

    #[error("admission queue full (capacity {capacity}, waited {waited:?})")]
    QueueFull { capacity: usize, waited: Duration },

    #[error("invalid transition for {id}: {from} -> {to}")]
    InvalidTransition {
        id: JobId,
        from: JobStatus,
        to: JobStatus,
    },

    #[error("cannot requeue {id}: ancestor {ancestor} failed")]
    AncestorFailed { id: JobId, ancestor: JobId },

    #[error("scheduler is shutting down")]
    ShuttingDown,

    #[error("execution failed: {0}")]
    ExecutionFailed(String),

    #[error("internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Errors the caller may resolve by retrying the same request later.
    pub fn is_transient(&self) -> bool {
        matches!(self, Error::QueueFull { .. })
    }
}

pub type Result<T> = std::result::Result<T, Error>;
