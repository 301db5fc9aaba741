//! Speculative merge-queue scheduling.
//!
//! Jobs are registered in an in-memory [`JobRegistry`], held in a bounded
//! [`AdmissionQueue`] until the [`SpeculationPolicy`] admits them, run by a
//! fixed [`WorkerPool`], and settled by the [`CascadeResolver`], which
//! promotes or cancels everything stacked on a finished job.

pub mod cascade;
pub mod policy;
pub mod queue;
pub mod registry;
pub mod scheduler;
pub mod worker;

#[cfg(test)]
pub(crate) mod testing;

pub use cascade::{CascadeResolver, Outcome, Settlement};
pub use policy::{Admission, SpeculationPolicy};
pub use queue::{AdmissionQueue, Slot};
pub use registry::{JobRegistry, JobTable};
pub use scheduler::{Scheduler, SchedulerConfig, SchedulerStats};
pub use worker::{ShutdownReport, Worker, WorkerContext, WorkerPool};
