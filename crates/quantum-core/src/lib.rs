//! Core domain types and traits for the quantum-merge scheduler.
//!
//! This crate contains:
//! - Job and pull-request identifiers
//! - The job record, its status machine and read-only views
//! - The executor capability the scheduler drives
//! - The shared error type

pub mod error;
pub mod executor;
pub mod id;
pub mod job;

pub use error::{Error, Result};
pub use executor::Executor;
pub use id::{BaseRef, JobId, PrNumber};
pub use job::{Job, JobStatus, JobView};
