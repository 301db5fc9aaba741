//! Executor capability.
//!
//! Executors run the CI validation for one pull request. The scheduler only
//! sees pass/fail; how the build actually runs is up to the implementation.

use async_trait::async_trait;

use crate::{PrNumber, Result};

/// Trait for CI executors.
///
/// Implementations must be safe to call concurrently for different PRs.
#[async_trait]
pub trait Executor: Send + Sync {
    /// Name of this executor.
    fn name(&self) -> &'static str;

    /// Validate a pull request.
    ///
    /// `Ok(true)` means the checks passed, `Ok(false)` that they failed.
    /// `Err` is reserved for infrastructure trouble (could not spawn, timed
    /// out, ...), which the scheduler records as a failed job.
    async fn execute(&self, pr: PrNumber) -> Result<bool>;
}
