//! Identifiers for pull requests, jobs and their bases.

use derive_more::Display;
use serde::{Deserialize, Serialize};

/// A pull request number as reported by the source-control provider.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, Display,
)]
#[display("{_0}")]
#[serde(transparent)]
pub struct PrNumber(u64);

impl PrNumber {
    pub fn new(number: u64) -> Self {
        Self(number)
    }

    pub fn get(&self) -> u64 {
        self.0
    }
}

impl From<u64> for PrNumber {
    fn from(number: u64) -> Self {
        Self(number)
    }
}

/// Identifier of a job, unique for the lifetime of a registry.
///
/// Derived from the PR number and the attempt (revision) of that PR,
/// e.g. `pr-7-2` for the second submission of PR 7.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, Display)]
#[display("{_0}")]
#[serde(transparent)]
pub struct JobId(String);

impl JobId {
    pub fn for_attempt(pr: PrNumber, attempt: u32) -> Self {
        Self(format!("pr-{}-{}", pr, attempt))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<String> for JobId {
    fn from(id: String) -> Self {
        Self(id)
    }
}

impl From<&str> for JobId {
    fn from(id: &str) -> Self {
        Self(id.to_string())
    }
}

impl std::str::FromStr for JobId {
    type Err = std::convert::Infallible;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        Ok(Self(s.to_string()))
    }
}

/// What a job is stacked on: the trunk, or another job still in the registry.
///
/// Serialized as `null` for the trunk and as the job id otherwise.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(from = "Option<JobId>", into = "Option<JobId>")]
pub enum BaseRef {
    #[default]
    Trunk,
    Job(JobId),
}

impl BaseRef {
    pub fn is_trunk(&self) -> bool {
        matches!(self, BaseRef::Trunk)
    }

    pub fn job(&self) -> Option<&JobId> {
        match self {
            BaseRef::Trunk => None,
            BaseRef::Job(id) => Some(id),
        }
    }
}

impl std::fmt::Display for BaseRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            BaseRef::Trunk => write!(f, "trunk"),
            BaseRef::Job(id) => write!(f, "{}", id),
        }
    }
}

impl From<Option<JobId>> for BaseRef {
    fn from(id: Option<JobId>) -> Self {
        id.map_or(BaseRef::Trunk, BaseRef::Job)
    }
}

impl From<BaseRef> for Option<JobId> {
    fn from(base: BaseRef) -> Self {
        match base {
            BaseRef::Trunk => None,
            BaseRef::Job(id) => Some(id),
        }
    }
}

impl From<JobId> for BaseRef {
    fn from(id: JobId) -> Self {
        BaseRef::Job(id)
    }
}
