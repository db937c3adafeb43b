//! Build status snapshots read from the CI feed.

use serde::{Deserialize, Serialize};

use crate::domain::descriptor::BuildRef;

/// Result of a CI build as last reported.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BuildResult {
    Running,
    Success,
    Failure,
    Unknown,
}

impl BuildResult {
    /// `Success` and `Failure` end monitoring; the rest keep polling.
    pub fn is_terminal(&self) -> bool {
        matches!(self, BuildResult::Success | BuildResult::Failure)
    }
}

/// Read-only snapshot supplied by a [`StatusFeed`](crate::adapters::StatusFeed).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BuildStatus {
    pub job_id: String,
    pub build_id: u64,
    pub result: BuildResult,
}

impl BuildStatus {
    pub fn new(build: &BuildRef, result: BuildResult) -> Self {
        Self {
            job_id: build.job_id.clone(),
            build_id: build.build_id,
            result,
        }
    }

    /// Snapshot used when the feed has nothing for this build yet.
    pub fn unknown(build: &BuildRef) -> Self {
        Self::new(build, BuildResult::Unknown)
    }
}
