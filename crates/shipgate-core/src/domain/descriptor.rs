//! Change descriptors: the unit of code a caller asks Shipgate to ship.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::domain::error::{GateError, Result};

/// CI coordinates the status feed is queried with.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct BuildRef {
    /// CI job name; folder jobs use `/` separators (`team/service`).
    pub job_id: String,
    /// Build number within the job.
    pub build_id: u64,
}

impl BuildRef {
    pub fn new(job_id: impl Into<String>, build_id: u64) -> Self {
        Self {
            job_id: job_id.into(),
            build_id,
        }
    }
}

impl std::fmt::Display for BuildRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}#{}", self.job_id, self.build_id)
    }
}

/// Immutable description of a change under evaluation.
///
/// Fields are public for construction from config files and JSON, but the
/// controller only ever reads them. Use [`ChangeDescriptor::validate`] (or
/// the validating [`ChangeDescriptor::new`]) before handing one to an
/// adapter that cannot cope with empty fields.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChangeDescriptor {
    /// Content reference, typically a container image (`registry/app:tag`).
    pub artifact: String,

    /// Source revision the artifact was built from.
    pub revision: String,

    /// Target environment (`staging`, `production`, ...).
    pub environment: String,

    /// Build whose CI status decides whether the deployment sticks.
    pub build: BuildRef,

    /// Free-form labels forwarded to adapters.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub labels: BTreeMap<String, String>,
}

impl ChangeDescriptor {
    /// Create a validated descriptor.
    pub fn new(
        artifact: impl Into<String>,
        revision: impl Into<String>,
        environment: impl Into<String>,
        build: BuildRef,
    ) -> Result<Self> {
        let descriptor = Self {
            artifact: artifact.into(),
            revision: revision.into(),
            environment: environment.into(),
            build,
            labels: BTreeMap::new(),
        };
        descriptor.validate()?;
        Ok(descriptor)
    }

    /// Attach a label.
    pub fn with_label(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.labels.insert(key.into(), value.into());
        self
    }

    /// Reject descriptors with blank required fields.
    pub fn validate(&self) -> Result<()> {
        let required = [
            ("artifact", &self.artifact),
            ("revision", &self.revision),
            ("environment", &self.environment),
            ("build.job_id", &self.build.job_id),
        ];
        for (field, value) in required {
            if value.trim().is_empty() {
                return Err(GateError::InvalidDescriptor(format!(
                    "{field} must not be empty"
                )));
            }
        }
        Ok(())
    }

    /// SHA-256 hex digest of the descriptor's JSON form.
    ///
    /// Struct fields serialize in declaration order and labels are a
    /// `BTreeMap`, so equal descriptors always hash equal.
    pub fn digest(&self) -> String {
        let bytes = serde_json::to_vec(self).unwrap_or_default();
        let mut hasher = Sha256::new();
        hasher.update(&bytes);
        hex::encode(hasher.finalize())
    }

    /// Short revision for log lines (first 12 chars).
    pub fn short_revision(&self) -> &str {
        let end = self
            .revision
            .char_indices()
            .nth(12)
            .map(|(i, _)| i)
            .unwrap_or(self.revision.len());
        &self.revision[..end]
    }
}
