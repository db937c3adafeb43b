//! Adapter trait definitions for Shipgate
//!
//! These traits are the only way the state machine touches the outside world:
//! - `RiskScorer`: Black-box risk model (descriptor -> score)
//! - `DeploymentBackend`: Execution backend (create/start/stop/status)
//! - `StatusFeed`: Read-only CI build status
//!
//! All traits are async and backend-agnostic. In-memory fakes are provided
//! for testing via the `fakes` module; real implementations live in the
//! `shipgate-adapters` crate.
//!
//! Implementations are shared across concurrently running attempts, so they
//! must be `Send + Sync` and must not let calls for distinct attempt ids or
//! handles interfere with each other.

use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::domain::{
    AttemptId, BackendError, BackendHandle, BuildRef, BuildStatus, ChangeDescriptor,
    RiskAssessment, ScorerError,
};

// ---------------------------------------------------------------------------
// RiskScorer
// ---------------------------------------------------------------------------

/// Risk model wrapper.
///
/// Guarantees:
/// - A returned assessment always carries a finite score in `[0, 1]`.
/// - Malformed descriptors fail with `ScorerError::InvalidInput`.
/// - Transport/model failures fail with `ScorerError::Unavailable` and are
///   not retried inside the adapter.
#[async_trait]
pub trait RiskScorer: Send + Sync {
    async fn score(&self, descriptor: &ChangeDescriptor) -> Result<RiskAssessment, ScorerError>;
}

// ---------------------------------------------------------------------------
// DeploymentBackend
// ---------------------------------------------------------------------------

/// Observed state of a backend resource.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackendStatus {
    Unknown,
    Starting,
    Running,
    Stopped,
    Errored,
}

/// Execution backend wrapper.
///
/// Guarantees:
/// - `create` is idempotent per `attempt_id`: repeated calls return the same
///   handle and never create a second resource.
/// - `stop` succeeds for resources that were never started, only partially
///   started, already stopped, or no longer exist.
/// - `status` never fails; an unreachable backend reports `Unknown`.
#[async_trait]
pub trait DeploymentBackend: Send + Sync {
    async fn create(
        &self,
        attempt_id: AttemptId,
        descriptor: &ChangeDescriptor,
    ) -> Result<BackendHandle, BackendError>;

    async fn start(&self, handle: &BackendHandle) -> Result<(), BackendError>;

    async fn stop(&self, handle: &BackendHandle) -> Result<(), BackendError>;

    async fn status(&self, handle: &BackendHandle) -> BackendStatus;
}

// ---------------------------------------------------------------------------
// StatusFeed
// ---------------------------------------------------------------------------

/// CI build status source.
///
/// `latest` is a non-blocking read; a build the feed knows nothing about
/// yet yields `Running` or `Unknown`, never an error.
#[async_trait]
pub trait StatusFeed: Send + Sync {
    async fn latest(&self, build: &BuildRef) -> BuildStatus;
}

// ---------------------------------------------------------------------------
// Adapter bundle
// ---------------------------------------------------------------------------

/// The three adapters one controller drives, shared by every attempt.
#[derive(Clone)]
pub struct Adapters {
    pub scorer: Arc<dyn RiskScorer>,
    pub backend: Arc<dyn DeploymentBackend>,
    pub feed: Arc<dyn StatusFeed>,
}

impl Adapters {
    pub fn new(
        scorer: Arc<dyn RiskScorer>,
        backend: Arc<dyn DeploymentBackend>,
        feed: Arc<dyn StatusFeed>,
    ) -> Self {
        Self {
            scorer,
            backend,
            feed,
        }
    }
}

impl std::fmt::Debug for Adapters {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Adapters").finish_non_exhaustive()
    }
}
