//! Error taxonomy for Shipgate.
//!
//! Adapter failures (`ScorerError`, `BackendError`) never escape the
//! controller: the state machine folds them into the attempt record.
//! `GateError` covers everything around the loop (config, journal, input).

use serde::{Deserialize, Serialize};

use crate::domain::attempt::AttemptState;

/// Failure reported by a [`RiskScorer`](crate::adapters::RiskScorer).
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ScorerError {
    /// The descriptor was rejected; retrying will not help.
    #[error("invalid input: {0}")]
    InvalidInput(String),

    /// Transport or model failure; the caller may retry.
    #[error("scorer unavailable: {0}")]
    Unavailable(String),
}

impl ScorerError {
    pub fn kind(&self) -> FaultKind {
        match self {
            ScorerError::InvalidInput(_) => FaultKind::InvalidInput,
            ScorerError::Unavailable(_) => FaultKind::ScorerUnavailable,
        }
    }
}

/// Failure reported by a [`DeploymentBackend`](crate::adapters::DeploymentBackend).
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum BackendError {
    #[error("backend create failed: {0}")]
    CreateFailed(String),

    #[error("backend start failed: {0}")]
    StartFailed(String),

    #[error("backend stop failed: {0}")]
    StopFailed(String),
}

impl BackendError {
    pub fn kind(&self) -> FaultKind {
        match self {
            BackendError::CreateFailed(_) => FaultKind::BackendCreateFailed,
            BackendError::StartFailed(_) => FaultKind::BackendStartFailed,
            BackendError::StopFailed(_) => FaultKind::RollbackFailed,
        }
    }

    /// The adapter's own message, without the variant prefix.
    pub fn message(&self) -> &str {
        match self {
            BackendError::CreateFailed(m)
            | BackendError::StartFailed(m)
            | BackendError::StopFailed(m) => m,
        }
    }
}

/// Classification of an adapter failure recorded on an attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FaultKind {
    InvalidInput,
    ScorerUnavailable,
    BackendCreateFailed,
    BackendStartFailed,
    RollbackFailed,
}

impl FaultKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            FaultKind::InvalidInput => "invalid_input",
            FaultKind::ScorerUnavailable => "scorer_unavailable",
            FaultKind::BackendCreateFailed => "backend_create_failed",
            FaultKind::BackendStartFailed => "backend_start_failed",
            FaultKind::RollbackFailed => "rollback_failed",
        }
    }

    /// Whether the state machine may retry the call that produced this fault.
    pub fn is_transient(&self) -> bool {
        matches!(self, FaultKind::ScorerUnavailable)
    }
}

impl std::fmt::Display for FaultKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Shipgate errors outside the attempt loop.
#[derive(Debug, thiserror::Error)]
pub enum GateError {
    #[error("invalid change descriptor: {0}")]
    InvalidDescriptor(String),

    #[error("invalid config: {0}")]
    InvalidConfig(String),

    #[error("invalid risk score: {0}")]
    InvalidScore(String),

    #[error("illegal transition {from} -> {to}")]
    IllegalTransition { from: AttemptState, to: AttemptState },

    #[error("terminal outcome already set for attempt {0}")]
    OutcomeAlreadySet(uuid::Uuid),

    #[error("journal error: {0}")]
    Journal(String),

    #[error("attempt task failed: {0}")]
    TaskFailed(String),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type for Shipgate operations.
pub type Result<T> = std::result::Result<T, GateError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn scorer_error_kinds() {
        assert_eq!(
            ScorerError::InvalidInput("empty".into()).kind(),
            FaultKind::InvalidInput
        );
        assert_eq!(
            ScorerError::Unavailable("503".into()).kind(),
            FaultKind::ScorerUnavailable
        );
    }

    #[test]
    fn only_scorer_unavailable_is_transient() {
        assert!(FaultKind::ScorerUnavailable.is_transient());
        assert!(!FaultKind::InvalidInput.is_transient());
        assert!(!FaultKind::BackendStartFailed.is_transient());
        assert!(!FaultKind::RollbackFailed.is_transient());
    }

    #[test]
    fn stop_failure_maps_to_rollback_failed() {
        let err = BackendError::StopFailed("daemon gone".into());
        assert_eq!(err.kind(), FaultKind::RollbackFailed);
        assert_eq!(err.message(), "daemon gone");
        assert!(err.to_string().contains("backend stop failed"));
    }

    #[test]
    fn illegal_transition_display() {
        let err = GateError::IllegalTransition {
            from: AttemptState::Succeeded,
            to: AttemptState::Deploying,
        };
        assert_eq!(err.to_string(), "illegal transition succeeded -> deploying");
    }
}
