//! Domain models for Shipgate.
//!
//! Canonical definitions for the core entities:
//! - `ChangeDescriptor`: Immutable description of a change to ship
//! - `RiskAssessment`: Validated score from the risk model
//! - `DeploymentAttempt`: One gating/deploy/monitor/rollback attempt
//! - `BuildStatus`: Snapshot from the CI status feed

pub mod assessment;
pub mod attempt;
pub mod build;
pub mod descriptor;
pub mod error;

pub use assessment::RiskAssessment;
pub use attempt::{
    AttemptId, AttemptState, BackendHandle, DeploymentAttempt, Fault, HistoryEntry,
    OutcomeReason, RollbackTrigger, Severity, TerminalOutcome,
};
pub use build::{BuildResult, BuildStatus};
pub use descriptor::{BuildRef, ChangeDescriptor};
pub use error::{BackendError, FaultKind, GateError, Result, ScorerError};
