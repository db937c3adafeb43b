//! Shipgate Core Library
//!
//! Risk-gated deployment controller: scores a change, deploys it through an
//! execution backend, watches its CI build and rolls it back on failure.

pub mod adapters;
pub mod config;
pub mod controller;
pub mod domain;
pub mod fakes;
pub mod journal;
pub mod machine;
pub mod metrics;
pub mod obs;
pub mod telemetry;

pub use adapters::{Adapters, BackendStatus, DeploymentBackend, RiskScorer, StatusFeed};
pub use config::GateConfig;
pub use controller::{AttemptHandle, PipelineController};
pub use domain::{
    AttemptId, AttemptState, BackendError, BackendHandle, BuildRef, BuildResult, BuildStatus,
    ChangeDescriptor, DeploymentAttempt, Fault, FaultKind, GateError, HistoryEntry,
    OutcomeReason, Result, RiskAssessment, RollbackTrigger, ScorerError, Severity,
    TerminalOutcome,
};
pub use journal::{
    read_jsonl, recovery_points, AttemptJournal, JournalRecord, JsonlJournal, MemoryJournal,
    NullJournal, RecoveryPoint,
};
pub use machine::{AttemptMachine, Step};

pub use metrics::METRICS;
pub use telemetry::init_tracing;

/// Shipgate version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
