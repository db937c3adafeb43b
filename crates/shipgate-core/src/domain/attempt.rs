//! Deployment attempts and their lifecycle record.
//!
//! A [`DeploymentAttempt`] is mutated only by the state machine driving it.
//! Its fields are private so the invariants hold for every holder:
//!
//! - `state` only moves along [`AttemptState::can_transition_to`].
//! - `history` and `faults` are append-only.
//! - `terminal_outcome` is set exactly once, together with the final
//!   transition into a terminal state.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::domain::assessment::RiskAssessment;
use crate::domain::descriptor::ChangeDescriptor;
use crate::domain::error::{FaultKind, GateError, Result};

/// Unique identifier of one attempt. Never reused.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct AttemptId(pub Uuid);

impl AttemptId {
    pub fn new() -> Self {
        AttemptId(Uuid::new_v4())
    }

    /// First 8 hex chars, for resource names and log lines.
    pub fn short(&self) -> String {
        self.0.simple().to_string()[..8].to_string()
    }
}

impl Default for AttemptId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for AttemptId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Opaque resource id returned by the execution backend.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct BackendHandle(pub String);

impl BackendHandle {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for BackendHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Lifecycle state of an attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AttemptState {
    Pending,
    Analyzing,
    Deploying,
    Monitoring,
    /// Internal sub-state between a detected failure and `stop` returning.
    RollingBack,
    Succeeded,
    RolledBack,
    Aborted,
    Failed,
}

impl AttemptState {
    pub fn as_str(&self) -> &'static str {
        match self {
            AttemptState::Pending => "pending",
            AttemptState::Analyzing => "analyzing",
            AttemptState::Deploying => "deploying",
            AttemptState::Monitoring => "monitoring",
            AttemptState::RollingBack => "rolling_back",
            AttemptState::Succeeded => "succeeded",
            AttemptState::RolledBack => "rolled_back",
            AttemptState::Aborted => "aborted",
            AttemptState::Failed => "failed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            AttemptState::Succeeded
                | AttemptState::RolledBack
                | AttemptState::Aborted
                | AttemptState::Failed
        )
    }

    /// Whether a backend resource may exist while in this state.
    pub fn may_hold_resource(&self) -> bool {
        matches!(
            self,
            AttemptState::Deploying | AttemptState::Monitoring | AttemptState::RollingBack
        )
    }

    /// Forward-only transition table.
    ///
    /// `Failed` is reachable from every non-terminal state so an unexpected
    /// condition can always be closed out.
    pub fn can_transition_to(&self, next: AttemptState) -> bool {
        use AttemptState::*;
        if self.is_terminal() {
            return false;
        }
        if next == Failed {
            return true;
        }
        matches!(
            (self, next),
            (Pending, Analyzing)
                | (Pending, Aborted)
                | (Analyzing, Aborted)
                | (Analyzing, Deploying)
                | (Deploying, Monitoring)
                | (Deploying, RollingBack)
                | (Monitoring, Succeeded)
                | (Monitoring, RollingBack)
                | (RollingBack, RolledBack)
        )
    }
}

impl std::fmt::Display for AttemptState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// An adapter failure, stamped with the state it happened in.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Fault {
    pub state: AttemptState,
    pub kind: FaultKind,
    pub message: String,
    pub at: DateTime<Utc>,
}

impl Fault {
    pub fn new(state: AttemptState, kind: FaultKind, message: impl Into<String>) -> Self {
        Self {
            state,
            kind,
            message: message.into(),
            at: Utc::now(),
        }
    }
}

/// One recorded state transition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HistoryEntry {
    pub from: AttemptState,
    pub to: AttemptState,
    pub at: DateTime<Utc>,
    /// Adapter failure that caused this transition, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fault: Option<Fault>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub note: Option<String>,
}

/// Why a deployment was rolled back.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum RollbackTrigger {
    /// The status feed reported a failed build.
    BuildFailed,
    /// The backend reported the resource as errored.
    BackendErrored,
    /// No terminal build status arrived within the monitoring window.
    MonitoringTimeout { waited_ms: u64 },
    /// Cancellation requested after the deployment had begun.
    Cancelled,
}

impl std::fmt::Display for RollbackTrigger {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RollbackTrigger::BuildFailed => f.write_str("build failed"),
            RollbackTrigger::BackendErrored => f.write_str("backend reported errored"),
            RollbackTrigger::MonitoringTimeout { waited_ms } => {
                write!(f, "no terminal build status after {waited_ms}ms")
            }
            RollbackTrigger::Cancelled => f.write_str("cancelled while deployed"),
        }
    }
}

/// Structured reason attached to the terminal outcome.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "reason", rename_all = "snake_case")]
pub enum OutcomeReason {
    Deployed,
    RiskAboveThreshold { score: f64, threshold: f64 },
    Cancelled { during: AttemptState },
    InvalidInput { message: String },
    ScorerExhausted { calls: u32, last_error: String },
    BackendCreateFailed { message: String },
    BackendStartFailed { message: String },
    Reverted { trigger: RollbackTrigger },
    RollbackFailed { trigger: RollbackTrigger, message: String },
    /// The machine hit a condition its own transition table rules out.
    Internal { message: String },
}

impl OutcomeReason {
    pub fn severity(&self) -> Severity {
        match self {
            OutcomeReason::Deployed => Severity::Info,
            OutcomeReason::RiskAboveThreshold { .. } | OutcomeReason::Cancelled { .. } => {
                Severity::Warning
            }
            OutcomeReason::Reverted { .. } => Severity::Warning,
            OutcomeReason::InvalidInput { .. }
            | OutcomeReason::ScorerExhausted { .. }
            | OutcomeReason::BackendCreateFailed { .. }
            | OutcomeReason::BackendStartFailed { .. } => Severity::Error,
            OutcomeReason::RollbackFailed { .. } => Severity::Critical,
            OutcomeReason::Internal { .. } => Severity::Critical,
        }
    }
}

impl std::fmt::Display for OutcomeReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            OutcomeReason::Deployed => f.write_str("deployed"),
            OutcomeReason::RiskAboveThreshold { score, threshold } => {
                write!(f, "risk score {score:.3} above threshold {threshold:.3}")
            }
            OutcomeReason::Cancelled { during } => write!(f, "cancelled during {during}"),
            OutcomeReason::InvalidInput { message } => write!(f, "invalid input: {message}"),
            OutcomeReason::ScorerExhausted { calls, last_error } => {
                write!(f, "scorer unavailable after {calls} calls: {last_error}")
            }
            OutcomeReason::BackendCreateFailed { message } => {
                write!(f, "backend create failed: {message}")
            }
            OutcomeReason::BackendStartFailed { message } => {
                write!(f, "backend start failed: {message}")
            }
            OutcomeReason::Reverted { trigger } => write!(f, "rolled back: {trigger}"),
            OutcomeReason::RollbackFailed { trigger, message } => {
                write!(f, "rollback after '{trigger}' failed: {message}")
            }
            OutcomeReason::Internal { message } => write!(f, "internal error: {message}"),
        }
    }
}

/// How loudly an outcome should be surfaced.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Info,
    Warning,
    Error,
    /// A resource may still be running in an unknown state.
    Critical,
}

/// Final result of an attempt, set once on entering a terminal state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TerminalOutcome {
    pub state: AttemptState,
    pub reason: OutcomeReason,
    pub at: DateTime<Utc>,
}

impl TerminalOutcome {
    pub fn severity(&self) -> Severity {
        self.reason.severity()
    }

    pub fn is_success(&self) -> bool {
        self.state == AttemptState::Succeeded
    }

    /// Rollback itself failed; operators must inspect the resource.
    pub fn is_rollback_failure(&self) -> bool {
        matches!(self.reason, OutcomeReason::RollbackFailed { .. })
    }

    /// `start` failed after `create` returned a resource; stop was never called.
    pub fn is_start_failure(&self) -> bool {
        matches!(self.reason, OutcomeReason::BackendStartFailed { .. })
    }
}

/// The central aggregate: one end-to-end gating/deploy/monitor attempt.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeploymentAttempt {
    id: AttemptId,
    descriptor: ChangeDescriptor,
    state: AttemptState,
    created_at: DateTime<Utc>,
    #[serde(default)]
    assessment: Option<RiskAssessment>,
    #[serde(default)]
    backend_handle: Option<BackendHandle>,
    #[serde(default)]
    history: Vec<HistoryEntry>,
    #[serde(default)]
    faults: Vec<Fault>,
    #[serde(default)]
    terminal_outcome: Option<TerminalOutcome>,
}

impl DeploymentAttempt {
    /// New attempt in `Pending` with a fresh id.
    pub fn new(descriptor: ChangeDescriptor) -> Self {
        Self::with_id(AttemptId::new(), descriptor)
    }

    pub fn with_id(id: AttemptId, descriptor: ChangeDescriptor) -> Self {
        Self {
            id,
            descriptor,
            state: AttemptState::Pending,
            created_at: Utc::now(),
            assessment: None,
            backend_handle: None,
            history: Vec::new(),
            faults: Vec::new(),
            terminal_outcome: None,
        }
    }

    pub fn id(&self) -> AttemptId {
        self.id
    }

    pub fn descriptor(&self) -> &ChangeDescriptor {
        &self.descriptor
    }

    pub fn state(&self) -> AttemptState {
        self.state
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    pub fn assessment(&self) -> Option<&RiskAssessment> {
        self.assessment.as_ref()
    }

    pub fn backend_handle(&self) -> Option<&BackendHandle> {
        self.backend_handle.as_ref()
    }

    pub fn history(&self) -> &[HistoryEntry] {
        &self.history
    }

    pub fn faults(&self) -> &[Fault] {
        &self.faults
    }

    pub fn terminal_outcome(&self) -> Option<&TerminalOutcome> {
        self.terminal_outcome.as_ref()
    }

    pub fn is_terminal(&self) -> bool {
        self.state.is_terminal()
    }

    pub(crate) fn set_assessment(&mut self, assessment: RiskAssessment) {
        self.assessment = Some(assessment);
    }

    pub(crate) fn set_backend_handle(&mut self, handle: BackendHandle) {
        self.backend_handle = Some(handle);
    }

    pub(crate) fn record_fault(&mut self, fault: Fault) {
        self.faults.push(fault);
    }

    /// Move to a non-terminal state, appending to history.
    pub(crate) fn advance(
        &mut self,
        to: AttemptState,
        fault: Option<Fault>,
        note: Option<String>,
    ) -> Result<&HistoryEntry> {
        if to.is_terminal() {
            return Err(GateError::IllegalTransition {
                from: self.state,
                to,
            });
        }
        self.push_transition(to, fault, note)
    }

    /// Move to a terminal state and set the outcome in the same step.
    pub(crate) fn finish(
        &mut self,
        to: AttemptState,
        reason: OutcomeReason,
        fault: Option<Fault>,
    ) -> Result<&HistoryEntry> {
        if !to.is_terminal() {
            return Err(GateError::IllegalTransition {
                from: self.state,
                to,
            });
        }
        if self.terminal_outcome.is_some() {
            return Err(GateError::OutcomeAlreadySet(self.id.0));
        }
        if !self.state.can_transition_to(to) {
            return Err(GateError::IllegalTransition {
                from: self.state,
                to,
            });
        }
        let note = Some(reason.to_string());
        let at = Utc::now();
        self.terminal_outcome = Some(TerminalOutcome { state: to, reason, at });
        self.push_transition(to, fault, note)
    }

    fn push_transition(
        &mut self,
        to: AttemptState,
        fault: Option<Fault>,
        note: Option<String>,
    ) -> Result<&HistoryEntry> {
        if !self.state.can_transition_to(to) {
            return Err(GateError::IllegalTransition {
                from: self.state,
                to,
            });
        }
        self.history.push(HistoryEntry {
            from: self.state,
            to,
            at: Utc::now(),
            fault,
            note,
        });
        self.state = to;
        let idx = self.history.len() - 1;
        Ok(&self.history[idx])
    }
}
