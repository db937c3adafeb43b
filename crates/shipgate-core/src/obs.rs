//! Structured observability hooks for attempt lifecycle events.
//!
//! This module provides:
//! - An attempt-scoped tracing span for instrumenting the state machine future
//! - Emission functions for key lifecycle events: start, transition, fault, finish
//!
//! Every event carries a stable `event = "..."` field so log pipelines can
//! filter on it. For JSON output, pass `json = true` to
//! [`init_tracing`](crate::telemetry::init_tracing).

use tracing::{debug, error, info, warn};

use crate::domain::{DeploymentAttempt, Fault, HistoryEntry, Severity};

/// Span that scopes all logging for one attempt.
///
/// Attach it with `tracing::Instrument` rather than entering it, since the
/// attempt future crosses await points.
pub fn attempt_span(attempt: &DeploymentAttempt) -> tracing::Span {
    let d = attempt.descriptor();
    tracing::info_span!(
        "shipgate.attempt",
        attempt_id = %attempt.id(),
        revision = %d.short_revision(),
        environment = %d.environment,
    )
}

/// Emit event: attempt accepted by the controller.
pub fn emit_attempt_started(attempt: &DeploymentAttempt) {
    let d = attempt.descriptor();
    info!(
        event = "attempt.started",
        attempt_id = %attempt.id(),
        artifact = %d.artifact,
        build = %d.build,
        descriptor_digest = %d.digest(),
    );
}

/// Emit event: state transition appended to history.
pub fn emit_transition(attempt: &DeploymentAttempt, entry: &HistoryEntry) {
    info!(
        event = "attempt.transition",
        attempt_id = %attempt.id(),
        from = %entry.from,
        to = %entry.to,
        note = entry.note.as_deref().unwrap_or(""),
    );
}

/// Emit event: adapter failure recorded on the attempt.
pub fn emit_fault(attempt: &DeploymentAttempt, fault: &Fault) {
    warn!(
        event = "attempt.fault",
        attempt_id = %attempt.id(),
        state = %fault.state,
        kind = %fault.kind,
        message = %fault.message,
    );
}

/// Emit event: attempt reached a terminal state.
///
/// Level follows outcome severity; critical outcomes log at `error!` with
/// `critical = true` and the backend handle.
pub fn emit_attempt_finished(attempt: &DeploymentAttempt, duration_ms: u64) {
    let Some(outcome) = attempt.terminal_outcome() else {
        return;
    };
    let state = outcome.state;
    let reason = outcome.reason.to_string();
    let transitions = attempt.history().len();
    match outcome.severity() {
        Severity::Info => info!(
            event = "attempt.finished",
            attempt_id = %attempt.id(),
            state = %state,
            reason = %reason,
            transitions,
            duration_ms,
        ),
        Severity::Warning => warn!(
            event = "attempt.finished",
            attempt_id = %attempt.id(),
            state = %state,
            reason = %reason,
            transitions,
            duration_ms,
        ),
        Severity::Error => error!(
            event = "attempt.finished",
            attempt_id = %attempt.id(),
            state = %state,
            reason = %reason,
            transitions,
            duration_ms,
        ),
        Severity::Critical => error!(
            event = "attempt.finished",
            attempt_id = %attempt.id(),
            state = %state,
            reason = %reason,
            transitions,
            duration_ms,
            critical = true,
            backend_handle = attempt.backend_handle().map(|h| h.as_str()).unwrap_or(""),
            "attempt needs operator attention; resource may still be running",
        ),
    }
}

/// Emit event: one status feed poll during Monitoring.
pub fn emit_poll(attempt_id: &str, poll: u32, result: &str) {
    debug!(event = "attempt.poll", attempt_id = %attempt_id, poll, result = %result);
}

/// Emit event: journal write failure (warning level).
pub fn emit_journal_write_failed(attempt_id: &str, kind: &str, error: &dyn std::fmt::Display) {
    warn!(
        event = "journal.write_failed",
        attempt_id = %attempt_id,
        record = %kind,
        error = %error,
    );
}
