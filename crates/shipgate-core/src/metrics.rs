//! Global atomic counters for Shipgate observability.
//!
//! Counters are incremented silently at the call site. Call
//! [`Metrics::flush`] to emit current values as a single
//! `tracing::info!` event (e.g. when the CLI exits).

use std::sync::atomic::{AtomicU64, Ordering};

use crate::domain::{AttemptState, TerminalOutcome};

/// Global metrics singleton.
pub static METRICS: Metrics = Metrics::new();

/// Lightweight atomic counters. No allocations and no locking.
pub struct Metrics {
    attempts_started: AtomicU64,
    attempts_succeeded: AtomicU64,
    attempts_aborted: AtomicU64,
    attempts_rolled_back: AtomicU64,
    attempts_failed: AtomicU64,
    rollback_failures: AtomicU64,
    scorer_retries: AtomicU64,
    status_polls: AtomicU64,
    journal_write_failures: AtomicU64,
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

impl Metrics {
    pub const fn new() -> Self {
        Self {
            attempts_started: AtomicU64::new(0),
            attempts_succeeded: AtomicU64::new(0),
            attempts_aborted: AtomicU64::new(0),
            attempts_rolled_back: AtomicU64::new(0),
            attempts_failed: AtomicU64::new(0),
            rollback_failures: AtomicU64::new(0),
            scorer_retries: AtomicU64::new(0),
            status_polls: AtomicU64::new(0),
            journal_write_failures: AtomicU64::new(0),
        }
    }

    pub fn inc_attempts_started(&self) {
        self.attempts_started.fetch_add(1, Ordering::Relaxed);
    }

    /// Count a terminal outcome under its state (and as a rollback failure
    /// when applicable).
    pub fn record_outcome(&self, outcome: &TerminalOutcome) {
        let counter = match outcome.state {
            AttemptState::Succeeded => &self.attempts_succeeded,
            AttemptState::Aborted => &self.attempts_aborted,
            AttemptState::RolledBack => &self.attempts_rolled_back,
            _ => &self.attempts_failed,
        };
        counter.fetch_add(1, Ordering::Relaxed);
        if outcome.is_rollback_failure() {
            self.rollback_failures.fetch_add(1, Ordering::Relaxed);
        }
        tracing::trace!(metric = "outcome", state = %outcome.state, "counter incremented");
    }

    pub fn inc_scorer_retries(&self) {
        self.scorer_retries.fetch_add(1, Ordering::Relaxed);
        tracing::trace!(metric = "scorer_retries", "counter incremented");
    }

    pub fn inc_status_polls(&self) {
        self.status_polls.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_journal_write_failures(&self) {
        self.journal_write_failures.fetch_add(1, Ordering::Relaxed);
    }

    /// Emit all current counter values as a single `info!` event.
    pub fn flush(&self) {
        tracing::info!(
            metric = "flush",
            attempts_started = self.attempts_started(),
            attempts_succeeded = self.attempts_succeeded(),
            attempts_aborted = self.attempts_aborted(),
            attempts_rolled_back = self.attempts_rolled_back(),
            attempts_failed = self.attempts_failed(),
            rollback_failures = self.rollback_failures(),
            scorer_retries = self.scorer_retries(),
            status_polls = self.status_polls(),
            journal_write_failures = self.journal_write_failures(),
        );
    }

    pub fn attempts_started(&self) -> u64 {
        self.attempts_started.load(Ordering::Relaxed)
    }

    pub fn attempts_succeeded(&self) -> u64 {
        self.attempts_succeeded.load(Ordering::Relaxed)
    }

    pub fn attempts_aborted(&self) -> u64 {
        self.attempts_aborted.load(Ordering::Relaxed)
    }

    pub fn attempts_rolled_back(&self) -> u64 {
        self.attempts_rolled_back.load(Ordering::Relaxed)
    }

    pub fn attempts_failed(&self) -> u64 {
        self.attempts_failed.load(Ordering::Relaxed)
    }

    pub fn rollback_failures(&self) -> u64 {
        self.rollback_failures.load(Ordering::Relaxed)
    }

    pub fn scorer_retries(&self) -> u64 {
        self.scorer_retries.load(Ordering::Relaxed)
    }

    pub fn status_polls(&self) -> u64 {
        self.status_polls.load(Ordering::Relaxed)
    }

    pub fn journal_write_failures(&self) -> u64 {
        self.journal_write_failures.load(Ordering::Relaxed)
    }

    /// Reset all counters to zero (useful in tests).
    pub fn reset(&self) {
        for counter in [
            &self.attempts_started,
            &self.attempts_succeeded,
            &self.attempts_aborted,
            &self.attempts_rolled_back,
            &self.attempts_failed,
            &self.rollback_failures,
            &self.scorer_retries,
            &self.status_polls,
            &self.journal_write_failures,
        ] {
            counter.store(0, Ordering::Relaxed);
        }
    }
}
