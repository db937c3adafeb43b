//! Deployment state machine: drives one attempt to a terminal state.
//!
//! The machine owns a single [`DeploymentAttempt`] and moves it through
//! Pending → Analyzing → Deploying → Monitoring → {Succeeded, RolledBack,
//! Aborted, Failed}, with RollingBack between a detected failure and the
//! backend `stop` call.
//!
//! Every state handler returns a [`Step`]; [`AttemptMachine::drive`]
//! applies it to the attempt and writes it to the journal before the
//! handler for the next state makes any adapter call.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use crate::adapters::{Adapters, BackendStatus};
use crate::config::GateConfig;
use crate::domain::{
    AttemptState, BackendError, BuildResult, DeploymentAttempt, Fault, FaultKind,
    OutcomeReason, RollbackTrigger, ScorerError,
};
use crate::journal::{AttemptJournal, JournalRecord};
use crate::metrics::METRICS;
use crate::obs;

/// Decision produced by one state handler.
#[derive(Debug, Clone, PartialEq)]
pub enum Step {
    /// Move to a non-terminal state.
    Advance {
        to: AttemptState,
        note: Option<String>,
    },
    /// Move to RollingBack for the given reason.
    RollBack(RollbackTrigger),
    /// Move to a terminal state.
    Finish {
        to: AttemptState,
        reason: OutcomeReason,
        fault: Option<Fault>,
    },
}

impl Step {
    fn advance(to: AttemptState) -> Self {
        Step::Advance { to, note: None }
    }

    fn finish(to: AttemptState, reason: OutcomeReason) -> Self {
        Step::Finish {
            to,
            reason,
            fault: None,
        }
    }

    fn fail(reason: OutcomeReason, fault: Fault) -> Self {
        Step::Finish {
            to: AttemptState::Failed,
            reason,
            fault: Some(fault),
        }
    }

    fn internal(message: impl Into<String>) -> Self {
        Step::finish(
            AttemptState::Failed,
            OutcomeReason::Internal {
                message: message.into(),
            },
        )
    }

    fn cancelled(during: AttemptState) -> Self {
        Step::finish(AttemptState::Aborted, OutcomeReason::Cancelled { during })
    }
}

/// Run `fut` under an optional time limit; `None` means it timed out.
async fn bounded<F: Future>(limit: Option<Duration>, fut: F) -> Option<F::Output> {
    match limit {
        Some(limit) => tokio::time::timeout(limit, fut).await.ok(),
        None => Some(fut.await),
    }
}

fn elapsed_ms(since: Instant) -> u64 {
    since.elapsed().as_millis() as u64
}

/// State machine for one deployment attempt.
pub struct AttemptMachine {
    attempt: DeploymentAttempt,
    adapters: Adapters,
    config: GateConfig,
    journal: Arc<dyn AttemptJournal>,
    cancel: CancellationToken,
    rollback_trigger: Option<RollbackTrigger>,
}

impl AttemptMachine {
    pub fn new(
        attempt: DeploymentAttempt,
        adapters: Adapters,
        config: GateConfig,
        journal: Arc<dyn AttemptJournal>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            attempt,
            adapters,
            config,
            journal,
            cancel,
            rollback_trigger: None,
        }
    }

    pub fn attempt(&self) -> &DeploymentAttempt {
        &self.attempt
    }

    /// Drive the attempt until it reaches a terminal state.
    ///
    /// Never fails: every adapter failure ends up in the returned record.
    pub async fn drive(mut self) -> DeploymentAttempt {
        let started = Instant::now();
        METRICS.inc_attempts_started();
        obs::emit_attempt_started(&self.attempt);
        self.write(JournalRecord::Created {
            attempt_id: self.attempt.id(),
            descriptor: self.attempt.descriptor().clone(),
            at: self.attempt.created_at(),
        })
        .await;

        while !self.attempt.is_terminal() {
            let step = match self.attempt.state() {
                AttemptState::Pending => self.begin(),
                AttemptState::Analyzing => self.analyze().await,
                AttemptState::Deploying => self.deploy().await,
                AttemptState::Monitoring => self.monitor().await,
                AttemptState::RollingBack => self.roll_back().await,
                AttemptState::Succeeded
                | AttemptState::RolledBack
                | AttemptState::Aborted
                | AttemptState::Failed => break,
            };
            self.apply(step).await;
        }

        if let Some(outcome) = self.attempt.terminal_outcome() {
            METRICS.record_outcome(outcome);
        }
        obs::emit_attempt_finished(&self.attempt, elapsed_ms(started));
        self.write(JournalRecord::Finished {
            attempt: Box::new(self.attempt.clone()),
        })
        .await;
        self.attempt
    }

    /// Apply a step to the attempt record, then journal it.
    async fn apply(&mut self, step: Step) {
        let caused_by = match &step {
            Step::Finish { fault, .. } => fault.clone(),
            _ => None,
        };
        let applied = match step {
            Step::Advance { to, note } => self.attempt.advance(to, None, note).cloned(),
            Step::RollBack(trigger) => {
                let note = Some(trigger.to_string());
                self.rollback_trigger = Some(trigger);
                self.attempt
                    .advance(AttemptState::RollingBack, None, note)
                    .cloned()
            }
            Step::Finish { to, reason, fault } => self.attempt.finish(to, reason, fault).cloned(),
        };

        let entry = match applied {
            Ok(entry) => entry,
            Err(e) => {
                error!(attempt_id = %self.attempt.id(), error = %e, "state machine produced an illegal step");
                let reason = OutcomeReason::Internal {
                    message: e.to_string(),
                };
                match self.attempt.finish(AttemptState::Failed, reason, None) {
                    Ok(entry) => entry.clone(),
                    Err(_) => return,
                }
            }
        };

        // A fault that moves the attempt lives on its history entry only.
        if let Some(fault) = &caused_by {
            obs::emit_fault(&self.attempt, fault);
        }
        obs::emit_transition(&self.attempt, &entry);
        self.write(JournalRecord::Transition {
            attempt_id: self.attempt.id(),
            entry,
        })
        .await;
    }

    /// Record a fault that does not move the attempt (e.g. a retried call).
    async fn note_fault(&mut self, fault: Fault) {
        obs::emit_fault(&self.attempt, &fault);
        self.attempt.record_fault(fault.clone());
        self.write(JournalRecord::Fault {
            attempt_id: self.attempt.id(),
            fault,
        })
        .await;
    }

    /// Journal writes are best effort: failures are logged and counted.
    async fn write(&self, record: JournalRecord) {
        if let Err(e) = self.journal.append(&record).await {
            METRICS.inc_journal_write_failures();
            obs::emit_journal_write_failed(&self.attempt.id().to_string(), record.kind(), &e);
        }
    }

    // -----------------------------------------------------------------------
    // State handlers
    // -----------------------------------------------------------------------

    fn begin(&self) -> Step {
        if self.cancel.is_cancelled() {
            return Step::cancelled(AttemptState::Pending);
        }
        Step::advance(AttemptState::Analyzing)
    }

    async fn analyze(&mut self) -> Step {
        if let Err(e) = self.attempt.descriptor().validate() {
            let message = e.to_string();
            return Step::fail(
                OutcomeReason::InvalidInput {
                    message: message.clone(),
                },
                Fault::new(AttemptState::Analyzing, FaultKind::InvalidInput, message),
            );
        }

        let max_calls = self.config.max_scorer_calls();
        let call_timeout = self.config.adapter_call_timeout;
        let mut calls = 0u32;

        loop {
            calls += 1;
            debug!(call = calls, max_calls, "requesting risk score");

            let scored = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => None,
                r = bounded(call_timeout, self.adapters.scorer.score(self.attempt.descriptor())) => Some(r),
            };
            let Some(result) = scored else {
                return Step::cancelled(AttemptState::Analyzing);
            };
            let result = result.unwrap_or_else(|| {
                Err(ScorerError::Unavailable(format!(
                    "no response within {}ms",
                    call_timeout.map(|t| t.as_millis()).unwrap_or_default()
                )))
            });

            match result {
                Ok(assessment) => {
                    self.attempt.set_assessment(assessment);
                    let score = assessment.score();
                    let threshold = self.config.threshold;
                    if assessment.exceeds(threshold) {
                        return Step::finish(
                            AttemptState::Aborted,
                            OutcomeReason::RiskAboveThreshold { score, threshold },
                        );
                    }
                    return Step::Advance {
                        to: AttemptState::Deploying,
                        note: Some(format!("risk score {score:.3} <= threshold {threshold:.3}")),
                    };
                }
                Err(ScorerError::InvalidInput(message)) => {
                    return Step::fail(
                        OutcomeReason::InvalidInput {
                            message: message.clone(),
                        },
                        Fault::new(AttemptState::Analyzing, FaultKind::InvalidInput, message),
                    );
                }
                Err(err @ ScorerError::Unavailable(_)) => {
                    let fault = Fault::new(AttemptState::Analyzing, err.kind(), err.to_string());
                    if calls >= max_calls {
                        return Step::fail(
                            OutcomeReason::ScorerExhausted {
                                calls,
                                last_error: err.to_string(),
                            },
                            fault,
                        );
                    }
                    self.note_fault(fault).await;
                    METRICS.inc_scorer_retries();
                    info!(call = calls, max_calls, "scorer unavailable, retrying");

                    tokio::select! {
                        biased;
                        _ = self.cancel.cancelled() => return Step::cancelled(AttemptState::Analyzing),
                        _ = tokio::time::sleep(self.config.scorer_retry_backoff) => {}
                    }
                }
            }
        }
    }

    async fn deploy(&mut self) -> Step {
        let call_timeout = self.config.adapter_call_timeout;
        let timeout_msg =
            |op: &str| format!("{op} timed out after {}ms", call_timeout.map(|t| t.as_millis()).unwrap_or_default());

        let created = bounded(
            call_timeout,
            self.adapters
                .backend
                .create(self.attempt.id(), self.attempt.descriptor()),
        )
        .await
        .unwrap_or_else(|| Err(BackendError::CreateFailed(timeout_msg("create"))));

        let handle = match created {
            Ok(handle) => handle,
            Err(e) => {
                let message = e.message().to_string();
                return Step::fail(
                    OutcomeReason::BackendCreateFailed {
                        message: message.clone(),
                    },
                    Fault::new(AttemptState::Deploying, FaultKind::BackendCreateFailed, message),
                );
            }
        };

        // Journal the handle before starting so a crash here still leaves
        // enough to tear the resource down.
        self.attempt.set_backend_handle(handle.clone());
        self.write(JournalRecord::HandleAssigned {
            attempt_id: self.attempt.id(),
            handle: handle.clone(),
            at: chrono::Utc::now(),
        })
        .await;

        let started = bounded(call_timeout, self.adapters.backend.start(&handle))
            .await
            .unwrap_or_else(|| Err(BackendError::StartFailed(timeout_msg("start"))));

        if let Err(e) = started {
            let message = e.message().to_string();
            return Step::fail(
                OutcomeReason::BackendStartFailed {
                    message: message.clone(),
                },
                Fault::new(AttemptState::Deploying, FaultKind::BackendStartFailed, message),
            );
        }

        // Past this point cancellation must go through rollback.
        if self.cancel.is_cancelled() {
            return Step::RollBack(RollbackTrigger::Cancelled);
        }
        Step::Advance {
            to: AttemptState::Monitoring,
            note: Some(format!("started {handle}")),
        }
    }

    async fn monitor(&mut self) -> Step {
        let Some(handle) = self.attempt.backend_handle().cloned() else {
            return Step::internal("monitoring without a backend handle");
        };
        let build = self.attempt.descriptor().build.clone();
        let attempt_id = self.attempt.id().to_string();
        let started = Instant::now();
        let deadline = started + self.config.monitoring_timeout;
        let interval = self.config.monitoring_poll_interval;
        let mut polls = 0u32;

        loop {
            polls += 1;
            METRICS.inc_status_polls();

            let polled = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => return Step::RollBack(RollbackTrigger::Cancelled),
                r = tokio::time::timeout_at(deadline, self.adapters.feed.latest(&build)) => r,
            };
            let Ok(status) = polled else {
                return Step::RollBack(RollbackTrigger::MonitoringTimeout {
                    waited_ms: elapsed_ms(started),
                });
            };
            obs::emit_poll(&attempt_id, polls, &format!("{:?}", status.result));

            match status.result {
                BuildResult::Success => {
                    return Step::finish(AttemptState::Succeeded, OutcomeReason::Deployed)
                }
                BuildResult::Failure => return Step::RollBack(RollbackTrigger::BuildFailed),
                BuildResult::Running | BuildResult::Unknown => {}
            }

            let backend_status = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => return Step::RollBack(RollbackTrigger::Cancelled),
                r = tokio::time::timeout_at(deadline, self.adapters.backend.status(&handle)) => {
                    r.unwrap_or(BackendStatus::Unknown)
                }
            };
            if backend_status == BackendStatus::Errored {
                return Step::RollBack(RollbackTrigger::BackendErrored);
            }

            let now = Instant::now();
            if now >= deadline {
                return Step::RollBack(RollbackTrigger::MonitoringTimeout {
                    waited_ms: elapsed_ms(started),
                });
            }
            let wake = (now + interval).min(deadline);
            tokio::select! {
                biased;
                _ = self.cancel.cancelled() => return Step::RollBack(RollbackTrigger::Cancelled),
                _ = tokio::time::sleep_until(wake) => {}
            }
        }
    }

    /// Stop the resource. Not cancellable and never retried.
    async fn roll_back(&mut self) -> Step {
        let Some(trigger) = self.rollback_trigger.clone() else {
            return Step::internal("rolling back without a trigger");
        };
        let Some(handle) = self.attempt.backend_handle().cloned() else {
            return Step::internal("rolling back without a backend handle");
        };
        let call_timeout = self.config.adapter_call_timeout;

        let stopped = bounded(call_timeout, self.adapters.backend.stop(&handle))
            .await
            .unwrap_or_else(|| {
                Err(BackendError::StopFailed(format!(
                    "stop timed out after {}ms",
                    call_timeout.map(|t| t.as_millis()).unwrap_or_default()
                )))
            });

        match stopped {
            Ok(()) => Step::finish(AttemptState::RolledBack, OutcomeReason::Reverted { trigger }),
            Err(e) => {
                let message = e.message().to_string();
                Step::fail(
                    OutcomeReason::RollbackFailed {
                        trigger,
                        message: message.clone(),
                    },
                    Fault::new(AttemptState::RollingBack, FaultKind::RollbackFailed, message),
                )
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{BuildRef, ChangeDescriptor};
    use crate::fakes::{MemoryBackend, ScriptedScorer, ScriptedStatusFeed};
    use crate::journal::NullJournal;

    fn machine(
        scorer: ScriptedScorer,
        backend: MemoryBackend,
        feed: ScriptedStatusFeed,
        cancel: CancellationToken,
    ) -> AttemptMachine {
        let d = ChangeDescriptor::new("img:1", "abc123", "staging", BuildRef::new("svc", 5))
            .expect("descriptor");
        AttemptMachine::new(
            DeploymentAttempt::new(d),
            Adapters::new(Arc::new(scorer), Arc::new(backend), Arc::new(feed)),
            GateConfig::default(),
            Arc::new(NullJournal),
            cancel,
        )
    }

    #[tokio::test]
    async fn begin_aborts_when_already_cancelled() {
        let cancel = CancellationToken::new();
        cancel.cancel();
        let m = machine(
            ScriptedScorer::fixed(0.1),
            MemoryBackend::new(),
            ScriptedStatusFeed::always(BuildResult::Success),
            cancel,
        );
        assert_eq!(m.begin(), Step::cancelled(AttemptState::Pending));
    }

    #[tokio::test]
    async fn analyze_records_assessment_and_advances() {
        let mut m = machine(
            ScriptedScorer::fixed(0.2),
            MemoryBackend::new(),
            ScriptedStatusFeed::always(BuildResult::Success),
            CancellationToken::new(),
        );
        let step = m.analyze().await;
        assert!(matches!(
            step,
            Step::Advance {
                to: AttemptState::Deploying,
                ..
            }
        ));
        assert_eq!(m.attempt().assessment().map(|a| a.score()), Some(0.2));
    }

    #[tokio::test]
    async fn roll_back_without_trigger_is_internal_failure() {
        let mut m = machine(
            ScriptedScorer::fixed(0.2),
            MemoryBackend::new(),
            ScriptedStatusFeed::always(BuildResult::Success),
            CancellationToken::new(),
        );
        let step = m.roll_back().await;
        assert!(matches!(
            step,
            Step::Finish {
                to: AttemptState::Failed,
                reason: OutcomeReason::Internal { .. },
                ..
            }
        ));
    }

    #[tokio::test]
    async fn illegal_step_closes_attempt_as_failed() {
        let mut m = machine(
            ScriptedScorer::fixed(0.2),
            MemoryBackend::new(),
            ScriptedStatusFeed::always(BuildResult::Success),
            CancellationToken::new(),
        );
        // Pending cannot jump straight to Monitoring.
        m.apply(Step::advance(AttemptState::Monitoring)).await;
        let outcome = m.attempt().terminal_outcome().expect("outcome");
        assert_eq!(outcome.state, AttemptState::Failed);
        assert!(matches!(outcome.reason, OutcomeReason::Internal { .. }));
    }
}
