//! Pipeline controller: accepts change descriptors and runs one attempt each.
//!
//! The controller holds the shared adapters, config and journal. Every
//! submitted descriptor gets a fresh [`AttemptId`] and its own
//! [`AttemptMachine`]; attempts never share mutable state, so any number of
//! them may run at once on the same controller.

use std::sync::Arc;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::Instrument;

use crate::adapters::{Adapters, DeploymentBackend, RiskScorer, StatusFeed};
use crate::config::GateConfig;
use crate::domain::{AttemptId, ChangeDescriptor, DeploymentAttempt, GateError, Result};
use crate::journal::{AttemptJournal, NullJournal};
use crate::machine::AttemptMachine;
use crate::obs;

/// Runs deployment attempts against one set of adapters.
#[derive(Clone)]
pub struct PipelineController {
    adapters: Adapters,
    config: GateConfig,
    journal: Arc<dyn AttemptJournal>,
}

impl PipelineController {
    /// Build a controller from its three adapters.
    ///
    /// Fails if `config` does not validate.
    pub fn new(
        scorer: Arc<dyn RiskScorer>,
        backend: Arc<dyn DeploymentBackend>,
        feed: Arc<dyn StatusFeed>,
        config: GateConfig,
    ) -> Result<Self> {
        Self::from_adapters(Adapters::new(scorer, backend, feed), config)
    }

    pub fn from_adapters(adapters: Adapters, config: GateConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            adapters,
            config,
            journal: Arc::new(NullJournal),
        })
    }

    /// Write attempt records to `journal` instead of discarding them.
    pub fn with_journal(mut self, journal: Arc<dyn AttemptJournal>) -> Self {
        self.journal = journal;
        self
    }

    pub fn config(&self) -> &GateConfig {
        &self.config
    }

    /// Run one attempt to completion.
    pub async fn run(&self, descriptor: ChangeDescriptor) -> DeploymentAttempt {
        self.run_with_cancel(descriptor, CancellationToken::new())
            .await
    }

    /// Run one attempt, stopping early once `cancel` fires.
    ///
    /// Cancellation before Deploying aborts; from Deploying or Monitoring it
    /// rolls the resource back. A rollback in progress is never interrupted.
    pub async fn run_with_cancel(
        &self,
        descriptor: ChangeDescriptor,
        cancel: CancellationToken,
    ) -> DeploymentAttempt {
        self.machine(DeploymentAttempt::new(descriptor), cancel)
            .await
    }

    /// Run an attempt on its own task and return a handle to it.
    pub fn spawn(&self, descriptor: ChangeDescriptor) -> AttemptHandle {
        let attempt = DeploymentAttempt::new(descriptor);
        let id = attempt.id();
        let cancel = CancellationToken::new();
        let task = tokio::spawn(self.machine(attempt, cancel.clone()));
        AttemptHandle { id, cancel, task }
    }

    /// Run every descriptor concurrently; results keep the input order.
    pub async fn run_all(
        &self,
        descriptors: impl IntoIterator<Item = ChangeDescriptor>,
    ) -> Vec<DeploymentAttempt> {
        let runs = descriptors.into_iter().map(|d| self.run(d));
        futures::future::join_all(runs).await
    }

    fn machine(
        &self,
        attempt: DeploymentAttempt,
        cancel: CancellationToken,
    ) -> impl std::future::Future<Output = DeploymentAttempt> + Send + 'static {
        let span = obs::attempt_span(&attempt);
        AttemptMachine::new(
            attempt,
            self.adapters.clone(),
            self.config.clone(),
            Arc::clone(&self.journal),
            cancel,
        )
        .drive()
        .instrument(span)
    }
}

impl std::fmt::Debug for PipelineController {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PipelineController")
            .field("adapters", &self.adapters)
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

/// A spawned attempt.
#[derive(Debug)]
pub struct AttemptHandle {
    id: AttemptId,
    cancel: CancellationToken,
    task: JoinHandle<DeploymentAttempt>,
}

impl AttemptHandle {
    pub fn id(&self) -> AttemptId {
        self.id
    }

    /// Request cancellation. Safe to call more than once.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    /// Token that cancels this attempt, for wiring into signal handlers.
    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Wait for the attempt to reach a terminal state.
    pub async fn join(self) -> Result<DeploymentAttempt> {
        self.task
            .await
            .map_err(|e| GateError::TaskFailed(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{AttemptState, BuildRef, BuildResult};
    use crate::fakes::{MemoryBackend, ScriptedScorer, ScriptedStatusFeed};

    fn descriptor(rev: &str) -> ChangeDescriptor {
        ChangeDescriptor::new("img:7", rev, "staging", BuildRef::new("svc", 9))
            .expect("descriptor")
    }

    fn controller(config: GateConfig) -> Result<PipelineController> {
        PipelineController::new(
            Arc::new(ScriptedScorer::fixed(0.1)),
            Arc::new(MemoryBackend::new()),
            Arc::new(ScriptedStatusFeed::always(BuildResult::Success)),
            config,
        )
    }

    #[test]
    fn rejects_invalid_config() {
        let err = controller(GateConfig::default().with_threshold(1.5)).unwrap_err();
        assert!(matches!(err, GateError::InvalidConfig(_)));
    }

    #[tokio::test]
    async fn spawned_attempt_joins_with_its_id() {
        let ctl = controller(GateConfig::default()).unwrap();
        let handle = ctl.spawn(descriptor("abc"));
        let id = handle.id();
        let attempt = handle.join().await.unwrap();
        assert_eq!(attempt.id(), id);
        assert_eq!(attempt.state(), AttemptState::Succeeded);
    }

    #[tokio::test]
    async fn resubmitting_a_descriptor_starts_a_new_attempt() {
        let ctl = controller(GateConfig::default()).unwrap();
        let first = ctl.run(descriptor("abc")).await;
        let second = ctl.run(descriptor("abc")).await;
        assert_ne!(first.id(), second.id());
        assert_eq!(first.descriptor(), second.descriptor());
    }
}
