//! In-memory fakes for adapter traits (testing only)
//!
//! Provides `ScriptedScorer`, `MemoryBackend`, and `ScriptedStatusFeed`
//! that satisfy the adapter contracts without any external dependencies.
//! Every fake counts its calls so tests can assert on side effects.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;

use crate::adapters::{BackendStatus, DeploymentBackend, RiskScorer, StatusFeed};
use crate::domain::{
    AttemptId, BackendError, BackendHandle, BuildRef, BuildResult, BuildStatus,
    ChangeDescriptor, RiskAssessment, ScorerError,
};

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Pop the next scripted step, repeating the last one once the script runs out.
fn next_step<T: Clone>(script: &Mutex<VecDeque<T>>) -> Option<T> {
    let mut script = lock(script);
    if script.len() > 1 {
        script.pop_front()
    } else {
        script.front().cloned()
    }
}

// ---------------------------------------------------------------------------
// ScriptedScorer
// ---------------------------------------------------------------------------

/// One scripted scorer response.
#[derive(Debug, Clone)]
pub enum ScoreStep {
    Score(f64),
    Fail(ScorerError),
    /// Never resolve; exercises call timeouts and cancellation.
    Stall,
}

/// Scorer that replays a fixed script of responses.
#[derive(Debug)]
pub struct ScriptedScorer {
    script: Mutex<VecDeque<ScoreStep>>,
    calls: AtomicU32,
}

impl ScriptedScorer {
    pub fn new(steps: impl IntoIterator<Item = ScoreStep>) -> Self {
        Self {
            script: Mutex::new(steps.into_iter().collect()),
            calls: AtomicU32::new(0),
        }
    }

    /// Always return `score`.
    pub fn fixed(score: f64) -> Self {
        Self::new([ScoreStep::Score(score)])
    }

    /// Always fail with `err`.
    pub fn failing(err: ScorerError) -> Self {
        Self::new([ScoreStep::Fail(err)])
    }

    pub fn calls(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl RiskScorer for ScriptedScorer {
    async fn score(&self, descriptor: &ChangeDescriptor) -> Result<RiskAssessment, ScorerError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        descriptor
            .validate()
            .map_err(|e| ScorerError::InvalidInput(e.to_string()))?;

        match next_step(&self.script) {
            Some(ScoreStep::Score(score)) => {
                RiskAssessment::now(score).map_err(|e| ScorerError::Unavailable(e.to_string()))
            }
            Some(ScoreStep::Fail(err)) => Err(err),
            Some(ScoreStep::Stall) => std::future::pending().await,
            None => Err(ScorerError::Unavailable("empty script".to_string())),
        }
    }
}

// ---------------------------------------------------------------------------
// MemoryBackend
// ---------------------------------------------------------------------------

#[derive(Debug, Default)]
struct BackendState {
    by_attempt: HashMap<AttemptId, BackendHandle>,
    resources: HashMap<BackendHandle, BackendStatus>,
}

/// In-memory execution backend keyed by attempt id.
#[derive(Debug, Default)]
pub struct MemoryBackend {
    state: Mutex<BackendState>,
    create_failure: Option<String>,
    start_failure: Option<String>,
    stop_failure: Option<String>,
    start_delay: Option<Duration>,
    reported_status: Option<BackendStatus>,
    create_calls: AtomicU32,
    start_calls: AtomicU32,
    stop_calls: AtomicU32,
    status_calls: AtomicU32,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_create_failure(mut self, message: impl Into<String>) -> Self {
        self.create_failure = Some(message.into());
        self
    }

    pub fn with_start_failure(mut self, message: impl Into<String>) -> Self {
        self.start_failure = Some(message.into());
        self
    }

    pub fn with_stop_failure(mut self, message: impl Into<String>) -> Self {
        self.stop_failure = Some(message.into());
        self
    }

    /// Delay `start` so tests can act while an attempt is Deploying.
    pub fn with_start_delay(mut self, delay: Duration) -> Self {
        self.start_delay = Some(delay);
        self
    }

    /// Report `status` for every resource regardless of its real state.
    pub fn reporting(mut self, status: BackendStatus) -> Self {
        self.reported_status = Some(status);
        self
    }

    pub fn create_calls(&self) -> u32 {
        self.create_calls.load(Ordering::SeqCst)
    }

    pub fn start_calls(&self) -> u32 {
        self.start_calls.load(Ordering::SeqCst)
    }

    pub fn stop_calls(&self) -> u32 {
        self.stop_calls.load(Ordering::SeqCst)
    }

    pub fn status_calls(&self) -> u32 {
        self.status_calls.load(Ordering::SeqCst)
    }

    /// Number of distinct resources ever created.
    pub fn resource_count(&self) -> usize {
        lock(&self.state).resources.len()
    }

    /// Number of resources currently running.
    pub fn running_count(&self) -> usize {
        lock(&self.state)
            .resources
            .values()
            .filter(|s| **s == BackendStatus::Running)
            .count()
    }

    /// Handle previously issued for `attempt_id`, if any.
    pub fn handle_for(&self, attempt_id: AttemptId) -> Option<BackendHandle> {
        lock(&self.state).by_attempt.get(&attempt_id).cloned()
    }
}

#[async_trait]
impl DeploymentBackend for MemoryBackend {
    async fn create(
        &self,
        attempt_id: AttemptId,
        descriptor: &ChangeDescriptor,
    ) -> Result<BackendHandle, BackendError> {
        self.create_calls.fetch_add(1, Ordering::SeqCst);
        if let Some(msg) = &self.create_failure {
            return Err(BackendError::CreateFailed(msg.clone()));
        }

        let mut state = lock(&self.state);
        if let Some(existing) = state.by_attempt.get(&attempt_id) {
            return Ok(existing.clone());
        }
        let handle = BackendHandle(format!(
            "mem-{}-{}",
            attempt_id.short(),
            descriptor.short_revision()
        ));
        state.by_attempt.insert(attempt_id, handle.clone());
        state
            .resources
            .insert(handle.clone(), BackendStatus::Starting);
        Ok(handle)
    }

    async fn start(&self, handle: &BackendHandle) -> Result<(), BackendError> {
        self.start_calls.fetch_add(1, Ordering::SeqCst);
        if let Some(delay) = self.start_delay {
            tokio::time::sleep(delay).await;
        }
        if let Some(msg) = &self.start_failure {
            return Err(BackendError::StartFailed(msg.clone()));
        }

        let mut state = lock(&self.state);
        match state.resources.get_mut(handle) {
            Some(status) => {
                *status = BackendStatus::Running;
                Ok(())
            }
            None => Err(BackendError::StartFailed(format!(
                "no resource for handle {handle}"
            ))),
        }
    }

    async fn stop(&self, handle: &BackendHandle) -> Result<(), BackendError> {
        self.stop_calls.fetch_add(1, Ordering::SeqCst);
        if let Some(msg) = &self.stop_failure {
            return Err(BackendError::StopFailed(msg.clone()));
        }

        // Missing or never-started resources are fine to stop.
        let mut state = lock(&self.state);
        if let Some(status) = state.resources.get_mut(handle) {
            *status = BackendStatus::Stopped;
        }
        Ok(())
    }

    async fn status(&self, handle: &BackendHandle) -> BackendStatus {
        self.status_calls.fetch_add(1, Ordering::SeqCst);
        if let Some(status) = self.reported_status {
            return status;
        }
        lock(&self.state)
            .resources
            .get(handle)
            .copied()
            .unwrap_or(BackendStatus::Unknown)
    }
}

// ---------------------------------------------------------------------------
// ScriptedStatusFeed
// ---------------------------------------------------------------------------

/// One scripted feed response.
#[derive(Debug, Clone, Copy)]
pub enum FeedStep {
    Report(BuildResult),
    /// Never resolve; models a stalled CI server.
    Stall,
}

/// Status feed that replays a fixed script of build results.
#[derive(Debug)]
pub struct ScriptedStatusFeed {
    script: Mutex<VecDeque<FeedStep>>,
    calls: AtomicU32,
}

impl ScriptedStatusFeed {
    pub fn new(steps: impl IntoIterator<Item = FeedStep>) -> Self {
        Self {
            script: Mutex::new(steps.into_iter().collect()),
            calls: AtomicU32::new(0),
        }
    }

    /// Report the given results in order, then keep repeating the last one.
    pub fn reporting(results: impl IntoIterator<Item = BuildResult>) -> Self {
        Self::new(results.into_iter().map(FeedStep::Report))
    }

    /// Always report `result`.
    pub fn always(result: BuildResult) -> Self {
        Self::reporting([result])
    }

    pub fn stalled() -> Self {
        Self::new([FeedStep::Stall])
    }

    pub fn calls(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl StatusFeed for ScriptedStatusFeed {
    async fn latest(&self, build: &BuildRef) -> BuildStatus {
        self.calls.fetch_add(1, Ordering::SeqCst);
        match next_step(&self.script) {
            Some(FeedStep::Report(result)) => BuildStatus::new(build, result),
            Some(FeedStep::Stall) => std::future::pending().await,
            None => BuildStatus::unknown(build),
        }
    }
}
