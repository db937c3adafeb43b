use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use shipgate_core::fakes::{MemoryBackend, ScoreStep, ScriptedScorer, ScriptedStatusFeed};
use shipgate_core::{
    recovery_points, AttemptState, BuildRef, BuildResult, ChangeDescriptor, GateConfig,
    JournalRecord, MemoryJournal, OutcomeReason, PipelineController, RollbackTrigger,
};

fn descriptor(rev: &str) -> ChangeDescriptor {
    ChangeDescriptor::new("registry.local/app:2", rev, "prod", BuildRef::new("app", 7))
        .expect("descriptor")
}

fn config() -> GateConfig {
    GateConfig::default()
        .with_monitoring(Duration::from_secs(60), Duration::from_secs(5))
        .with_adapter_call_timeout(Some(Duration::from_secs(30)))
}

fn controller(
    scorer: ScriptedScorer,
    backend: Arc<MemoryBackend>,
    feed: ScriptedStatusFeed,
) -> PipelineController {
    PipelineController::new(Arc::new(scorer), backend, Arc::new(feed), config())
        .expect("controller")
}

// ---------------------------------------------------------------------------
// Cancellation
// ---------------------------------------------------------------------------

#[tokio::test(start_paused = true)]
async fn cancelled_before_start_never_scores() {
    let scorer = Arc::new(ScriptedScorer::fixed(0.1));
    let backend = Arc::new(MemoryBackend::new());
    let ctl = PipelineController::new(
        scorer.clone(),
        backend.clone(),
        Arc::new(ScriptedStatusFeed::always(BuildResult::Success)),
        config(),
    )
    .expect("controller");
    let token = CancellationToken::new();
    token.cancel();

    let attempt = ctl.run_with_cancel(descriptor("a1"), token).await;

    assert_eq!(attempt.state(), AttemptState::Aborted);
    assert_eq!(
        attempt.terminal_outcome().map(|o| o.reason.clone()),
        Some(OutcomeReason::Cancelled {
            during: AttemptState::Pending
        })
    );
    assert_eq!(scorer.calls(), 0);
    assert_eq!(backend.create_calls(), 0);
}

#[tokio::test(start_paused = true)]
async fn cancel_while_analyzing_aborts_without_deploying() {
    let backend = Arc::new(MemoryBackend::new());
    let ctl = controller(
        ScriptedScorer::new([ScoreStep::Stall]),
        backend.clone(),
        ScriptedStatusFeed::always(BuildResult::Success),
    );

    let handle = ctl.spawn(descriptor("a2"));
    tokio::time::sleep(Duration::from_secs(1)).await;
    handle.cancel();
    let attempt = handle.join().await.expect("join");

    assert_eq!(
        attempt.terminal_outcome().map(|o| o.reason.clone()),
        Some(OutcomeReason::Cancelled {
            during: AttemptState::Analyzing
        })
    );
    assert_eq!(backend.create_calls(), 0);
}

#[tokio::test(start_paused = true)]
async fn cancel_while_monitoring_rolls_back() {
    let backend = Arc::new(MemoryBackend::new());
    let ctl = controller(
        ScriptedScorer::fixed(0.1),
        backend.clone(),
        ScriptedStatusFeed::always(BuildResult::Running),
    );

    let handle = ctl.spawn(descriptor("a3"));
    tokio::time::sleep(Duration::from_secs(7)).await;
    handle.cancel();
    let attempt = handle.join().await.expect("join");

    assert_eq!(attempt.state(), AttemptState::RolledBack);
    assert_eq!(
        attempt.terminal_outcome().map(|o| o.reason.clone()),
        Some(OutcomeReason::Reverted {
            trigger: RollbackTrigger::Cancelled
        })
    );
    assert_eq!(backend.stop_calls(), 1);
    assert_eq!(backend.running_count(), 0);
}

#[tokio::test(start_paused = true)]
async fn cancel_while_starting_waits_for_start_then_rolls_back() {
    let backend = Arc::new(MemoryBackend::new().with_start_delay(Duration::from_secs(10)));
    let ctl = controller(
        ScriptedScorer::fixed(0.1),
        backend.clone(),
        ScriptedStatusFeed::always(BuildResult::Success),
    );

    let handle = ctl.spawn(descriptor("a4"));
    tokio::time::sleep(Duration::from_secs(2)).await;
    handle.cancel();
    let attempt = handle.join().await.expect("join");

    assert_eq!(attempt.state(), AttemptState::RolledBack);
    assert!(!attempt
        .history()
        .iter()
        .any(|e| e.to == AttemptState::Monitoring));
    assert_eq!(backend.start_calls(), 1);
    assert_eq!(backend.stop_calls(), 1);
}

#[tokio::test(start_paused = true)]
async fn cancel_while_starting_with_failed_start_never_stops() {
    let backend = Arc::new(
        MemoryBackend::new()
            .with_start_delay(Duration::from_secs(10))
            .with_start_failure("image pull failed"),
    );
    let ctl = controller(
        ScriptedScorer::fixed(0.1),
        backend.clone(),
        ScriptedStatusFeed::always(BuildResult::Success),
    );

    let handle = ctl.spawn(descriptor("a5"));
    tokio::time::sleep(Duration::from_secs(2)).await;
    handle.cancel();
    let attempt = handle.join().await.expect("join");

    assert_eq!(attempt.state(), AttemptState::Failed);
    assert!(matches!(
        attempt.terminal_outcome().map(|o| &o.reason),
        Some(OutcomeReason::BackendStartFailed { message }) if message == "image pull failed"
    ));
    assert!(!attempt
        .history()
        .iter()
        .any(|e| e.to == AttemptState::RollingBack));
    assert_eq!(backend.start_calls(), 1);
    assert_eq!(backend.stop_calls(), 0);
}

#[tokio::test(start_paused = true)]
async fn cancelling_a_finished_attempt_changes_nothing() {
    let backend = Arc::new(MemoryBackend::new());
    let ctl = controller(
        ScriptedScorer::fixed(0.1),
        backend.clone(),
        ScriptedStatusFeed::always(BuildResult::Success),
    );
    let token = CancellationToken::new();

    let attempt = ctl.run_with_cancel(descriptor("a5"), token.clone()).await;
    token.cancel();

    assert_eq!(attempt.state(), AttemptState::Succeeded);
    assert_eq!(backend.stop_calls(), 0);
}

// ---------------------------------------------------------------------------
// Concurrency
// ---------------------------------------------------------------------------

#[tokio::test(start_paused = true)]
async fn concurrent_attempts_are_independent() {
    let backend = Arc::new(MemoryBackend::new());
    let ctl = controller(
        ScriptedScorer::fixed(0.1),
        backend.clone(),
        ScriptedStatusFeed::reporting([BuildResult::Running, BuildResult::Success]),
    );
    let revisions = ["r1", "r2", "r3", "r4"];

    let attempts = ctl
        .run_all(revisions.iter().map(|r| descriptor(r)))
        .await;

    assert_eq!(attempts.len(), revisions.len());
    for (attempt, rev) in attempts.iter().zip(revisions) {
        assert_eq!(attempt.descriptor().revision, rev);
        assert!(attempt.is_terminal());
    }
    let ids: HashSet<_> = attempts.iter().map(|a| a.id()).collect();
    assert_eq!(ids.len(), revisions.len());
    let handles: HashSet<_> = attempts
        .iter()
        .filter_map(|a| a.backend_handle().cloned())
        .collect();
    assert_eq!(handles.len(), revisions.len());
    assert_eq!(backend.resource_count(), revisions.len());
}

#[tokio::test(start_paused = true)]
async fn cancelling_one_attempt_leaves_others_running() {
    let backend = Arc::new(MemoryBackend::new());
    let ctl = controller(
        ScriptedScorer::fixed(0.1),
        backend.clone(),
        ScriptedStatusFeed::reporting([
            BuildResult::Running,
            BuildResult::Running,
            BuildResult::Running,
            BuildResult::Running,
            BuildResult::Success,
        ]),
    );

    let doomed = ctl.spawn(descriptor("c1"));
    let survivor = ctl.spawn(descriptor("c2"));
    tokio::time::sleep(Duration::from_secs(1)).await;
    doomed.cancel();

    let doomed = doomed.join().await.expect("join");
    let survivor = survivor.join().await.expect("join");
    assert_eq!(doomed.state(), AttemptState::RolledBack);
    assert!(survivor.is_terminal());
    assert_ne!(survivor.state(), AttemptState::RolledBack);
    assert_eq!(backend.stop_calls(), 1);
}

// ---------------------------------------------------------------------------
// Journal
// ---------------------------------------------------------------------------

#[tokio::test(start_paused = true)]
async fn journal_captures_the_full_lifecycle() {
    let journal = Arc::new(MemoryJournal::new());
    let backend = Arc::new(MemoryBackend::new());
    let ctl = controller(
        ScriptedScorer::fixed(0.1),
        backend.clone(),
        ScriptedStatusFeed::always(BuildResult::Failure),
    )
    .with_journal(journal.clone());

    let attempt = ctl.run(descriptor("j1")).await;
    let records = journal.records_for(attempt.id());

    assert!(matches!(records.first(), Some(JournalRecord::Created { .. })));
    assert!(matches!(records.last(), Some(JournalRecord::Finished { .. })));
    let transitions = records
        .iter()
        .filter(|r| matches!(r, JournalRecord::Transition { .. }))
        .count();
    assert_eq!(transitions, attempt.history().len());

    // The handle is journaled before Monitoring is entered.
    let handle_at = records
        .iter()
        .position(|r| matches!(r, JournalRecord::HandleAssigned { .. }))
        .expect("handle record");
    let monitoring_at = records
        .iter()
        .position(|r| {
            matches!(r, JournalRecord::Transition { entry, .. } if entry.to == AttemptState::Monitoring)
        })
        .expect("monitoring record");
    assert!(handle_at < monitoring_at);

    let points = recovery_points(&records);
    let point = &points[&attempt.id()];
    assert_eq!(point.state, AttemptState::RolledBack);
    assert!(!point.needs_teardown());
}

#[tokio::test(start_paused = true)]
async fn interrupted_journal_points_at_the_live_resource() {
    let journal = Arc::new(MemoryJournal::new());
    let backend = Arc::new(MemoryBackend::new());
    let ctl = controller(
        ScriptedScorer::fixed(0.1),
        backend.clone(),
        ScriptedStatusFeed::always(BuildResult::Success),
    )
    .with_journal(journal.clone());

    let attempt = ctl.run(descriptor("j2")).await;
    // Drop everything from Monitoring onward, as if the process died there.
    let records: Vec<_> = journal
        .records_for(attempt.id())
        .into_iter()
        .take_while(|r| {
            !matches!(r, JournalRecord::Transition { entry, .. } if entry.to == AttemptState::Succeeded)
        })
        .collect();

    let points = recovery_points(&records);
    let point = &points[&attempt.id()];
    assert_eq!(point.state, AttemptState::Monitoring);
    assert!(point.needs_teardown());
    assert_eq!(point.backend_handle, backend.handle_for(attempt.id()));
}

#[tokio::test(start_paused = true)]
async fn failed_start_leaves_resource_for_recovery() {
    let journal = Arc::new(MemoryJournal::new());
    let backend = Arc::new(MemoryBackend::new().with_start_failure("port already allocated"));
    let ctl = controller(
        ScriptedScorer::fixed(0.1),
        backend.clone(),
        ScriptedStatusFeed::always(BuildResult::Success),
    )
    .with_journal(journal.clone());

    let attempt = ctl.run(descriptor("j3")).await;
    assert_eq!(attempt.state(), AttemptState::Failed);
    assert_eq!(backend.stop_calls(), 0);
    assert_eq!(backend.resource_count(), 1);

    let points = recovery_points(&journal.records_for(attempt.id()));
    let point = &points[&attempt.id()];
    assert!(!point.needs_teardown());
    assert!(point.orphaned_resource());
    assert!(point.needs_attention());
    assert_eq!(point.backend_handle, backend.handle_for(attempt.id()));
}
