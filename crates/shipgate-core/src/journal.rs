//! Append-only attempt journal.
//!
//! The state machine writes every transition here before acting on the new
//! state, and writes the backend handle as soon as `create` returns it. An
//! external supervisor can fold the records back into the last known state
//! of each attempt with [`recovery_points`] and tear down anything that was
//! left holding a resource.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::io::AsyncWriteExt;

use crate::domain::{
    AttemptId, AttemptState, BackendHandle, ChangeDescriptor, DeploymentAttempt, Fault,
    GateError, HistoryEntry, Result, TerminalOutcome,
};

/// One journal line.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "record", rename_all = "snake_case")]
pub enum JournalRecord {
    Created {
        attempt_id: AttemptId,
        descriptor: ChangeDescriptor,
        at: DateTime<Utc>,
    },
    Transition {
        attempt_id: AttemptId,
        entry: HistoryEntry,
    },
    HandleAssigned {
        attempt_id: AttemptId,
        handle: BackendHandle,
        at: DateTime<Utc>,
    },
    Fault {
        attempt_id: AttemptId,
        fault: Fault,
    },
    Finished {
        attempt: Box<DeploymentAttempt>,
    },
}

impl JournalRecord {
    pub fn attempt_id(&self) -> AttemptId {
        match self {
            JournalRecord::Created { attempt_id, .. }
            | JournalRecord::Transition { attempt_id, .. }
            | JournalRecord::HandleAssigned { attempt_id, .. }
            | JournalRecord::Fault { attempt_id, .. } => *attempt_id,
            JournalRecord::Finished { attempt } => attempt.id(),
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            JournalRecord::Created { .. } => "created",
            JournalRecord::Transition { .. } => "transition",
            JournalRecord::HandleAssigned { .. } => "handle_assigned",
            JournalRecord::Fault { .. } => "fault",
            JournalRecord::Finished { .. } => "finished",
        }
    }
}

/// Sink for attempt lifecycle records.
///
/// Guarantees:
/// - Records for one attempt are appended in the order they were produced.
/// - Implementations are shared by concurrent attempts.
#[async_trait]
pub trait AttemptJournal: Send + Sync {
    async fn append(&self, record: &JournalRecord) -> Result<()>;
}

/// Journal that discards everything.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullJournal;

#[async_trait]
impl AttemptJournal for NullJournal {
    async fn append(&self, _record: &JournalRecord) -> Result<()> {
        Ok(())
    }
}

/// In-memory journal (testing and embedding).
#[derive(Debug, Default)]
pub struct MemoryJournal {
    records: Mutex<Vec<JournalRecord>>,
}

impl MemoryJournal {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn records(&self) -> Vec<JournalRecord> {
        self.records
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .clone()
    }

    pub fn records_for(&self, attempt_id: AttemptId) -> Vec<JournalRecord> {
        self.records()
            .into_iter()
            .filter(|r| r.attempt_id() == attempt_id)
            .collect()
    }
}

#[async_trait]
impl AttemptJournal for MemoryJournal {
    async fn append(&self, record: &JournalRecord) -> Result<()> {
        self.records
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .push(record.clone());
        Ok(())
    }
}

/// Newline-delimited JSON journal on the local filesystem.
#[derive(Debug)]
pub struct JsonlJournal {
    path: PathBuf,
    write_lock: tokio::sync::Mutex<()>,
}

impl JsonlJournal {
    /// Open (or create on first write) a journal at `path`.
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            write_lock: tokio::sync::Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[async_trait]
impl AttemptJournal for JsonlJournal {
    async fn append(&self, record: &JournalRecord) -> Result<()> {
        let mut line = serde_json::to_vec(record)?;
        line.push(b'\n');

        // One writer at a time keeps lines from interleaving.
        let _guard = self.write_lock.lock().await;
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                tokio::fs::create_dir_all(parent).await?;
            }
        }
        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .await?;
        file.write_all(&line).await?;
        file.flush().await?;
        Ok(())
    }
}

/// Read every record from a JSONL journal.
///
/// A truncated final line (a crash mid-write) is skipped; a malformed line
/// anywhere else is an error.
pub async fn read_jsonl(path: impl AsRef<Path>) -> Result<Vec<JournalRecord>> {
    let path = path.as_ref();
    let content = tokio::fs::read_to_string(path).await?;
    let lines: Vec<&str> = content.lines().filter(|l| !l.trim().is_empty()).collect();
    let mut records = Vec::with_capacity(lines.len());
    for (idx, line) in lines.iter().enumerate() {
        match serde_json::from_str::<JournalRecord>(line) {
            Ok(record) => records.push(record),
            Err(_) if idx + 1 == lines.len() && !content.ends_with('\n') => {
                tracing::warn!(
                    path = %path.display(),
                    line = idx + 1,
                    "skipping truncated final journal line"
                );
            }
            Err(e) => {
                return Err(GateError::Journal(format!(
                    "{}:{}: {}",
                    path.display(),
                    idx + 1,
                    e
                )))
            }
        }
    }
    Ok(records)
}

/// Last known state of one attempt, folded from its journal records.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RecoveryPoint {
    pub attempt_id: AttemptId,
    pub descriptor: Option<ChangeDescriptor>,
    pub state: AttemptState,
    pub backend_handle: Option<BackendHandle>,
    pub outcome: Option<TerminalOutcome>,
    pub last_update: Option<DateTime<Utc>>,
}

impl RecoveryPoint {
    fn new(attempt_id: AttemptId) -> Self {
        Self {
            attempt_id,
            descriptor: None,
            state: AttemptState::Pending,
            backend_handle: None,
            outcome: None,
            last_update: None,
        }
    }

    /// The attempt stopped mid-flight while a resource may still exist.
    pub fn needs_teardown(&self) -> bool {
        !self.state.is_terminal() && self.backend_handle.is_some()
    }

    /// A rollback was attempted and failed; the resource state is unknown.
    pub fn rollback_failed(&self) -> bool {
        self.outcome
            .as_ref()
            .is_some_and(TerminalOutcome::is_rollback_failure)
    }

    /// The attempt finished as Failed because `start` failed, leaving the
    /// created (possibly half-started) resource behind.
    pub fn orphaned_resource(&self) -> bool {
        self.backend_handle.is_some()
            && self
                .outcome
                .as_ref()
                .is_some_and(TerminalOutcome::is_start_failure)
    }

    /// Anything an operator or `recover --teardown` should look at.
    pub fn needs_attention(&self) -> bool {
        self.needs_teardown() || self.rollback_failed() || self.orphaned_resource()
    }
}

/// Fold journal records into one recovery point per attempt.
pub fn recovery_points(records: &[JournalRecord]) -> BTreeMap<AttemptId, RecoveryPoint> {
    let mut points: BTreeMap<AttemptId, RecoveryPoint> = BTreeMap::new();
    for record in records {
        let id = record.attempt_id();
        let point = points
            .entry(id)
            .or_insert_with(|| RecoveryPoint::new(id));
        match record {
            JournalRecord::Created { descriptor, at, .. } => {
                point.descriptor = Some(descriptor.clone());
                point.last_update = Some(*at);
            }
            JournalRecord::Transition { entry, .. } => {
                point.state = entry.to;
                point.last_update = Some(entry.at);
            }
            JournalRecord::HandleAssigned { handle, at, .. } => {
                point.backend_handle = Some(handle.clone());
                point.last_update = Some(*at);
            }
            JournalRecord::Fault { fault, .. } => {
                point.last_update = Some(fault.at);
            }
            JournalRecord::Finished { attempt } => {
                point.descriptor = Some(attempt.descriptor().clone());
                point.state = attempt.state();
                point.backend_handle = attempt.backend_handle().cloned();
                point.outcome = attempt.terminal_outcome().cloned();
                point.last_update = attempt.terminal_outcome().map(|o| o.at);
            }
        }
    }
    points
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{BuildRef, OutcomeReason};

    fn descriptor() -> ChangeDescriptor {
        ChangeDescriptor::new("img:3", "c0ffee", "prod", BuildRef::new("svc", 11))
            .expect("descriptor")
    }

    fn transition(id: AttemptId, from: AttemptState, to: AttemptState) -> JournalRecord {
        JournalRecord::Transition {
            attempt_id: id,
            entry: HistoryEntry {
                from,
                to,
                at: Utc::now(),
                fault: None,
                note: None,
            },
        }
    }

    #[test]
    fn recovery_flags_live_attempt_with_handle() {
        let id = AttemptId::new();
        let records = vec![
            JournalRecord::Created {
                attempt_id: id,
                descriptor: descriptor(),
                at: Utc::now(),
            },
            transition(id, AttemptState::Pending, AttemptState::Analyzing),
            transition(id, AttemptState::Analyzing, AttemptState::Deploying),
            JournalRecord::HandleAssigned {
                attempt_id: id,
                handle: BackendHandle("ctr-1".into()),
                at: Utc::now(),
            },
            transition(id, AttemptState::Deploying, AttemptState::Monitoring),
        ];

        let points = recovery_points(&records);
        let point = &points[&id];
        assert_eq!(point.state, AttemptState::Monitoring);
        assert!(point.needs_teardown());
        assert!(!point.rollback_failed());
    }

    #[test]
    fn recovery_ignores_finished_and_handle_less_attempts() {
        let mut finished = DeploymentAttempt::new(descriptor());
        finished.advance(AttemptState::Analyzing, None, None).unwrap();
        finished
            .finish(
                AttemptState::Aborted,
                OutcomeReason::RiskAboveThreshold {
                    score: 0.9,
                    threshold: 0.5,
                },
                None,
            )
            .unwrap();

        let analyzing = AttemptId::new();
        let records = vec![
            transition(analyzing, AttemptState::Pending, AttemptState::Analyzing),
            JournalRecord::Finished {
                attempt: Box::new(finished.clone()),
            },
        ];

        let points = recovery_points(&records);
        assert_eq!(points.len(), 2);
        assert!(!points[&analyzing].needs_teardown());
        assert_eq!(points[&finished.id()].state, AttemptState::Aborted);
        assert!(!points[&finished.id()].needs_teardown());
    }

    #[test]
    fn recovery_flags_resource_left_by_failed_start() {
        let mut attempt = DeploymentAttempt::new(descriptor());
        attempt.advance(AttemptState::Analyzing, None, None).unwrap();
        attempt.advance(AttemptState::Deploying, None, None).unwrap();
        attempt.set_backend_handle(BackendHandle("ctr-9".into()));
        attempt
            .finish(
                AttemptState::Failed,
                OutcomeReason::BackendStartFailed {
                    message: "port already allocated".into(),
                },
                None,
            )
            .unwrap();

        let points = recovery_points(&[JournalRecord::Finished {
            attempt: Box::new(attempt.clone()),
        }]);
        let point = &points[&attempt.id()];
        assert_eq!(point.state, AttemptState::Failed);
        assert!(!point.needs_teardown());
        assert!(!point.rollback_failed());
        assert!(point.orphaned_resource());
        assert!(point.needs_attention());
    }

    #[test]
    fn failed_create_leaves_nothing_to_recover() {
        let mut attempt = DeploymentAttempt::new(descriptor());
        attempt.advance(AttemptState::Analyzing, None, None).unwrap();
        attempt.advance(AttemptState::Deploying, None, None).unwrap();
        attempt
            .finish(
                AttemptState::Failed,
                OutcomeReason::BackendCreateFailed {
                    message: "no space left".into(),
                },
                None,
            )
            .unwrap();

        let points = recovery_points(&[JournalRecord::Finished {
            attempt: Box::new(attempt.clone()),
        }]);
        assert!(!points[&attempt.id()].needs_attention());
    }

    #[tokio::test]
    async fn jsonl_journal_round_trips_records() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("nested").join("journal.jsonl");
        let journal = JsonlJournal::new(&path);

        let id = AttemptId::new();
        let created = JournalRecord::Created {
            attempt_id: id,
            descriptor: descriptor(),
            at: Utc::now(),
        };
        let moved = transition(id, AttemptState::Pending, AttemptState::Analyzing);
        journal.append(&created).await.unwrap();
        journal.append(&moved).await.unwrap();

        let records = read_jsonl(&path).await.expect("read");
        assert_eq!(records, vec![created, moved]);
    }

    #[tokio::test]
    async fn read_jsonl_skips_truncated_tail_only() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("journal.jsonl");
        let id = AttemptId::new();
        let good = serde_json::to_string(&transition(
            id,
            AttemptState::Pending,
            AttemptState::Analyzing,
        ))
        .unwrap();

        tokio::fs::write(&path, format!("{good}\n{{\"record\":\"trans"))
            .await
            .unwrap();
        assert_eq!(read_jsonl(&path).await.unwrap().len(), 1);

        tokio::fs::write(&path, format!("not json\n{good}\n"))
            .await
            .unwrap();
        let err = read_jsonl(&path).await.unwrap_err();
        assert!(matches!(err, GateError::Journal(_)));
    }
}
