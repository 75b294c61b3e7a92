use chrono::TimeZone;
use opslog::error::{StoreError, TelemetryError};
use opslog::record::builder::RecordBuilder;
use opslog::record::{Action, TelemetryRecord};
use opslog::store::fs::FsRemoteLog;
use opslog::store::{
    AppendOnlyRemoteLog, AppendPayload, CommitIdentity, Layout, LogWorkspace, StoredRecord,
};
use opslog::writer::{AppendOutcome, LogWriter, WriterPolicy};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;
use tempfile::tempdir;

/// Filesystem store whose next `conflicts` publish attempts are rejected
/// as if a concurrent writer had advanced the remote tip in between.
struct ContendedLog {
    root: PathBuf,
    conflicts: Arc<AtomicU32>,
}

impl ContendedLog {
    fn new(root: &Path, conflicts: u32) -> Self {
        FsRemoteLog::init(root).unwrap();
        Self {
            root: root.to_path_buf(),
            conflicts: Arc::new(AtomicU32::new(conflicts)),
        }
    }
}

impl AppendOnlyRemoteLog for ContendedLog {
    fn checkout(&self) -> Result<Box<dyn LogWorkspace>, StoreError> {
        let inner = FsRemoteLog::open(&self.root)?.checkout()?;
        Ok(Box::new(ContendedWorkspace {
            inner,
            conflicts: Arc::clone(&self.conflicts),
        }))
    }

    fn list(&self, repo: &str) -> Result<Vec<StoredRecord>, StoreError> {
        FsRemoteLog::open(&self.root)?.list(repo)
    }
}

struct ContendedWorkspace {
    inner: Box<dyn LogWorkspace>,
    conflicts: Arc<AtomicU32>,
}

impl LogWorkspace for ContendedWorkspace {
    fn stage_append(
        &mut self,
        rel_path: &Path,
        payload: &AppendPayload,
    ) -> Result<(), StoreError> {
        self.inner.stage_append(rel_path, payload)
    }

    fn commit(&mut self, message: &str, identity: &CommitIdentity) -> Result<(), StoreError> {
        self.inner.commit(message, identity)
    }

    fn publish(&mut self) -> Result<(), StoreError> {
        let remaining = self.conflicts.load(Ordering::SeqCst);
        if remaining > 0 {
            self.conflicts.store(remaining - 1, Ordering::SeqCst);
            return Err(StoreError::Conflict);
        }
        self.inner.publish()
    }

    fn resync(&mut self) -> Result<(), StoreError> {
        self.inner.resync()
    }
}

fn record() -> TelemetryRecord {
    RecordBuilder::new()
        .schema_version("1.0")
        .generated_at(chrono::Utc.with_ymd_and_hms(2026, 1, 1, 12, 0, 0).unwrap())
        .correlation_id("run-1")
        .source("ci", "prepare", "77")
        .entity("repository", "acme", "demo")
        .category("build")
        .action(Action::Success)
        .build()
        .unwrap()
}

fn policy(max_retries: u32, strict: bool) -> WriterPolicy {
    WriterPolicy {
        layout: Layout::Hierarchical,
        max_retries,
        backoff_base: Duration::from_millis(1),
        strict,
        identity: CommitIdentity::default(),
    }
}

#[test]
fn transient_conflicts_are_retried_until_published() {
    let tmp = tempdir().unwrap();
    let log = ContendedLog::new(tmp.path(), 3);
    let reader = FsRemoteLog::open(tmp.path()).unwrap();
    let writer = LogWriter::new(Box::new(log), policy(5, false));

    let outcome = writer.append(&record()).unwrap();
    match outcome {
        AppendOutcome::Published { attempts, .. } => assert_eq!(attempts, 4),
        other => panic!("expected published outcome, got {other:?}"),
    }

    // The retried append landed exactly once.
    assert_eq!(reader.list("demo").unwrap().len(), 1);
}

#[test]
fn exhausted_retries_are_a_structured_failure_in_best_effort_mode() {
    let tmp = tempdir().unwrap();
    let log = ContendedLog::new(tmp.path(), u32::MAX);
    let reader = FsRemoteLog::open(tmp.path()).unwrap();
    let writer = LogWriter::new(Box::new(log), policy(2, false));

    // The caller's control flow is untouched: Ok with a failure outcome.
    let outcome = writer.append(&record()).unwrap();
    match outcome {
        AppendOutcome::Failed { error } => {
            assert!(error.contains("2 attempt"), "unexpected error text: {error}");
        }
        other => panic!("expected failed outcome, got {other:?}"),
    }
    assert!(reader.list("demo").unwrap().is_empty());
}

#[test]
fn try_append_propagates_failures_under_any_policy() {
    let tmp = tempdir().unwrap();
    let log = ContendedLog::new(tmp.path(), u32::MAX);
    let writer = LogWriter::new(Box::new(log), policy(2, false));

    let err = writer.try_append(&record()).unwrap_err();
    assert!(matches!(err, TelemetryError::ConflictExhausted { attempts: 2 }));
}

#[test]
fn exhausted_retries_raise_in_strict_mode() {
    let tmp = tempdir().unwrap();
    let log = ContendedLog::new(tmp.path(), u32::MAX);
    let writer = LogWriter::new(Box::new(log), policy(3, true));

    let err = writer.append(&record()).unwrap_err();
    assert!(matches!(err, TelemetryError::ConflictExhausted { attempts: 3 }));
}

#[test]
fn a_conflicting_writer_loses_no_records() {
    let tmp = tempdir().unwrap();

    // First writer publishes cleanly.
    let first = LogWriter::new(
        Box::new(ContendedLog::new(tmp.path(), 0)),
        policy(5, false),
    );
    first.append(&record()).unwrap();

    // Second writer hits conflicts before landing a different partition.
    let mut other = record();
    other.correlation_id = "run-2".to_string();
    let second = LogWriter::new(
        Box::new(ContendedLog::new(tmp.path(), 2)),
        policy(5, false),
    );
    let outcome = second.append(&other).unwrap();
    assert!(matches!(outcome, AppendOutcome::Published { .. }));

    let reader = FsRemoteLog::open(tmp.path()).unwrap();
    assert_eq!(reader.list("demo").unwrap().len(), 2);
}
