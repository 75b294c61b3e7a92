use crate::error::{StoreError, TelemetryError};
use crate::record::TelemetryRecord;
use crate::store::{AppendOnlyRemoteLog, AppendPayload, CommitIdentity, Layout, PartitionKey};
use serde::Serialize;
use std::thread;
use std::time::Duration;

pub const DEFAULT_MAX_RETRIES: u32 = 5;
pub const DEFAULT_BACKOFF_BASE_MS: u64 = 200;

#[derive(Debug, Clone)]
pub struct WriterPolicy {
    pub layout: Layout,
    /// Publish attempts before giving up, at least 1.
    pub max_retries: u32,
    /// Attempt `n` sleeps `backoff_base * n` before resyncing.
    pub backoff_base: Duration,
    /// Best-effort (default) swallows failures into a structured outcome;
    /// strict propagates them for environments that require delivery.
    pub strict: bool,
    pub identity: CommitIdentity,
}

impl Default for WriterPolicy {
    fn default() -> Self {
        Self {
            layout: Layout::Hierarchical,
            max_retries: DEFAULT_MAX_RETRIES,
            backoff_base: Duration::from_millis(DEFAULT_BACKOFF_BASE_MS),
            strict: false,
            identity: CommitIdentity::default(),
        }
    }
}

/// Structured result of one append. Telemetry emission failure must never
/// be mistaken for business-logic failure, so non-success is a value here,
/// not a panic or (in best-effort mode) an error.
#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(tag = "outcome", rename_all = "kebab-case")]
pub enum AppendOutcome {
    Published { attempts: u32, path: String },
    Skipped { reason: String },
    Failed { error: String },
}

pub struct LogWriter {
    backend: Option<Box<dyn AppendOnlyRemoteLog>>,
    policy: WriterPolicy,
}

impl LogWriter {
    pub fn new(backend: Box<dyn AppendOnlyRemoteLog>, policy: WriterPolicy) -> Self {
        Self {
            backend: Some(backend),
            policy,
        }
    }

    /// Writer with no backend configured. Appends are skipped in
    /// best-effort mode and fail with `BackendUnavailable` in strict mode.
    pub fn unconfigured(policy: WriterPolicy) -> Self {
        Self {
            backend: None,
            policy,
        }
    }

    pub fn policy(&self) -> &WriterPolicy {
        &self.policy
    }

    /// Append one record to its partition, honoring the policy's failure
    /// semantics. In best-effort mode the returned `Result` is always
    /// `Ok`; the outcome value carries any failure.
    pub fn append(&self, record: &TelemetryRecord) -> Result<AppendOutcome, TelemetryError> {
        let Some(backend) = self.backend.as_deref() else {
            if self.policy.strict {
                return Err(TelemetryError::BackendUnavailable(
                    "no remote log configured".to_string(),
                ));
            }
            return Ok(AppendOutcome::Skipped {
                reason: "no remote log configured".to_string(),
            });
        };

        match self.publish_with_retry(backend, record) {
            Ok(outcome) => Ok(outcome),
            Err(err) if self.policy.strict => Err(err),
            Err(err) => Ok(AppendOutcome::Failed {
                error: err.to_string(),
            }),
        }
    }

    /// Strict append regardless of policy: every delivery failure is
    /// returned to the caller, including a missing backend.
    pub fn try_append(&self, record: &TelemetryRecord) -> Result<AppendOutcome, TelemetryError> {
        let Some(backend) = self.backend.as_deref() else {
            return Err(TelemetryError::BackendUnavailable(
                "no remote log configured".to_string(),
            ));
        };
        self.publish_with_retry(backend, record)
    }

    fn publish_with_retry(
        &self,
        backend: &dyn AppendOnlyRemoteLog,
        record: &TelemetryRecord,
    ) -> Result<AppendOutcome, TelemetryError> {
        let key = PartitionKey::for_record(record);
        let rel_path = key.relative_path(self.policy.layout);
        let payload = AppendPayload::for_record(record, self.policy.layout).map_err(map_store)?;

        // Workspace teardown is tied to this scope; success and failure
        // paths both release the working copy.
        let mut workspace = backend.checkout().map_err(map_store)?;
        workspace
            .stage_append(&rel_path, &payload)
            .map_err(map_store)?;
        workspace
            .commit(&commit_message(record), &self.policy.identity)
            .map_err(map_store)?;

        let max_attempts = self.policy.max_retries.max(1);
        for attempt in 1..=max_attempts {
            match workspace.publish() {
                Ok(()) => {
                    return Ok(AppendOutcome::Published {
                        attempts: attempt,
                        path: rel_path.to_string_lossy().into_owned(),
                    });
                }
                Err(StoreError::Conflict) if attempt < max_attempts => {
                    thread::sleep(self.policy.backoff_base * attempt);
                    workspace.resync().map_err(map_store)?;
                }
                Err(StoreError::Conflict) => {
                    return Err(TelemetryError::ConflictExhausted {
                        attempts: max_attempts,
                    });
                }
                Err(err) => return Err(map_store(err)),
            }
        }
        Err(TelemetryError::ConflictExhausted {
            attempts: max_attempts,
        })
    }
}

pub fn commit_message(record: &TelemetryRecord) -> String {
    format!(
        "telemetry(v1): {} {} ({})",
        record.event.category,
        record.event.action.as_str(),
        record.correlation_id
    )
}

fn map_store(err: StoreError) -> TelemetryError {
    match err {
        StoreError::Corrupt { path, detail } => {
            TelemetryError::AggregationCorruption { path, detail }
        }
        other => TelemetryError::BackendUnavailable(other.to_string()),
    }
}
