use std::path::PathBuf;
use thiserror::Error;

/// Structural validation failure for a single record.
///
/// Collects every issue found so an emission site can be fixed in one pass
/// instead of one field per run.
#[derive(Debug, Clone, Error)]
#[error("invalid telemetry record: {}", issues.join("; "))]
pub struct ValidationError {
    pub issues: Vec<String>,
}

impl ValidationError {
    pub fn new(issues: Vec<String>) -> Self {
        Self { issues }
    }

    pub fn single(issue: impl Into<String>) -> Self {
        Self {
            issues: vec![issue.into()],
        }
    }
}

/// Transport-level failures raised by a remote log backend.
#[derive(Debug, Error)]
pub enum StoreError {
    /// The remote advanced while a publish was in flight.
    #[error("publish rejected: remote advanced concurrently")]
    Conflict,
    #[error("remote log unavailable: {0}")]
    Unavailable(String),
    #[error("append-only violation at {0}: existing record differs")]
    AppendOnlyViolation(PathBuf),
    #[error("unreadable record at {path}: {detail}")]
    Corrupt { path: PathBuf, detail: String },
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Failures surfaced by the telemetry core to its callers.
#[derive(Debug, Error)]
pub enum TelemetryError {
    #[error(transparent)]
    Validation(#[from] ValidationError),
    #[error("append retries exhausted after {attempts} attempt(s)")]
    ConflictExhausted { attempts: u32 },
    #[error("telemetry backend unavailable: {0}")]
    BackendUnavailable(String),
    #[error("corrupt telemetry at {path}: {detail}")]
    AggregationCorruption { path: PathBuf, detail: String },
}
