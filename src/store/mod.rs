pub mod fs;
pub mod git;

use crate::error::StoreError;
use crate::record::TelemetryRecord;
use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::path::{Path, PathBuf};

/// Storage layout of a log partition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Layout {
    /// `repo/date/correlation_id/category.json`, one JSON object per file.
    Hierarchical,
    /// `repo/date.jsonl`, one JSON object per line, append only.
    Flat,
}

impl Layout {
    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "hierarchical" => Some(Layout::Hierarchical),
            "flat" => Some(Layout::Flat),
            _ => None,
        }
    }
}

/// Address of the log segment one record lands in: the unit of
/// concurrent-write contention.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PartitionKey {
    pub repo: String,
    pub date: NaiveDate,
    pub correlation_id: String,
    pub category: String,
}

impl PartitionKey {
    pub fn for_record(record: &TelemetryRecord) -> Self {
        Self {
            repo: record.entity.repo.clone(),
            date: record.generated_at.date_naive(),
            correlation_id: record.correlation_id.clone(),
            category: record.event.category.clone(),
        }
    }

    pub fn relative_path(&self, layout: Layout) -> PathBuf {
        let mut path = PathBuf::from(&self.repo);
        match layout {
            Layout::Hierarchical => {
                path.push(self.date.to_string());
                path.push(&self.correlation_id);
                path.push(format!("{}.json", self.category));
            }
            Layout::Flat => {
                path.push(format!("{}.jsonl", self.date));
            }
        }
        path
    }
}

/// How staged bytes land in the partition. Existing bytes are never
/// rewritten; replaying an identical document is a no-op.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AppendPayload {
    /// Hierarchical layout: the whole file.
    Document(String),
    /// Flat layout: one line appended to the file.
    Line(String),
}

impl AppendPayload {
    pub fn for_record(record: &TelemetryRecord, layout: Layout) -> Result<Self, StoreError> {
        let body = serde_json::to_string(record).map_err(|e| StoreError::Corrupt {
            path: PathBuf::new(),
            detail: format!("unserializable record: {e}"),
        })?;
        Ok(match layout {
            Layout::Hierarchical => AppendPayload::Document(body),
            Layout::Flat => AppendPayload::Line(body),
        })
    }
}

/// Author identity stamped onto published appends.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommitIdentity {
    pub name: String,
    pub email: String,
}

impl Default for CommitIdentity {
    fn default() -> Self {
        Self {
            name: "Opslog Bot".to_string(),
            email: "opslog-bot@users.noreply.github.com".to_string(),
        }
    }
}

/// One published record as read back from a partition.
#[derive(Debug, Clone)]
pub struct StoredRecord {
    /// Path relative to the log root; flat-layout records carry a
    /// `path:line` suffix in diagnostics, not here.
    pub path: PathBuf,
    pub value: Value,
}

/// Narrow transport seam over the shared, versioned, append-only store.
/// Concrete backends are swappable so tests never spawn external
/// processes.
pub trait AppendOnlyRemoteLog {
    /// Acquire a private, ephemeral working copy synchronized to the
    /// latest published state. Torn down when the workspace is dropped,
    /// on every exit path.
    fn checkout(&self) -> Result<Box<dyn LogWorkspace>, StoreError>;

    /// Every published record under one repo partition.
    fn list(&self, repo: &str) -> Result<Vec<StoredRecord>, StoreError>;
}

/// A private working copy of the remote log.
pub trait LogWorkspace {
    fn stage_append(&mut self, rel_path: &Path, payload: &AppendPayload)
    -> Result<(), StoreError>;

    fn commit(&mut self, message: &str, identity: &CommitIdentity) -> Result<(), StoreError>;

    /// Attempt to make the local commit visible to every other reader.
    /// `StoreError::Conflict` means the remote advanced concurrently.
    fn publish(&mut self) -> Result<(), StoreError>;

    /// Forward merge of newly published remote state onto the local
    /// commit. Never a destructive reset: local intent and other writers'
    /// already-published appends both survive.
    fn resync(&mut self) -> Result<(), StoreError>;
}

/// Shared read-back walk used by filesystem-shaped backends: parses every
/// `.json` document and every non-blank `.jsonl` line under `root/repo`.
pub(crate) fn collect_records(root: &Path, repo: &str) -> Result<Vec<StoredRecord>, StoreError> {
    let mut records = Vec::new();
    let partition = root.join(repo);
    if !partition.exists() {
        return Ok(records);
    }
    collect_dir(root, &partition, &mut records)?;
    Ok(records)
}

fn collect_dir(root: &Path, dir: &Path, records: &mut Vec<StoredRecord>) -> Result<(), StoreError> {
    let mut entries: Vec<PathBuf> = std::fs::read_dir(dir)?
        .collect::<Result<Vec<_>, _>>()?
        .into_iter()
        .map(|e| e.path())
        .collect();
    entries.sort();

    for path in entries {
        if path.is_dir() {
            collect_dir(root, &path, records)?;
            continue;
        }
        let rel = path.strip_prefix(root).unwrap_or(&path).to_path_buf();
        match path.extension().and_then(|e| e.to_str()) {
            Some("json") => {
                let raw = std::fs::read_to_string(&path)?;
                let value = serde_json::from_str(&raw).map_err(|e| StoreError::Corrupt {
                    path: rel.clone(),
                    detail: e.to_string(),
                })?;
                records.push(StoredRecord { path: rel, value });
            }
            Some("jsonl") => {
                let raw = std::fs::read_to_string(&path)?;
                for line in raw.lines() {
                    if line.trim().is_empty() {
                        continue;
                    }
                    let value = serde_json::from_str(line).map_err(|e| StoreError::Corrupt {
                        path: rel.clone(),
                        detail: e.to_string(),
                    })?;
                    records.push(StoredRecord {
                        path: rel.clone(),
                        value,
                    });
                }
            }
            _ => {}
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::builder::RecordBuilder;
    use crate::record::Action;
    use chrono::TimeZone;

    fn record() -> TelemetryRecord {
        RecordBuilder::new()
            .schema_version("1.0")
            .generated_at(chrono::Utc.with_ymd_and_hms(2026, 1, 2, 23, 59, 59).unwrap())
            .correlation_id("run-42")
            .source("ci", "prepare", "77")
            .entity("repository", "acme", "demo")
            .category("repo-prepare")
            .action(Action::Success)
            .build()
            .unwrap()
    }

    #[test]
    fn hierarchical_path_is_repo_date_correlation_category() {
        let key = PartitionKey::for_record(&record());
        assert_eq!(
            key.relative_path(Layout::Hierarchical),
            PathBuf::from("demo/2026-01-02/run-42/repo-prepare.json")
        );
    }

    #[test]
    fn flat_path_is_repo_date_jsonl() {
        let key = PartitionKey::for_record(&record());
        assert_eq!(
            key.relative_path(Layout::Flat),
            PathBuf::from("demo/2026-01-02.jsonl")
        );
    }

    #[test]
    fn partition_date_is_the_utc_date_of_generated_at() {
        let key = PartitionKey::for_record(&record());
        assert_eq!(key.date.to_string(), "2026-01-02");
    }
}
