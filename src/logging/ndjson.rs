use crate::record::TelemetryRecord;
use crate::writer::AppendOutcome;
use anyhow::Result;
use chrono::Utc;
use serde_json::json;
use std::fs::OpenOptions;
use std::io::Write;
use std::path::Path;

/// Append one NDJSON line describing an append outcome to a local mirror
/// file. Diagnostics only; the remote log stays the source of truth.
/// `record` is absent when the input never parsed into a record.
pub fn mirror_outcome(
    path: &Path,
    record: Option<&TelemetryRecord>,
    outcome: &AppendOutcome,
) -> Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let mut f = OpenOptions::new().create(true).append(true).open(path)?;
    let line = json!({
        "ts": Utc::now().to_rfc3339(),
        "correlation_id": record.map(|r| r.correlation_id.clone()),
        "category": record.map(|r| r.event.category.clone()),
        "action": record.map(|r| r.event.action.as_str()),
        "result": serde_json::to_value(outcome)?
    });
    writeln!(f, "{}", line)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::Action;
    use crate::record::builder::RecordBuilder;
    use tempfile::tempdir;

    #[test]
    fn mirror_appends_one_line_per_outcome() {
        let tmp = tempdir().unwrap();
        let path = tmp.path().join("logs/emit.ndjson");
        let record = RecordBuilder::seeded()
            .source("ci", "prepare", "77")
            .entity("repository", "acme", "demo")
            .category("build")
            .action(Action::Success)
            .build()
            .unwrap();
        let outcome = AppendOutcome::Skipped {
            reason: "no remote log configured".to_string(),
        };

        mirror_outcome(&path, Some(&record), &outcome).unwrap();
        mirror_outcome(&path, Some(&record), &outcome).unwrap();

        let content = std::fs::read_to_string(&path).unwrap();
        let lines: Vec<&str> = content.lines().collect();
        assert_eq!(lines.len(), 2);
        let parsed: serde_json::Value = serde_json::from_str(lines[0]).unwrap();
        assert_eq!(parsed["category"], "build");
        assert_eq!(parsed["result"]["outcome"], "skipped");
    }

    #[test]
    fn mirror_without_a_record_nulls_the_record_fields() {
        let tmp = tempdir().unwrap();
        let path = tmp.path().join("emit.ndjson");
        let outcome = AppendOutcome::Failed {
            error: "record is not valid JSON".to_string(),
        };

        mirror_outcome(&path, None, &outcome).unwrap();

        let content = std::fs::read_to_string(&path).unwrap();
        let parsed: serde_json::Value = serde_json::from_str(content.trim()).unwrap();
        assert!(parsed["correlation_id"].is_null());
        assert!(parsed["category"].is_null());
        assert_eq!(parsed["result"]["outcome"], "failed");
    }
}
