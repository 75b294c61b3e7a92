use crate::store::Layout;
use crate::validator::is_valid_date_name;
use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value;
use std::collections::BTreeSet;
use std::path::{Path, PathBuf};

pub const DASHBOARD_SCHEMA_VERSION: &str = "dashboard.v1";
pub const TELEMETRY_VERSION: &str = "v1";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum DashboardStatus {
    NoTelemetry,
    Healthy,
    InvalidTelemetry,
    Error,
}

#[derive(Debug, Clone, Default, Serialize, PartialEq)]
pub struct Coverage {
    pub first: Option<String>,
    pub last: Option<String>,
    pub days_present: usize,
}

#[derive(Debug, Clone, Default, Serialize, PartialEq)]
pub struct Metrics {
    pub total_events: u64,
    /// One per correlation folder; absent in the flat layout.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub total_runs: Option<u64>,
    pub categories: Vec<String>,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct Diagnostics {
    pub warnings: Vec<String>,
    pub errors: Vec<String>,
    pub notes: Vec<String>,
}

/// Derived, recomputable read model of one repo partition. Disposable:
/// always recomputable from the current partition state.
#[derive(Debug, Clone, Serialize)]
pub struct DashboardSnapshot {
    pub schema_version: &'static str,
    pub repo: String,
    pub telemetry_version: &'static str,
    pub generated_at: DateTime<Utc>,
    pub status: DashboardStatus,
    pub coverage: Coverage,
    pub metrics: Metrics,
    pub diagnostics: Diagnostics,
}

/// What to do with an unreadable or malformed record. Explicit, never
/// silently inconsistent.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MalformedPolicy {
    /// Fail closed: name the first offender and stop (default).
    Fail,
    /// Skip the offender and note it in the diagnostics.
    SkipAndNote,
}

#[derive(Debug, Clone, Copy)]
pub struct AggregatorOptions {
    pub layout: Layout,
    pub on_malformed: MalformedPolicy,
}

impl Default for AggregatorOptions {
    fn default() -> Self {
        Self {
            layout: Layout::Hierarchical,
            on_malformed: MalformedPolicy::Fail,
        }
    }
}

pub fn aggregate(root: &Path, repo: &str, options: AggregatorOptions) -> DashboardSnapshot {
    aggregate_at(root, repo, options, Utc::now())
}

/// Deterministic aggregation: given an identical partition snapshot and
/// `generated_at`, two runs produce byte-identical output.
pub fn aggregate_at(
    root: &Path,
    repo: &str,
    options: AggregatorOptions,
    generated_at: DateTime<Utc>,
) -> DashboardSnapshot {
    match try_aggregate(root, repo, options, generated_at) {
        Ok(snapshot) => snapshot,
        Err(err) => snapshot_with(
            repo,
            generated_at,
            DashboardStatus::Error,
            Coverage::default(),
            Metrics::default(),
            Diagnostics {
                errors: vec![err.to_string()],
                ..Diagnostics::default()
            },
        ),
    }
}

fn try_aggregate(
    root: &Path,
    repo: &str,
    options: AggregatorOptions,
    generated_at: DateTime<Utc>,
) -> Result<DashboardSnapshot> {
    let partition = root.join(repo);
    if !partition.exists() {
        return Ok(no_telemetry(repo, generated_at, Vec::new()));
    }

    let mut warnings = Vec::new();
    let mut invalid_entries = Vec::new();
    let mut dates = Vec::new();

    for entry in sorted_entries(&partition)? {
        let name = file_name(&entry);
        if name.starts_with('.') {
            continue;
        }
        let date_name = match options.layout {
            Layout::Hierarchical if entry.is_dir() && is_valid_date_name(&name) => name.clone(),
            Layout::Flat
                if entry.is_file()
                    && name
                        .strip_suffix(".jsonl")
                        .is_some_and(is_valid_date_name) =>
            {
                name.trim_end_matches(".jsonl").to_string()
            }
            _ => {
                invalid_entries.push(name);
                continue;
            }
        };
        dates.push((date_name, entry));
    }

    if !invalid_entries.is_empty() {
        match options.on_malformed {
            MalformedPolicy::Fail => {
                return Ok(snapshot_with(
                    repo,
                    generated_at,
                    DashboardStatus::InvalidTelemetry,
                    Coverage::default(),
                    Metrics::default(),
                    Diagnostics {
                        errors: invalid_entries
                            .iter()
                            .map(|name| format!("invalid partition entry: {name}"))
                            .collect(),
                        ..Diagnostics::default()
                    },
                ));
            }
            MalformedPolicy::SkipAndNote => {
                for name in &invalid_entries {
                    warnings.push(format!("skipped invalid partition entry: {name}"));
                }
            }
        }
    }

    if dates.is_empty() {
        return Ok(no_telemetry(repo, generated_at, warnings));
    }

    let mut total_events = 0u64;
    let mut total_runs = 0u64;
    let mut categories = BTreeSet::new();

    for (_, date_path) in &dates {
        let outcome = match options.layout {
            Layout::Hierarchical => scan_date_dir(
                date_path,
                &mut total_events,
                &mut total_runs,
                &mut categories,
                options.on_malformed,
                &mut warnings,
            )?,
            Layout::Flat => scan_jsonl_file(
                date_path,
                &mut total_events,
                &mut categories,
                options.on_malformed,
                &mut warnings,
            )?,
        };
        if let Some(offender) = outcome {
            return Ok(snapshot_with(
                repo,
                generated_at,
                DashboardStatus::InvalidTelemetry,
                Coverage::default(),
                Metrics::default(),
                Diagnostics {
                    errors: vec![offender],
                    ..Diagnostics::default()
                },
            ));
        }
    }

    let coverage = Coverage {
        first: dates.first().map(|(d, _)| d.clone()),
        last: dates.last().map(|(d, _)| d.clone()),
        days_present: dates.len(),
    };
    let metrics = Metrics {
        total_events,
        total_runs: match options.layout {
            Layout::Hierarchical => Some(total_runs),
            Layout::Flat => None,
        },
        categories: categories.into_iter().collect(),
    };

    Ok(snapshot_with(
        repo,
        generated_at,
        DashboardStatus::Healthy,
        coverage,
        metrics,
        Diagnostics {
            warnings,
            notes: vec!["No destructive actions taken".to_string()],
            ..Diagnostics::default()
        },
    ))
}

/// Returns `Some(offender)` when a malformed record must fail the run.
fn scan_date_dir(
    date_dir: &Path,
    total_events: &mut u64,
    total_runs: &mut u64,
    categories: &mut BTreeSet<String>,
    on_malformed: MalformedPolicy,
    warnings: &mut Vec<String>,
) -> Result<Option<String>> {
    for corr_dir in sorted_entries(date_dir)? {
        if !corr_dir.is_dir() {
            continue;
        }
        *total_runs += 1;
        for file in sorted_entries(&corr_dir)? {
            let name = file_name(&file);
            if name.starts_with('.') {
                continue;
            }
            let raw = std::fs::read_to_string(&file)
                .with_context(|| format!("read {}", file.display()))?;
            let parsed: Option<Value> = serde_json::from_str(raw.trim()).ok();
            match parsed.filter(Value::is_object) {
                Some(record) => {
                    *total_events += 1;
                    if let Some(category) =
                        record.pointer("/event/category").and_then(|v| v.as_str())
                    {
                        categories.insert(category.to_string());
                    }
                }
                None => {
                    let offender = format!("malformed record: {}", file.display());
                    match on_malformed {
                        MalformedPolicy::Fail => return Ok(Some(offender)),
                        MalformedPolicy::SkipAndNote => warnings.push(format!("skipped {offender}")),
                    }
                }
            }
        }
    }
    Ok(None)
}

fn scan_jsonl_file(
    file: &Path,
    total_events: &mut u64,
    categories: &mut BTreeSet<String>,
    on_malformed: MalformedPolicy,
    warnings: &mut Vec<String>,
) -> Result<Option<String>> {
    let raw =
        std::fs::read_to_string(file).with_context(|| format!("read {}", file.display()))?;
    for (idx, line) in raw.lines().enumerate() {
        if line.trim().is_empty() {
            continue;
        }
        let parsed: Option<Value> = serde_json::from_str(line).ok();
        match parsed.filter(Value::is_object) {
            Some(record) => {
                *total_events += 1;
                if let Some(category) = record.pointer("/event/category").and_then(|v| v.as_str())
                {
                    categories.insert(category.to_string());
                }
            }
            None => {
                let offender = format!("malformed record: {}:{}", file.display(), idx + 1);
                match on_malformed {
                    MalformedPolicy::Fail => return Ok(Some(offender)),
                    MalformedPolicy::SkipAndNote => warnings.push(format!("skipped {offender}")),
                }
            }
        }
    }
    Ok(None)
}

/// Build `dashboard.json` for every repo under the telemetry root. A repo
/// whose aggregation fails gets an error-status dashboard; the fan-out
/// never aborts halfway.
pub fn build_all(
    root: &Path,
    out_dir: &Path,
    options: AggregatorOptions,
) -> Result<Vec<(String, DashboardSnapshot)>> {
    let mut built = Vec::new();
    if !root.exists() {
        return Ok(built);
    }
    std::fs::create_dir_all(out_dir)
        .with_context(|| format!("create dashboard root {}", out_dir.display()))?;

    for repo_dir in sorted_entries(root)? {
        if !repo_dir.is_dir() {
            continue;
        }
        let repo = file_name(&repo_dir);
        let snapshot = aggregate(root, &repo, options);
        let target = out_dir.join(&repo).join("dashboard.json");
        if let Some(parent) = target.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let body = serde_json::to_string_pretty(&snapshot)?;
        std::fs::write(&target, body)
            .with_context(|| format!("write {}", target.display()))?;
        built.push((repo, snapshot));
    }
    Ok(built)
}

fn no_telemetry(repo: &str, generated_at: DateTime<Utc>, warnings: Vec<String>) -> DashboardSnapshot {
    let mut diagnostics = Diagnostics {
        warnings,
        ..Diagnostics::default()
    };
    diagnostics
        .warnings
        .push("No telemetry records found".to_string());
    snapshot_with(
        repo,
        generated_at,
        DashboardStatus::NoTelemetry,
        Coverage::default(),
        Metrics::default(),
        diagnostics,
    )
}

fn snapshot_with(
    repo: &str,
    generated_at: DateTime<Utc>,
    status: DashboardStatus,
    coverage: Coverage,
    metrics: Metrics,
    diagnostics: Diagnostics,
) -> DashboardSnapshot {
    DashboardSnapshot {
        schema_version: DASHBOARD_SCHEMA_VERSION,
        repo: repo.to_string(),
        telemetry_version: TELEMETRY_VERSION,
        generated_at,
        status,
        coverage,
        metrics,
        diagnostics,
    }
}

fn sorted_entries(dir: &Path) -> Result<Vec<PathBuf>> {
    let mut entries: Vec<_> = std::fs::read_dir(dir)
        .with_context(|| format!("read dir {}", dir.display()))?
        .collect::<std::io::Result<Vec<_>>>()?
        .into_iter()
        .map(|e| e.path())
        .collect();
    entries.sort();
    Ok(entries)
}

fn file_name(path: &Path) -> String {
    path.file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use serde_json::json;
    use tempfile::tempdir;

    fn fixed_now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 2, 1, 0, 0, 0).unwrap()
    }

    fn write(path: &Path, content: &str) {
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(path, content).unwrap();
    }

    fn record(date: &str, category: &str) -> String {
        json!({
            "schema_version": "1.0",
            "generated_at": format!("{date}T00:00:00Z"),
            "correlation_id": "abc",
            "entity": {"repo": "demo"},
            "event": {"category": category, "action": "success", "reason": null}
        })
        .to_string()
    }

    #[test]
    fn missing_partition_is_no_telemetry_with_zeroed_metrics() {
        let tmp = tempdir().unwrap();
        let snapshot = aggregate_at(tmp.path(), "demo", AggregatorOptions::default(), fixed_now());
        assert_eq!(snapshot.status, DashboardStatus::NoTelemetry);
        assert_eq!(snapshot.metrics.total_events, 0);
        assert_eq!(
            snapshot.coverage,
            Coverage {
                first: None,
                last: None,
                days_present: 0
            }
        );
        assert_eq!(snapshot.diagnostics.warnings, vec!["No telemetry records found"]);
    }

    #[test]
    fn single_hierarchical_record_is_healthy() {
        let tmp = tempdir().unwrap();
        write(
            &tmp.path().join("demo/2026-01-01/abc/build.json"),
            &record("2026-01-01", "build"),
        );
        let snapshot = aggregate_at(tmp.path(), "demo", AggregatorOptions::default(), fixed_now());
        assert_eq!(snapshot.status, DashboardStatus::Healthy);
        assert_eq!(snapshot.metrics.total_events, 1);
        assert_eq!(snapshot.metrics.total_runs, Some(1));
        assert_eq!(snapshot.metrics.categories, vec!["build"]);
        assert_eq!(snapshot.coverage.days_present, 1);
    }

    #[test]
    fn events_and_days_are_counted_across_dates() {
        let tmp = tempdir().unwrap();
        write(
            &tmp.path().join("demo/2026-01-01/c1/build.json"),
            &record("2026-01-01", "build"),
        );
        write(
            &tmp.path().join("demo/2026-01-01/c2/deploy.json"),
            &record("2026-01-01", "deploy"),
        );
        write(
            &tmp.path().join("demo/2026-01-03/c3/build.json"),
            &record("2026-01-03", "build"),
        );
        let snapshot = aggregate_at(tmp.path(), "demo", AggregatorOptions::default(), fixed_now());
        assert_eq!(snapshot.metrics.total_events, 3);
        assert_eq!(snapshot.metrics.total_runs, Some(3));
        assert_eq!(snapshot.coverage.days_present, 2);
        assert_eq!(snapshot.coverage.first.as_deref(), Some("2026-01-01"));
        assert_eq!(snapshot.coverage.last.as_deref(), Some("2026-01-03"));
        assert_eq!(snapshot.metrics.categories, vec!["build", "deploy"]);
    }

    #[test]
    fn flat_layout_counts_lines_and_omits_total_runs() {
        let tmp = tempdir().unwrap();
        write(
            &tmp.path().join("demo/2026-01-01.jsonl"),
            &format!("{}\n\n{}\n", record("2026-01-01", "build"), record("2026-01-01", "deploy")),
        );
        let snapshot = aggregate_at(
            tmp.path(),
            "demo",
            AggregatorOptions {
                layout: Layout::Flat,
                on_malformed: MalformedPolicy::Fail,
            },
            fixed_now(),
        );
        assert_eq!(snapshot.status, DashboardStatus::Healthy);
        assert_eq!(snapshot.metrics.total_events, 2);
        assert_eq!(snapshot.metrics.total_runs, None);
    }

    #[test]
    fn invalid_date_entries_fail_closed_by_default() {
        let tmp = tempdir().unwrap();
        std::fs::create_dir_all(tmp.path().join("demo/latest")).unwrap();
        let snapshot = aggregate_at(tmp.path(), "demo", AggregatorOptions::default(), fixed_now());
        assert_eq!(snapshot.status, DashboardStatus::InvalidTelemetry);
        assert_eq!(snapshot.diagnostics.errors, vec!["invalid partition entry: latest"]);
    }

    #[test]
    fn malformed_record_names_first_offender() {
        let tmp = tempdir().unwrap();
        write(&tmp.path().join("demo/2026-01-01/abc/build.json"), "not json");
        let snapshot = aggregate_at(tmp.path(), "demo", AggregatorOptions::default(), fixed_now());
        assert_eq!(snapshot.status, DashboardStatus::InvalidTelemetry);
        assert!(snapshot.diagnostics.errors[0].starts_with("malformed record: "));
    }

    #[test]
    fn permissive_policy_skips_and_notes() {
        let tmp = tempdir().unwrap();
        write(&tmp.path().join("demo/2026-01-01/abc/bad.json"), "not json");
        write(
            &tmp.path().join("demo/2026-01-01/abc/build.json"),
            &record("2026-01-01", "build"),
        );
        let snapshot = aggregate_at(
            tmp.path(),
            "demo",
            AggregatorOptions {
                layout: Layout::Hierarchical,
                on_malformed: MalformedPolicy::SkipAndNote,
            },
            fixed_now(),
        );
        assert_eq!(snapshot.status, DashboardStatus::Healthy);
        assert_eq!(snapshot.metrics.total_events, 1);
        assert_eq!(snapshot.diagnostics.warnings.len(), 1);
    }

    #[test]
    fn identical_partition_yields_byte_identical_output() {
        let tmp = tempdir().unwrap();
        write(
            &tmp.path().join("demo/2026-01-01/c1/build.json"),
            &record("2026-01-01", "build"),
        );
        let opts = AggregatorOptions::default();
        let a = serde_json::to_string(&aggregate_at(tmp.path(), "demo", opts, fixed_now())).unwrap();
        let b = serde_json::to_string(&aggregate_at(tmp.path(), "demo", opts, fixed_now())).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn fan_out_writes_one_dashboard_per_repo() {
        let tmp = tempdir().unwrap();
        let out = tempdir().unwrap();
        write(
            &tmp.path().join("demo/2026-01-01/c1/build.json"),
            &record("2026-01-01", "build"),
        );
        std::fs::create_dir_all(tmp.path().join("empty-repo")).unwrap();

        let built = build_all(tmp.path(), out.path(), AggregatorOptions::default()).unwrap();
        assert_eq!(built.len(), 2);
        assert!(out.path().join("demo/dashboard.json").exists());
        assert!(out.path().join("empty-repo/dashboard.json").exists());

        let demo: Value = serde_json::from_str(
            &std::fs::read_to_string(out.path().join("demo/dashboard.json")).unwrap(),
        )
        .unwrap();
        assert_eq!(demo["schema_version"], "dashboard.v1");
        assert_eq!(demo["status"], "healthy");
    }
}
