use crate::record::structural_issues;
use crate::store::Layout;
use anyhow::{Context, Result};
use chrono::DateTime;
use serde::Serialize;
use serde_json::Value;
use std::path::Path;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum ViolationKind {
    /// Required fields, types, enum constraints.
    Structural,
    /// Cross-field and path placement invariants.
    Placement,
}

#[derive(Debug, Clone, Serialize)]
pub struct Violation {
    pub path: String,
    pub kind: ViolationKind,
    pub message: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct ValidationReport {
    pub ok: bool,
    pub files_checked: usize,
    pub violations: Vec<Violation>,
}

#[derive(Debug, Clone, Copy)]
pub struct ValidatorOptions {
    pub layout: Layout,
    /// `false` restricts validation to existence/layout checks and skips
    /// parsing record contents.
    pub parse_json: bool,
}

impl Default for ValidatorOptions {
    fn default() -> Self {
        Self {
            layout: Layout::Hierarchical,
            parse_json: true,
        }
    }
}

struct Walk {
    violations: Vec<Violation>,
    files_checked: usize,
    parse_json: bool,
}

impl Walk {
    fn fail(&mut self, path: &Path, kind: ViolationKind, message: impl Into<String>) {
        self.violations.push(Violation {
            path: path.display().to_string(),
            kind,
            message: message.into(),
        });
    }

    fn fail_at(&mut self, location: String, kind: ViolationKind, message: impl Into<String>) {
        self.violations.push(Violation {
            path: location,
            kind,
            message: message.into(),
        });
    }
}

/// Walk a whole log tree and report every violation found. The validator
/// never stops at the first error; an absent or empty tree is valid-empty,
/// not a violation.
pub fn validate_tree(root: &Path, options: ValidatorOptions) -> Result<ValidationReport> {
    let mut walk = Walk {
        violations: Vec::new(),
        files_checked: 0,
        parse_json: options.parse_json,
    };

    if root.exists() {
        for repo_dir in sorted_entries(root)? {
            if !repo_dir.is_dir() {
                continue;
            }
            let repo_name = file_name(&repo_dir);
            match options.layout {
                Layout::Hierarchical => walk_hierarchical_repo(&mut walk, &repo_dir, &repo_name)?,
                Layout::Flat => walk_flat_repo(&mut walk, &repo_dir, &repo_name)?,
            }
        }
    }

    Ok(ValidationReport {
        ok: walk.violations.is_empty(),
        files_checked: walk.files_checked,
        violations: walk.violations,
    })
}

/// Validate one already-parsed record with no placement context; the
/// structural layer only.
pub fn validate_record(value: &Value) -> ValidationReport {
    let issues = structural_issues(value);
    ValidationReport {
        ok: issues.is_empty(),
        files_checked: 1,
        violations: issues
            .into_iter()
            .map(|message| Violation {
                path: "<record>".to_string(),
                kind: ViolationKind::Structural,
                message,
            })
            .collect(),
    }
}

fn walk_hierarchical_repo(walk: &mut Walk, repo_dir: &Path, repo_name: &str) -> Result<()> {
    for date_dir in sorted_entries(repo_dir)? {
        let date_name = file_name(&date_dir);
        if !is_valid_date_name(&date_name) {
            walk.fail(
                repo_dir,
                ViolationKind::Placement,
                format!("invalid date folder: {date_name}"),
            );
            continue;
        }
        if !date_dir.is_dir() {
            walk.fail(
                repo_dir,
                ViolationKind::Placement,
                format!("date entry is not a directory: {date_name}"),
            );
            continue;
        }

        for corr_dir in sorted_entries(&date_dir)? {
            if !corr_dir.is_dir() {
                continue;
            }
            let corr_name = file_name(&corr_dir);
            let files = sorted_entries(&corr_dir)?;
            if files.is_empty() {
                walk.fail(&corr_dir, ViolationKind::Placement, "empty correlation directory");
                continue;
            }
            for file in files {
                let name = file_name(&file);
                if name.starts_with('.') {
                    continue;
                }
                if file.extension().and_then(|e| e.to_str()) != Some("json") {
                    walk.fail(
                        &corr_dir,
                        ViolationKind::Placement,
                        format!("non-JSON file found: {name}"),
                    );
                    continue;
                }
                walk.files_checked += 1;
                if walk.parse_json {
                    validate_json_file(walk, &file, repo_name, &date_name, &corr_name)?;
                }
            }
        }
    }
    Ok(())
}

fn walk_flat_repo(walk: &mut Walk, repo_dir: &Path, repo_name: &str) -> Result<()> {
    for entry in sorted_entries(repo_dir)? {
        let name = file_name(&entry);
        if name.starts_with('.') {
            continue;
        }
        if entry.is_dir() {
            walk.fail(
                repo_dir,
                ViolationKind::Placement,
                format!("unexpected directory in flat layout: {name}"),
            );
            continue;
        }
        let Some(date_name) = name.strip_suffix(".jsonl") else {
            walk.fail(
                repo_dir,
                ViolationKind::Placement,
                format!("non-JSONL file found: {name}"),
            );
            continue;
        };
        if !is_valid_date_name(date_name) {
            walk.fail(
                repo_dir,
                ViolationKind::Placement,
                format!("invalid date file: {name}"),
            );
            continue;
        }
        walk.files_checked += 1;
        if walk.parse_json {
            validate_jsonl_file(walk, &entry, repo_name, date_name)?;
        }
    }
    Ok(())
}

fn validate_json_file(
    walk: &mut Walk,
    file: &Path,
    repo_name: &str,
    date_name: &str,
    corr_name: &str,
) -> Result<()> {
    let content = std::fs::read_to_string(file)
        .with_context(|| format!("read telemetry file {}", file.display()))?;

    let record: Value = match serde_json::from_str(content.trim()) {
        Ok(value) => value,
        Err(_) => {
            walk.fail(
                file,
                ViolationKind::Structural,
                "Invalid JSON or multiple JSON objects.",
            );
            return Ok(());
        }
    };

    if record.is_array() {
        walk.fail(
            file,
            ViolationKind::Placement,
            "File must contain a single JSON object.",
        );
        return Ok(());
    }

    for issue in structural_issues(&record) {
        walk.fail(file, ViolationKind::Structural, issue);
    }

    check_placement(
        walk,
        file.display().to_string(),
        &record,
        repo_name,
        date_name,
        Some(corr_name),
        Some(file),
    );
    Ok(())
}

fn validate_jsonl_file(
    walk: &mut Walk,
    file: &Path,
    repo_name: &str,
    date_name: &str,
) -> Result<()> {
    let content = std::fs::read_to_string(file)
        .with_context(|| format!("read telemetry file {}", file.display()))?;

    for (idx, line) in content.lines().enumerate() {
        // Blank lines are ignored for counting, never for other lines.
        if line.trim().is_empty() {
            continue;
        }
        let location = format!("{}:{}", file.display(), idx + 1);
        let record: Value = match serde_json::from_str(line) {
            Ok(value) => value,
            Err(_) => {
                walk.fail_at(location, ViolationKind::Structural, "Invalid JSON line.");
                continue;
            }
        };
        for issue in structural_issues(&record) {
            walk.fail_at(location.clone(), ViolationKind::Structural, issue);
        }
        check_placement(walk, location, &record, repo_name, date_name, None, None);
    }
    Ok(())
}

/// The cross-field layer: a record must live exactly where its own fields
/// say it lives.
fn check_placement(
    walk: &mut Walk,
    location: String,
    record: &Value,
    repo_name: &str,
    date_name: &str,
    corr_name: Option<&str>,
    file: Option<&Path>,
) {
    if let Some(raw) = record.get("generated_at").and_then(|v| v.as_str())
        && let Ok(generated_at) = DateTime::parse_from_rfc3339(raw)
    {
        let utc_date = generated_at.to_utc().date_naive().to_string();
        if utc_date != date_name {
            walk.fail_at(
                location.clone(),
                ViolationKind::Placement,
                format!("date mismatch: folder={date_name}, generated_at date={utc_date}"),
            );
        }
    }

    if let Some(corr_name) = corr_name
        && let Some(correlation_id) = record.get("correlation_id").and_then(|v| v.as_str())
        && correlation_id != corr_name
    {
        walk.fail_at(
            location.clone(),
            ViolationKind::Placement,
            format!("correlation mismatch: folder={corr_name}, record={correlation_id}"),
        );
    }

    if let Some(file) = file
        && let Some(category) = record.pointer("/event/category").and_then(|v| v.as_str())
    {
        let expected = format!("{category}.json");
        if file.file_name().and_then(|n| n.to_str()) != Some(expected.as_str()) {
            walk.fail_at(
                location.clone(),
                ViolationKind::Placement,
                format!("filename must match event.category ({expected})"),
            );
        }
    }

    if let Some(entity_repo) = record.pointer("/entity/repo").and_then(|v| v.as_str())
        && entity_repo != repo_name
    {
        walk.fail_at(
            location,
            ViolationKind::Placement,
            format!("repo mismatch: path={repo_name}, entity.repo={entity_repo}"),
        );
    }
}

/// Strict 4-digit/2-digit/2-digit date pattern.
pub fn is_valid_date_name(name: &str) -> bool {
    let bytes = name.as_bytes();
    bytes.len() == 10
        && bytes[4] == b'-'
        && bytes[7] == b'-'
        && [0, 1, 2, 3, 5, 6, 8, 9]
            .iter()
            .all(|&i| bytes[i].is_ascii_digit())
}

fn sorted_entries(dir: &Path) -> Result<Vec<std::path::PathBuf>> {
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
