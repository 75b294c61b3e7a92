pub mod builder;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// The only envelope version this crate writes and validates.
pub const SCHEMA_VERSION: &str = "1.0";

/// Reserved key inside `details`; prevents accidental nesting collisions
/// with the top-level `event` object (use `details.issue_event` instead).
pub const RESERVED_DETAILS_KEY: &str = "event";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Action {
    Success,
    Failure,
}

impl Action {
    pub fn as_str(self) -> &'static str {
        match self {
            Action::Success => "success",
            Action::Failure => "failure",
        }
    }
}

/// Provenance of the emitting process.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Source {
    pub workflow: String,
    pub job: String,
    pub run_id: String,
}

/// The subject the event is about.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Entity {
    #[serde(rename = "type")]
    pub entity_type: String,
    pub owner: String,
    pub repo: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventInfo {
    pub category: String,
    pub action: Action,
    pub reason: Option<String>,
}

/// One immutable telemetry event (schema v1). Created once at emission
/// time, written exactly through the log writer, read-only thereafter.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TelemetryRecord {
    pub schema_version: String,
    pub generated_at: DateTime<Utc>,
    pub correlation_id: String,
    pub source: Source,
    pub entity: Entity,
    pub event: EventInfo,
    pub details: Map<String, Value>,
}

impl TelemetryRecord {
    /// Structurally validate an arbitrary JSON payload, then deserialize.
    /// Every issue is reported at once.
    pub fn from_json(value: &Value) -> Result<Self, crate::error::ValidationError> {
        let issues = structural_issues(value);
        if !issues.is_empty() {
            return Err(crate::error::ValidationError::new(issues));
        }
        serde_json::from_value(value.clone())
            .map_err(|e| crate::error::ValidationError::single(format!("undeserializable record: {e}")))
    }
}

fn non_empty_str<'a>(value: &'a Value, pointer: &str) -> Option<&'a str> {
    value
        .pointer(pointer)
        .and_then(|v| v.as_str())
        .filter(|s| !s.is_empty())
}

/// The structural validation layer shared by the record builder's JSON
/// entry point and the tree validator: required fields present and
/// correctly typed, enums constrained, `details` an object with no
/// reserved keys. Returns every issue found, never just the first.
pub fn structural_issues(value: &Value) -> Vec<String> {
    let mut issues = Vec::new();

    let Some(record) = value.as_object() else {
        issues.push("payload is not a JSON object".to_string());
        return issues;
    };

    for field in [
        "schema_version",
        "generated_at",
        "correlation_id",
        "source",
        "entity",
        "event",
        "details",
    ] {
        if !record.contains_key(field) {
            issues.push(format!("missing required field: {field}"));
        }
    }

    if let Some(version) = record.get("schema_version") {
        if version.as_str() != Some(SCHEMA_VERSION) {
            issues.push(format!("schema_version must be \"{SCHEMA_VERSION}\""));
        }
    }

    if let Some(generated_at) = record.get("generated_at") {
        match generated_at.as_str() {
            Some(raw) if DateTime::parse_from_rfc3339(raw).is_ok() => {}
            _ => issues.push("invalid generated_at timestamp".to_string()),
        }
    }

    if let Some(correlation_id) = record.get("correlation_id")
        && correlation_id.as_str().is_none_or(str::is_empty)
    {
        issues.push("correlation_id must be a non-empty string".to_string());
    }

    if record.contains_key("source") {
        for field in ["workflow", "job", "run_id"] {
            if non_empty_str(value, &format!("/source/{field}")).is_none() {
                issues.push(format!("missing source.{field}"));
            }
        }
    }

    if record.contains_key("entity") {
        for field in ["type", "owner", "repo"] {
            if non_empty_str(value, &format!("/entity/{field}")).is_none() {
                issues.push(format!("missing entity.{field}"));
            }
        }
    }

    if record.contains_key("event") {
        if non_empty_str(value, "/event/category").is_none() {
            issues.push("missing event.category".to_string());
        }
        match value.pointer("/event/action").and_then(|v| v.as_str()) {
            Some("success") | Some("failure") => {}
            Some(other) => issues.push(format!("invalid event.action: {other}")),
            None => issues.push("missing event.action".to_string()),
        }
        if value
            .pointer("/event")
            .and_then(|v| v.as_object())
            .is_some_and(|ev| !ev.contains_key("reason"))
        {
            issues.push("missing event.reason (use null when absent)".to_string());
        }
    }

    if let Some(details) = record.get("details") {
        match details.as_object() {
            None => issues.push("details must be an object".to_string()),
            Some(map) => {
                if map.contains_key(RESERVED_DETAILS_KEY) {
                    issues.push(
                        "details.event is not allowed (use details.issue_event)".to_string(),
                    );
                }
                if let Some(checks) = map.get("checks").and_then(|v| v.as_array()) {
                    for check in checks {
                        match check.get("outcome").and_then(|v| v.as_str()) {
                            Some("PASS") | Some("WARN") | Some("FAIL") => {}
                            other => issues.push(format!(
                                "invalid check.outcome: {}",
                                other.unwrap_or("<missing>")
                            )),
                        }
                    }
                }
                // Duplicate repo drift guard.
                if let Some(details_repo) = map.get("repo").and_then(|v| v.as_str())
                    && let Some(entity_repo) = non_empty_str(value, "/entity/repo")
                    && !details_repo.ends_with(entity_repo)
                {
                    issues.push("details.repo does not align with entity.repo".to_string());
                }
            }
        }
    }

    issues
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn valid_record() -> Value {
        json!({
            "schema_version": "1.0",
            "generated_at": "2026-01-01T00:00:00Z",
            "correlation_id": "abc",
            "source": {"workflow": "ci", "job": "prepare", "run_id": "77"},
            "entity": {"type": "repository", "owner": "acme", "repo": "demo"},
            "event": {"category": "build", "action": "success", "reason": null},
            "details": {}
        })
    }

    #[test]
    fn valid_record_has_no_issues() {
        assert!(structural_issues(&valid_record()).is_empty());
    }

    #[test]
    fn missing_field_is_named() {
        let mut value = valid_record();
        value.as_object_mut().unwrap().remove("correlation_id");
        let issues = structural_issues(&value);
        assert_eq!(issues, vec!["missing required field: correlation_id"]);
    }

    #[test]
    fn bad_action_and_reserved_details_key_both_reported() {
        let mut value = valid_record();
        value["event"]["action"] = json!("skipped");
        value["details"]["event"] = json!({"nested": true});
        let issues = structural_issues(&value);
        assert!(issues.iter().any(|i| i == "invalid event.action: skipped"));
        assert!(issues.iter().any(|i| i.starts_with("details.event is not allowed")));
    }

    #[test]
    fn check_outcomes_are_constrained() {
        let mut value = valid_record();
        value["details"]["checks"] = json!([
            {"id": "labels", "outcome": "PASS"},
            {"id": "milestones", "outcome": "SKIP"}
        ]);
        let issues = structural_issues(&value);
        assert_eq!(issues, vec!["invalid check.outcome: SKIP"]);
    }

    #[test]
    fn details_repo_drift_is_flagged() {
        let mut value = valid_record();
        value["details"]["repo"] = json!("acme/other");
        let issues = structural_issues(&value);
        assert_eq!(issues, vec!["details.repo does not align with entity.repo"]);
    }

    #[test]
    fn from_json_round_trips() {
        let record = TelemetryRecord::from_json(&valid_record()).unwrap();
        assert_eq!(record.schema_version, SCHEMA_VERSION);
        assert_eq!(record.event.action, Action::Success);
        assert_eq!(record.entity.repo, "demo");
    }

    #[test]
    fn from_json_rejects_array_payload() {
        let err = TelemetryRecord::from_json(&json!([1, 2])).unwrap_err();
        assert_eq!(err.issues, vec!["payload is not a JSON object"]);
    }
}
