use crate::error::ValidationError;
use crate::record::{Action, Entity, EventInfo, RESERVED_DETAILS_KEY, SCHEMA_VERSION, Source, TelemetryRecord};
use chrono::{DateTime, Utc};
use serde_json::{Map, Value};

/// Pure construction of one telemetry record. `build` reports every
/// missing field at once so a malformed emission site can be fixed in a
/// single pass.
#[derive(Debug, Clone, Default)]
pub struct RecordBuilder {
    schema_version: Option<String>,
    generated_at: Option<DateTime<Utc>>,
    correlation_id: Option<String>,
    workflow: Option<String>,
    job: Option<String>,
    run_id: Option<String>,
    entity_type: Option<String>,
    owner: Option<String>,
    repo: Option<String>,
    category: Option<String>,
    action: Option<Action>,
    reason: Option<String>,
    details: Map<String, Value>,
}

impl RecordBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder with the envelope fields an instrumented caller rarely wants
    /// to pick by hand: current schema version, emission time, and a fresh
    /// correlation id.
    pub fn seeded() -> Self {
        Self {
            schema_version: Some(SCHEMA_VERSION.to_string()),
            generated_at: Some(Utc::now()),
            correlation_id: Some(uuid::Uuid::new_v4().to_string()),
            ..Self::default()
        }
    }

    pub fn schema_version(mut self, version: &str) -> Self {
        self.schema_version = Some(version.to_string());
        self
    }

    pub fn generated_at(mut self, at: DateTime<Utc>) -> Self {
        self.generated_at = Some(at);
        self
    }

    pub fn correlation_id(mut self, id: &str) -> Self {
        self.correlation_id = Some(id.to_string());
        self
    }

    pub fn source(mut self, workflow: &str, job: &str, run_id: &str) -> Self {
        self.workflow = Some(workflow.to_string());
        self.job = Some(job.to_string());
        self.run_id = Some(run_id.to_string());
        self
    }

    pub fn entity(mut self, entity_type: &str, owner: &str, repo: &str) -> Self {
        self.entity_type = Some(entity_type.to_string());
        self.owner = Some(owner.to_string());
        self.repo = Some(repo.to_string());
        self
    }

    pub fn category(mut self, category: &str) -> Self {
        self.category = Some(category.to_string());
        self
    }

    pub fn action(mut self, action: Action) -> Self {
        self.action = Some(action);
        self
    }

    pub fn reason(mut self, reason: &str) -> Self {
        self.reason = Some(reason.to_string());
        self
    }

    pub fn detail(mut self, key: &str, value: Value) -> Self {
        self.details.insert(key.to_string(), value);
        self
    }

    pub fn build(self) -> Result<TelemetryRecord, ValidationError> {
        let mut issues = Vec::new();

        let require = |issues: &mut Vec<String>, present: bool, field: &str| {
            if !present {
                issues.push(format!("missing required field: {field}"));
            }
        };

        require(&mut issues, self.schema_version.is_some(), "schema_version");
        require(&mut issues, self.generated_at.is_some(), "generated_at");
        require(&mut issues, self.correlation_id.is_some(), "correlation_id");
        require(&mut issues, self.workflow.is_some(), "source.workflow");
        require(&mut issues, self.job.is_some(), "source.job");
        require(&mut issues, self.run_id.is_some(), "source.run_id");
        require(&mut issues, self.entity_type.is_some(), "entity.type");
        require(&mut issues, self.owner.is_some(), "entity.owner");
        require(&mut issues, self.repo.is_some(), "entity.repo");
        require(&mut issues, self.category.is_some(), "event.category");
        require(&mut issues, self.action.is_some(), "event.action");

        if let Some(version) = self.schema_version.as_deref()
            && version != SCHEMA_VERSION
        {
            issues.push(format!("schema_version must be \"{SCHEMA_VERSION}\""));
        }

        if self.details.contains_key(RESERVED_DETAILS_KEY) {
            issues.push("details.event is not allowed (use details.issue_event)".to_string());
        }

        if !issues.is_empty() {
            return Err(ValidationError::new(issues));
        }

        // All `unwrap_or_default` arms below are unreachable: every field
        // was checked present above.
        Ok(TelemetryRecord {
            schema_version: self.schema_version.unwrap_or_default(),
            generated_at: self.generated_at.unwrap_or_default(),
            correlation_id: self.correlation_id.unwrap_or_default(),
            source: Source {
                workflow: self.workflow.unwrap_or_default(),
                job: self.job.unwrap_or_default(),
                run_id: self.run_id.unwrap_or_default(),
            },
            entity: Entity {
                entity_type: self.entity_type.unwrap_or_default(),
                owner: self.owner.unwrap_or_default(),
                repo: self.repo.unwrap_or_default(),
            },
            event: EventInfo {
                category: self.category.unwrap_or_default(),
                action: self.action.unwrap_or(Action::Failure),
                reason: self.reason,
            },
            details: self.details,
        })
    }
}
