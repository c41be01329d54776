//! Closed catalogue of task kinds and their payload schemas
//!
//! Every [`TaskKind`] has a JSON schema. All schemas are compiled once when
//! the catalogue is built, so a broken schema stops start-up instead of
//! surfacing on the first submission.

use crate::error::{CoordinatorError, CoordinatorResult};
use crate::protocol::TaskKind;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::str::FromStr;

pub struct TaskCatalog {
    validators: HashMap<TaskKind, jsonschema::Validator>,
}

impl TaskCatalog {
    /// Compile every payload schema
    pub fn new() -> CoordinatorResult<Self> {
        let mut validators = HashMap::new();
        for kind in TaskKind::ALL {
            let schema = Self::payload_schema(kind);
            let validator = jsonschema::validator_for(&schema).map_err(|e| {
                CoordinatorError::internal(format!("Schema compilation error for {kind}: {e}"))
            })?;
            validators.insert(kind, validator);
        }
        Ok(Self { validators })
    }

    /// JSON schema for the payload of `kind`
    pub fn payload_schema(kind: TaskKind) -> Value {
        match kind {
            TaskKind::ScrapeWeb => json!({
                "type": "object",
                "required": ["url"],
                "properties": {"url": {"type": "string", "minLength": 1}}
            }),
            TaskKind::ScrapePdf => json!({
                "type": "object",
                "anyOf": [{"required": ["url"]}, {"required": ["file_path"]}],
                "properties": {
                    "url": {"type": "string"},
                    "file_path": {"type": "string"}
                }
            }),
            TaskKind::ScrapeAcademic => json!({
                "type": "object",
                "anyOf": [
                    {"required": ["query"]},
                    {"required": ["paper_id"]},
                    {"required": ["author"]}
                ]
            }),
            TaskKind::ProcessText => json!({
                "type": "object",
                "required": ["text"],
                "properties": {"text": {"type": "string"}}
            }),
            _ => json!({"type": "object"}),
        }
    }

    /// Resolve a task type string and check its payload
    pub fn validate(&self, task_type: &str, payload: &Value) -> CoordinatorResult<TaskKind> {
        let kind = TaskKind::from_str(task_type)
            .map_err(|e| CoordinatorError::validation(e.to_string()))?;

        let validator = self
            .validators
            .get(&kind)
            .ok_or_else(|| CoordinatorError::internal(format!("No schema compiled for {kind}")))?;

        validator.validate(payload).map_err(|errors| {
            let error_messages: Vec<String> = errors
                .map(|e| format!("At '{}': {}", e.instance_path, e))
                .collect();
            CoordinatorError::validation(format!(
                "Invalid payload for {kind}: {}",
                error_messages.join("; ")
            ))
        })?;

        Ok(kind)
    }
}
