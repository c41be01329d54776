//! Task records and their lifecycle states

use crate::protocol::{Capability, TaskKind};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;

/// Task lifecycle: `pending -> processing -> {completed, failed}`, and
/// `failed -> pending` on an explicit retry
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskStatus {
    Pending,
    Processing,
    Completed,
    Failed,
}

impl TaskStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskStatus::Pending => "pending",
            TaskStatus::Processing => "processing",
            TaskStatus::Completed => "completed",
            TaskStatus::Failed => "failed",
        }
    }

    /// True for the transitions the lifecycle allows
    pub fn can_transition_to(&self, next: TaskStatus) -> bool {
        matches!(
            (self, next),
            (TaskStatus::Pending, TaskStatus::Processing)
                | (TaskStatus::Processing, TaskStatus::Completed)
                | (TaskStatus::Processing, TaskStatus::Failed)
                | (TaskStatus::Failed, TaskStatus::Pending)
        )
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One audit entry per state transition
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HistoryEntry {
    pub status: TaskStatus,
    pub timestamp: DateTime<Utc>,
    pub message: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TaskRecord {
    pub id: String,
    pub task_type: TaskKind,
    pub capability: Capability,
    pub payload: Value,
    pub status: TaskStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub assigned_to: Option<String>,
    pub result: Option<Value>,
    pub error: Option<String>,
    pub history: Vec<HistoryEntry>,
}

impl TaskRecord {
    pub fn new(id: String, task_type: TaskKind, payload: Value, now: DateTime<Utc>) -> Self {
        Self {
            id,
            task_type,
            capability: task_type.capability(),
            payload,
            status: TaskStatus::Pending,
            created_at: now,
            updated_at: now,
            assigned_to: None,
            result: None,
            error: None,
            history: vec![HistoryEntry {
                status: TaskStatus::Pending,
                timestamp: now,
                message: "Task created".to_string(),
            }],
        }
    }

    /// Record a state change; callers check `can_transition_to` first
    pub(crate) fn transition(&mut self, status: TaskStatus, message: String, now: DateTime<Utc>) {
        self.status = status;
        self.updated_at = now;
        self.history.push(HistoryEntry {
            status,
            timestamp: now,
            message,
        });
    }

    pub(crate) fn mark_processing(&mut self, agent_id: &str, now: DateTime<Utc>) {
        self.assigned_to = Some(agent_id.to_string());
        self.transition(
            TaskStatus::Processing,
            format!("Task assigned to agent {agent_id}"),
            now,
        );
    }

    pub(crate) fn mark_completed(&mut self, result: Value, now: DateTime<Utc>) {
        self.result = Some(result);
        self.error = None;
        self.transition(
            TaskStatus::Completed,
            "Task completed successfully".to_string(),
            now,
        );
    }

    pub(crate) fn mark_failed(&mut self, error: String, now: DateTime<Utc>) {
        let message = format!("Task failed: {error}");
        self.result = None;
        self.error = Some(error);
        self.transition(TaskStatus::Failed, message, now);
    }

    pub(crate) fn mark_retried(&mut self, now: DateTime<Utc>) {
        self.error = None;
        self.assigned_to = None;
        self.transition(TaskStatus::Pending, "Task retried".to_string(), now);
    }
}

/// What callers see from a status lookup
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TaskStatusReport {
    pub id: String,
    pub status: TaskStatus,
    pub task_type: TaskKind,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub assigned_to: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub history: Vec<HistoryEntry>,
}

impl From<&TaskRecord> for TaskStatusReport {
    fn from(record: &TaskRecord) -> Self {
        Self {
            id: record.id.clone(),
            status: record.status,
            task_type: record.task_type,
            created_at: record.created_at,
            updated_at: record.updated_at,
            assigned_to: record.assigned_to.clone(),
            result: record
                .result
                .clone()
                .filter(|_| record.status == TaskStatus::Completed),
            error: record
                .error
                .clone()
                .filter(|_| record.status == TaskStatus::Failed),
            history: record.history.clone(),
        }
    }
}

/// Number of tasks in each partition
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct TaskCounts {
    pub pending: usize,
    pub processing: usize,
    pub completed: usize,
    pub failed: usize,
}

impl TaskCounts {
    pub fn total(&self) -> usize {
        self.pending + self.processing + self.completed + self.failed
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_transition_table() {
        use TaskStatus::*;
        assert!(Pending.can_transition_to(Processing));
        assert!(Processing.can_transition_to(Completed));
        assert!(Processing.can_transition_to(Failed));
        assert!(Failed.can_transition_to(Pending));

        assert!(!Pending.can_transition_to(Completed));
        assert!(!Completed.can_transition_to(Pending));
        assert!(!Processing.can_transition_to(Pending));
        assert!(!Failed.can_transition_to(Processing));
    }

    #[test]
    fn test_new_record_history() {
        let record = TaskRecord::new(
            "scr-1".to_string(),
            TaskKind::ScrapeWeb,
            json!({"url": "https://example.com"}),
            Utc::now(),
        );

        assert_eq!(record.status, TaskStatus::Pending);
        assert_eq!(record.capability, Capability::Scraper);
        assert_eq!(record.history.len(), 1);
        assert_eq!(record.history[0].message, "Task created");
    }

    #[test]
    fn test_retry_clears_error_and_assignment() {
        let now = Utc::now();
        let mut record = TaskRecord::new("prc-1".into(), TaskKind::ProcessText, json!({}), now);
        record.mark_processing("processor-1", now);
        record.mark_failed("Agent failure".to_string(), now);
        record.mark_retried(now);

        assert_eq!(record.status, TaskStatus::Pending);
        assert_eq!(record.error, None);
        assert_eq!(record.assigned_to, None);
        let messages: Vec<&str> = record.history.iter().map(|h| h.message.as_str()).collect();
        assert_eq!(
            messages,
            vec![
                "Task created",
                "Task assigned to agent processor-1",
                "Task failed: Agent failure",
                "Task retried"
            ]
        );
    }

    #[test]
    fn test_status_report_shows_only_terminal_payload() {
        let now = Utc::now();
        let mut record = TaskRecord::new("ui-1".into(), TaskKind::ComposeDashboard, json!({}), now);
        record.mark_processing("ui-a", now);
        record.mark_completed(json!({"ok": true}), now);

        let report = TaskStatusReport::from(&record);
        assert_eq!(report.result, Some(json!({"ok": true})));
        assert_eq!(report.error, None);

        let wire = serde_json::to_value(&report).unwrap();
        assert_eq!(wire["status"], "completed");
        assert!(wire.get("error").is_none());
    }
}
