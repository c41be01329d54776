//! Wire types exchanged between the coordinator and workers
//!
//! Work-queue messages carry a [`TaskEnvelope`]; everything on the event bus
//! is an [`EventEnvelope`] whose `payload` is one of the typed payloads below.

use crate::agent::state::AgentState;
use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// Errors parsing closed protocol enumerations from strings
#[derive(Debug, Error, PartialEq)]
pub enum ProtocolError {
    #[error("Unknown capability: {0}")]
    UnknownCapability(String),
    #[error("Unknown task type: {0}")]
    UnknownTaskKind(String),
    #[error("Unknown event type: {0}")]
    UnknownEventType(String),
}

/// Category of work an agent performs; one work queue per capability
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Capability {
    Scraper,
    Processor,
    Knowledge,
    Learning,
    Ui,
}

impl Capability {
    pub const ALL: [Capability; 5] = [
        Capability::Scraper,
        Capability::Processor,
        Capability::Knowledge,
        Capability::Learning,
        Capability::Ui,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Capability::Scraper => "scraper",
            Capability::Processor => "processor",
            Capability::Knowledge => "knowledge",
            Capability::Learning => "learning",
            Capability::Ui => "ui",
        }
    }

    /// Short prefix used when minting task ids for this capability
    pub fn task_id_prefix(&self) -> &'static str {
        match self {
            Capability::Scraper => "scr",
            Capability::Processor => "prc",
            Capability::Knowledge => "knw",
            Capability::Learning => "lrn",
            Capability::Ui => "ui",
        }
    }
}

impl fmt::Display for Capability {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Capability {
    type Err = ProtocolError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Capability::ALL
            .into_iter()
            .find(|c| c.as_str() == s)
            .ok_or_else(|| ProtocolError::UnknownCapability(s.to_string()))
    }
}

/// Closed set of task types accepted at submission
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskKind {
    ScrapeWeb,
    ScrapePdf,
    ScrapeAcademic,
    ProcessText,
    ProcessImage,
    ExtractConcepts,
    BuildGraph,
    FindConnections,
    ValidateKnowledge,
    RecommendContent,
    GenerateQuiz,
    CreateStudyPlan,
    GenerateVisualization,
    ComposeDashboard,
}

impl TaskKind {
    pub const ALL: [TaskKind; 14] = [
        TaskKind::ScrapeWeb,
        TaskKind::ScrapePdf,
        TaskKind::ScrapeAcademic,
        TaskKind::ProcessText,
        TaskKind::ProcessImage,
        TaskKind::ExtractConcepts,
        TaskKind::BuildGraph,
        TaskKind::FindConnections,
        TaskKind::ValidateKnowledge,
        TaskKind::RecommendContent,
        TaskKind::GenerateQuiz,
        TaskKind::CreateStudyPlan,
        TaskKind::GenerateVisualization,
        TaskKind::ComposeDashboard,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            TaskKind::ScrapeWeb => "scrape_web",
            TaskKind::ScrapePdf => "scrape_pdf",
            TaskKind::ScrapeAcademic => "scrape_academic",
            TaskKind::ProcessText => "process_text",
            TaskKind::ProcessImage => "process_image",
            TaskKind::ExtractConcepts => "extract_concepts",
            TaskKind::BuildGraph => "build_graph",
            TaskKind::FindConnections => "find_connections",
            TaskKind::ValidateKnowledge => "validate_knowledge",
            TaskKind::RecommendContent => "recommend_content",
            TaskKind::GenerateQuiz => "generate_quiz",
            TaskKind::CreateStudyPlan => "create_study_plan",
            TaskKind::GenerateVisualization => "generate_visualization",
            TaskKind::ComposeDashboard => "compose_dashboard",
        }
    }

    /// Static task-type to capability mapping used by the scheduler
    pub fn capability(&self) -> Capability {
        match self {
            TaskKind::ScrapeWeb | TaskKind::ScrapePdf | TaskKind::ScrapeAcademic => {
                Capability::Scraper
            }
            TaskKind::ProcessText | TaskKind::ProcessImage | TaskKind::ExtractConcepts => {
                Capability::Processor
            }
            TaskKind::BuildGraph | TaskKind::FindConnections | TaskKind::ValidateKnowledge => {
                Capability::Knowledge
            }
            TaskKind::RecommendContent | TaskKind::GenerateQuiz | TaskKind::CreateStudyPlan => {
                Capability::Learning
            }
            TaskKind::GenerateVisualization | TaskKind::ComposeDashboard => Capability::Ui,
        }
    }

    /// All kinds served by one capability
    pub fn for_capability(capability: Capability) -> impl Iterator<Item = TaskKind> {
        TaskKind::ALL
            .into_iter()
            .filter(move |kind| kind.capability() == capability)
    }
}

impl fmt::Display for TaskKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TaskKind {
    type Err = ProtocolError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        TaskKind::ALL
            .into_iter()
            .find(|k| k.as_str() == s)
            .ok_or_else(|| ProtocolError::UnknownTaskKind(s.to_string()))
    }
}

/// Canonical event types on the bus
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EventType {
    #[serde(rename = "agent.started")]
    AgentStarted,
    #[serde(rename = "agent.stopping")]
    AgentStopping,
    #[serde(rename = "agent.stopped")]
    AgentStopped,
    #[serde(rename = "agent.state_changed")]
    AgentStateChanged,
    #[serde(rename = "agent.error")]
    AgentError,
    #[serde(rename = "agent.heartbeat")]
    AgentHeartbeat,
    #[serde(rename = "task.assigned")]
    TaskAssigned,
    #[serde(rename = "task.completed")]
    TaskCompleted,
    #[serde(rename = "task.failed")]
    TaskFailed,
}

impl EventType {
    pub const ALL: [EventType; 9] = [
        EventType::AgentStarted,
        EventType::AgentStopping,
        EventType::AgentStopped,
        EventType::AgentStateChanged,
        EventType::AgentError,
        EventType::AgentHeartbeat,
        EventType::TaskAssigned,
        EventType::TaskCompleted,
        EventType::TaskFailed,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            EventType::AgentStarted => "agent.started",
            EventType::AgentStopping => "agent.stopping",
            EventType::AgentStopped => "agent.stopped",
            EventType::AgentStateChanged => "agent.state_changed",
            EventType::AgentError => "agent.error",
            EventType::AgentHeartbeat => "agent.heartbeat",
            EventType::TaskAssigned => "task.assigned",
            EventType::TaskCompleted => "task.completed",
            EventType::TaskFailed => "task.failed",
        }
    }
}

impl fmt::Display for EventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EventType {
    type Err = ProtocolError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        EventType::ALL
            .into_iter()
            .find(|e| e.as_str() == s)
            .ok_or_else(|| ProtocolError::UnknownEventType(s.to_string()))
    }
}

/// Task hand-off published on a capability work queue
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskEnvelope {
    pub task_id: String,
    pub task_type: TaskKind,
    pub task_payload: Value,
    pub agent_id: String,
}

/// Broadcast notification on the event bus
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventEnvelope {
    pub event_type: EventType,
    pub payload: Value,
    pub timestamp: DateTime<Utc>,
}

impl EventEnvelope {
    pub fn new(event_type: EventType, payload: Value) -> Self {
        Self {
            event_type,
            payload,
            timestamp: Utc::now(),
        }
    }

    /// Build an envelope from one of the typed payloads
    pub fn from_payload<T: Serialize>(
        event_type: EventType,
        payload: &T,
    ) -> Result<Self, serde_json::Error> {
        Ok(Self::new(event_type, serde_json::to_value(payload)?))
    }

    /// Decode the payload into its typed form
    pub fn parse_payload<T: DeserializeOwned>(&self) -> Result<T, serde_json::Error> {
        serde_json::from_value(self.payload.clone())
    }
}

/// Payload of agent.started, agent.stopping, agent.stopped and agent.heartbeat
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentLifecyclePayload {
    pub agent_id: String,
    pub agent_type: Capability,
    pub timestamp: DateTime<Utc>,
}

/// Payload of agent.state_changed
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentStateChangedPayload {
    pub agent_id: String,
    pub agent_type: Capability,
    pub old_state: AgentState,
    pub new_state: AgentState,
    pub timestamp: DateTime<Utc>,
}

/// Payload of agent.error
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentErrorPayload {
    pub agent_id: String,
    pub agent_type: Capability,
    pub error: String,
    pub timestamp: DateTime<Utc>,
}

/// Payload of task.assigned
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskAssignedPayload {
    pub task_id: String,
    pub task_type: TaskKind,
    pub agent_id: String,
    pub timestamp: DateTime<Utc>,
}

/// Payload of task.completed
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskCompletedPayload {
    pub task_id: String,
    pub agent_id: String,
    #[serde(default)]
    pub result: Value,
    pub timestamp: DateTime<Utc>,
}

/// Payload of task.failed
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskFailedPayload {
    pub task_id: String,
    pub agent_id: String,
    #[serde(default = "unknown_error")]
    pub error: String,
    pub timestamp: DateTime<Utc>,
}

fn unknown_error() -> String {
    "Unknown error".to_string()
}
