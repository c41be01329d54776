//! Error taxonomy for the orchestration layer
//!
//! Maps every failure the coordinator can report onto one enum. Transport and
//! configuration failures are wrapped; everything else is a domain rejection
//! that leaves state untouched.

use crate::agent::state::AgentState;
use crate::task::record::TaskStatus;
use thiserror::Error;

/// Main error type for coordinator operations
#[derive(Debug, Error)]
pub enum CoordinatorError {
    #[error("Validation failed: {message}")]
    Validation { message: String },

    #[error("Task not found: {task_id}")]
    TaskNotFound { task_id: String },

    #[error("Agent not found: {agent_id}")]
    AgentNotFound { agent_id: String },

    #[error("Task {task_id} is {actual}, expected {expected}")]
    InvalidTaskState {
        task_id: String,
        expected: TaskStatus,
        actual: TaskStatus,
    },

    #[error("Agent {agent_id} cannot {operation} while {state}")]
    InvalidAgentState {
        agent_id: String,
        state: AgentState,
        operation: &'static str,
    },

    #[error("Agent {agent_id} does not hold task {task_id}")]
    NotTaskOwner { agent_id: String, task_id: String },

    #[error("Task {task_id} is already held by agent {agent_id}")]
    TaskAlreadyHeld { task_id: String, agent_id: String },

    #[error("Transport error: {0}")]
    Transport(#[from] crate::transport::ChannelError),

    #[error("Configuration error: {0}")]
    Config(#[from] crate::config::ConfigError),

    #[error("Internal error: {message}")]
    Internal { message: String },
}

impl CoordinatorError {
    /// Create validation error
    pub fn validation<S: Into<String>>(message: S) -> Self {
        Self::Validation {
            message: message.into(),
        }
    }

    /// Create task not found error
    pub fn task_not_found<S: Into<String>>(task_id: S) -> Self {
        Self::TaskNotFound {
            task_id: task_id.into(),
        }
    }

    /// Create agent not found error
    pub fn agent_not_found<S: Into<String>>(agent_id: S) -> Self {
        Self::AgentNotFound {
            agent_id: agent_id.into(),
        }
    }

    /// Create ownership mismatch error
    pub fn not_task_owner<A: Into<String>, T: Into<String>>(agent_id: A, task_id: T) -> Self {
        Self::NotTaskOwner {
            agent_id: agent_id.into(),
            task_id: task_id.into(),
        }
    }

    /// Create internal error
    pub fn internal<S: Into<String>>(message: S) -> Self {
        Self::Internal {
            message: message.into(),
        }
    }

    /// True for rejections caused by a report that no longer matches current
    /// ownership (late, duplicated, or misaddressed worker reports).
    pub fn is_stale_report(&self) -> bool {
        matches!(
            self,
            CoordinatorError::NotTaskOwner { .. }
                | CoordinatorError::AgentNotFound { .. }
                | CoordinatorError::InvalidTaskState { .. }
        )
    }
}

/// Result type for coordinator operations
pub type CoordinatorResult<T> = Result<T, CoordinatorError>;
