//! Task executors
//!
//! A [`TaskExecutor`] performs the actual work for a task kind. Workers of one
//! capability hold an [`ExecutorRegistry`] that must cover every task kind of
//! that capability; the check runs when the registry is verified, before the
//! worker pool subscribes to anything.

use crate::error::{CoordinatorError, CoordinatorResult};
use crate::protocol::{Capability, TaskKind};
use async_trait::async_trait;
use chrono::Utc;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::Arc;

/// Work for one or more task kinds
///
/// An `Err` string is reported verbatim as the task's error.
#[async_trait]
pub trait TaskExecutor: Send + Sync {
    async fn execute(&self, kind: TaskKind, payload: &Value) -> Result<Value, String>;
}

/// Returns the payload with processing metadata
#[derive(Debug, Default, Clone)]
pub struct EchoExecutor;

#[async_trait]
impl TaskExecutor for EchoExecutor {
    async fn execute(&self, kind: TaskKind, payload: &Value) -> Result<Value, String> {
        Ok(json!({
            "task_type": kind,
            "echo": payload,
            "processed_at": Utc::now(),
        }))
    }
}

/// Closed mapping from the task kinds of one capability to executors
pub struct ExecutorRegistry {
    capability: Capability,
    executors: HashMap<TaskKind, Arc<dyn TaskExecutor>>,
}

impl ExecutorRegistry {
    pub fn new(capability: Capability) -> Self {
        Self {
            capability,
            executors: HashMap::new(),
        }
    }

    /// Registry mapping every kind of `capability` to [`EchoExecutor`]
    pub fn echo(capability: Capability) -> Self {
        let echo: Arc<dyn TaskExecutor> = Arc::new(EchoExecutor);
        let executors = TaskKind::for_capability(capability)
            .map(|kind| (kind, echo.clone()))
            .collect();
        Self {
            capability,
            executors,
        }
    }

    /// Register `executor` for `kind`; the kind must belong to this capability
    pub fn register(
        &mut self,
        kind: TaskKind,
        executor: Arc<dyn TaskExecutor>,
    ) -> CoordinatorResult<()> {
        if kind.capability() != self.capability {
            return Err(CoordinatorError::validation(format!(
                "Task type {kind} belongs to {}, not {}",
                kind.capability(),
                self.capability
            )));
        }
        self.executors.insert(kind, executor);
        Ok(())
    }

    /// Fail unless every task kind of the capability has an executor
    pub fn verify(&self) -> CoordinatorResult<()> {
        let missing: Vec<String> = TaskKind::for_capability(self.capability)
            .filter(|kind| !self.executors.contains_key(kind))
            .map(|kind| kind.to_string())
            .collect();

        if missing.is_empty() {
            Ok(())
        } else {
            Err(CoordinatorError::internal(format!(
                "No executor registered for {} task types: {}",
                self.capability,
                missing.join(", ")
            )))
        }
    }

    pub fn capability(&self) -> Capability {
        self.capability
    }

    pub fn get(&self, kind: TaskKind) -> Option<Arc<dyn TaskExecutor>> {
        self.executors.get(&kind).cloned()
    }
}
