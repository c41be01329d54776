//! Knowledge coordinator
//!
//! Orchestration layer for a multi-agent knowledge pipeline. Callers submit
//! typed tasks; the coordinator queues them by capability, hands them to idle
//! agents over a message channel, tracks agent heartbeats and fails the work of
//! agents that go silent.
//!
//! # Overview
//!
//! - [`task`]: task catalogue with payload schemas, task records, the task store
//! - [`agent`]: agent state machine and registry
//! - [`orchestrator`]: the control loop and the caller API
//! - [`transport`]: the `MessageChannel` trait with in-memory and MQTT v5 backends
//! - [`worker`]: the worker-side runtime used for embedded workers
//! - [`observability`] and [`health`]: logging, metrics, HTTP health server
//!
//! # Quick Start
//!
//! ```rust
//! use knowledge_coordinator::config::CoordinatorConfig;
//! use knowledge_coordinator::observability::MetricsCollector;
//! use knowledge_coordinator::orchestrator::Orchestrator;
//! use knowledge_coordinator::task::TaskStatus;
//! use knowledge_coordinator::transport::InMemoryChannel;
//! use serde_json::json;
//! use std::sync::Arc;
//!
//! tokio_test::block_on(async {
//!     let config = CoordinatorConfig::from_toml_str(
//!         r#"
//!         [mqtt]
//!         broker_url = "mqtt://localhost:1883"
//!         "#,
//!     )
//!     .unwrap();
//!
//!     let orchestrator = Orchestrator::new(
//!         Arc::new(InMemoryChannel::default()),
//!         config,
//!         Arc::new(MetricsCollector::new()),
//!     )
//!     .unwrap();
//!
//!     let task_id = orchestrator
//!         .submit("scrape_web", json!({"url": "https://example.com"}))
//!         .await
//!         .unwrap();
//!     assert!(task_id.starts_with("scr-"));
//!
//!     let report = orchestrator.status(&task_id).await.unwrap();
//!     assert_eq!(report.status, TaskStatus::Pending);
//! });
//! ```

pub mod agent;
pub mod config;
pub mod error;
pub mod health;
pub mod observability;
pub mod orchestrator;
pub mod protocol;
pub mod task;
pub mod testing;
pub mod timing;
pub mod transport;
pub mod worker;

pub use agent::{AgentRegistry, AgentState};
pub use config::{ConfigError, CoordinatorConfig};
pub use error::{CoordinatorError, CoordinatorResult};
pub use orchestrator::Orchestrator;
pub use protocol::{Capability, EventEnvelope, EventType, TaskEnvelope, TaskKind};
pub use task::{TaskStatus, TaskStore};
pub use transport::{InMemoryChannel, MessageChannel, MqttChannel};
