//! MQTT v5 implementation of the message channel
//!
//! Pure logic is kept apart from I/O:
//!
//! - [`connection`] - connection states, reconnect backoff, broker options
//! - [`message_handler`] - packet routing and envelope parsing
//! - [`health_monitor`] - reconnection decisions and health metrics
//! - [`client`] - the [`MqttChannel`] itself and its event-loop supervisor
//!
//! Work queues use shared subscriptions (`$share/{capability}-workers/...`)
//! so each task message reaches one consumer. Acknowledgements are manual:
//! a task message is acked once its handler accepts it, and a rejected one is
//! republished to its queue before being acked.
//!
//! ```rust,no_run
//! use knowledge_coordinator::config::MqttSection;
//! use knowledge_coordinator::transport::{MessageChannel, MqttChannel};
//! use std::time::Duration;
//!
//! # tokio_test::block_on(async {
//! let config = MqttSection {
//!     broker_url: "mqtt://localhost:1883".to_string(),
//!     client_id: "knowledge-coordinator".to_string(),
//!     username_env: None,
//!     password_env: None,
//!     session_expiry_secs: 3600,
//!     reconnect_jitter_ms: 100,
//! };
//!
//! let channel = MqttChannel::new(config, Duration::from_millis(100))?;
//! channel.connect().await?;
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! # });
//! ```

pub mod client;
pub mod connection;
pub mod health_monitor;
pub mod message_handler;

pub use client::MqttChannel;
pub use connection::{ConnectionState, MqttError, ReconnectConfig};
pub use health_monitor::{ConnectionEvent, HealthMetrics, HealthMonitor, ReconnectionDecision};
pub use message_handler::{EventRoute, MessageHandler, MessageKind};
