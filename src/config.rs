//! Coordinator configuration
//!
//! Loaded from a TOML file. Every section except `[mqtt]` has defaults, so a
//! minimal file only names the broker.

use crate::protocol::Capability;
use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use thiserror::Error;

static CLIENT_ID_PATTERN: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[a-zA-Z0-9._-]+$").expect("client id pattern is a valid regex"));

/// Top-level configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CoordinatorConfig {
    #[serde(default)]
    pub coordinator: CoordinatorSection,
    pub mqtt: MqttSection,
    #[serde(default)]
    pub agents: AgentPoolSection,
    #[serde(default)]
    pub workers: WorkerSection,
    #[serde(default)]
    pub health: HealthSection,
}

/// Control loop timing
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CoordinatorSection {
    /// Scheduling tick in milliseconds (default: 1000)
    #[serde(default = "default_tick_interval_ms")]
    pub tick_interval_ms: u64,
    /// Minimum spacing between agent health sweeps (default: 30)
    #[serde(default = "default_health_check_interval")]
    pub health_check_interval_secs: u64,
    /// Heartbeat age after which an agent is considered failed (default: 60)
    #[serde(default = "default_heartbeat_timeout")]
    pub heartbeat_timeout_secs: u64,
    /// How long stopping an agent waits for held tasks to finish (default: 10)
    #[serde(default = "default_stop_drain_timeout")]
    pub stop_drain_timeout_secs: u64,
    /// How long shutdown waits for the control loop before aborting it (default: 5)
    #[serde(default = "default_shutdown_timeout")]
    pub shutdown_timeout_secs: u64,
}

impl Default for CoordinatorSection {
    fn default() -> Self {
        Self {
            tick_interval_ms: default_tick_interval_ms(),
            health_check_interval_secs: default_health_check_interval(),
            heartbeat_timeout_secs: default_heartbeat_timeout(),
            stop_drain_timeout_secs: default_stop_drain_timeout(),
            shutdown_timeout_secs: default_shutdown_timeout(),
        }
    }
}

impl CoordinatorSection {
    pub fn tick_interval(&self) -> Duration {
        Duration::from_millis(self.tick_interval_ms)
    }

    pub fn health_check_interval(&self) -> Duration {
        Duration::from_secs(self.health_check_interval_secs)
    }

    pub fn heartbeat_timeout(&self) -> Duration {
        Duration::from_secs(self.heartbeat_timeout_secs)
    }

    pub fn stop_drain_timeout(&self) -> Duration {
        Duration::from_secs(self.stop_drain_timeout_secs)
    }

    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_secs(self.shutdown_timeout_secs)
    }
}

fn default_tick_interval_ms() -> u64 {
    1000
}

fn default_health_check_interval() -> u64 {
    30
}

fn default_heartbeat_timeout() -> u64 {
    60
}

fn default_stop_drain_timeout() -> u64 {
    10
}

fn default_shutdown_timeout() -> u64 {
    5
}

/// MQTT broker connection
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct MqttSection {
    /// MQTT broker URL with protocol and port
    pub broker_url: String,
    /// Client identifier prefix (must match [a-zA-Z0-9._-]+)
    #[serde(default = "default_client_id")]
    pub client_id: String,
    /// Environment variable containing username
    pub username_env: Option<String>,
    /// Environment variable containing password
    pub password_env: Option<String>,
    /// Broker-side session lifetime so queued QoS 1 messages survive reconnects
    #[serde(default = "default_session_expiry")]
    pub session_expiry_secs: u32,
    /// Upper bound of the random delay added to each reconnect backoff step
    #[serde(default = "default_reconnect_jitter_ms")]
    pub reconnect_jitter_ms: u64,
}

fn default_client_id() -> String {
    "knowledge-coordinator".to_string()
}

fn default_session_expiry() -> u32 {
    3600
}

fn default_reconnect_jitter_ms() -> u64 {
    100
}

/// Number of agents started per capability when the coordinator boots
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AgentPoolSection {
    #[serde(default = "default_scraper_agents")]
    pub scraper: u32,
    #[serde(default = "default_processor_agents")]
    pub processor: u32,
    #[serde(default = "default_knowledge_agents")]
    pub knowledge: u32,
    #[serde(default = "default_learning_agents")]
    pub learning: u32,
    #[serde(default = "default_ui_agents")]
    pub ui: u32,
}

impl Default for AgentPoolSection {
    fn default() -> Self {
        Self {
            scraper: default_scraper_agents(),
            processor: default_processor_agents(),
            knowledge: default_knowledge_agents(),
            learning: default_learning_agents(),
            ui: default_ui_agents(),
        }
    }
}

impl AgentPoolSection {
    pub fn pool_size(&self, capability: Capability) -> u32 {
        match capability {
            Capability::Scraper => self.scraper,
            Capability::Processor => self.processor,
            Capability::Knowledge => self.knowledge,
            Capability::Learning => self.learning,
            Capability::Ui => self.ui,
        }
    }
}

fn default_scraper_agents() -> u32 {
    3
}

fn default_processor_agents() -> u32 {
    3
}

fn default_knowledge_agents() -> u32 {
    2
}

fn default_learning_agents() -> u32 {
    2
}

fn default_ui_agents() -> u32 {
    1
}

/// Worker-side runtime settings (embedded workers and the heartbeat contract)
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct WorkerSection {
    /// Run in-process echo workers for the configured pools
    #[serde(default)]
    pub embedded: bool,
    /// Heartbeat period in seconds (default: 10)
    #[serde(default = "default_worker_heartbeat_interval")]
    pub heartbeat_interval_secs: u64,
    /// Upper bound of the random delay added to each heartbeat
    #[serde(default = "default_heartbeat_jitter_ms")]
    pub heartbeat_jitter_ms: u64,
    /// Pause before a rejected work-queue message is offered again
    #[serde(default = "default_redelivery_delay_ms")]
    pub redelivery_delay_ms: u64,
}

impl Default for WorkerSection {
    fn default() -> Self {
        Self {
            embedded: false,
            heartbeat_interval_secs: default_worker_heartbeat_interval(),
            heartbeat_jitter_ms: default_heartbeat_jitter_ms(),
            redelivery_delay_ms: default_redelivery_delay_ms(),
        }
    }
}

impl WorkerSection {
    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_secs(self.heartbeat_interval_secs)
    }

    pub fn heartbeat_jitter(&self) -> Duration {
        Duration::from_millis(self.heartbeat_jitter_ms)
    }

    pub fn redelivery_delay(&self) -> Duration {
        Duration::from_millis(self.redelivery_delay_ms)
    }
}

fn default_worker_heartbeat_interval() -> u64 {
    10
}

fn default_heartbeat_jitter_ms() -> u64 {
    2000
}

fn default_redelivery_delay_ms() -> u64 {
    100
}

/// Health and status HTTP server
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct HealthSection {
    #[serde(default = "default_health_port")]
    pub port: u16,
}

impl Default for HealthSection {
    fn default() -> Self {
        Self {
            port: default_health_port(),
        }
    }
}

fn default_health_port() -> u16 {
    8080
}

/// Configuration loading errors
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    FileRead(#[from] std::io::Error),
    #[error("Failed to parse TOML: {0}")]
    TomlParse(#[from] toml::de::Error),
    #[error("Environment variable not found: {0}")]
    EnvVarNotFound(String),
    #[error("Invalid client ID format: {0}")]
    InvalidClientId(String),
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),
}

impl CoordinatorConfig {
    /// Load configuration from a TOML file and validate it
    pub fn load_from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        Self::from_toml_str(&content)
    }

    /// Parse and validate configuration from TOML text
    pub fn from_toml_str(content: &str) -> Result<Self, ConfigError> {
        let config: CoordinatorConfig = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Check cross-field constraints that serde cannot express
    pub fn validate(&self) -> Result<(), ConfigError> {
        validate_client_id(&self.mqtt.client_id)?;
        validate_broker_url(&self.mqtt.broker_url)?;

        if self.coordinator.tick_interval_ms == 0 {
            return Err(ConfigError::InvalidConfig(
                "coordinator.tick_interval_ms must be greater than 0".to_string(),
            ));
        }

        if self.coordinator.heartbeat_timeout_secs <= self.workers.heartbeat_interval_secs {
            return Err(ConfigError::InvalidConfig(format!(
                "coordinator.heartbeat_timeout_secs ({}) must exceed workers.heartbeat_interval_secs ({})",
                self.coordinator.heartbeat_timeout_secs, self.workers.heartbeat_interval_secs
            )));
        }

        if self.workers.heartbeat_interval_secs == 0 {
            return Err(ConfigError::InvalidConfig(
                "workers.heartbeat_interval_secs must be greater than 0".to_string(),
            ));
        }

        Ok(())
    }

    /// Helper method to get environment variable with consistent error handling
    fn get_env_var_optional(env_var_name: Option<&String>) -> Option<String> {
        env_var_name.and_then(|name| std::env::var(name).ok())
    }

    /// Get MQTT username from environment variable
    pub fn get_mqtt_username(&self) -> Option<String> {
        Self::get_env_var_optional(self.mqtt.username_env.as_ref())
    }

    /// Get MQTT password from environment variable
    pub fn get_mqtt_password(&self) -> Option<String> {
        Self::get_env_var_optional(self.mqtt.password_env.as_ref())
    }

    /// Require the MQTT password when a password variable is configured
    pub fn require_mqtt_password(&self) -> Result<Option<String>, ConfigError> {
        match &self.mqtt.password_env {
            Some(name) => std::env::var(name)
                .map(Some)
                .map_err(|_| ConfigError::EnvVarNotFound(name.clone())),
            None => Ok(None),
        }
    }

    /// Create a test configuration for unit testing
    #[cfg(test)]
    pub fn test_config() -> Self {
        let toml_content = r#"
[coordinator]
tick_interval_ms = 50
health_check_interval_secs = 1
heartbeat_timeout_secs = 30
stop_drain_timeout_secs = 1

[mqtt]
broker_url = "mqtt://localhost:1883"

[agents]
scraper = 0
processor = 0
knowledge = 0
learning = 0
ui = 0
"#;
        toml::from_str(toml_content).expect("Test config should parse")
    }
}

/// Validate MQTT client id characters
fn validate_client_id(client_id: &str) -> Result<(), ConfigError> {
    if !CLIENT_ID_PATTERN.is_match(client_id) {
        return Err(ConfigError::InvalidClientId(format!(
            "Client ID '{client_id}' must match pattern [a-zA-Z0-9._-]+"
        )));
    }
    Ok(())
}

fn validate_broker_url(broker_url: &str) -> Result<(), ConfigError> {
    let url = url::Url::parse(broker_url)
        .map_err(|e| ConfigError::InvalidConfig(format!("Invalid broker URL '{broker_url}': {e}")))?;

    match url.scheme() {
        "mqtt" | "mqtts" => Ok(()),
        other => Err(ConfigError::InvalidConfig(format!(
            "Unsupported broker URL scheme '{other}', expected mqtt or mqtts"
        ))),
    }
}
