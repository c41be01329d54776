//! Component health checks
//!
//! Each [`HealthCheck`] inspects one part of the coordinator. The
//! [`HealthCheckManager`] runs them all; the coordinator is healthy only when
//! every check passes.

use crate::agent::registry::AgentRegistry;
use crate::observability::metrics::MetricsCollector;
use crate::transport::MessageChannel;
use async_trait::async_trait;
use serde::Serialize;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

/// Health check result
#[derive(Debug, Clone, Serialize)]
pub struct HealthCheckResult {
    pub component: String,
    pub healthy: bool,
    pub message: Option<String>,
    pub response_time_ms: Option<u64>,
}

impl HealthCheckResult {
    fn new(component: &str, healthy: bool, message: String, started: Instant) -> Self {
        Self {
            component: component.to_string(),
            healthy,
            message: Some(message),
            response_time_ms: Some(started.elapsed().as_millis() as u64),
        }
    }
}

/// Trait for components that can be health checked
#[async_trait]
pub trait HealthCheck: Send + Sync {
    async fn health_check(&self) -> HealthCheckResult;

    fn component_name(&self) -> &str;
}

/// Healthy while the message channel reports a connection
pub struct ChannelHealthCheck {
    channel: Arc<dyn MessageChannel>,
}

impl ChannelHealthCheck {
    pub fn new(channel: Arc<dyn MessageChannel>) -> Self {
        Self { channel }
    }
}

#[async_trait]
impl HealthCheck for ChannelHealthCheck {
    async fn health_check(&self) -> HealthCheckResult {
        let start = Instant::now();
        let connected = self.channel.is_connected();
        let message = if connected {
            "Message channel connected".to_string()
        } else {
            "Message channel disconnected".to_string()
        };

        debug!(connected, "Channel health check");
        HealthCheckResult::new(self.component_name(), connected, message, start)
    }

    fn component_name(&self) -> &str {
        "message_channel"
    }
}

/// Healthy while the control loop has ticked within `max_tick_age`
pub struct ControlLoopHealthCheck {
    metrics: Arc<MetricsCollector>,
    max_tick_age: Duration,
}

impl ControlLoopHealthCheck {
    pub fn new(metrics: Arc<MetricsCollector>, max_tick_age: Duration) -> Self {
        Self {
            metrics,
            max_tick_age,
        }
    }
}

#[async_trait]
impl HealthCheck for ControlLoopHealthCheck {
    async fn health_check(&self) -> HealthCheckResult {
        let start = Instant::now();
        let (healthy, message) = match self.metrics.last_tick_age() {
            None => (false, "Control loop has not ticked yet".to_string()),
            Some(age) if age > self.max_tick_age => (
                false,
                format!("Control loop last ticked {}ms ago", age.as_millis()),
            ),
            Some(age) => (true, format!("Control loop ticked {}ms ago", age.as_millis())),
        };

        HealthCheckResult::new(self.component_name(), healthy, message, start)
    }

    fn component_name(&self) -> &str {
        "control_loop"
    }
}

/// Unhealthy when every agent of some capability is in ERROR
pub struct AgentPoolHealthCheck {
    registry: Arc<AgentRegistry>,
}

impl AgentPoolHealthCheck {
    pub fn new(registry: Arc<AgentRegistry>) -> Self {
        Self { registry }
    }
}

#[async_trait]
impl HealthCheck for AgentPoolHealthCheck {
    async fn health_check(&self) -> HealthCheckResult {
        let start = Instant::now();
        let failed_pools: Vec<String> = self
            .registry
            .agent_counts()
            .await
            .into_iter()
            .filter(|(_, counts)| counts.total > 0 && counts.error == counts.total)
            .map(|(capability, _)| capability.to_string())
            .collect();

        if failed_pools.is_empty() {
            HealthCheckResult::new(
                self.component_name(),
                true,
                "No agent pool entirely in error".to_string(),
                start,
            )
        } else {
            warn!(pools = ?failed_pools, "Agent pools down");
            HealthCheckResult::new(
                self.component_name(),
                false,
                format!("All agents in error for: {}", failed_pools.join(", ")),
                start,
            )
        }
    }

    fn component_name(&self) -> &str {
        "agent_pools"
    }
}

/// Aggregated health check manager
#[derive(Default)]
pub struct HealthCheckManager {
    health_checks: Vec<Box<dyn HealthCheck>>,
}

impl HealthCheckManager {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_health_check(&mut self, health_check: Box<dyn HealthCheck>) {
        self.health_checks.push(health_check);
    }

    pub async fn run_health_checks(&self) -> Vec<HealthCheckResult> {
        let mut results = Vec::with_capacity(self.health_checks.len());
        for health_check in &self.health_checks {
            results.push(health_check.health_check().await);
        }
        results
    }

    /// True when every registered check passes (or none are registered)
    pub async fn calculate_overall_health(&self) -> bool {
        let results = self.run_health_checks().await;
        if results.is_empty() {
            warn!("No health checks configured - assuming healthy");
            return true;
        }

        let healthy_count = results.iter().filter(|r| r.healthy).count();
        debug!(
            healthy = healthy_count,
            total = results.len(),
            "Overall health check"
        );
        healthy_count == results.len()
    }
}
