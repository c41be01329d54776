//! Health and status HTTP server
//!
//! | Route | Purpose |
//! | --- | --- |
//! | `GET /health` | every component check; 503 when any fails |
//! | `GET /status` | system status: agents, tasks, uptime |
//! | `GET /metrics` | metrics snapshot |
//! | `GET /ready` | readiness: running and channel connected |
//! | `GET /live` | liveness |
//! | `GET /` | route index |

use crate::health::{HealthCheckManager, HealthCheckResult};
use crate::orchestrator::Orchestrator;
use serde::Serialize;
use std::collections::BTreeMap;
use std::convert::Infallible;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};
use warp::http::StatusCode;
use warp::{Filter, Rejection, Reply};

pub struct HealthServer {
    orchestrator: Arc<Orchestrator>,
    checks: Arc<HealthCheckManager>,
    port: u16,
}

impl HealthServer {
    pub fn new(orchestrator: Arc<Orchestrator>, checks: Arc<HealthCheckManager>, port: u16) -> Self {
        Self {
            orchestrator,
            checks,
            port,
        }
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    /// Serve until the process exits
    pub async fn start(self: Arc<Self>) {
        let port = self.port;
        tracing::info!(port, "Starting health server");
        warp::serve(self.routes()).run(([0, 0, 0, 0], port)).await;
    }

    pub fn routes(self: &Arc<Self>) -> impl Filter<Extract = impl Reply, Error = Rejection> + Clone {
        let with_server = {
            let server = Arc::clone(self);
            warp::any().map(move || server.clone())
        };

        let health = warp::path("health")
            .and(warp::path::end())
            .and(warp::get())
            .and(with_server.clone())
            .and_then(|server: Arc<HealthServer>| async move {
                let status = server.health_status().await;
                let code = if status.status == "healthy" {
                    StatusCode::OK
                } else {
                    StatusCode::SERVICE_UNAVAILABLE
                };
                Ok::<_, Infallible>(warp::reply::with_status(warp::reply::json(&status), code))
            });

        let status = warp::path("status")
            .and(warp::path::end())
            .and(warp::get())
            .and(with_server.clone())
            .and_then(|server: Arc<HealthServer>| async move {
                let status = server.orchestrator.system_status().await;
                Ok::<_, Infallible>(warp::reply::json(&status))
            });

        let metrics = warp::path("metrics")
            .and(warp::path::end())
            .and(warp::get())
            .and(with_server.clone())
            .and_then(|server: Arc<HealthServer>| async move {
                let snapshot = server.orchestrator.metrics().get_metrics();
                Ok::<_, Infallible>(warp::reply::json(&snapshot))
            });

        let ready = warp::path("ready")
            .and(warp::path::end())
            .and(warp::get())
            .and(with_server)
            .and_then(|server: Arc<HealthServer>| async move {
                let ready = server.orchestrator.is_running()
                    && server.orchestrator.channel().is_connected();
                let response = ReadinessResponse {
                    ready,
                    timestamp: current_timestamp(),
                };
                let code = if ready {
                    StatusCode::OK
                } else {
                    StatusCode::SERVICE_UNAVAILABLE
                };
                Ok::<_, Infallible>(warp::reply::with_status(warp::reply::json(&response), code))
            });

        let live = warp::path("live").and(warp::path::end()).and(warp::get()).map(|| {
            warp::reply::json(&LivenessResponse {
                alive: true,
                timestamp: current_timestamp(),
            })
        });

        let root = warp::path::end().and(warp::get()).map(|| {
            let endpoints: BTreeMap<&str, &str> = [
                ("/health", "Component health checks"),
                ("/status", "Agent and task counts, uptime"),
                ("/metrics", "Counters and turnaround statistics"),
                ("/ready", "Readiness probe"),
                ("/live", "Liveness probe"),
            ]
            .into_iter()
            .collect();
            warp::reply::json(&endpoints)
        });

        health
            .or(status)
            .or(metrics)
            .or(ready)
            .or(live)
            .or(root)
            .with(warp::cors().allow_any_origin())
    }

    async fn health_status(&self) -> HealthStatus {
        let checks = self.checks.run_health_checks().await;
        let healthy = checks.iter().all(|check| check.healthy);

        HealthStatus {
            status: if healthy { "healthy" } else { "degraded" },
            timestamp: current_timestamp(),
            uptime_seconds: self.orchestrator.system_status().await.uptime_seconds,
            checks,
        }
    }
}

#[derive(Debug, Serialize)]
struct HealthStatus {
    status: &'static str,
    timestamp: u64,
    uptime_seconds: u64,
    checks: Vec<HealthCheckResult>,
}

#[derive(Debug, Serialize)]
struct ReadinessResponse {
    ready: bool,
    timestamp: u64,
}

#[derive(Debug, Serialize)]
struct LivenessResponse {
    alive: bool,
    timestamp: u64,
}

fn current_timestamp() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}
