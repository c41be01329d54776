//! Orchestrator: composition root of the coordination layer
//!
//! Owns the task catalogue, the task store and the agent registry, wires them
//! to the message channel and runs the control loop. Every tick runs the
//! rate-limited health sweep, applies the forced failures it produced, then
//! runs one scheduling pass. Ticks are serialised, whether they come from the
//! loop or from [`Orchestrator::tick`].
//!
//! Worker reports (`task.completed`, `task.failed`) and heartbeats arrive on
//! the event bus and are applied as soon as they are received. A report is
//! first checked against the registry's ownership records and only then
//! applied to the store, so late or duplicated reports change nothing.

use crate::agent::registry::{AgentCounts, AgentRegistry, StopOutcome, TaskRelease};
use crate::config::CoordinatorConfig;
use crate::error::{CoordinatorError, CoordinatorResult};
use crate::observability::metrics::MetricsCollector;
use crate::protocol::{
    AgentLifecyclePayload, Capability, EventEnvelope, EventType, TaskCompletedPayload,
    TaskFailedPayload,
};
use crate::task::catalog::TaskCatalog;
use crate::task::record::{TaskCounts, TaskStatusReport};
use crate::task::store::{SchedulingReport, TaskStore};
use crate::transport::{EventHandler, MessageChannel, SubscriptionId};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::{watch, Mutex};
use tokio::task::{JoinHandle, JoinSet};
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn, Instrument};

/// Event types the coordinator consumes
pub const INBOUND_EVENTS: [EventType; 3] = [
    EventType::TaskCompleted,
    EventType::TaskFailed,
    EventType::AgentHeartbeat,
];

/// What one control-loop iteration did
#[derive(Debug, Clone, Default, Serialize)]
pub struct TickReport {
    pub forced_failures: usize,
    pub scheduling: SchedulingReport,
}

#[derive(Debug, Clone, Serialize)]
pub struct SystemStatus {
    pub running: bool,
    pub channel_connected: bool,
    pub started_at: Option<DateTime<Utc>>,
    pub uptime_seconds: u64,
    pub agents: BTreeMap<Capability, AgentCounts>,
    pub tasks: TaskCounts,
    /// Seconds the oldest pending task has waited
    pub oldest_pending_secs: Option<u64>,
}

pub struct Orchestrator {
    config: CoordinatorConfig,
    channel: Arc<dyn MessageChannel>,
    metrics: Arc<MetricsCollector>,
    catalog: TaskCatalog,
    store: Arc<TaskStore>,
    registry: Arc<AgentRegistry>,
    running: AtomicBool,
    started_at: Mutex<Option<DateTime<Utc>>>,
    tick_lock: Mutex<()>,
    shutdown_tx: watch::Sender<bool>,
    control_loop: Mutex<Option<JoinHandle<()>>>,
    event_subscription: Mutex<Option<SubscriptionId>>,
}

impl Orchestrator {
    /// Build the coordinator; fails if a payload schema does not compile
    pub fn new(
        channel: Arc<dyn MessageChannel>,
        config: CoordinatorConfig,
        metrics: Arc<MetricsCollector>,
    ) -> CoordinatorResult<Self> {
        let catalog = TaskCatalog::new()?;
        let store = Arc::new(TaskStore::new(metrics.clone()));
        let registry = Arc::new(AgentRegistry::new(
            channel.clone(),
            metrics.clone(),
            &config.coordinator,
        ));
        let (shutdown_tx, _) = watch::channel(false);

        Ok(Self {
            config,
            channel,
            metrics,
            catalog,
            store,
            registry,
            running: AtomicBool::new(false),
            started_at: Mutex::new(None),
            tick_lock: Mutex::new(()),
            shutdown_tx,
            control_loop: Mutex::new(None),
            event_subscription: Mutex::new(None),
        })
    }

    /// Connect, subscribe to worker reports, start the configured agent
    /// pools and spawn the control loop
    pub async fn start(self: &Arc<Self>) -> CoordinatorResult<()> {
        if self.running.swap(true, Ordering::SeqCst) {
            return Err(CoordinatorError::internal("Orchestrator already running"));
        }

        if let Err(e) = self.bring_up().await {
            self.roll_back_start().await;
            return Err(e);
        }

        *self.started_at.lock().await = Some(Utc::now());
        self.shutdown_tx.send_replace(false);
        let shutdown_rx = self.shutdown_tx.subscribe();
        let this = Arc::clone(self);
        let handle = tokio::spawn(
            async move { this.run_control_loop(shutdown_rx).await }
                .instrument(tracing::info_span!("control_loop")),
        );
        *self.control_loop.lock().await = Some(handle);

        info!(
            tick_ms = self.config.coordinator.tick_interval_ms,
            "Orchestrator started"
        );
        Ok(())
    }

    async fn bring_up(self: &Arc<Self>) -> CoordinatorResult<()> {
        self.connect_and_subscribe().await?;
        for capability in Capability::ALL {
            for _ in 0..self.config.agents.pool_size(capability) {
                self.registry.start(capability).await?;
            }
        }
        Ok(())
    }

    /// Undo a partial start so `start` can be called again
    async fn roll_back_start(&self) {
        if let Some(subscription) = self.event_subscription.lock().await.take() {
            if let Err(e) = self.channel.unsubscribe(subscription).await {
                warn!(error = %e, "Failed to unsubscribe after failed start");
            }
        }
        if self.channel.is_connected() {
            if let Err(e) = self.channel.disconnect().await {
                warn!(error = %e, "Failed to disconnect after failed start");
            }
        }
        self.running.store(false, Ordering::SeqCst);
    }

    async fn connect_and_subscribe(self: &Arc<Self>) -> CoordinatorResult<()> {
        self.channel.connect().await?;

        let handler = Arc::new(InboundEvents {
            orchestrator: Arc::downgrade(self),
        });
        let subscription = self
            .channel
            .subscribe_events(&INBOUND_EVENTS, handler)
            .await?;
        *self.event_subscription.lock().await = Some(subscription);
        Ok(())
    }

    async fn run_control_loop(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        let mut interval = tokio::time::interval(self.config.coordinator.tick_interval());
        interval.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = interval.tick() => {
                    self.tick().await;
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        debug!("Control loop received shutdown signal");
                        break;
                    }
                }
            }
        }
    }

    /// Run one control-loop iteration
    pub async fn tick(&self) -> TickReport {
        let _tick = self.tick_lock.lock().await;

        let releases = self.registry.check_health().await;
        let forced_failures = releases.len();
        self.apply_releases(releases).await;

        let scheduling = self.store.run_scheduling_pass(&self.registry).await;
        self.metrics.loop_ticked();

        TickReport {
            forced_failures,
            scheduling,
        }
    }

    async fn apply_releases(&self, releases: Vec<TaskRelease>) {
        for release in releases {
            let task_id = release.task_id.clone();
            if let Err(e) = self.store.apply_release(release).await {
                warn!(task_id = %task_id, error = %e, "Could not apply task release");
            }
        }
    }

    /// Handle one inbound event from the bus
    pub async fn handle_event(&self, event: EventEnvelope) {
        match event.event_type {
            EventType::TaskCompleted => match event.parse_payload::<TaskCompletedPayload>() {
                Ok(report) => {
                    let outcome = self
                        .registry
                        .complete(&report.agent_id, &report.task_id, report.result)
                        .await;
                    self.apply_report(&report.task_id, &report.agent_id, outcome)
                        .await;
                }
                Err(e) => warn!(error = %e, "Dropping malformed task.completed event"),
            },
            EventType::TaskFailed => match event.parse_payload::<TaskFailedPayload>() {
                Ok(report) => {
                    let outcome = self
                        .registry
                        .fail(&report.agent_id, &report.task_id, report.error)
                        .await;
                    self.apply_report(&report.task_id, &report.agent_id, outcome)
                        .await;
                }
                Err(e) => warn!(error = %e, "Dropping malformed task.failed event"),
            },
            EventType::AgentHeartbeat => match event.parse_payload::<AgentLifecyclePayload>() {
                Ok(heartbeat) => {
                    if let Err(e) = self.registry.heartbeat(&heartbeat.agent_id).await {
                        debug!(agent_id = %heartbeat.agent_id, error = %e, "Ignoring heartbeat");
                    }
                }
                Err(e) => warn!(error = %e, "Dropping malformed agent.heartbeat event"),
            },
            other => debug!(event_type = %other, "Ignoring event"),
        }
    }

    async fn apply_report(
        &self,
        task_id: &str,
        agent_id: &str,
        outcome: CoordinatorResult<TaskRelease>,
    ) {
        match outcome {
            Ok(release) => {
                if let Err(e) = self.store.apply_release(release).await {
                    warn!(task_id = %task_id, agent_id = %agent_id, error = %e, "Store rejected report");
                }
            }
            Err(e) if e.is_stale_report() => {
                self.metrics.stale_report();
                debug!(task_id = %task_id, agent_id = %agent_id, error = %e, "Ignoring stale report");
            }
            Err(e) => {
                warn!(task_id = %task_id, agent_id = %agent_id, error = %e, "Could not apply report");
            }
        }
    }

    /// Validate and enqueue a task; never waits for it to run
    pub async fn submit(&self, task_type: &str, payload: Value) -> CoordinatorResult<String> {
        let kind = match self.catalog.validate(task_type, &payload) {
            Ok(kind) => kind,
            Err(e) => {
                self.metrics.task_rejected();
                debug!(task_type = %task_type, error = %e, "Task rejected");
                return Err(e);
            }
        };
        Ok(self.store.submit(kind, payload).await)
    }

    pub async fn status(&self, task_id: &str) -> CoordinatorResult<TaskStatusReport> {
        self.store.status(task_id).await
    }

    /// Requeue a failed task
    pub async fn retry(&self, task_id: &str) -> CoordinatorResult<()> {
        self.store.retry(task_id).await
    }

    pub async fn list_agents(&self) -> BTreeMap<Capability, AgentCounts> {
        self.registry.agent_counts().await
    }

    pub async fn start_agent(&self, capability: Capability) -> CoordinatorResult<String> {
        self.registry.start(capability).await
    }

    /// Stop one agent, failing in the store whatever it could not finish
    pub async fn stop_agent(&self, agent_id: &str) -> CoordinatorResult<StopOutcome> {
        let outcome = self
            .registry
            .stop(agent_id, self.config.coordinator.stop_drain_timeout())
            .await?;
        self.apply_releases(outcome.abandoned.clone()).await;
        Ok(outcome)
    }

    pub async fn system_status(&self) -> SystemStatus {
        let started_at = *self.started_at.lock().await;
        let uptime_seconds = started_at
            .and_then(|at| (Utc::now() - at).to_std().ok())
            .map_or(0, |d| d.as_secs());

        SystemStatus {
            running: self.is_running(),
            channel_connected: self.channel.is_connected(),
            started_at,
            uptime_seconds,
            agents: self.registry.agent_counts().await,
            tasks: self.store.counts().await,
            oldest_pending_secs: self
                .store
                .oldest_pending_age()
                .await
                .map(|age| age.as_secs()),
        }
    }

    /// Stop the control loop, every agent and the channel
    ///
    /// The loop gets `timeout` to finish its current tick before it is
    /// aborted. Agents are then stopped concurrently with the configured
    /// drain timeout while worker reports are still being received.
    pub async fn shutdown(&self, timeout: Duration) -> CoordinatorResult<()> {
        if !self.running.swap(false, Ordering::SeqCst) {
            return Ok(());
        }
        info!("Orchestrator shutting down");

        self.shutdown_tx.send_replace(true);
        if let Some(mut handle) = self.control_loop.lock().await.take() {
            if tokio::time::timeout(timeout, &mut handle).await.is_err() {
                warn!(timeout_ms = timeout.as_millis() as u64, "Control loop did not stop in time, aborting");
                handle.abort();
            }
        }

        self.stop_all_agents(timeout).await;

        if let Some(subscription) = self.event_subscription.lock().await.take() {
            if let Err(e) = self.channel.unsubscribe(subscription).await {
                warn!(error = %e, "Failed to unsubscribe from events");
            }
        }

        if let Err(e) = self.channel.disconnect().await {
            error!(error = %e, "Failed to disconnect message channel");
            return Err(e.into());
        }

        info!("Orchestrator stopped");
        Ok(())
    }

    /// Stop every agent concurrently; each drains for the configured
    /// timeout and the whole batch gets `grace` on top of that
    async fn stop_all_agents(&self, grace: Duration) {
        let drain_timeout = self.config.coordinator.stop_drain_timeout();
        let deadline = tokio::time::Instant::now() + drain_timeout + grace;

        let mut stops = JoinSet::new();
        for agent_id in self.registry.agent_ids().await {
            let registry = self.registry.clone();
            stops.spawn(async move {
                let outcome = registry.stop(&agent_id, drain_timeout).await;
                (agent_id, outcome)
            });
        }

        loop {
            match tokio::time::timeout_at(deadline, stops.join_next()).await {
                Ok(None) => break,
                Ok(Some(Ok((_, Ok(outcome))))) => self.apply_releases(outcome.abandoned).await,
                Ok(Some(Ok((agent_id, Err(e))))) => {
                    warn!(agent_id = %agent_id, error = %e, "Failed to stop agent");
                }
                Ok(Some(Err(e))) => warn!(error = %e, "Agent stop task failed"),
                Err(_) => {
                    warn!(remaining = stops.len(), "Agents did not stop in time, abandoning");
                    stops.abort_all();
                    break;
                }
            }
        }
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    pub fn config(&self) -> &CoordinatorConfig {
        &self.config
    }

    pub fn metrics(&self) -> Arc<MetricsCollector> {
        self.metrics.clone()
    }

    pub fn registry(&self) -> Arc<AgentRegistry> {
        self.registry.clone()
    }

    pub fn store(&self) -> Arc<TaskStore> {
        self.store.clone()
    }

    pub fn channel(&self) -> Arc<dyn MessageChannel> {
        self.channel.clone()
    }
}

/// Event-bus subscriber forwarding to the orchestrator
///
/// Holds a weak reference: the channel keeps its handlers alive, and the
/// orchestrator keeps the channel alive.
struct InboundEvents {
    orchestrator: Weak<Orchestrator>,
}

#[async_trait]
impl EventHandler for InboundEvents {
    async fn handle_event(&self, event: EventEnvelope) {
        match self.orchestrator.upgrade() {
            Some(orchestrator) => orchestrator.handle_event(event).await,
            None => debug!(event_type = %event.event_type, "Orchestrator gone, dropping event"),
        }
    }
}
