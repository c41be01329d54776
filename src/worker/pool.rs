//! Worker pool for one capability
//!
//! Consumes the capability's work queue on behalf of the agents attached to
//! it. An envelope addressed to an agent this pool does not host is rejected,
//! so the channel requeues it for another consumer. Accepted envelopes are
//! acknowledged immediately and executed in a detached task that reports back
//! with exactly one `task.completed` or `task.failed` event.
//!
//! Agents are attached when their `agent.started` event is seen (or through
//! [`WorkerPool::attach`]) and detached on `agent.stopping`. Each attached
//! agent sends `agent.heartbeat` every heartbeat interval plus jitter, the
//! first one after a random delay.

use crate::config::WorkerSection;
use crate::error::CoordinatorResult;
use crate::protocol::{
    AgentLifecyclePayload, Capability, EventEnvelope, EventType, TaskCompletedPayload,
    TaskEnvelope, TaskFailedPayload,
};
use crate::timing::{jitter, jittered};
use crate::transport::{
    emit_event, EventHandler, HandlerError, MessageChannel, SubscriptionId, TaskHandler,
};
use crate::worker::executor::{ExecutorRegistry, TaskExecutor};
use async_trait::async_trait;
use chrono::Utc;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn, Instrument};

/// Lifecycle events that attach and detach agents
const LIFECYCLE_EVENTS: [EventType; 3] = [
    EventType::AgentStarted,
    EventType::AgentStopping,
    EventType::AgentStopped,
];

struct PoolInner {
    capability: Capability,
    channel: Arc<dyn MessageChannel>,
    executors: ExecutorRegistry,
    heartbeat_interval: Duration,
    heartbeat_jitter: Duration,
    /// Attached agent ids and their heartbeat tasks
    agents: Mutex<HashMap<String, JoinHandle<()>>>,
}

impl PoolInner {
    async fn attach(&self, agent_id: &str) {
        let mut agents = self.agents.lock().await;
        if agents.contains_key(agent_id) {
            return;
        }

        let heartbeat = tokio::spawn(heartbeat_loop(
            self.channel.clone(),
            agent_id.to_string(),
            self.capability,
            self.heartbeat_interval,
            self.heartbeat_jitter,
        ));
        agents.insert(agent_id.to_string(), heartbeat);
        info!(agent_id = %agent_id, capability = %self.capability, "Agent attached to worker pool");
    }

    async fn detach(&self, agent_id: &str) -> bool {
        match self.agents.lock().await.remove(agent_id) {
            Some(heartbeat) => {
                heartbeat.abort();
                info!(agent_id = %agent_id, "Agent detached from worker pool");
                true
            }
            None => false,
        }
    }
}

impl Drop for PoolInner {
    fn drop(&mut self) {
        for (_, heartbeat) in self.agents.get_mut().drain() {
            heartbeat.abort();
        }
    }
}

#[async_trait]
impl TaskHandler for PoolInner {
    async fn handle_task(&self, envelope: TaskEnvelope) -> Result<(), HandlerError> {
        if !self.agents.lock().await.contains_key(&envelope.agent_id) {
            return Err(format!(
                "Agent {} is not hosted by the {} worker pool",
                envelope.agent_id, self.capability
            )
            .into());
        }

        let channel = self.channel.clone();
        let span = crate::task_span!(
            task_id = %envelope.task_id,
            agent_id = %envelope.agent_id,
            task_type = %envelope.task_type
        );
        match self.executors.get(envelope.task_type) {
            Some(executor) => {
                tokio::spawn(run_task(channel, executor, envelope).instrument(span));
            }
            None => {
                let error = format!(
                    "No executor for task type {} in the {} worker pool",
                    envelope.task_type, self.capability
                );
                report_failure(channel.as_ref(), &envelope, error)
                    .instrument(span)
                    .await;
            }
        }
        Ok(())
    }
}

#[async_trait]
impl EventHandler for PoolInner {
    async fn handle_event(&self, event: EventEnvelope) {
        let payload: AgentLifecyclePayload = match event.parse_payload() {
            Ok(payload) => payload,
            Err(e) => {
                warn!(event_type = %event.event_type, error = %e, "Dropping malformed lifecycle event");
                return;
            }
        };
        if payload.agent_type != self.capability {
            return;
        }

        match event.event_type {
            EventType::AgentStarted => self.attach(&payload.agent_id).await,
            EventType::AgentStopping | EventType::AgentStopped => {
                self.detach(&payload.agent_id).await;
            }
            _ => {}
        }
    }
}

async fn run_task(
    channel: Arc<dyn MessageChannel>,
    executor: Arc<dyn TaskExecutor>,
    envelope: TaskEnvelope,
) {
    debug!("Executing task");
    match executor
        .execute(envelope.task_type, &envelope.task_payload)
        .await
    {
        Ok(result) => {
            let payload = TaskCompletedPayload {
                task_id: envelope.task_id.clone(),
                agent_id: envelope.agent_id.clone(),
                result,
                timestamp: Utc::now(),
            };
            emit_event(channel.as_ref(), EventType::TaskCompleted, &payload).await;
            debug!("Task completed");
        }
        Err(error) => report_failure(channel.as_ref(), &envelope, error).await,
    }
}

async fn report_failure(channel: &dyn MessageChannel, envelope: &TaskEnvelope, error: String) {
    warn!(error = %error, "Task execution failed");
    let payload = TaskFailedPayload {
        task_id: envelope.task_id.clone(),
        agent_id: envelope.agent_id.clone(),
        error,
        timestamp: Utc::now(),
    };
    emit_event(channel, EventType::TaskFailed, &payload).await;
}

async fn heartbeat_loop(
    channel: Arc<dyn MessageChannel>,
    agent_id: String,
    capability: Capability,
    interval: Duration,
    max_jitter: Duration,
) {
    tokio::time::sleep(jitter(max_jitter)).await;
    loop {
        let payload = AgentLifecyclePayload {
            agent_id: agent_id.clone(),
            agent_type: capability,
            timestamp: Utc::now(),
        };
        emit_event(channel.as_ref(), EventType::AgentHeartbeat, &payload).await;
        tokio::time::sleep(jittered(interval, max_jitter)).await;
    }
}

/// Embedded workers for one capability
pub struct WorkerPool {
    inner: Arc<PoolInner>,
    subscriptions: Mutex<Vec<SubscriptionId>>,
}

impl WorkerPool {
    /// Fails if `executors` does not cover every task kind of its capability
    pub fn new(
        executors: ExecutorRegistry,
        channel: Arc<dyn MessageChannel>,
        config: &WorkerSection,
    ) -> CoordinatorResult<Self> {
        executors.verify()?;
        Ok(Self {
            inner: Arc::new(PoolInner {
                capability: executors.capability(),
                channel,
                executors,
                heartbeat_interval: config.heartbeat_interval(),
                heartbeat_jitter: config.heartbeat_jitter(),
                agents: Mutex::new(HashMap::new()),
            }),
            subscriptions: Mutex::new(Vec::new()),
        })
    }

    /// Subscribe to the work queue and to agent lifecycle events
    pub async fn start(&self) -> CoordinatorResult<()> {
        let channel = &self.inner.channel;
        let queue = channel
            .subscribe(self.inner.capability, self.inner.clone())
            .await?;
        let lifecycle = channel
            .subscribe_events(&LIFECYCLE_EVENTS, self.inner.clone())
            .await?;

        self.subscriptions.lock().await.extend([queue, lifecycle]);
        info!(capability = %self.inner.capability, "Worker pool started");
        Ok(())
    }

    pub async fn attach(&self, agent_id: &str) {
        self.inner.attach(agent_id).await;
    }

    /// Stop hosting an agent; returns false if it was not attached
    pub async fn detach(&self, agent_id: &str) -> bool {
        self.inner.detach(agent_id).await
    }

    pub async fn attached_agents(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.inner.agents.lock().await.keys().cloned().collect();
        ids.sort();
        ids
    }

    pub fn capability(&self) -> Capability {
        self.inner.capability
    }

    /// Unsubscribe and stop every heartbeat
    pub async fn shutdown(&self) {
        for subscription in self.subscriptions.lock().await.drain(..) {
            if let Err(e) = self.inner.channel.unsubscribe(subscription).await {
                warn!(subscription = %subscription, error = %e, "Failed to unsubscribe worker pool");
            }
        }
        for (_, heartbeat) in self.inner.agents.lock().await.drain() {
            heartbeat.abort();
        }
        info!(capability = %self.inner.capability, "Worker pool stopped");
    }
}
