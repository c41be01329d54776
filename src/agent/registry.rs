//! Agent registry
//!
//! Owns every [`AgentRecord`]. Records live in one flat map keyed by agent id
//! with a secondary index by capability, both behind a single
//! `tokio::sync::Mutex`. Lifecycle events produced by a mutation are collected
//! while the lock is held and published after it is released; event
//! publication is best-effort and never fails the mutation.
//!
//! The one exception to "publish after unlock" is [`AgentRegistry::assign`]:
//! the task envelope is published on the work queue while the lock is held so
//! that a record is only mutated once the hand-off has succeeded.

use crate::agent::state::AgentState;
use crate::config::CoordinatorSection;
use crate::error::{CoordinatorError, CoordinatorResult};
use crate::observability::metrics::MetricsCollector;
use crate::protocol::{
    AgentErrorPayload, AgentLifecyclePayload, AgentStateChangedPayload, Capability,
    EventEnvelope, EventType, TaskAssignedPayload, TaskEnvelope, TaskFailedPayload, TaskKind,
};
use crate::transport::MessageChannel;
use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{Mutex, Notify};
use tracing::{debug, info, warn, Instrument};
use uuid::Uuid;

/// Error recorded on tasks held by an agent whose heartbeat went stale
pub const AGENT_FAILURE_ERROR: &str = "Agent failure";
/// Error carried by the `agent.error` event of a stale agent
pub const HEARTBEAT_TIMEOUT_ERROR: &str = "Agent heartbeat timeout";
/// Error recorded on tasks still held when a stop drain times out
pub const AGENT_STOPPED_ERROR: &str = "Agent stopped before completing task";

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AgentRecord {
    pub id: String,
    pub capability: Capability,
    pub state: AgentState,
    pub created_at: DateTime<Utc>,
    pub last_heartbeat: DateTime<Utc>,
    /// When the agent last entered IDLE; orders `list_idle`
    pub idle_since: DateTime<Utc>,
    pub held_tasks: BTreeSet<String>,
}

impl AgentRecord {
    fn new(capability: Capability, now: DateTime<Utc>) -> Self {
        Self {
            id: format!("{}-{}", capability, Uuid::new_v4().simple()),
            capability,
            state: AgentState::Starting,
            created_at: now,
            last_heartbeat: now,
            idle_since: now,
            held_tasks: BTreeSet::new(),
        }
    }

    fn transition(
        &mut self,
        next: AgentState,
        now: DateTime<Utc>,
        outbox: &mut Outbox,
    ) -> CoordinatorResult<()> {
        if !self.state.can_transition_to(next) {
            return Err(CoordinatorError::InvalidAgentState {
                agent_id: self.id.clone(),
                state: self.state,
                operation: "change state",
            });
        }

        let old_state = self.state;
        self.state = next;
        if next == AgentState::Idle {
            self.idle_since = now;
        }
        debug!(agent_id = %self.id, from = %old_state, to = %next, "Agent state changed");

        outbox.push(
            EventType::AgentStateChanged,
            &AgentStateChangedPayload {
                agent_id: self.id.clone(),
                agent_type: self.capability,
                old_state,
                new_state: next,
                timestamp: now,
            },
        );
        Ok(())
    }

    fn lifecycle_payload(&self, now: DateTime<Utc>) -> AgentLifecyclePayload {
        AgentLifecyclePayload {
            agent_id: self.id.clone(),
            agent_type: self.capability,
            timestamp: now,
        }
    }
}

/// How a held task left its agent
#[derive(Debug, Clone, PartialEq)]
pub enum TaskOutcome {
    Completed(Value),
    Failed(String),
}

/// A task released by an agent, to be applied to the task store
#[derive(Debug, Clone, PartialEq)]
pub struct TaskRelease {
    pub task_id: String,
    pub agent_id: String,
    pub outcome: TaskOutcome,
}

impl TaskRelease {
    fn failed(task_id: String, agent_id: &str, error: &str) -> Self {
        Self {
            task_id,
            agent_id: agent_id.to_string(),
            outcome: TaskOutcome::Failed(error.to_string()),
        }
    }
}

/// Result of stopping an agent
#[derive(Debug, Clone, PartialEq)]
pub struct StopOutcome {
    pub agent_id: String,
    /// True when every held task finished before the drain timeout
    pub drained: bool,
    /// Tasks still held at the deadline, released as failed
    pub abandoned: Vec<TaskRelease>,
}

/// Agents of one capability by state
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct AgentCounts {
    pub total: usize,
    pub idle: usize,
    pub busy: usize,
    pub error: usize,
    pub starting: usize,
    pub stopping: usize,
}

/// Events produced under the lock, published once it is released
#[derive(Default)]
struct Outbox {
    events: Vec<EventEnvelope>,
}

impl Outbox {
    fn push<T: Serialize>(&mut self, event_type: EventType, payload: &T) {
        match EventEnvelope::from_payload(event_type, payload) {
            Ok(envelope) => self.events.push(envelope),
            Err(e) => warn!(event_type = %event_type, error = %e, "Failed to serialize event"),
        }
    }
}

#[derive(Default)]
struct RegistryState {
    agents: HashMap<String, AgentRecord>,
    by_capability: HashMap<Capability, BTreeSet<String>>,
    /// Reverse index: which agent holds a task id
    task_owner: HashMap<String, String>,
    last_health_check: Option<Instant>,
}

impl RegistryState {
    fn agent(&self, agent_id: &str) -> CoordinatorResult<&AgentRecord> {
        self.agents
            .get(agent_id)
            .ok_or_else(|| CoordinatorError::agent_not_found(agent_id))
    }

    fn agent_mut(&mut self, agent_id: &str) -> CoordinatorResult<&mut AgentRecord> {
        self.agents
            .get_mut(agent_id)
            .ok_or_else(|| CoordinatorError::agent_not_found(agent_id))
    }

    fn remove(&mut self, agent_id: &str) -> Option<AgentRecord> {
        let record = self.agents.remove(agent_id)?;
        if let Some(ids) = self.by_capability.get_mut(&record.capability) {
            ids.remove(agent_id);
        }
        Some(record)
    }

    /// Drop a task from its agent; an emptied BUSY agent goes back to IDLE.
    /// Returns whether the agent's held set is now empty.
    fn release(
        &mut self,
        agent_id: &str,
        task_id: &str,
        now: DateTime<Utc>,
        outbox: &mut Outbox,
    ) -> CoordinatorResult<bool> {
        let record = self.agent_mut(agent_id)?;
        if !record.held_tasks.remove(task_id) {
            return Err(CoordinatorError::not_task_owner(agent_id, task_id));
        }

        let emptied = record.held_tasks.is_empty();
        if emptied && record.state == AgentState::Busy {
            record.transition(AgentState::Idle, now, outbox)?;
        }
        self.task_owner.remove(task_id);
        Ok(emptied)
    }

    /// Take every task an agent holds, producing failed releases
    fn abandon_all(
        &mut self,
        agent_id: &str,
        error: &str,
        now: DateTime<Utc>,
        outbox: &mut Outbox,
    ) -> Vec<TaskRelease> {
        let Some(record) = self.agents.get_mut(agent_id) else {
            return Vec::new();
        };
        let held = std::mem::take(&mut record.held_tasks);

        held.into_iter()
            .map(|task_id| {
                self.task_owner.remove(&task_id);
                outbox.push(
                    EventType::TaskFailed,
                    &TaskFailedPayload {
                        task_id: task_id.clone(),
                        agent_id: agent_id.to_string(),
                        error: error.to_string(),
                        timestamp: now,
                    },
                );
                TaskRelease::failed(task_id, agent_id, error)
            })
            .collect()
    }
}

/// Lifecycle, assignment and health tracking for every agent
pub struct AgentRegistry {
    state: Mutex<RegistryState>,
    channel: Arc<dyn MessageChannel>,
    metrics: Arc<MetricsCollector>,
    heartbeat_timeout: Duration,
    health_check_interval: Duration,
    /// Woken whenever a STOPPING agent's held set becomes empty
    drained: Notify,
}

impl AgentRegistry {
    pub fn new(
        channel: Arc<dyn MessageChannel>,
        metrics: Arc<MetricsCollector>,
        config: &CoordinatorSection,
    ) -> Self {
        Self {
            state: Mutex::new(RegistryState::default()),
            channel,
            metrics,
            heartbeat_timeout: config.heartbeat_timeout(),
            health_check_interval: config.health_check_interval(),
            drained: Notify::new(),
        }
    }

    /// Register a new agent of `capability` and make it available for work
    pub async fn start(&self, capability: Capability) -> CoordinatorResult<String> {
        let mut outbox = Outbox::default();
        let agent_id = {
            let mut state = self.state.lock().await;
            let now = Utc::now();
            let mut record = AgentRecord::new(capability, now);
            record.transition(AgentState::Idle, now, &mut outbox)?;
            outbox.push(EventType::AgentStarted, &record.lifecycle_payload(now));

            let agent_id = record.id.clone();
            state
                .by_capability
                .entry(capability)
                .or_default()
                .insert(agent_id.clone());
            state.agents.insert(agent_id.clone(), record);
            agent_id
        };

        self.metrics.agent_started();
        info!(agent_id = %agent_id, capability = %capability, "Agent started");
        self.flush(outbox).await;
        Ok(agent_id)
    }

    /// Stop an agent, waiting up to `drain_timeout` for its held tasks
    ///
    /// The agent rejects new assignments as soon as it is STOPPING. Tasks still
    /// held at the deadline are released as failed and returned in
    /// [`StopOutcome::abandoned`]; the caller applies them to the task store.
    pub async fn stop(
        &self,
        agent_id: &str,
        drain_timeout: Duration,
    ) -> CoordinatorResult<StopOutcome> {
        let mut outbox = Outbox::default();
        {
            let mut state = self.state.lock().await;
            let now = Utc::now();
            let record = state.agent_mut(agent_id)?;
            if !record.state.can_transition_to(AgentState::Stopping) {
                return Err(CoordinatorError::InvalidAgentState {
                    agent_id: agent_id.to_string(),
                    state: record.state,
                    operation: "stop",
                });
            }
            record.transition(AgentState::Stopping, now, &mut outbox)?;
            outbox.push(EventType::AgentStopping, &record.lifecycle_payload(now));
            info!(
                agent_id = %agent_id,
                held_tasks = record.held_tasks.len(),
                "Agent stopping"
            );
        }
        self.flush(outbox).await;

        let drained = self
            .wait_for_drain(agent_id, drain_timeout)
            .instrument(crate::agent_span!(agent_id = %agent_id))
            .await;

        let mut outbox = Outbox::default();
        let abandoned = {
            let mut state = self.state.lock().await;
            let now = Utc::now();
            let abandoned = state.abandon_all(agent_id, AGENT_STOPPED_ERROR, now, &mut outbox);
            let record = state.agent_mut(agent_id)?;
            record.transition(AgentState::Stopped, now, &mut outbox)?;
            outbox.push(EventType::AgentStopped, &record.lifecycle_payload(now));
            state.remove(agent_id);
            abandoned
        };

        self.metrics.agent_stopped();
        if abandoned.is_empty() {
            info!(agent_id = %agent_id, "Agent stopped");
        } else {
            warn!(
                agent_id = %agent_id,
                abandoned = abandoned.len(),
                "Agent stopped with tasks still in flight"
            );
        }
        self.flush(outbox).await;

        Ok(StopOutcome {
            agent_id: agent_id.to_string(),
            drained,
            abandoned,
        })
    }

    async fn wait_for_drain(&self, agent_id: &str, drain_timeout: Duration) -> bool {
        let deadline = tokio::time::Instant::now() + drain_timeout;
        loop {
            // Registered before the check so a release between check and wait is not missed
            let notified = self.drained.notified();
            {
                let state = self.state.lock().await;
                match state.agents.get(agent_id) {
                    Some(record) if !record.held_tasks.is_empty() => {}
                    _ => return true,
                }
            }
            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                return false;
            }
        }
    }

    /// Idle agents of `capability`, longest idle first
    pub async fn list_idle(&self, capability: Capability) -> Vec<String> {
        let state = self.state.lock().await;
        let Some(ids) = state.by_capability.get(&capability) else {
            return Vec::new();
        };

        let mut idle: Vec<&AgentRecord> = ids
            .iter()
            .filter_map(|id| state.agents.get(id))
            .filter(|record| record.state == AgentState::Idle)
            .collect();
        idle.sort_by(|a, b| a.idle_since.cmp(&b.idle_since).then_with(|| a.id.cmp(&b.id)));
        idle.into_iter().map(|record| record.id.clone()).collect()
    }

    /// Hand a task to an agent
    ///
    /// Publishes the envelope on the capability's work queue; the agent record
    /// changes only if that publish succeeds.
    pub async fn assign(
        &self,
        agent_id: &str,
        task_id: &str,
        task_type: TaskKind,
        payload: &Value,
    ) -> CoordinatorResult<()> {
        let mut outbox = Outbox::default();
        {
            let mut guard = self.state.lock().await;
            let state = &mut *guard;

            let record = state.agent(agent_id)?;
            if !record.state.accepts_tasks() {
                return Err(CoordinatorError::InvalidAgentState {
                    agent_id: agent_id.to_string(),
                    state: record.state,
                    operation: "accept tasks",
                });
            }
            if task_type.capability() != record.capability {
                return Err(CoordinatorError::validation(format!(
                    "Task type {task_type} cannot run on {} agent {agent_id}",
                    record.capability
                )));
            }
            if let Some(owner) = state.task_owner.get(task_id) {
                return Err(CoordinatorError::TaskAlreadyHeld {
                    task_id: task_id.to_string(),
                    agent_id: owner.clone(),
                });
            }

            let capability = record.capability;
            let envelope = TaskEnvelope {
                task_id: task_id.to_string(),
                task_type,
                task_payload: payload.clone(),
                agent_id: agent_id.to_string(),
            };
            self.channel.publish_task(capability, &envelope).await?;

            let now = Utc::now();
            let record = state.agent_mut(agent_id)?;
            record.held_tasks.insert(task_id.to_string());
            if record.state == AgentState::Idle {
                record.transition(AgentState::Busy, now, &mut outbox)?;
            }
            state
                .task_owner
                .insert(task_id.to_string(), agent_id.to_string());

            outbox.push(
                EventType::TaskAssigned,
                &TaskAssignedPayload {
                    task_id: task_id.to_string(),
                    task_type,
                    agent_id: agent_id.to_string(),
                    timestamp: now,
                },
            );
        }

        self.metrics.task_assigned();
        info!(agent_id = %agent_id, task_id = %task_id, task_type = %task_type, "Task assigned");
        self.flush(outbox).await;
        Ok(())
    }

    /// Accept a completion report from the task's current owner
    pub async fn complete(
        &self,
        agent_id: &str,
        task_id: &str,
        result: Value,
    ) -> CoordinatorResult<TaskRelease> {
        self.release(agent_id, task_id, TaskOutcome::Completed(result))
            .await
    }

    /// Accept a failure report from the task's current owner
    pub async fn fail(
        &self,
        agent_id: &str,
        task_id: &str,
        error: String,
    ) -> CoordinatorResult<TaskRelease> {
        self.release(agent_id, task_id, TaskOutcome::Failed(error))
            .await
    }

    async fn release(
        &self,
        agent_id: &str,
        task_id: &str,
        outcome: TaskOutcome,
    ) -> CoordinatorResult<TaskRelease> {
        let mut outbox = Outbox::default();
        let wake_stoppers = {
            let mut state = self.state.lock().await;
            let emptied = state.release(agent_id, task_id, Utc::now(), &mut outbox)?;
            emptied && state.agent(agent_id)?.state == AgentState::Stopping
        };

        if wake_stoppers {
            self.drained.notify_waiters();
        }
        self.flush(outbox).await;

        Ok(TaskRelease {
            task_id: task_id.to_string(),
            agent_id: agent_id.to_string(),
            outcome,
        })
    }

    /// Record a liveness signal; an agent in ERROR resumes work
    pub async fn heartbeat(&self, agent_id: &str) -> CoordinatorResult<()> {
        let mut outbox = Outbox::default();
        {
            let mut state = self.state.lock().await;
            let now = Utc::now();
            let record = state.agent_mut(agent_id)?;
            record.last_heartbeat = now;

            if record.state == AgentState::Error {
                let resumed = if record.held_tasks.is_empty() {
                    AgentState::Idle
                } else {
                    AgentState::Busy
                };
                record.transition(resumed, now, &mut outbox)?;
                info!(agent_id = %agent_id, state = %resumed, "Agent recovered");
            }
        }

        self.metrics.heartbeat_received();
        self.flush(outbox).await;
        Ok(())
    }

    /// Rate-limited health sweep used by the control loop
    ///
    /// Returns an empty list when the previous sweep ran less than the health
    /// check interval ago.
    pub async fn check_health(&self) -> Vec<TaskRelease> {
        {
            let mut state = self.state.lock().await;
            let due = state
                .last_health_check
                .map_or(true, |last| last.elapsed() >= self.health_check_interval);
            if !due {
                return Vec::new();
            }
            state.last_health_check = Some(Instant::now());
        }
        self.health_sweep(Utc::now(), self.heartbeat_timeout).await
    }

    /// Run a health sweep regardless of the rate limit
    #[doc(hidden)]
    pub async fn force_health_sweep_for_test(&self) -> Vec<TaskRelease> {
        self.health_sweep(Utc::now(), self.heartbeat_timeout).await
    }

    /// Move every IDLE/BUSY agent whose last heartbeat is older than
    /// `timeout` to ERROR and force-fail the tasks it holds
    ///
    /// Agents already in ERROR are skipped, so each stale agent is reported
    /// once until a heartbeat brings it back. The agent is neither restarted
    /// nor are its tasks retried.
    pub async fn health_sweep(&self, now: DateTime<Utc>, timeout: Duration) -> Vec<TaskRelease> {
        let mut outbox = Outbox::default();
        let mut releases = Vec::new();
        let mut stale_agents = 0usize;
        {
            let mut state = self.state.lock().await;
            let stale: Vec<String> = state
                .agents
                .values()
                .filter(|record| record.state.is_monitored())
                .filter(|record| {
                    (now - record.last_heartbeat).to_std().unwrap_or_default() > timeout
                })
                .map(|record| record.id.clone())
                .collect();

            for agent_id in stale {
                let Some(record) = state.agents.get_mut(&agent_id) else {
                    continue;
                };
                if let Err(e) = record.transition(AgentState::Error, now, &mut outbox) {
                    warn!(agent_id = %agent_id, error = %e, "Could not mark stale agent");
                    continue;
                }
                outbox.push(
                    EventType::AgentError,
                    &AgentErrorPayload {
                        agent_id: agent_id.clone(),
                        agent_type: record.capability,
                        error: HEARTBEAT_TIMEOUT_ERROR.to_string(),
                        timestamp: now,
                    },
                );
                warn!(
                    agent_id = %agent_id,
                    last_heartbeat = %record.last_heartbeat,
                    held_tasks = record.held_tasks.len(),
                    "Agent heartbeat timed out"
                );

                releases.extend(state.abandon_all(&agent_id, AGENT_FAILURE_ERROR, now, &mut outbox));
                stale_agents += 1;
            }
        }

        self.metrics.health_sweep();
        for _ in 0..stale_agents {
            self.metrics.agent_error();
        }
        self.flush(outbox).await;
        releases
    }

    /// Agent counts by state for every capability
    pub async fn agent_counts(&self) -> BTreeMap<Capability, AgentCounts> {
        let state = self.state.lock().await;
        let mut counts: BTreeMap<Capability, AgentCounts> = Capability::ALL
            .into_iter()
            .map(|capability| (capability, AgentCounts::default()))
            .collect();

        for record in state.agents.values() {
            let entry = counts.entry(record.capability).or_default();
            entry.total += 1;
            match record.state {
                AgentState::Idle => entry.idle += 1,
                AgentState::Busy => entry.busy += 1,
                AgentState::Error => entry.error += 1,
                AgentState::Starting => entry.starting += 1,
                AgentState::Stopping => entry.stopping += 1,
                AgentState::Stopped => {}
            }
        }
        counts
    }

    /// Snapshot of one agent
    pub async fn get(&self, agent_id: &str) -> Option<AgentRecord> {
        self.state.lock().await.agents.get(agent_id).cloned()
    }

    /// Ids of every registered agent, sorted
    pub async fn agent_ids(&self) -> Vec<String> {
        let state = self.state.lock().await;
        let mut ids: Vec<String> = state.agents.keys().cloned().collect();
        ids.sort();
        ids
    }

    /// Agent currently holding `task_id`
    pub async fn task_owner(&self, task_id: &str) -> Option<String> {
        self.state.lock().await.task_owner.get(task_id).cloned()
    }

    #[doc(hidden)]
    pub async fn set_last_heartbeat_for_test(
        &self,
        agent_id: &str,
        last_heartbeat: DateTime<Utc>,
    ) -> CoordinatorResult<()> {
        let mut state = self.state.lock().await;
        state.agent_mut(agent_id)?.last_heartbeat = last_heartbeat;
        Ok(())
    }

    async fn flush(&self, outbox: Outbox) {
        for event in outbox.events {
            match self.channel.publish_event(&event).await {
                Ok(()) => self.metrics.event_published(),
                Err(e) => {
                    self.metrics.event_dropped();
                    warn!(event_type = %event.event_type, error = %e, "Dropping event");
                }
            }
        }
    }
}
