//! Task store
//!
//! Four partitions (pending, processing, completed, failed) behind one
//! `tokio::sync::Mutex`. A record is moved between partitions, never copied,
//! so a task id is in exactly one partition at any time. Pending tasks keep
//! submission order, which is the only scheduling policy.

use crate::agent::registry::{AgentRegistry, TaskOutcome, TaskRelease};
use crate::error::{CoordinatorError, CoordinatorResult};
use crate::observability::metrics::MetricsCollector;
use crate::protocol::{Capability, TaskKind};
use crate::task::record::{TaskCounts, TaskRecord, TaskStatus, TaskStatusReport};
use chrono::Utc;
use serde::Serialize;
use serde_json::Value;
use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};
use uuid::Uuid;

#[derive(Default)]
struct StoreState {
    pending: VecDeque<TaskRecord>,
    processing: HashMap<String, TaskRecord>,
    completed: HashMap<String, TaskRecord>,
    failed: HashMap<String, TaskRecord>,
}

impl StoreState {
    fn find(&self, task_id: &str) -> Option<&TaskRecord> {
        self.processing
            .get(task_id)
            .or_else(|| self.pending.iter().find(|t| t.id == task_id))
            .or_else(|| self.completed.get(task_id))
            .or_else(|| self.failed.get(task_id))
    }

    /// Error for an operation that expected `task_id` in `expected`
    fn wrong_state(&self, task_id: &str, expected: TaskStatus) -> CoordinatorError {
        match self.find(task_id) {
            Some(record) => CoordinatorError::InvalidTaskState {
                task_id: task_id.to_string(),
                expected,
                actual: record.status,
            },
            None => CoordinatorError::task_not_found(task_id),
        }
    }

    fn take_pending(&mut self, task_id: &str) -> Option<TaskRecord> {
        let position = self.pending.iter().position(|t| t.id == task_id)?;
        self.pending.remove(position)
    }
}

/// One task handed to one agent during a scheduling pass
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Assignment {
    pub task_id: String,
    pub agent_id: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct SchedulingReport {
    pub assigned: Vec<Assignment>,
    pub handoff_failures: usize,
    /// Tasks still pending after the pass, per capability
    pub pending_left: BTreeMap<Capability, usize>,
}

pub struct TaskStore {
    state: Mutex<StoreState>,
    metrics: Arc<MetricsCollector>,
}

impl TaskStore {
    pub fn new(metrics: Arc<MetricsCollector>) -> Self {
        Self {
            state: Mutex::new(StoreState::default()),
            metrics,
        }
    }

    /// Add a pending task; payload validation happens before this call
    pub async fn submit(&self, task_type: TaskKind, payload: Value) -> String {
        let task_id = format!(
            "{}-{}",
            task_type.capability().task_id_prefix(),
            Uuid::new_v4().simple()
        );
        let record = TaskRecord::new(task_id.clone(), task_type, payload, Utc::now());

        self.state.lock().await.pending.push_back(record);
        self.metrics.task_submitted();
        info!(task_id = %task_id, task_type = %task_type, "Task submitted");
        task_id
    }

    pub async fn status(&self, task_id: &str) -> CoordinatorResult<TaskStatusReport> {
        let state = self.state.lock().await;
        state
            .find(task_id)
            .map(TaskStatusReport::from)
            .ok_or_else(|| CoordinatorError::task_not_found(task_id))
    }

    /// Move a processing task to completed
    pub async fn complete(&self, task_id: &str, result: Value) -> CoordinatorResult<()> {
        let mut state = self.state.lock().await;
        let Some(mut record) = state.processing.remove(task_id) else {
            return Err(state.wrong_state(task_id, TaskStatus::Processing));
        };

        let now = Utc::now();
        let turnaround = record
            .history
            .iter()
            .rev()
            .find(|entry| entry.status == TaskStatus::Processing)
            .and_then(|entry| (now - entry.timestamp).to_std().ok());
        record.mark_completed(result, now);
        state.completed.insert(task_id.to_string(), record);
        drop(state);

        self.metrics.task_completed(turnaround);
        info!(
            task_id = %task_id,
            turnaround_ms = turnaround.map(|d| d.as_millis() as u64),
            "Task completed"
        );
        Ok(())
    }

    /// Move a processing task to failed, recording `error` verbatim
    pub async fn fail(&self, task_id: &str, error: String) -> CoordinatorResult<()> {
        let mut state = self.state.lock().await;
        let Some(mut record) = state.processing.remove(task_id) else {
            return Err(state.wrong_state(task_id, TaskStatus::Processing));
        };

        warn!(task_id = %task_id, error = %error, "Task failed");
        record.mark_failed(error, Utc::now());
        state.failed.insert(task_id.to_string(), record);
        drop(state);

        self.metrics.task_failed();
        Ok(())
    }

    /// Return a failed task to the back of the pending queue
    pub async fn retry(&self, task_id: &str) -> CoordinatorResult<()> {
        let mut state = self.state.lock().await;
        let Some(mut record) = state.failed.remove(task_id) else {
            return Err(state.wrong_state(task_id, TaskStatus::Failed));
        };

        record.mark_retried(Utc::now());
        state.pending.push_back(record);
        drop(state);

        self.metrics.task_retried();
        info!(task_id = %task_id, "Task retried");
        Ok(())
    }

    /// Apply a release produced by the agent registry
    pub async fn apply_release(&self, release: TaskRelease) -> CoordinatorResult<()> {
        match release.outcome {
            TaskOutcome::Completed(result) => self.complete(&release.task_id, result).await,
            TaskOutcome::Failed(error) => self.fail(&release.task_id, error).await,
        }
    }

    pub async fn counts(&self) -> TaskCounts {
        let state = self.state.lock().await;
        TaskCounts {
            pending: state.pending.len(),
            processing: state.processing.len(),
            completed: state.completed.len(),
            failed: state.failed.len(),
        }
    }

    /// Pair pending tasks with idle agents, FIFO per capability
    ///
    /// Idle agents are listed once per capability per pass. The registry
    /// publishes the task before the task leaves `pending`; a transport
    /// failure leaves the task pending and skips the rest of that capability
    /// until the next pass. The store lock is held for the whole pass and the
    /// registry lock is taken inside it, never the other way round.
    pub async fn run_scheduling_pass(&self, registry: &AgentRegistry) -> SchedulingReport {
        let mut state = self.state.lock().await;
        let mut report = SchedulingReport::default();

        let candidates: Vec<(String, Capability, TaskKind, Value)> = state
            .pending
            .iter()
            .map(|t| (t.id.clone(), t.capability, t.task_type, t.payload.clone()))
            .collect();

        let mut idle_agents: HashMap<Capability, VecDeque<String>> = HashMap::new();
        let mut exhausted: HashSet<Capability> = HashSet::new();

        for (task_id, capability, task_type, payload) in candidates {
            if exhausted.contains(&capability) {
                continue;
            }
            if !idle_agents.contains_key(&capability) {
                let idle = registry.list_idle(capability).await;
                idle_agents.insert(capability, idle.into());
            }
            let Some(idle) = idle_agents.get_mut(&capability) else {
                continue;
            };

            loop {
                let Some(agent_id) = idle.pop_front() else {
                    exhausted.insert(capability);
                    break;
                };

                match registry
                    .assign(&agent_id, &task_id, task_type, &payload)
                    .await
                {
                    Ok(()) => {
                        if let Some(mut record) = state.take_pending(&task_id) {
                            record.mark_processing(&agent_id, Utc::now());
                            state.processing.insert(task_id.clone(), record);
                        }
                        report.assigned.push(Assignment {
                            task_id: task_id.clone(),
                            agent_id,
                        });
                        break;
                    }
                    Err(CoordinatorError::Transport(e)) => {
                        report.handoff_failures += 1;
                        self.metrics.handoff_failed();
                        warn!(
                            task_id = %task_id,
                            agent_id = %agent_id,
                            capability = %capability,
                            error = %e,
                            "Task hand-off failed, leaving task pending"
                        );
                        exhausted.insert(capability);
                        break;
                    }
                    Err(e) => {
                        debug!(
                            task_id = %task_id,
                            agent_id = %agent_id,
                            error = %e,
                            "Agent unavailable, trying next"
                        );
                    }
                }
            }
        }

        for record in &state.pending {
            *report.pending_left.entry(record.capability).or_default() += 1;
        }
        drop(state);

        self.metrics.scheduling_pass();
        if !report.assigned.is_empty() {
            debug!(
                assigned = report.assigned.len(),
                handoff_failures = report.handoff_failures,
                "Scheduling pass finished"
            );
        }
        report
    }

    /// Age of the oldest pending task, if any
    pub async fn oldest_pending_age(&self) -> Option<Duration> {
        let state = self.state.lock().await;
        state
            .pending
            .front()
            .and_then(|t| (Utc::now() - t.created_at).to_std().ok())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::CoordinatorConfig;
    use crate::testing::mocks::MockChannel;
    use proptest::prelude::*;
    use serde_json::json;

    struct Fixture {
        channel: Arc<MockChannel>,
        store: TaskStore,
        registry: AgentRegistry,
    }

    fn fixture() -> Fixture {
        let metrics = Arc::new(MetricsCollector::new());
        let channel = Arc::new(MockChannel::new());
        let config = CoordinatorConfig::test_config();
        Fixture {
            store: TaskStore::new(metrics.clone()),
            registry: AgentRegistry::new(channel.clone(), metrics, &config.coordinator),
            channel,
        }
    }

    fn scrape_payload() -> Value {
        json!({"url": "https://example.com"})
    }

    #[tokio::test]
    async fn test_submit_creates_pending_task() {
        let f = fixture();

        let task_id = f.store.submit(TaskKind::ScrapeWeb, scrape_payload()).await;

        assert!(task_id.starts_with("scr-"));
        let report = f.store.status(&task_id).await.unwrap();
        assert_eq!(report.status, TaskStatus::Pending);
        assert_eq!(report.assigned_to, None);
        assert_eq!(f.store.counts().await.pending, 1);
    }

    #[tokio::test]
    async fn test_status_unknown_task() {
        let f = fixture();
        let err = f.store.status("scr-missing").await.unwrap_err();
        assert!(matches!(err, CoordinatorError::TaskNotFound { .. }));
    }

    #[tokio::test]
    async fn test_scheduling_pass_assigns_fifo() {
        // Arrange
        let f = fixture();
        let agent = f.registry.start(Capability::Scraper).await.unwrap();
        let first = f.store.submit(TaskKind::ScrapeWeb, scrape_payload()).await;
        let second = f.store.submit(TaskKind::ScrapeWeb, scrape_payload()).await;

        // Act
        let report = f.store.run_scheduling_pass(&f.registry).await;

        // Assert
        assert_eq!(
            report.assigned,
            vec![Assignment {
                task_id: first.clone(),
                agent_id: agent.clone()
            }]
        );
        assert_eq!(report.pending_left.get(&Capability::Scraper), Some(&1));

        let first_status = f.store.status(&first).await.unwrap();
        assert_eq!(first_status.status, TaskStatus::Processing);
        assert_eq!(first_status.assigned_to, Some(agent));
        assert_eq!(
            f.store.status(&second).await.unwrap().status,
            TaskStatus::Pending
        );
    }

    #[tokio::test]
    async fn test_no_capacity_keeps_task_pending() {
        let f = fixture();
        f.registry.start(Capability::Scraper).await.unwrap();
        let task_id = f.store.submit(TaskKind::BuildGraph, json!({})).await;

        for _ in 0..5 {
            let report = f.store.run_scheduling_pass(&f.registry).await;
            assert!(report.assigned.is_empty());
        }

        assert_eq!(
            f.store.status(&task_id).await.unwrap().status,
            TaskStatus::Pending
        );
    }

    #[tokio::test]
    async fn test_failed_handoff_leaves_task_pending() {
        // Arrange
        let f = fixture();
        let agent = f.registry.start(Capability::Scraper).await.unwrap();
        let task_id = f.store.submit(TaskKind::ScrapeWeb, scrape_payload()).await;
        f.channel.set_fail_tasks(true);

        // Act
        let report = f.store.run_scheduling_pass(&f.registry).await;

        // Assert
        assert_eq!(report.handoff_failures, 1);
        assert!(report.assigned.is_empty());
        assert_eq!(
            f.store.status(&task_id).await.unwrap().status,
            TaskStatus::Pending
        );
        assert!(f.registry.get(&agent).await.unwrap().held_tasks.is_empty());

        // Recovers on the next pass
        f.channel.set_fail_tasks(false);
        let report = f.store.run_scheduling_pass(&f.registry).await;
        assert_eq!(report.assigned.len(), 1);
    }

    #[tokio::test]
    async fn test_complete_requires_processing() {
        let f = fixture();
        let task_id = f.store.submit(TaskKind::ProcessText, json!({"text": "hi"})).await;

        let err = f.store.complete(&task_id, json!({})).await.unwrap_err();

        assert!(matches!(
            err,
            CoordinatorError::InvalidTaskState {
                expected: TaskStatus::Processing,
                actual: TaskStatus::Pending,
                ..
            }
        ));
        assert_eq!(f.store.counts().await.pending, 1);
    }

    #[tokio::test]
    async fn test_fail_then_retry() {
        let f = fixture();
        let agent = f.registry.start(Capability::Processor).await.unwrap();
        let task_id = f.store.submit(TaskKind::ProcessText, json!({"text": "hi"})).await;
        f.store.run_scheduling_pass(&f.registry).await;

        let release = f
            .registry
            .fail(&agent, &task_id, "parser crashed".to_string())
            .await
            .unwrap();
        f.store.apply_release(release).await.unwrap();

        let failed = f.store.status(&task_id).await.unwrap();
        assert_eq!(failed.status, TaskStatus::Failed);
        assert_eq!(failed.error.as_deref(), Some("parser crashed"));

        f.store.retry(&task_id).await.unwrap();
        let retried = f.store.status(&task_id).await.unwrap();
        assert_eq!(retried.status, TaskStatus::Pending);
        assert_eq!(retried.error, None);
        assert_eq!(retried.assigned_to, None);
        assert_eq!(retried.history.last().unwrap().message, "Task retried");
    }

    #[tokio::test]
    async fn test_retry_requires_failed() {
        let f = fixture();
        let task_id = f.store.submit(TaskKind::GenerateQuiz, json!({})).await;

        let err = f.store.retry(&task_id).await.unwrap_err();

        assert!(matches!(err, CoordinatorError::InvalidTaskState { .. }));
    }

    #[tokio::test]
    async fn test_complete_records_result() {
        let f = fixture();
        let agent = f.registry.start(Capability::Ui).await.unwrap();
        let task_id = f.store.submit(TaskKind::ComposeDashboard, json!({})).await;
        f.store.run_scheduling_pass(&f.registry).await;

        let release = f
            .registry
            .complete(&agent, &task_id, json!({"widgets": 3}))
            .await
            .unwrap();
        f.store.apply_release(release).await.unwrap();

        let report = f.store.status(&task_id).await.unwrap();
        assert_eq!(report.status, TaskStatus::Completed);
        assert_eq!(report.result, Some(json!({"widgets": 3})));
        assert_eq!(
            f.store.counts().await,
            TaskCounts {
                completed: 1,
                ..TaskCounts::default()
            }
        );
    }

    #[derive(Debug, Clone)]
    enum Op {
        Submit,
        Schedule,
        CompleteOldest,
        FailOldest,
        RetryOldest,
    }

    fn op_strategy() -> impl Strategy<Value = Op> {
        prop_oneof![
            Just(Op::Submit),
            Just(Op::Schedule),
            Just(Op::CompleteOldest),
            Just(Op::FailOldest),
            Just(Op::RetryOldest),
        ]
    }

    async fn apply(f: &Fixture, op: Op) {
        match op {
            Op::Submit => {
                f.store.submit(TaskKind::ScrapeWeb, scrape_payload()).await;
            }
            Op::Schedule => {
                f.store.run_scheduling_pass(&f.registry).await;
            }
            Op::CompleteOldest | Op::FailOldest => {
                let held = {
                    let state = f.store.state.lock().await;
                    state
                        .processing
                        .values()
                        .min_by_key(|t| t.updated_at)
                        .and_then(|t| Some((t.id.clone(), t.assigned_to.clone()?)))
                };
                if let Some((task_id, agent_id)) = held {
                    let release = if matches!(op, Op::CompleteOldest) {
                        f.registry.complete(&agent_id, &task_id, json!({})).await
                    } else {
                        f.registry.fail(&agent_id, &task_id, "boom".into()).await
                    };
                    if let Ok(release) = release {
                        f.store.apply_release(release).await.unwrap();
                    }
                }
            }
            Op::RetryOldest => {
                let failed = {
                    let state = f.store.state.lock().await;
                    state.failed.keys().next().cloned()
                };
                if let Some(task_id) = failed {
                    f.store.retry(&task_id).await.unwrap();
                }
            }
        }
    }

    proptest! {
        #[test]
        fn prop_lifecycle_invariants(ops in prop::collection::vec(op_strategy(), 1..40)) {
            let runtime = tokio::runtime::Builder::new_current_thread()
                .enable_all()
                .build()
                .unwrap();

            runtime.block_on(async {
                let f = fixture();
                f.registry.start(Capability::Scraper).await.unwrap();
                f.registry.start(Capability::Scraper).await.unwrap();

                let mut submitted = 0usize;
                for op in ops {
                    if matches!(op, Op::Submit) {
                        submitted += 1;
                    }
                    apply(&f, op).await;
                }

                let state = f.store.state.lock().await;
                let mut ids: Vec<&TaskRecord> = state.pending.iter().collect();
                ids.extend(state.processing.values());
                ids.extend(state.completed.values());
                ids.extend(state.failed.values());

                // Exactly one partition per task
                let unique: HashSet<&str> = ids.iter().map(|t| t.id.as_str()).collect();
                assert_eq!(unique.len(), ids.len());
                assert_eq!(ids.len(), submitted);

                for record in ids {
                    // Every recorded step follows the lifecycle
                    for pair in record.history.windows(2) {
                        assert!(pair[0].status.can_transition_to(pair[1].status));
                    }
                    assert_eq!(record.history.last().map(|h| h.status), Some(record.status));
                }

                // Processing tasks are exactly the tasks agents hold
                for (task_id, record) in &state.processing {
                    assert_eq!(
                        f.registry.task_owner(task_id).await,
                        record.assigned_to.clone()
                    );
                }
                for agent_id in f.registry.agent_ids().await {
                    let agent = f.registry.get(&agent_id).await.unwrap();
                    assert_eq!(
                        agent.state == crate::agent::state::AgentState::Busy,
                        !agent.held_tasks.is_empty()
                    );
                }
            });
        }
    }
}
