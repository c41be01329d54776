//! Agent failure detection tests
//!
//! A stale heartbeat moves the agent to ERROR once per detection window and
//! fails every task it held with the agent-failure reason. Nothing is retried
//! automatically; an explicit retry lets another agent pick the task up.


use chrono::Utc;
use knowledge_coordinator::agent::{AgentState, AGENT_FAILURE_ERROR, HEARTBEAT_TIMEOUT_ERROR};
use knowledge_coordinator::config::CoordinatorConfig;
use knowledge_coordinator::observability::MetricsCollector;
use knowledge_coordinator::orchestrator::Orchestrator;
use knowledge_coordinator::protocol::{AgentErrorPayload, Capability, EventType, TaskFailedPayload};
use knowledge_coordinator::task::TaskStatus;
use knowledge_coordinator::testing::mocks::MockChannel;
use serde_json::json;
use std::sync::Arc;

/// Sweeps on every tick
fn sweeping_orchestrator(channel: Arc<MockChannel>) -> Arc<Orchestrator> {
    let mut config: CoordinatorConfig = test_helpers::test_config();
    config.coordinator.health_check_interval_secs = 0;
    Arc::new(Orchestrator::new(channel, config, Arc::new(MetricsCollector::new())).unwrap())
}

async fn go_silent(orchestrator: &Orchestrator, agent_id: &str) {
    orchestrator
        .registry()
        .set_last_heartbeat_for_test(agent_id, Utc::now() - chrono::Duration::minutes(10))
        .await
        .unwrap();
}

#[tokio::test]
async fn test_stale_agent_fails_its_task_and_retry_reassigns() {
    // Arrange: one scraper holding one task
    let channel = Arc::new(MockChannel::new());
    let orchestrator = sweeping_orchestrator(channel.clone());
    let stale_agent = orchestrator.start_agent(Capability::Scraper).await.unwrap();
    let task_id = orchestrator
        .submit("scrape_academic", json!({"author": "Lamport"}))
        .await
        .unwrap();
    orchestrator.tick().await;
    assert_eq!(
        orchestrator.status(&task_id).await.unwrap().assigned_to,
        Some(stale_agent.clone())
    );

    // Act: heartbeat goes stale
    go_silent(&orchestrator, &stale_agent).await;
    let report = orchestrator.tick().await;

    // Assert
    assert_eq!(report.forced_failures, 1);
    let status = orchestrator.status(&task_id).await.unwrap();
    assert_eq!(status.status, TaskStatus::Failed);
    assert_eq!(status.error.as_deref(), Some(AGENT_FAILURE_ERROR));
    let agent = orchestrator.registry().get(&stale_agent).await.unwrap();
    assert_eq!(agent.state, AgentState::Error);
    assert!(agent.held_tasks.is_empty());

    let errors = channel.events_of(EventType::AgentError).await;
    assert_eq!(errors.len(), 1);
    let payload: AgentErrorPayload = errors[0].parse_payload().unwrap();
    assert_eq!(payload.agent_id, stale_agent);
    assert_eq!(payload.error, HEARTBEAT_TIMEOUT_ERROR);

    let failures = channel.events_of(EventType::TaskFailed).await;
    assert_eq!(failures.len(), 1);
    let payload: TaskFailedPayload = failures[0].parse_payload().unwrap();
    assert_eq!(payload.task_id, task_id);
    assert_eq!(payload.error, AGENT_FAILURE_ERROR);

    // Act: retry with no healthy agent, then add one
    orchestrator.retry(&task_id).await.unwrap();
    orchestrator.tick().await;
    assert_eq!(
        orchestrator.status(&task_id).await.unwrap().status,
        TaskStatus::Pending
    );

    let fresh_agent = orchestrator.start_agent(Capability::Scraper).await.unwrap();
    orchestrator.tick().await;

    // Assert
    let status = orchestrator.status(&task_id).await.unwrap();
    assert_eq!(status.status, TaskStatus::Processing);
    assert_eq!(status.assigned_to, Some(fresh_agent));
}

#[tokio::test]
async fn test_stale_agent_detected_once() {
    // Arrange
    let channel = Arc::new(MockChannel::new());
    let orchestrator = sweeping_orchestrator(channel.clone());
    let agent_id = orchestrator.start_agent(Capability::Learning).await.unwrap();
    go_silent(&orchestrator, &agent_id).await;

    // Act
    let reports = vec![
        orchestrator.tick().await,
        orchestrator.tick().await,
        orchestrator.tick().await,
    ];

    // Assert
    assert!(reports.iter().all(|r| r.forced_failures == 0));
    assert_eq!(channel.events_of(EventType::AgentError).await.len(), 1);
    let metrics = orchestrator.metrics().get_metrics();
    assert_eq!(metrics.agents.errors, 1);
    assert_eq!(metrics.control_loop.health_sweeps, 3);
}

#[tokio::test]
async fn test_failed_agent_gets_no_new_work() {
    // Arrange: one agent, busy with the first of two tasks
    let channel = Arc::new(MockChannel::new());
    let orchestrator = sweeping_orchestrator(channel.clone());
    let agent_id = orchestrator.start_agent(Capability::Knowledge).await.unwrap();
    let first = orchestrator
        .submit("find_connections", json!({"concept": "graphs"}))
        .await
        .unwrap();
    orchestrator.tick().await;
    let second = orchestrator
        .submit("validate_knowledge", json!({"claim": "P != NP"}))
        .await
        .unwrap();
    orchestrator
        .store()
        .run_scheduling_pass(&orchestrator.registry())
        .await;
    // Busy agents are not listed as idle
    assert_eq!(
        orchestrator.status(&second).await.unwrap().status,
        TaskStatus::Pending
    );

    // Act
    go_silent(&orchestrator, &agent_id).await;
    orchestrator.tick().await;

    // Assert
    assert_eq!(
        orchestrator.status(&first).await.unwrap().status,
        TaskStatus::Failed
    );
    assert_eq!(
        orchestrator.status(&second).await.unwrap().status,
        TaskStatus::Pending
    );
    let counts = orchestrator.list_agents().await;
    assert_eq!(counts[&Capability::Knowledge].error, 1);
    assert_eq!(counts[&Capability::Knowledge].idle, 0);
}

#[tokio::test]
async fn test_heartbeat_brings_agent_back() {
    // Arrange
    let channel = Arc::new(MockChannel::new());
    let orchestrator = sweeping_orchestrator(channel.clone());
    let agent_id = orchestrator.start_agent(Capability::Ui).await.unwrap();
    go_silent(&orchestrator, &agent_id).await;
    orchestrator.tick().await;
    let task_id = orchestrator
        .submit("generate_visualization", json!({"kind": "graph"}))
        .await
        .unwrap();
    orchestrator.tick().await;
    assert_eq!(
        orchestrator.status(&task_id).await.unwrap().status,
        TaskStatus::Pending
    );

    // Act: the worker's heartbeat arrives
    let heartbeat = knowledge_coordinator::protocol::EventEnvelope::from_payload(
        EventType::AgentHeartbeat,
        &knowledge_coordinator::protocol::AgentLifecyclePayload {
            agent_id: agent_id.clone(),
            agent_type: Capability::Ui,
            timestamp: Utc::now(),
        },
    )
    .unwrap();
    orchestrator.handle_event(heartbeat).await;
    orchestrator.tick().await;

    // Assert
    let status = orchestrator.status(&task_id).await.unwrap();
    assert_eq!(status.status, TaskStatus::Processing);
    assert_eq!(status.assigned_to, Some(agent_id));
}

#[tokio::test]
async fn test_sweep_is_rate_limited_in_control_loop() {
    // Default test config sweeps at most once per second
    let channel = Arc::new(MockChannel::new());
    let orchestrator = test_helpers::orchestrator(channel.clone());
    let agent_id = orchestrator.start_agent(Capability::Processor).await.unwrap();

    orchestrator.tick().await;
    go_silent(&orchestrator, &agent_id).await;
    orchestrator.tick().await;

    let agent = orchestrator.registry().get(&agent_id).await.unwrap();
    assert_eq!(agent.state, AgentState::Idle);

    // Explicit sweep bypasses the limit
    orchestrator.registry().force_health_sweep_for_test().await;
    let agent = orchestrator.registry().get(&agent_id).await.unwrap();
    assert_eq!(agent.state, AgentState::Error);
}
