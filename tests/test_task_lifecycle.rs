//! Task lifecycle tests
//!
//! Drive the orchestrator through the caller API and worker reports:
//! - a task for an available capability runs to completion
//! - a task with no agent of its capability waits indefinitely
//! - a second task for a busy single agent waits for the first
//! - worker failures are terminal until retried


use knowledge_coordinator::agent::AgentState;
use knowledge_coordinator::error::CoordinatorError;
use knowledge_coordinator::protocol::{Capability, EventType};
use knowledge_coordinator::task::TaskStatus;
use knowledge_coordinator::testing::mocks::MockChannel;
use serde_json::json;
use std::sync::Arc;

#[tokio::test]
async fn test_task_runs_to_completion_on_idle_agent() {
    // Arrange
    let channel = Arc::new(MockChannel::new());
    let orchestrator = test_helpers::orchestrator(channel.clone());
    let agent_id = orchestrator
        .start_agent(Capability::Knowledge)
        .await
        .unwrap();
    let task_id = orchestrator
        .submit("build_graph", json!({"concepts": ["rust", "ownership"]}))
        .await
        .unwrap();

    // Act: one scheduling tick
    let report = orchestrator.tick().await;

    // Assert: assigned and handed to the knowledge work queue
    assert_eq!(report.scheduling.assigned.len(), 1);
    let status = orchestrator.status(&task_id).await.unwrap();
    assert_eq!(status.status, TaskStatus::Processing);
    assert_eq!(status.assigned_to.as_deref(), Some(agent_id.as_str()));

    let published = channel.published_tasks().await;
    assert_eq!(published.len(), 1);
    assert_eq!(published[0].0, Capability::Knowledge);
    assert_eq!(published[0].1.task_id, task_id);
    assert_eq!(published[0].1.agent_id, agent_id);
    assert_eq!(channel.events_of(EventType::TaskAssigned).await.len(), 1);

    let agent = orchestrator.registry().get(&agent_id).await.unwrap();
    assert_eq!(agent.state, AgentState::Busy);

    // Act: the worker reports back
    orchestrator
        .handle_event(test_helpers::completed_event(
            &task_id,
            &agent_id,
            json!({"nodes": 2}),
        ))
        .await;

    // Assert
    let status = orchestrator.status(&task_id).await.unwrap();
    assert_eq!(status.status, TaskStatus::Completed);
    assert_eq!(status.result, Some(json!({"nodes": 2})));
    assert!(status.error.is_none());
    let messages: Vec<&str> = status.history.iter().map(|h| h.message.as_str()).collect();
    assert_eq!(
        messages,
        vec![
            "Task created".to_string(),
            format!("Task assigned to agent {agent_id}"),
            "Task completed successfully".to_string(),
        ]
    );

    let agent = orchestrator.registry().get(&agent_id).await.unwrap();
    assert_eq!(agent.state, AgentState::Idle);
    assert!(agent.held_tasks.is_empty());
}

#[tokio::test]
async fn test_task_without_capable_agent_stays_pending() {
    // Arrange: only scraper agents exist
    let channel = Arc::new(MockChannel::new());
    let orchestrator = test_helpers::orchestrator(channel.clone());
    orchestrator.start_agent(Capability::Scraper).await.unwrap();
    let task_id = orchestrator
        .submit("generate_quiz", json!({"topic": "graphs"}))
        .await
        .unwrap();

    // Act
    for _ in 0..20 {
        let report = orchestrator.tick().await;
        assert!(report.scheduling.assigned.is_empty());
        assert_eq!(report.scheduling.pending_left[&Capability::Learning], 1);
    }

    // Assert
    let status = orchestrator.status(&task_id).await.unwrap();
    assert_eq!(status.status, TaskStatus::Pending);
    assert!(status.error.is_none());
    assert_eq!(status.history.len(), 1);
    assert!(channel.published_tasks().await.is_empty());
    assert!(orchestrator.system_status().await.oldest_pending_secs.is_some());
}

#[tokio::test]
async fn test_second_task_waits_for_single_agent() {
    // Arrange
    let channel = Arc::new(MockChannel::new());
    let orchestrator = test_helpers::orchestrator(channel.clone());
    let agent_id = orchestrator.start_agent(Capability::Processor).await.unwrap();
    let first = orchestrator
        .submit("process_text", json!({"text": "first"}))
        .await
        .unwrap();
    let second = orchestrator
        .submit("process_text", json!({"text": "second"}))
        .await
        .unwrap();

    // Act
    orchestrator.tick().await;
    orchestrator.tick().await;

    // Assert: FIFO, the agent takes only the first
    assert_eq!(
        orchestrator.status(&first).await.unwrap().status,
        TaskStatus::Processing
    );
    assert_eq!(
        orchestrator.status(&second).await.unwrap().status,
        TaskStatus::Pending
    );

    // Act: first completes, agent becomes idle again
    orchestrator
        .handle_event(test_helpers::completed_event(&first, &agent_id, json!({})))
        .await;
    orchestrator.tick().await;

    // Assert
    let status = orchestrator.status(&second).await.unwrap();
    assert_eq!(status.status, TaskStatus::Processing);
    assert_eq!(status.assigned_to.as_deref(), Some(agent_id.as_str()));
    let published: Vec<String> = channel
        .published_tasks()
        .await
        .into_iter()
        .map(|(_, envelope)| envelope.task_id)
        .collect();
    assert_eq!(published, vec![first, second]);
}

#[tokio::test]
async fn test_worker_failure_is_terminal_until_retry() {
    // Arrange
    let channel = Arc::new(MockChannel::new());
    let orchestrator = test_helpers::orchestrator(channel.clone());
    let agent_id = orchestrator.start_agent(Capability::Scraper).await.unwrap();
    let task_id = orchestrator
        .submit("scrape_pdf", json!({"file_path": "/tmp/paper.pdf"}))
        .await
        .unwrap();
    orchestrator.tick().await;

    // Act
    orchestrator
        .handle_event(test_helpers::failed_event(
            &task_id,
            &agent_id,
            "PDF is encrypted",
        ))
        .await;
    for _ in 0..3 {
        orchestrator.tick().await;
    }

    // Assert: stored verbatim, never rescheduled on its own
    let status = orchestrator.status(&task_id).await.unwrap();
    assert_eq!(status.status, TaskStatus::Failed);
    assert_eq!(status.error.as_deref(), Some("PDF is encrypted"));
    assert!(status.result.is_none());
    assert_eq!(channel.published_tasks().await.len(), 1);

    // Act
    orchestrator.retry(&task_id).await.unwrap();

    // Assert
    let status = orchestrator.status(&task_id).await.unwrap();
    assert_eq!(status.status, TaskStatus::Pending);
    assert!(status.error.is_none());
    assert!(status.assigned_to.is_none());
    assert_eq!(status.history.last().unwrap().message, "Task retried");

    orchestrator.tick().await;
    assert_eq!(
        orchestrator.status(&task_id).await.unwrap().status,
        TaskStatus::Processing
    );
}

#[tokio::test]
async fn test_submission_validation() {
    let orchestrator = test_helpers::orchestrator(Arc::new(MockChannel::new()));

    let unknown = orchestrator.submit("summon_daemon", json!({})).await;
    let missing_url = orchestrator.submit("scrape_web", json!({"depth": 2})).await;
    let not_an_object = orchestrator.submit("process_text", json!("text")).await;

    assert!(matches!(unknown, Err(CoordinatorError::Validation { .. })));
    assert!(matches!(missing_url, Err(CoordinatorError::Validation { .. })));
    assert!(matches!(not_an_object, Err(CoordinatorError::Validation { .. })));

    let status = orchestrator.system_status().await;
    assert_eq!(status.tasks.total(), 0);
    assert_eq!(orchestrator.metrics().get_metrics().tasks.rejected, 3);
}

#[tokio::test]
async fn test_status_and_retry_of_unknown_task() {
    let orchestrator = test_helpers::orchestrator(Arc::new(MockChannel::new()));

    assert!(matches!(
        orchestrator.status("scr-missing").await,
        Err(CoordinatorError::TaskNotFound { .. })
    ));
    assert!(matches!(
        orchestrator.retry("scr-missing").await,
        Err(CoordinatorError::TaskNotFound { .. })
    ));
}

#[tokio::test]
async fn test_report_from_wrong_agent_is_ignored() {
    // Arrange
    let channel = Arc::new(MockChannel::new());
    let orchestrator = test_helpers::orchestrator(channel.clone());
    let owner = orchestrator.start_agent(Capability::Ui).await.unwrap();
    let other = orchestrator.start_agent(Capability::Ui).await.unwrap();
    let task_id = orchestrator
        .submit("compose_dashboard", json!({"widgets": 3}))
        .await
        .unwrap();
    orchestrator.tick().await;
    let assigned = orchestrator.status(&task_id).await.unwrap().assigned_to.unwrap();
    let intruder = if assigned == owner { &other } else { &owner };

    // Act
    orchestrator
        .handle_event(test_helpers::completed_event(&task_id, intruder, json!({})))
        .await;

    // Assert
    let status = orchestrator.status(&task_id).await.unwrap();
    assert_eq!(status.status, TaskStatus::Processing);
    assert_eq!(orchestrator.registry().task_owner(&task_id).await, Some(assigned));
    assert_eq!(orchestrator.metrics().get_metrics().tasks.stale_reports, 1);
}
