//! In-process message channel
//!
//! Work queues are FIFO per capability. A single pump task per queue hands
//! messages to consumers round-robin. A rejected message goes to the back of
//! its queue so the messages behind it still get delivered; when it is the
//! only message left the pump pauses for the redelivery delay first. After
//! [`MAX_DELIVERIES`] rejections a message is dropped. Events are fanned out
//! through [`EventFanout`].

use super::{
    ChannelError, EventFanout, EventHandler, MessageChannel, SubscriptionId, TaskHandler,
};
use crate::protocol::{Capability, EventEnvelope, EventType, TaskEnvelope};
use async_trait::async_trait;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, Notify};
use tokio::task::JoinHandle;
use tracing::{debug, warn, Instrument};

/// Deliveries after which a rejected message is dropped
pub const MAX_DELIVERIES: u32 = 50;

struct QueuedTask {
    envelope: TaskEnvelope,
    deliveries: u32,
}

#[derive(Default)]
struct QueueState {
    messages: VecDeque<QueuedTask>,
    consumers: Vec<(SubscriptionId, Arc<dyn TaskHandler>)>,
    next_consumer: usize,
}

impl QueueState {
    /// Take the head message and the consumer whose turn it is
    fn next_delivery(&mut self) -> Option<(QueuedTask, Arc<dyn TaskHandler>)> {
        if self.consumers.is_empty() {
            return None;
        }
        let message = self.messages.pop_front()?;
        let index = self.next_consumer % self.consumers.len();
        self.next_consumer = (index + 1) % self.consumers.len();
        Some((message, self.consumers[index].1.clone()))
    }
}

struct WorkQueue {
    state: Arc<Mutex<QueueState>>,
    signal: Arc<Notify>,
    pump: JoinHandle<()>,
}

/// Message channel that never leaves the process
pub struct InMemoryChannel {
    connected: Arc<AtomicBool>,
    redelivery_delay: Duration,
    next_subscription: AtomicU64,
    queues: Mutex<HashMap<Capability, WorkQueue>>,
    queue_subscriptions: Mutex<HashMap<SubscriptionId, Capability>>,
    events: EventFanout,
}

impl InMemoryChannel {
    pub fn new(redelivery_delay: Duration) -> Self {
        Self {
            connected: Arc::new(AtomicBool::new(false)),
            redelivery_delay,
            next_subscription: AtomicU64::new(1),
            queues: Mutex::new(HashMap::new()),
            queue_subscriptions: Mutex::new(HashMap::new()),
            events: EventFanout::new(),
        }
    }

    fn next_id(&self) -> SubscriptionId {
        SubscriptionId(self.next_subscription.fetch_add(1, Ordering::Relaxed))
    }

    /// Messages waiting on the queue of `capability` (not yet handed out)
    pub async fn pending_tasks(&self, capability: Capability) -> usize {
        let queues = self.queues.lock().await;
        match queues.get(&capability) {
            Some(queue) => queue.state.lock().await.messages.len(),
            None => 0,
        }
    }

    /// Return the queue for `capability`, creating it and its pump on first use
    fn queue_entry<'a>(
        &self,
        queues: &'a mut HashMap<Capability, WorkQueue>,
        capability: Capability,
    ) -> &'a WorkQueue {
        queues.entry(capability).or_insert_with(|| {
            let state = Arc::new(Mutex::new(QueueState::default()));
            let signal = Arc::new(Notify::new());
            let pump = tokio::spawn(
                run_pump(
                    capability,
                    state.clone(),
                    signal.clone(),
                    self.connected.clone(),
                    self.redelivery_delay,
                )
                .instrument(crate::channel_span!(capability = %capability)),
            );
            WorkQueue {
                state,
                signal,
                pump,
            }
        })
    }

    async fn wake_all_pumps(&self) {
        for queue in self.queues.lock().await.values() {
            queue.signal.notify_one();
        }
    }
}

impl Default for InMemoryChannel {
    fn default() -> Self {
        Self::new(Duration::from_millis(100))
    }
}

async fn run_pump(
    capability: Capability,
    state: Arc<Mutex<QueueState>>,
    signal: Arc<Notify>,
    connected: Arc<AtomicBool>,
    redelivery_delay: Duration,
) {
    loop {
        let next = if connected.load(Ordering::Acquire) {
            state.lock().await.next_delivery()
        } else {
            None
        };

        let Some((mut queued, handler)) = next else {
            signal.notified().await;
            continue;
        };

        queued.deliveries += 1;
        match handler.handle_task(queued.envelope.clone()).await {
            Ok(()) => {
                debug!(
                    capability = %capability,
                    task_id = %queued.envelope.task_id,
                    deliveries = queued.deliveries,
                    "Task message acknowledged"
                );
            }
            Err(e) if queued.deliveries >= MAX_DELIVERIES => {
                warn!(
                    capability = %capability,
                    task_id = %queued.envelope.task_id,
                    agent_id = %queued.envelope.agent_id,
                    deliveries = queued.deliveries,
                    error = %e,
                    "Task message rejected too often, dropping"
                );
            }
            Err(e) => {
                debug!(
                    capability = %capability,
                    task_id = %queued.envelope.task_id,
                    deliveries = queued.deliveries,
                    error = %e,
                    "Task message rejected, requeueing"
                );
                let alone = {
                    let mut state = state.lock().await;
                    state.messages.push_back(queued);
                    state.messages.len() == 1
                };
                if alone {
                    tokio::time::sleep(redelivery_delay).await;
                }
            }
        }
    }
}

#[async_trait]
impl MessageChannel for InMemoryChannel {
    async fn connect(&self) -> Result<(), ChannelError> {
        self.connected.store(true, Ordering::Release);
        self.wake_all_pumps().await;
        debug!("In-memory channel connected");
        Ok(())
    }

    async fn disconnect(&self) -> Result<(), ChannelError> {
        self.connected.store(false, Ordering::Release);
        debug!("In-memory channel disconnected");
        Ok(())
    }

    async fn publish_task(
        &self,
        capability: Capability,
        envelope: &TaskEnvelope,
    ) -> Result<(), ChannelError> {
        if !self.is_connected() {
            return Err(ChannelError::NotConnected);
        }

        let mut queues = self.queues.lock().await;
        let queue = self.queue_entry(&mut queues, capability);
        queue.state.lock().await.messages.push_back(QueuedTask {
            envelope: envelope.clone(),
            deliveries: 0,
        });
        queue.signal.notify_one();
        Ok(())
    }

    async fn publish_event(&self, event: &EventEnvelope) -> Result<(), ChannelError> {
        if !self.is_connected() {
            return Err(ChannelError::NotConnected);
        }
        let delivered = self.events.dispatch(event).await;
        debug!(event_type = %event.event_type, subscribers = delivered, "Event published");
        Ok(())
    }

    async fn subscribe(
        &self,
        capability: Capability,
        handler: Arc<dyn TaskHandler>,
    ) -> Result<SubscriptionId, ChannelError> {
        let id = self.next_id();
        let mut queues = self.queues.lock().await;
        let queue = self.queue_entry(&mut queues, capability);
        queue.state.lock().await.consumers.push((id, handler));
        queue.signal.notify_one();
        self.queue_subscriptions.lock().await.insert(id, capability);
        Ok(id)
    }

    async fn subscribe_events(
        &self,
        event_types: &[EventType],
        handler: Arc<dyn EventHandler>,
    ) -> Result<SubscriptionId, ChannelError> {
        let id = self.next_id();
        self.events.add(id, event_types, handler).await;
        Ok(id)
    }

    async fn unsubscribe(&self, subscription: SubscriptionId) -> Result<(), ChannelError> {
        let capability = self.queue_subscriptions.lock().await.remove(&subscription);
        if let Some(capability) = capability {
            if let Some(queue) = self.queues.lock().await.get(&capability) {
                let mut state = queue.state.lock().await;
                state.consumers.retain(|(id, _)| *id != subscription);
            }
            return Ok(());
        }

        if self.events.remove(subscription).await {
            Ok(())
        } else {
            Err(ChannelError::UnknownSubscription(subscription))
        }
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Acquire)
    }
}

impl Drop for InMemoryChannel {
    fn drop(&mut self) {
        for queue in self.queues.get_mut().values() {
            queue.pump.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::TaskKind;
    use crate::testing::mocks::{wait_until, RecordingEventHandler, RecordingTaskHandler};
    use crate::transport::HandlerError;
    use serde_json::json;
    use std::sync::atomic::AtomicUsize;

    fn envelope(task_id: &str) -> TaskEnvelope {
        TaskEnvelope {
            task_id: task_id.to_string(),
            task_type: TaskKind::ScrapeWeb,
            task_payload: json!({"url": "https://example.com"}),
            agent_id: "scraper-1".to_string(),
        }
    }

    #[tokio::test]
    async fn test_publish_requires_connection() {
        let channel = InMemoryChannel::default();

        let result = channel.publish_task(Capability::Scraper, &envelope("scr-1")).await;
        assert!(matches!(result, Err(ChannelError::NotConnected)));

        let event = EventEnvelope::new(EventType::TaskCompleted, json!({}));
        assert!(matches!(
            channel.publish_event(&event).await,
            Err(ChannelError::NotConnected)
        ));
    }

    #[tokio::test]
    async fn test_messages_wait_for_a_consumer() {
        // Arrange
        let channel = InMemoryChannel::default();
        channel.connect().await.unwrap();

        // Act
        channel
            .publish_task(Capability::Scraper, &envelope("scr-1"))
            .await
            .unwrap();

        // Assert
        assert_eq!(channel.pending_tasks(Capability::Scraper).await, 1);

        let handler = Arc::new(RecordingTaskHandler::new());
        channel
            .subscribe(Capability::Scraper, handler.clone())
            .await
            .unwrap();
        assert!(handler.wait_for(1, Duration::from_secs(1)).await);
        assert_eq!(channel.pending_tasks(Capability::Scraper).await, 0);
    }

    #[tokio::test]
    async fn test_each_message_goes_to_one_consumer() {
        let channel = InMemoryChannel::default();
        channel.connect().await.unwrap();
        let first = Arc::new(RecordingTaskHandler::new());
        let second = Arc::new(RecordingTaskHandler::new());
        channel.subscribe(Capability::Scraper, first.clone()).await.unwrap();
        channel.subscribe(Capability::Scraper, second.clone()).await.unwrap();

        for i in 0..4 {
            channel
                .publish_task(Capability::Scraper, &envelope(&format!("scr-{i}")))
                .await
                .unwrap();
        }

        tokio::time::sleep(Duration::from_millis(100)).await;
        let first_seen = first.received().await.len();
        let second_seen = second.received().await.len();
        assert_eq!(first_seen + second_seen, 4);
        assert_eq!(first_seen, 2, "consumers are served round-robin");
    }

    #[tokio::test]
    async fn test_rejected_message_is_redelivered() {
        // Arrange
        let channel = InMemoryChannel::new(Duration::from_millis(10));
        channel.connect().await.unwrap();
        let handler = Arc::new(RecordingTaskHandler::failing_first(2));
        channel.subscribe(Capability::Ui, handler.clone()).await.unwrap();

        // Act
        channel.publish_task(Capability::Ui, &envelope("ui-1")).await.unwrap();

        // Assert
        assert!(handler.wait_for(1, Duration::from_secs(1)).await);
        assert_eq!(handler.attempts(), 3);
        assert_eq!(handler.received().await[0].task_id, "ui-1");
    }

    #[tokio::test]
    async fn test_queues_are_isolated_per_capability() {
        let channel = InMemoryChannel::default();
        channel.connect().await.unwrap();
        let scraper = Arc::new(RecordingTaskHandler::new());
        channel.subscribe(Capability::Scraper, scraper.clone()).await.unwrap();

        channel
            .publish_task(Capability::Processor, &envelope("prc-1"))
            .await
            .unwrap();

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(scraper.received().await.is_empty());
        assert_eq!(channel.pending_tasks(Capability::Processor).await, 1);
    }

    #[tokio::test]
    async fn test_event_fan_out_and_unsubscribe() {
        let channel = InMemoryChannel::default();
        channel.connect().await.unwrap();
        let a = Arc::new(RecordingEventHandler::new());
        let b = Arc::new(RecordingEventHandler::new());
        let sub_a = channel
            .subscribe_events(&[EventType::AgentHeartbeat], a.clone())
            .await
            .unwrap();
        channel
            .subscribe_events(&[EventType::AgentHeartbeat], b.clone())
            .await
            .unwrap();

        let heartbeat = EventEnvelope::new(EventType::AgentHeartbeat, json!({}));
        channel.publish_event(&heartbeat).await.unwrap();
        assert!(a.wait_for(1, Duration::from_secs(1)).await);
        assert!(b.wait_for(1, Duration::from_secs(1)).await);

        channel.unsubscribe(sub_a).await.unwrap();
        channel.publish_event(&heartbeat).await.unwrap();
        assert!(b.wait_for(2, Duration::from_secs(1)).await);
        assert_eq!(a.events().await.len(), 1);

        assert!(matches!(
            channel.unsubscribe(sub_a).await,
            Err(ChannelError::UnknownSubscription(_))
        ));
    }

    /// Accepts only envelopes addressed to one agent
    struct AgentFilter {
        agent_id: &'static str,
        rejected: AtomicUsize,
        inner: RecordingTaskHandler,
    }

    #[async_trait]
    impl TaskHandler for AgentFilter {
        async fn handle_task(&self, envelope: TaskEnvelope) -> Result<(), HandlerError> {
            if envelope.agent_id != self.agent_id {
                self.rejected.fetch_add(1, Ordering::SeqCst);
                return Err(format!("{} is not hosted here", envelope.agent_id).into());
            }
            self.inner.handle_task(envelope).await
        }
    }

    #[tokio::test]
    async fn test_undeliverable_message_does_not_block_queue() {
        // Arrange: the only consumer hosts agent b
        let channel = InMemoryChannel::new(Duration::from_millis(10));
        channel.connect().await.unwrap();
        let handler = Arc::new(AgentFilter {
            agent_id: "scraper-b",
            rejected: AtomicUsize::new(0),
            inner: RecordingTaskHandler::new(),
        });
        channel.subscribe(Capability::Scraper, handler.clone()).await.unwrap();

        let mut for_a = envelope("scr-a");
        for_a.agent_id = "scraper-a".to_string();
        let mut for_b = envelope("scr-b");
        for_b.agent_id = "scraper-b".to_string();

        // Act
        channel.publish_task(Capability::Scraper, &for_a).await.unwrap();
        channel.publish_task(Capability::Scraper, &for_b).await.unwrap();

        // Assert: b gets through, a is eventually dropped
        assert!(handler.inner.wait_for(1, Duration::from_secs(1)).await);
        assert_eq!(handler.inner.received().await[0].task_id, "scr-b");

        let filter = &handler;
        let gave_up = wait_until(Duration::from_secs(5), move || async move {
            filter.rejected.load(Ordering::SeqCst) >= MAX_DELIVERIES as usize
        })
        .await;
        assert!(gave_up);
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(handler.rejected.load(Ordering::SeqCst), MAX_DELIVERIES as usize);
        assert_eq!(channel.pending_tasks(Capability::Scraper).await, 0);
    }
}
