//! Mock implementations for testing
//!
//! [`MockChannel`] records everything published through it and can be told to
//! fail the work-queue path and the event path independently. The recording
//! handlers capture what a channel delivers to them.

use crate::protocol::{Capability, EventEnvelope, EventType, TaskEnvelope};
use crate::transport::{
    ChannelError, EventHandler, HandlerError, MessageChannel, SubscriptionId, TaskHandler,
};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;

pub type PublishedTask = (Capability, TaskEnvelope);

enum MockSubscription {
    Tasks(Capability, Arc<dyn TaskHandler>),
    Events(Vec<EventType>, Arc<dyn EventHandler>),
}

/// Mock message channel for testing
#[derive(Default)]
pub struct MockChannel {
    published_tasks: Mutex<Vec<PublishedTask>>,
    published_events: Mutex<Vec<EventEnvelope>>,
    subscriptions: Mutex<HashMap<SubscriptionId, MockSubscription>>,
    next_subscription: AtomicU64,
    connected: AtomicBool,
    fail_tasks: AtomicBool,
    fail_events: AtomicBool,
    fail_connect: AtomicBool,
    fail_subscribe: AtomicBool,
}

impl MockChannel {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make `publish_task` fail until switched off again
    pub fn set_fail_tasks(&self, fail: bool) {
        self.fail_tasks.store(fail, Ordering::SeqCst);
    }

    /// Make `publish_event` fail until switched off again
    pub fn set_fail_events(&self, fail: bool) {
        self.fail_events.store(fail, Ordering::SeqCst);
    }

    pub fn set_fail_connect(&self, fail: bool) {
        self.fail_connect.store(fail, Ordering::SeqCst);
    }

    /// Make `subscribe_events` fail until switched off again
    pub fn set_fail_subscribe(&self, fail: bool) {
        self.fail_subscribe.store(fail, Ordering::SeqCst);
    }

    pub async fn published_tasks(&self) -> Vec<PublishedTask> {
        self.published_tasks.lock().await.clone()
    }

    pub async fn published_events(&self) -> Vec<EventEnvelope> {
        self.published_events.lock().await.clone()
    }

    /// Published events of one type
    pub async fn events_of(&self, event_type: EventType) -> Vec<EventEnvelope> {
        self.published_events
            .lock()
            .await
            .iter()
            .filter(|e| e.event_type == event_type)
            .cloned()
            .collect()
    }

    pub async fn clear(&self) {
        self.published_tasks.lock().await.clear();
        self.published_events.lock().await.clear();
    }

    /// Event types with at least one subscriber
    pub async fn subscribed_event_types(&self) -> Vec<EventType> {
        let subscriptions = self.subscriptions.lock().await;
        let mut types: Vec<EventType> = subscriptions
            .values()
            .filter_map(|s| match s {
                MockSubscription::Events(types, _) => Some(types.clone()),
                MockSubscription::Tasks(..) => None,
            })
            .flatten()
            .collect();
        types.sort_by_key(|t| t.as_str());
        types.dedup();
        types
    }

    pub async fn subscription_count(&self) -> usize {
        self.subscriptions.lock().await.len()
    }

    /// Hand an event straight to every matching subscriber, as a broker would
    pub async fn deliver_event(&self, event: &EventEnvelope) -> usize {
        let handlers: Vec<Arc<dyn EventHandler>> = {
            let subscriptions = self.subscriptions.lock().await;
            subscriptions
                .values()
                .filter_map(|s| match s {
                    MockSubscription::Events(types, handler)
                        if types.contains(&event.event_type) =>
                    {
                        Some(handler.clone())
                    }
                    _ => None,
                })
                .collect()
        };

        for handler in &handlers {
            handler.handle_event(event.clone()).await;
        }
        handlers.len()
    }

    /// Hand a task to the first consumer of `capability`
    pub async fn deliver_task(
        &self,
        capability: Capability,
        envelope: TaskEnvelope,
    ) -> Result<(), HandlerError> {
        let handler = {
            let subscriptions = self.subscriptions.lock().await;
            let mut consumers: Vec<(&SubscriptionId, &MockSubscription)> = subscriptions
                .iter()
                .filter(|(_, s)| matches!(s, MockSubscription::Tasks(c, _) if *c == capability))
                .collect();
            consumers.sort_by_key(|(id, _)| **id);
            consumers.first().and_then(|(_, s)| match s {
                MockSubscription::Tasks(_, handler) => Some(handler.clone()),
                MockSubscription::Events(..) => None,
            })
        };

        match handler {
            Some(handler) => handler.handle_task(envelope).await,
            None => Err(format!("No consumer for {capability}").into()),
        }
    }

    fn next_id(&self) -> SubscriptionId {
        SubscriptionId(self.next_subscription.fetch_add(1, Ordering::SeqCst) + 1)
    }
}

#[async_trait]
impl MessageChannel for MockChannel {
    async fn connect(&self) -> Result<(), ChannelError> {
        if self.fail_connect.load(Ordering::SeqCst) {
            return Err(ChannelError::ConnectionFailed(
                "Mock connection failure".to_string(),
            ));
        }
        self.connected.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn disconnect(&self) -> Result<(), ChannelError> {
        self.connected.store(false, Ordering::SeqCst);
        Ok(())
    }

    async fn publish_task(
        &self,
        capability: Capability,
        envelope: &TaskEnvelope,
    ) -> Result<(), ChannelError> {
        if self.fail_tasks.load(Ordering::SeqCst) {
            return Err(ChannelError::PublishFailed(
                "Mock work-queue failure".into(),
            ));
        }
        self.published_tasks
            .lock()
            .await
            .push((capability, envelope.clone()));
        Ok(())
    }

    async fn publish_event(&self, event: &EventEnvelope) -> Result<(), ChannelError> {
        if self.fail_events.load(Ordering::SeqCst) {
            return Err(ChannelError::PublishFailed("Mock event failure".into()));
        }
        self.published_events.lock().await.push(event.clone());
        Ok(())
    }

    async fn subscribe(
        &self,
        capability: Capability,
        handler: Arc<dyn TaskHandler>,
    ) -> Result<SubscriptionId, ChannelError> {
        let id = self.next_id();
        self.subscriptions
            .lock()
            .await
            .insert(id, MockSubscription::Tasks(capability, handler));
        Ok(id)
    }

    async fn subscribe_events(
        &self,
        event_types: &[EventType],
        handler: Arc<dyn EventHandler>,
    ) -> Result<SubscriptionId, ChannelError> {
        if self.fail_subscribe.load(Ordering::SeqCst) {
            return Err(ChannelError::SubscriptionFailed(
                "Mock subscription failure".to_string(),
            ));
        }
        let id = self.next_id();
        self.subscriptions
            .lock()
            .await
            .insert(id, MockSubscription::Events(event_types.to_vec(), handler));
        Ok(id)
    }

    async fn unsubscribe(&self, subscription: SubscriptionId) -> Result<(), ChannelError> {
        self.subscriptions
            .lock()
            .await
            .remove(&subscription)
            .map(|_| ())
            .ok_or(ChannelError::UnknownSubscription(subscription))
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }
}

/// Task handler that records every envelope it accepts
///
/// `failing_first(n)` rejects the first `n` deliveries to exercise redelivery.
#[derive(Default)]
pub struct RecordingTaskHandler {
    received: Mutex<Vec<TaskEnvelope>>,
    attempts: AtomicUsize,
    failures_left: AtomicUsize,
}

impl RecordingTaskHandler {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn failing_first(failures: usize) -> Self {
        Self {
            failures_left: AtomicUsize::new(failures),
            ..Self::default()
        }
    }

    pub async fn received(&self) -> Vec<TaskEnvelope> {
        self.received.lock().await.clone()
    }

    /// Deliveries seen, accepted or not
    pub fn attempts(&self) -> usize {
        self.attempts.load(Ordering::SeqCst)
    }

    /// Wait until at least `count` envelopes were accepted
    pub async fn wait_for(&self, count: usize, timeout: Duration) -> bool {
        wait_until(timeout, move || async move { self.received.lock().await.len() >= count }).await
    }
}

#[async_trait]
impl TaskHandler for RecordingTaskHandler {
    async fn handle_task(&self, envelope: TaskEnvelope) -> Result<(), HandlerError> {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        let rejected = self
            .failures_left
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |left| left.checked_sub(1))
            .is_ok();
        if rejected {
            return Err(format!("Rejected delivery of {}", envelope.task_id).into());
        }
        self.received.lock().await.push(envelope);
        Ok(())
    }
}

/// Event handler that records every event it receives
#[derive(Default)]
pub struct RecordingEventHandler {
    events: Mutex<Vec<EventEnvelope>>,
}

impl RecordingEventHandler {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn events(&self) -> Vec<EventEnvelope> {
        self.events.lock().await.clone()
    }

    pub async fn wait_for(&self, count: usize, timeout: Duration) -> bool {
        wait_until(timeout, move || async move { self.events.lock().await.len() >= count }).await
    }
}

#[async_trait]
impl EventHandler for RecordingEventHandler {
    async fn handle_event(&self, event: EventEnvelope) {
        self.events.lock().await.push(event);
    }
}

/// Poll `condition` every few milliseconds until it holds or `timeout` passes
pub async fn wait_until<F, Fut>(timeout: Duration, mut condition: F) -> bool
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = bool>,
{
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if condition().await {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}
