//! Event fan-out shared by the channel implementations
//!
//! Each subscriber owns an unbounded queue drained by its own dispatcher
//! task, so a slow subscriber delays only itself and sees events in
//! publication order.

use super::{EventHandler, SubscriptionId};
use crate::protocol::{EventEnvelope, EventType};
use std::collections::HashSet;
use std::sync::Arc;
use tokio::sync::{mpsc, Mutex};
use tracing::debug;

struct Subscriber {
    id: SubscriptionId,
    event_types: HashSet<EventType>,
    tx: mpsc::UnboundedSender<EventEnvelope>,
}

#[derive(Default)]
pub struct EventFanout {
    subscribers: Mutex<Vec<Subscriber>>,
}

impl EventFanout {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a subscriber and spawn its dispatcher
    pub async fn add(
        &self,
        id: SubscriptionId,
        event_types: &[EventType],
        handler: Arc<dyn EventHandler>,
    ) {
        let (tx, mut rx) = mpsc::unbounded_channel::<EventEnvelope>();

        tokio::spawn(async move {
            while let Some(event) = rx.recv().await {
                handler.handle_event(event).await;
            }
            debug!(subscription = %id, "Event dispatcher stopped");
        });

        self.subscribers.lock().await.push(Subscriber {
            id,
            event_types: event_types.iter().copied().collect(),
            tx,
        });
    }

    /// Remove a subscriber; events already queued for it are still delivered
    pub async fn remove(&self, id: SubscriptionId) -> bool {
        let mut subscribers = self.subscribers.lock().await;
        let before = subscribers.len();
        subscribers.retain(|s| s.id != id);
        subscribers.len() != before
    }

    /// Queue `event` for every interested subscriber, returning how many
    pub async fn dispatch(&self, event: &EventEnvelope) -> usize {
        let subscribers = self.subscribers.lock().await;
        subscribers
            .iter()
            .filter(|s| s.event_types.contains(&event.event_type))
            .filter(|s| s.tx.send(event.clone()).is_ok())
            .count()
    }

    /// Union of the event types any subscriber listens to
    pub async fn subscribed_types(&self) -> HashSet<EventType> {
        self.subscribers
            .lock()
            .await
            .iter()
            .flat_map(|s| s.event_types.iter().copied())
            .collect()
    }

    pub async fn len(&self) -> usize {
        self.subscribers.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }
}
