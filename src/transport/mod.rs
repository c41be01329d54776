//! Message channel abstraction for coordinator/worker communication
//!
//! A [`MessageChannel`] offers two delivery styles:
//!
//! - per-capability work queues, where each message reaches exactly one
//!   consumer and is redelivered if that consumer's handler returns an error
//! - a broadcast event bus, where every subscriber of an event type sees
//!   every event of that type
//!
//! Two implementations exist: [`memory::InMemoryChannel`] for single-process
//! deployments and tests, and [`mqtt::MqttChannel`] for a real broker.

use crate::protocol::{Capability, EventEnvelope, EventType, TaskEnvelope};
use async_trait::async_trait;
use serde::Serialize;
use std::fmt;
use std::sync::Arc;
use thiserror::Error;
use tracing::warn;

pub mod fanout;
pub mod memory;
pub mod mqtt;

pub use fanout::EventFanout;
pub use memory::InMemoryChannel;
pub use mqtt::{MqttChannel, MqttError};

/// Error returned by a handler; on the work-queue path it triggers redelivery
pub type HandlerError = Box<dyn std::error::Error + Send + Sync>;

/// Message channel errors
#[derive(Debug, Error)]
pub enum ChannelError {
    #[error("Channel is not connected")]
    NotConnected,
    #[error("Connection failed: {0}")]
    ConnectionFailed(String),
    #[error("Publishing failed")]
    PublishFailed(#[source] HandlerError),
    #[error("Subscription failed: {0}")]
    SubscriptionFailed(String),
    #[error("Unknown subscription: {0}")]
    UnknownSubscription(SubscriptionId),
    #[error("Serialization error")]
    Serialization(#[from] serde_json::Error),
    #[error("MQTT error: {0}")]
    Mqtt(#[from] MqttError),
}

/// Handle returned by subscribe calls, used to unsubscribe
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SubscriptionId(pub u64);

impl fmt::Display for SubscriptionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "sub-{}", self.0)
    }
}

/// Consumer of a capability work queue
///
/// Returning `Ok` acknowledges the message. Returning `Err` rejects it and the
/// channel requeues it for another delivery.
#[async_trait]
pub trait TaskHandler: Send + Sync {
    async fn handle_task(&self, envelope: TaskEnvelope) -> Result<(), HandlerError>;
}

/// Subscriber on the event bus
#[async_trait]
pub trait EventHandler: Send + Sync {
    async fn handle_event(&self, event: EventEnvelope);
}

/// Transport used by the coordinator and workers
///
/// All methods take `&self` so one channel can be shared behind an `Arc`
/// between the registry, the orchestrator and worker pools.
#[async_trait]
pub trait MessageChannel: Send + Sync {
    /// Connect to the broker (or open the in-process bus)
    async fn connect(&self) -> Result<(), ChannelError>;

    /// Disconnect and stop delivering messages
    async fn disconnect(&self) -> Result<(), ChannelError>;

    /// Enqueue a task on the work queue of `capability`
    async fn publish_task(
        &self,
        capability: Capability,
        envelope: &TaskEnvelope,
    ) -> Result<(), ChannelError>;

    /// Broadcast an event to every subscriber of its type
    async fn publish_event(&self, event: &EventEnvelope) -> Result<(), ChannelError>;

    /// Become a consumer of the work queue of `capability`
    async fn subscribe(
        &self,
        capability: Capability,
        handler: Arc<dyn TaskHandler>,
    ) -> Result<SubscriptionId, ChannelError>;

    /// Receive every event whose type is in `event_types`
    async fn subscribe_events(
        &self,
        event_types: &[EventType],
        handler: Arc<dyn EventHandler>,
    ) -> Result<SubscriptionId, ChannelError>;

    /// Remove a queue consumer or event subscriber
    async fn unsubscribe(&self, subscription: SubscriptionId) -> Result<(), ChannelError>;

    fn is_connected(&self) -> bool;
}

/// Publish an event without letting a failure reach the caller
///
/// Event emission is best-effort: failures are logged and reported through
/// the return value only.
pub async fn emit_event<T: Serialize>(
    channel: &dyn MessageChannel,
    event_type: EventType,
    payload: &T,
) -> bool {
    let envelope = match EventEnvelope::from_payload(event_type, payload) {
        Ok(envelope) => envelope,
        Err(e) => {
            warn!(event_type = %event_type, error = %e, "Failed to serialize event payload");
            return false;
        }
    };

    match channel.publish_event(&envelope).await {
        Ok(()) => true,
        Err(e) => {
            warn!(event_type = %event_type, error = %e, "Failed to publish event");
            false
        }
    }
}
