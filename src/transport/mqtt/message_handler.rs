//! Pure message routing and parsing for MQTT events
//!
//! Incoming packets are turned into [`EventRoute`] decisions and publish
//! payloads into typed envelopes. The client module performs the I/O.

use crate::protocol::{Capability, EventEnvelope, EventType, TaskEnvelope, TopicBuilder};
use rumqttc::v5::mqttbytes::v5::{Packet, Publish, SubscribeReasonCode};
use rumqttc::v5::Event;
use tracing::debug;

/// Pure message routing decisions based on MQTT events
pub struct MessageHandler;

impl MessageHandler {
    /// Route an MQTT event to the appropriate handling branch
    pub fn route_mqtt_event(event: &Event) -> EventRoute {
        match event {
            Event::Incoming(incoming) => match incoming {
                Packet::ConnAck(_) => EventRoute::ConnectionAcknowledged,
                Packet::Publish(publish) => EventRoute::MessageReceived(publish.clone()),
                Packet::Disconnect(_) => EventRoute::Disconnected,
                Packet::SubAck(suback) => EventRoute::SubscriptionConfirmed {
                    packet_id: suback.pkid,
                    failed: suback
                        .return_codes
                        .iter()
                        .any(|code| !matches!(code, SubscribeReasonCode::Success(_))),
                },
                other => EventRoute::InfrastructureEvent(format!("{other:?}")),
            },
            Event::Outgoing(_) => EventRoute::OutgoingEvent,
        }
    }

    /// Decide what an incoming publish is for, based on its topic
    pub fn classify_topic(topic: &str, retain: bool) -> MessageKind {
        if retain {
            debug!("Ignoring retained message on topic: {}", topic);
            return MessageKind::Ignored;
        }
        if let Some(capability) = TopicBuilder::parse_queue_topic(topic) {
            return MessageKind::Task(capability);
        }
        if let Some(event_type) = TopicBuilder::parse_event_topic(topic) {
            return MessageKind::Event(event_type);
        }
        debug!("Ignoring message on unrecognised topic: {}", topic);
        MessageKind::Ignored
    }

    pub fn parse_task_envelope(payload: &[u8]) -> Result<TaskEnvelope, String> {
        serde_json::from_slice::<TaskEnvelope>(payload)
            .map_err(|e| format!("Failed to parse TaskEnvelope: {e}"))
    }

    /// Parse an event envelope and check it matches the topic it arrived on
    pub fn parse_event_envelope(
        payload: &[u8],
        topic_event: EventType,
    ) -> Result<EventEnvelope, String> {
        let envelope = serde_json::from_slice::<EventEnvelope>(payload)
            .map_err(|e| format!("Failed to parse EventEnvelope: {e}"))?;
        if envelope.event_type != topic_event {
            return Err(format!(
                "Event type {} does not match topic event {}",
                envelope.event_type, topic_event
            ));
        }
        Ok(envelope)
    }

    /// Topic filters to (re)subscribe for the given queues and event types
    pub fn build_subscription_topics(
        capabilities: &[Capability],
        event_types: &[EventType],
    ) -> Vec<String> {
        capabilities
            .iter()
            .map(|c| TopicBuilder::build_queue_subscription(*c))
            .chain(event_types.iter().map(|e| TopicBuilder::build_event_topic(*e)))
            .collect()
    }
}

/// Routing decisions for MQTT events
#[derive(Debug, Clone)]
pub enum EventRoute {
    /// Connection acknowledged - ready to publish/subscribe
    ConnectionAcknowledged,
    /// Publish received on a subscribed topic
    MessageReceived(Publish),
    /// Broker disconnected us
    Disconnected,
    /// SubAck received
    SubscriptionConfirmed { packet_id: u16, failed: bool },
    /// Infrastructure event (PingResp, PubAck, ...)
    InfrastructureEvent(String),
    /// Outgoing event (handled by rumqttc)
    OutgoingEvent,
}

/// What an incoming publish carries
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageKind {
    Task(Capability),
    Event(EventType),
    Ignored,
}
