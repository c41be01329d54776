//! Topic canonicalization and topic layout for the message channel
//!
//! Work queues live under `/coordinator/queues/{capability}/tasks`, events
//! under `/coordinator/events/{event_type}`.

use super::messages::{Capability, EventType};
use std::str::FromStr;

const QUEUE_ROOT: &str = "/coordinator/queues";
const EVENT_ROOT: &str = "/coordinator/events";

pub fn canonicalize_topic(topic: &str) -> String {
    if topic.is_empty() {
        return "/".to_string();
    }

    // Single leading slash
    let mut result = if topic.starts_with('/') {
        topic.to_string()
    } else {
        format!("/{topic}")
    };

    while result.contains("//") {
        result = result.replace("//", "/");
    }

    // No trailing slash except for root
    if result.len() > 1 && result.ends_with('/') {
        result.pop();
    }

    result
}

/// Topic construction and parsing for queues and events
pub struct TopicBuilder;

impl TopicBuilder {
    /// Work queue topic: `/coordinator/queues/{capability}/tasks`
    pub fn build_queue_topic(capability: Capability) -> String {
        canonicalize_topic(&format!("{QUEUE_ROOT}/{capability}/tasks"))
    }

    /// Shared-subscription filter so each queued message reaches one consumer.
    /// The topic keeps its leading slash, so the filter has an empty first level.
    pub fn build_queue_subscription(capability: Capability) -> String {
        format!(
            "$share/{}/{}",
            Self::build_share_group(capability),
            Self::build_queue_topic(capability)
        )
    }

    pub fn build_share_group(capability: Capability) -> String {
        format!("{capability}-workers")
    }

    /// Event topic: `/coordinator/events/{event_type}`
    pub fn build_event_topic(event_type: EventType) -> String {
        canonicalize_topic(&format!("{EVENT_ROOT}/{event_type}"))
    }

    /// Recover the capability from an incoming queue topic
    pub fn parse_queue_topic(topic: &str) -> Option<Capability> {
        let canonical = canonicalize_topic(topic);
        let rest = canonical.strip_prefix(QUEUE_ROOT)?.strip_prefix('/')?;
        let capability = rest.strip_suffix("/tasks")?;
        Capability::from_str(capability).ok()
    }

    /// Recover the event type from an incoming event topic
    pub fn parse_event_topic(topic: &str) -> Option<EventType> {
        let canonical = canonicalize_topic(topic);
        let rest = canonical.strip_prefix(EVENT_ROOT)?.strip_prefix('/')?;
        EventType::from_str(rest).ok()
    }
}
