//! Impure I/O for the MQTT channel
//!
//! Owns the rumqttc client, runs the event-loop supervisor (reconnects with
//! backoff, re-subscribes after every ConnAck) and dispatches incoming
//! publishes to queue consumers and event subscribers with manual acks.
//!
//! The client's request queue is bounded and only drains while the event loop
//! is polled, so the supervisor never awaits it. Subscribes, acks and requeues
//! it needs go through an unbounded [`Request`] queue served by a separate
//! request pump task.

use super::connection::{configure_mqtt_options, ConnectionState, MqttError, ReconnectConfig};
use super::health_monitor::{ConnectionEvent, HealthMetrics, HealthMonitor, ReconnectionDecision};
use super::message_handler::{EventRoute, MessageHandler, MessageKind};
use crate::config::MqttSection;
use crate::protocol::{Capability, EventEnvelope, EventType, TaskEnvelope, TopicBuilder};
use crate::timing;
use crate::transport::{
    ChannelError, EventFanout, EventHandler, MessageChannel, SubscriptionId, TaskHandler,
};
use async_trait::async_trait;
use rumqttc::v5::mqttbytes::v5::{Publish, PublishProperties};
use rumqttc::v5::{mqttbytes::QoS, AsyncClient, EventLoop};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, watch, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn, Instrument};

/// Broker work issued on behalf of the supervisor
#[derive(Debug)]
enum Request {
    Subscribe(String),
    Ack(Publish),
    /// Republish to the capability queue; MQTT has no broker-side negative ack
    Requeue {
        capability: Capability,
        envelope: TaskEnvelope,
    },
}

fn send_request(requests: &mpsc::UnboundedSender<Request>, request: Request) {
    if let Err(e) = requests.send(request) {
        warn!(request = ?e.0, "Request pump stopped, dropping broker request");
    }
}

#[derive(Default)]
struct QueueConsumers {
    handlers: Vec<(SubscriptionId, Arc<dyn TaskHandler>)>,
    next: usize,
}

/// Local subscription table, shared with the supervisor task
#[derive(Default)]
struct Routes {
    queues: Mutex<HashMap<Capability, QueueConsumers>>,
    queue_subscriptions: Mutex<HashMap<SubscriptionId, Capability>>,
    events: EventFanout,
    topics: Mutex<Vec<String>>,
}

impl Routes {
    async fn next_consumer(&self, capability: Capability) -> Option<Arc<dyn TaskHandler>> {
        let mut queues = self.queues.lock().await;
        let consumers = queues.get_mut(&capability)?;
        if consumers.handlers.is_empty() {
            return None;
        }
        let index = consumers.next % consumers.handlers.len();
        consumers.next = (index + 1) % consumers.handlers.len();
        Some(consumers.handlers[index].1.clone())
    }

    /// Track a topic filter; returns true when it was not tracked before
    async fn track_topic(&self, topic: &str) -> bool {
        let mut topics = self.topics.lock().await;
        if topics.iter().any(|t| t == topic) {
            return false;
        }
        topics.push(topic.to_string());
        true
    }

    async fn untrack_topic(&self, topic: &str) {
        self.topics.lock().await.retain(|t| t != topic);
    }
}

#[derive(Default)]
struct ConnectionStats {
    connect_time: Option<Instant>,
    last_message_time: Option<Instant>,
    reconnect_count: u32,
}

/// Message channel over an MQTT v5 broker
pub struct MqttChannel {
    config: MqttSection,
    reconnect_config: ReconnectConfig,
    redelivery_delay: Duration,
    client: Arc<Mutex<AsyncClient>>,
    event_loop: Mutex<Option<EventLoop>>,
    event_loop_handle: Mutex<Option<JoinHandle<()>>>,
    request_pump_handle: Mutex<Option<JoinHandle<()>>>,
    state_tx: watch::Sender<ConnectionState>,
    state_rx: watch::Receiver<ConnectionState>,
    shutdown_tx: watch::Sender<bool>,
    routes: Arc<Routes>,
    stats: Arc<Mutex<ConnectionStats>>,
    next_subscription: AtomicU64,
}

impl MqttChannel {
    pub fn new(config: MqttSection, redelivery_delay: Duration) -> Result<Self, MqttError> {
        let (client, event_loop) = Self::create_connection(&config)?;
        let ((state_tx, state_rx), (shutdown_tx, _)) = Self::setup_connection_channels();

        Ok(Self {
            reconnect_config: ReconnectConfig::from_mqtt_section(&config),
            config,
            redelivery_delay,
            client: Arc::new(Mutex::new(client)),
            event_loop: Mutex::new(Some(event_loop)),
            event_loop_handle: Mutex::new(None),
            request_pump_handle: Mutex::new(None),
            state_tx,
            state_rx,
            shutdown_tx,
            routes: Arc::new(Routes::default()),
            stats: Arc::new(Mutex::new(ConnectionStats::default())),
            next_subscription: AtomicU64::new(1),
        })
    }

    fn create_connection(config: &MqttSection) -> Result<(AsyncClient, EventLoop), MqttError> {
        let mqtt_options = configure_mqtt_options(config)?;
        Ok(AsyncClient::new(mqtt_options, 10))
    }

    #[allow(clippy::type_complexity)]
    fn setup_connection_channels() -> (
        (
            watch::Sender<ConnectionState>,
            watch::Receiver<ConnectionState>,
        ),
        (watch::Sender<bool>, watch::Receiver<bool>),
    ) {
        let state_channels = watch::channel(ConnectionState::Connecting);
        let shutdown_channels = watch::channel(false);
        (state_channels, shutdown_channels)
    }

    /// Wait for ConnAck with a timeout
    async fn wait_for_connection_confirmation(
        mut state_rx: watch::Receiver<ConnectionState>,
        timeout: Duration,
    ) -> Result<(), MqttError> {
        let timeout_result = tokio::time::timeout(timeout, async {
            loop {
                if state_rx.changed().await.is_err() {
                    return Err(MqttError::ConnectionFailedStr(
                        "State channel closed".to_string(),
                    ));
                }
                match *state_rx.borrow() {
                    ConnectionState::Connected => return Ok(()),
                    ConnectionState::PermanentlyDisconnected(ref reason) => {
                        return Err(MqttError::ConnectionFailedStr(format!(
                            "Permanently disconnected: {reason}"
                        )));
                    }
                    ConnectionState::Disconnected(ref reason) => {
                        return Err(MqttError::ConnectionFailedStr(reason.clone()));
                    }
                    ConnectionState::Connecting | ConnectionState::Reconnecting(_) => continue,
                }
            }
        })
        .await;

        match timeout_result {
            Ok(result) => result,
            Err(_) => Err(MqttError::ConnectionFailedStr(
                "ConnAck timeout - no connection confirmation received".to_string(),
            )),
        }
    }

    /// Perform interruptible sleep with shutdown monitoring.
    /// Returns true if the sleep completed, false if shutdown was requested.
    async fn interruptible_sleep(mut shutdown_rx: watch::Receiver<bool>, delay_ms: u64) -> bool {
        tokio::select! {
            _ = shutdown_rx.changed() => !*shutdown_rx.borrow(),
            _ = tokio::time::sleep(Duration::from_millis(delay_ms)) => true,
        }
    }

    pub fn connection_state(&self) -> ConnectionState {
        self.state_rx.borrow().clone()
    }

    pub async fn health_metrics(&self) -> HealthMetrics {
        let stats = self.stats.lock().await;
        HealthMonitor::calculate_health_metrics(
            &self.connection_state(),
            stats.connect_time,
            stats.last_message_time,
            stats.reconnect_count,
        )
    }

    fn check_connection_state(&self) -> Result<(), MqttError> {
        let state = self.connection_state();
        if !HealthMonitor::can_publish(&state) {
            return Err(MqttError::NotConnected { state });
        }
        Ok(())
    }

    fn next_id(&self) -> SubscriptionId {
        SubscriptionId(self.next_subscription.fetch_add(1, Ordering::Relaxed))
    }

    async fn publish_json(&self, topic: &str, payload: Vec<u8>) -> Result<(), ChannelError> {
        self.check_connection_state()?;
        let client = self.client.lock().await.clone();
        client
            .publish_with_properties(
                topic,
                QoS::AtLeastOnce,
                false,
                payload,
                PublishProperties::default(),
            )
            .await
            .map_err(|e| MqttError::PublishFailed(Box::new(e)))?;
        Ok(())
    }

    /// Subscribe on the broker now if connected; otherwise the filter is
    /// picked up by the re-subscription after the next ConnAck
    async fn subscribe_topic(&self, topic: &str) -> Result<(), ChannelError> {
        if !self.routes.track_topic(topic).await {
            return Ok(());
        }
        if !self.is_connected() {
            debug!(topic = %topic, "Subscription deferred until connected");
            return Ok(());
        }

        let client = self.client.lock().await.clone();
        client
            .subscribe(topic, QoS::AtLeastOnce)
            .await
            .map_err(|e| MqttError::SubscriptionFailed(Box::new(e)))?;
        info!(topic = %topic, "Subscribed");
        Ok(())
    }

    fn supervisor(&self, requests: mpsc::UnboundedSender<Request>) -> Supervisor {
        Supervisor {
            config: self.config.clone(),
            reconnect_config: self.reconnect_config.clone(),
            redelivery_delay: self.redelivery_delay,
            client: self.client.clone(),
            requests,
            state_tx: self.state_tx.clone(),
            shutdown_rx: self.shutdown_tx.subscribe(),
            routes: self.routes.clone(),
            stats: self.stats.clone(),
            reconnect_attempts: 0,
        }
    }

    async fn unsubscribe_topic(&self, topic: &str) {
        self.routes.untrack_topic(topic).await;
        if !self.is_connected() {
            return;
        }
        let client = self.client.lock().await.clone();
        if let Err(e) = client.unsubscribe(topic).await {
            warn!(topic = %topic, error = %e, "Failed to unsubscribe");
        }
    }
}

/// Event-loop supervisor: polls the broker connection and reconnects on failure
struct Supervisor {
    config: MqttSection,
    reconnect_config: ReconnectConfig,
    redelivery_delay: Duration,
    /// Replaced on reconnect; never awaited from the supervisor
    client: Arc<Mutex<AsyncClient>>,
    requests: mpsc::UnboundedSender<Request>,
    state_tx: watch::Sender<ConnectionState>,
    shutdown_rx: watch::Receiver<bool>,
    routes: Arc<Routes>,
    stats: Arc<Mutex<ConnectionStats>>,
    reconnect_attempts: u32,
}

impl Supervisor {
    async fn run(mut self, mut event_loop: EventLoop) {
        info!(client_id = %self.config.client_id, "Starting MQTT event loop supervisor");

        loop {
            tokio::select! {
                changed = self.shutdown_rx.changed() => {
                    if changed.is_err() || *self.shutdown_rx.borrow() {
                        info!("Shutdown signal received, stopping MQTT supervisor");
                        break;
                    }
                }
                result = event_loop.poll() => {
                    let keep_running = match result {
                        Ok(event) => {
                            let route = MessageHandler::route_mqtt_event(&event);
                            self.process_event_route(route, &mut event_loop).await
                        }
                        Err(e) => {
                            let state = HealthMonitor::determine_next_state(
                                ConnectionEvent::NetworkError(e.to_string()),
                            );
                            let _ = self.state_tx.send(state);
                            self.reconnect(&mut event_loop).await
                        }
                    };
                    if !keep_running {
                        break;
                    }
                }
            }
        }

        info!(client_id = %self.config.client_id, "MQTT event loop stopped");
    }

    /// Returns false when the supervisor should stop
    async fn process_event_route(&mut self, route: EventRoute, event_loop: &mut EventLoop) -> bool {
        match route {
            EventRoute::ConnectionAcknowledged => {
                let _ = self
                    .state_tx
                    .send(HealthMonitor::determine_next_state(ConnectionEvent::ConnAckReceived));
                self.reconnect_attempts = 0;
                self.stats.lock().await.connect_time = Some(Instant::now());
                self.resubscribe().await;
                true
            }
            EventRoute::MessageReceived(publish) => {
                self.stats.lock().await.last_message_time = Some(Instant::now());
                self.handle_publish(publish).await;
                true
            }
            EventRoute::Disconnected => {
                let _ = self.state_tx.send(HealthMonitor::determine_next_state(
                    ConnectionEvent::DisconnectedByBroker,
                ));
                self.reconnect(event_loop).await
            }
            EventRoute::SubscriptionConfirmed { packet_id, failed } => {
                if failed {
                    warn!(target: "mqtt_transport", packet_id, "Broker rejected subscription");
                } else {
                    debug!(target: "mqtt_transport", packet_id, "Subscription confirmed");
                }
                true
            }
            EventRoute::InfrastructureEvent(event) => {
                debug!(target: "mqtt_transport", "MQTT event: {}", event);
                true
            }
            EventRoute::OutgoingEvent => true,
        }
    }

    async fn handle_publish(&self, publish: Publish) {
        let topic = String::from_utf8_lossy(&publish.topic).to_string();

        match MessageHandler::classify_topic(&topic, publish.retain) {
            MessageKind::Task(capability) => {
                let envelope = match MessageHandler::parse_task_envelope(&publish.payload) {
                    Ok(envelope) => envelope,
                    Err(e) => {
                        error!(topic = %topic, error = %e, "Dropping malformed task message");
                        send_request(&self.requests, Request::Ack(publish));
                        return;
                    }
                };

                match self.routes.next_consumer(capability).await {
                    Some(handler) => {
                        tokio::spawn(deliver_task(
                            self.requests.clone(),
                            handler,
                            capability,
                            envelope,
                            publish,
                            self.redelivery_delay,
                        ));
                    }
                    None => {
                        warn!(capability = %capability, "No local consumer, requeueing task");
                        send_request(&self.requests, Request::Requeue { capability, envelope });
                        send_request(&self.requests, Request::Ack(publish));
                    }
                }
            }
            MessageKind::Event(event_type) => {
                match MessageHandler::parse_event_envelope(&publish.payload, event_type) {
                    Ok(event) => {
                        self.routes.events.dispatch(&event).await;
                    }
                    Err(e) => {
                        warn!(topic = %topic, error = %e, "Dropping malformed event message");
                    }
                }
                send_request(&self.requests, Request::Ack(publish));
            }
            MessageKind::Ignored => send_request(&self.requests, Request::Ack(publish)),
        }
    }

    async fn resubscribe(&self) {
        let topics = self.routes.topics.lock().await.clone();
        debug!(target: "mqtt_transport", topics = topics.len(), "Queueing re-subscriptions");
        for topic in topics {
            send_request(&self.requests, Request::Subscribe(topic));
        }
    }

    /// Returns false when the supervisor should stop
    async fn reconnect(&mut self, event_loop: &mut EventLoop) -> bool {
        let decision = HealthMonitor::should_attempt_reconnection(
            self.reconnect_attempts,
            &self.reconnect_config,
            *self.shutdown_rx.borrow(),
            timing::jitter_ms(self.reconnect_config.jitter_ms),
        );

        match decision {
            ReconnectionDecision::Proceed { attempt, delay_ms } => {
                self.reconnect_attempts = attempt;
                self.stats.lock().await.reconnect_count += 1;
                let _ = self.state_tx.send(HealthMonitor::determine_next_state(
                    ConnectionEvent::ReconnectionStarted(attempt),
                ));
                info!("Attempting reconnection {} after {}ms delay", attempt, delay_ms);

                if !MqttChannel::interruptible_sleep(self.shutdown_rx.clone(), delay_ms).await {
                    return false;
                }

                match MqttChannel::create_connection(&self.config) {
                    Ok((new_client, new_event_loop)) => {
                        *event_loop = new_event_loop;
                        *self.client.lock().await = new_client;
                    }
                    Err(e) => error!("Failed to create new connection: {}", e),
                }
                true
            }
            ReconnectionDecision::AbortShutdownRequested => false,
            ReconnectionDecision::AbortMaxAttemptsExceeded => {
                let reason = format!(
                    "Max reconnection attempts ({}) exceeded",
                    self.reconnect_attempts
                );
                let _ = self.state_tx.send(HealthMonitor::determine_next_state(
                    ConnectionEvent::PermanentFailure(reason),
                ));
                false
            }
        }
    }
}

/// Serve supervisor requests until shutdown or until every sender is gone
///
/// Each request awaits the client's bounded queue, which the supervisor keeps
/// draining. The client lock is only held long enough to clone the handle.
async fn run_request_pump(
    client: Arc<Mutex<AsyncClient>>,
    mut requests: mpsc::UnboundedReceiver<Request>,
    mut shutdown_rx: watch::Receiver<bool>,
) {
    loop {
        let request = tokio::select! {
            changed = shutdown_rx.changed() => {
                if changed.is_err() || *shutdown_rx.borrow() {
                    break;
                }
                continue;
            }
            request = requests.recv() => match request {
                Some(request) => request,
                None => break,
            },
        };

        let client = client.lock().await.clone();
        if let Err(e) = forward_request(&client, request).await {
            warn!(error = %e, "Broker request failed");
        }
    }
    debug!(target: "mqtt_transport", "Request pump stopped");
}

async fn forward_request(client: &AsyncClient, request: Request) -> Result<(), MqttError> {
    match request {
        Request::Subscribe(topic) => {
            client
                .subscribe(topic.as_str(), QoS::AtLeastOnce)
                .await
                .map_err(|e| MqttError::SubscriptionFailed(Box::new(e)))?;
            debug!(target: "mqtt_transport", "Re-subscribed to: {}", topic);
        }
        Request::Ack(publish) => {
            client
                .ack(&publish)
                .await
                .map_err(|e| MqttError::AckFailed(Box::new(e)))?;
        }
        Request::Requeue {
            capability,
            envelope,
        } => {
            let payload =
                serde_json::to_vec(&envelope).map_err(|e| MqttError::PublishFailed(Box::new(e)))?;
            client
                .publish_with_properties(
                    TopicBuilder::build_queue_topic(capability),
                    QoS::AtLeastOnce,
                    false,
                    payload,
                    PublishProperties::default(),
                )
                .await
                .map_err(|e| MqttError::PublishFailed(Box::new(e)))?;
            debug!(task_id = %envelope.task_id, capability = %capability, "Requeued task");
        }
    }
    Ok(())
}

/// Hand one task message to a consumer, then ack or requeue-and-ack
async fn deliver_task(
    requests: mpsc::UnboundedSender<Request>,
    handler: Arc<dyn TaskHandler>,
    capability: Capability,
    envelope: TaskEnvelope,
    publish: Publish,
    redelivery_delay: Duration,
) {
    match handler.handle_task(envelope.clone()).await {
        Ok(()) => send_request(&requests, Request::Ack(publish)),
        Err(e) => {
            warn!(
                capability = %capability,
                task_id = %envelope.task_id,
                error = %e,
                "Task message rejected, requeueing"
            );
            tokio::time::sleep(redelivery_delay).await;
            send_request(&requests, Request::Requeue { capability, envelope });
            send_request(&requests, Request::Ack(publish));
        }
    }
}

#[async_trait]
impl MessageChannel for MqttChannel {
    async fn connect(&self) -> Result<(), ChannelError> {
        let event_loop = self.event_loop.lock().await.take().ok_or_else(|| {
            MqttError::ConnectionFailedStr("Event loop already started".to_string())
        })?;

        let (requests_tx, requests_rx) = mpsc::unbounded_channel();
        let span = crate::channel_span!(client_id = %self.config.client_id);
        let pump = tokio::spawn(
            run_request_pump(self.client.clone(), requests_rx, self.shutdown_tx.subscribe())
                .instrument(span.clone()),
        );
        *self.request_pump_handle.lock().await = Some(pump);

        let supervisor = self.supervisor(requests_tx);
        let handle = tokio::spawn(supervisor.run(event_loop).instrument(span));
        *self.event_loop_handle.lock().await = Some(handle);

        let timeout = HealthMonitor::calculate_connection_timeout(&self.reconnect_config);
        Self::wait_for_connection_confirmation(self.state_rx.clone(), timeout).await?;
        Ok(())
    }

    async fn disconnect(&self) -> Result<(), ChannelError> {
        // Queue DISCONNECT while the supervisor is still polling
        if self.is_connected() {
            let client = self.client.lock().await.clone();
            let sent = tokio::time::timeout(Duration::from_secs(1), client.disconnect()).await;
            match sent {
                Ok(Ok(())) => {}
                Ok(Err(e)) => {
                    let e = MqttError::ConnectionFailed(Box::new(e));
                    warn!(error = %e, "Failed to send MQTT disconnect");
                }
                Err(_) => warn!("Timed out queueing MQTT disconnect"),
            }
        }
        let _ = self.shutdown_tx.send(true);
        let _ = self
            .state_tx
            .send(ConnectionState::Disconnected("Client disconnected".to_string()));

        if let Some(handle) = self.event_loop_handle.lock().await.take() {
            match tokio::time::timeout(Duration::from_secs(2), handle).await {
                Ok(Ok(())) => info!("Event loop task shut down gracefully"),
                Ok(Err(e)) if !e.is_cancelled() => warn!("Event loop task ended with error: {}", e),
                Err(_) => warn!("Event loop task didn't shut down gracefully, abandoning it"),
                _ => {}
            }
        }

        info!("MQTT channel disconnected");
        Ok(())
    }

    async fn publish_task(
        &self,
        capability: Capability,
        envelope: &TaskEnvelope,
    ) -> Result<(), ChannelError> {
        let topic = TopicBuilder::build_queue_topic(capability);
        self.publish_json(&topic, serde_json::to_vec(envelope)?).await?;
        debug!(topic = %topic, task_id = %envelope.task_id, "Published task");
        Ok(())
    }

    async fn publish_event(&self, event: &EventEnvelope) -> Result<(), ChannelError> {
        let topic = TopicBuilder::build_event_topic(event.event_type);
        self.publish_json(&topic, serde_json::to_vec(event)?).await
    }

    async fn subscribe(
        &self,
        capability: Capability,
        handler: Arc<dyn TaskHandler>,
    ) -> Result<SubscriptionId, ChannelError> {
        let id = self.next_id();
        self.routes
            .queues
            .lock()
            .await
            .entry(capability)
            .or_default()
            .handlers
            .push((id, handler));
        self.routes
            .queue_subscriptions
            .lock()
            .await
            .insert(id, capability);

        self.subscribe_topic(&TopicBuilder::build_queue_subscription(capability))
            .await?;
        Ok(id)
    }

    async fn subscribe_events(
        &self,
        event_types: &[EventType],
        handler: Arc<dyn EventHandler>,
    ) -> Result<SubscriptionId, ChannelError> {
        let id = self.next_id();
        self.routes.events.add(id, event_types, handler).await;
        for event_type in event_types {
            self.subscribe_topic(&TopicBuilder::build_event_topic(*event_type))
                .await?;
        }
        Ok(id)
    }

    async fn unsubscribe(&self, subscription: SubscriptionId) -> Result<(), ChannelError> {
        let capability = self
            .routes
            .queue_subscriptions
            .lock()
            .await
            .remove(&subscription);

        if let Some(capability) = capability {
            let now_empty = {
                let mut queues = self.routes.queues.lock().await;
                match queues.get_mut(&capability) {
                    Some(consumers) => {
                        consumers.handlers.retain(|(id, _)| *id != subscription);
                        consumers.handlers.is_empty()
                    }
                    None => true,
                }
            };
            if now_empty {
                self.unsubscribe_topic(&TopicBuilder::build_queue_subscription(capability))
                    .await;
            }
            return Ok(());
        }

        if !self.routes.events.remove(subscription).await {
            return Err(ChannelError::UnknownSubscription(subscription));
        }
        let still_wanted = self.routes.events.subscribed_types().await;
        for event_type in EventType::ALL {
            if !still_wanted.contains(&event_type) {
                let topic = TopicBuilder::build_event_topic(event_type);
                let tracked = self.routes.topics.lock().await.contains(&topic);
                if tracked {
                    self.unsubscribe_topic(&topic).await;
                }
            }
        }
        Ok(())
    }

    fn is_connected(&self) -> bool {
        HealthMonitor::can_publish(&self.state_rx.borrow())
    }
}

impl Drop for MqttChannel {
    fn drop(&mut self) {
        let _ = self.shutdown_tx.send(true);
        if let Some(handle) = self.event_loop_handle.get_mut().take() {
            handle.abort();
        }
        if let Some(handle) = self.request_pump_handle.get_mut().take() {
            handle.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::TaskKind;
    use crate::testing::mocks::{RecordingEventHandler, RecordingTaskHandler};
    use bytes::Bytes;
    use serde_json::json;

    fn test_config() -> MqttSection {
        MqttSection {
            broker_url: "mqtt://localhost:1883".to_string(),
            client_id: "coordinator-test".to_string(),
            username_env: None,
            password_env: None,
            session_expiry_secs: 60,
            reconnect_jitter_ms: 0,
        }
    }

    #[test]
    fn test_setup_connection_channels() {
        let ((state_tx, state_rx), (shutdown_tx, shutdown_rx)) =
            MqttChannel::setup_connection_channels();

        assert_eq!(*state_rx.borrow(), ConnectionState::Connecting);
        assert!(!(*shutdown_rx.borrow()));

        state_tx.send(ConnectionState::Connected).unwrap();
        assert_eq!(*state_rx.borrow(), ConnectionState::Connected);
        shutdown_tx.send(true).unwrap();
        assert!(*shutdown_rx.borrow());
    }

    #[tokio::test]
    async fn test_wait_for_connection_confirmation_success() {
        // Arrange
        let ((state_tx, state_rx), _) = MqttChannel::setup_connection_channels();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(10)).await;
            let _ = state_tx.send(ConnectionState::Connected);
        });

        // Act
        let result =
            MqttChannel::wait_for_connection_confirmation(state_rx, Duration::from_millis(200))
                .await;

        // Assert
        assert!(result.is_ok());
    }

    #[tokio::test]
    async fn test_wait_for_connection_confirmation_timeout() {
        let ((state_tx, state_rx), _) = MqttChannel::setup_connection_channels();

        let result =
            MqttChannel::wait_for_connection_confirmation(state_rx, Duration::from_millis(10))
                .await;
        drop(state_tx);

        let err_msg = result.unwrap_err().to_string();
        assert!(err_msg.contains("ConnAck"), "unexpected error: {err_msg}");
    }

    #[tokio::test]
    async fn test_wait_for_connection_confirmation_disconnected() {
        let ((state_tx, state_rx), _) = MqttChannel::setup_connection_channels();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(10)).await;
            let _ = state_tx.send(ConnectionState::Disconnected("Test disconnect".to_string()));
        });

        let result =
            MqttChannel::wait_for_connection_confirmation(state_rx, Duration::from_millis(200))
                .await;

        assert!(result.unwrap_err().to_string().contains("Test disconnect"));
    }

    #[tokio::test]
    async fn test_interruptible_sleep() {
        let (_, (shutdown_tx, shutdown_rx)) = MqttChannel::setup_connection_channels();
        assert!(MqttChannel::interruptible_sleep(shutdown_rx.clone(), 5).await);

        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(5)).await;
            let _ = shutdown_tx.send(true);
        });
        assert!(!MqttChannel::interruptible_sleep(shutdown_rx, 1000).await);
    }

    #[tokio::test]
    async fn test_publish_fails_without_connection() {
        // Arrange
        let channel = MqttChannel::new(test_config(), Duration::from_millis(10)).unwrap();
        let envelope = TaskEnvelope {
            task_id: "scr-1".to_string(),
            task_type: TaskKind::ScrapeWeb,
            task_payload: json!({"url": "https://example.com"}),
            agent_id: "scraper-1".to_string(),
        };

        // Act
        let task_result = channel.publish_task(Capability::Scraper, &envelope).await;
        let event_result = channel
            .publish_event(&EventEnvelope::new(EventType::TaskAssigned, json!({})))
            .await;

        // Assert
        assert!(matches!(
            task_result,
            Err(ChannelError::Mqtt(MqttError::NotConnected { .. }))
        ));
        assert!(event_result.is_err());
        assert!(!channel.is_connected());
    }

    #[tokio::test]
    async fn test_subscriptions_are_tracked_before_connect() {
        let channel = MqttChannel::new(test_config(), Duration::from_millis(10)).unwrap();
        let task_handler = Arc::new(RecordingTaskHandler::new());
        let event_handler = Arc::new(RecordingEventHandler::new());

        let queue_sub = channel
            .subscribe(Capability::Scraper, task_handler)
            .await
            .unwrap();
        let event_sub = channel
            .subscribe_events(&[EventType::TaskCompleted, EventType::TaskFailed], event_handler)
            .await
            .unwrap();

        let topics = channel.routes.topics.lock().await.clone();
        assert_eq!(topics.len(), 3);
        assert!(topics.contains(&"$share/scraper-workers//coordinator/queues/scraper/tasks".to_string()));

        channel.unsubscribe(queue_sub).await.unwrap();
        channel.unsubscribe(event_sub).await.unwrap();
        assert!(channel.routes.topics.lock().await.is_empty());
    }

    #[tokio::test]
    async fn test_health_metrics_before_connect() {
        let channel = MqttChannel::new(test_config(), Duration::from_millis(10)).unwrap();

        let metrics = channel.health_metrics().await;

        assert!(!metrics.is_healthy);
        assert_eq!(metrics.uptime_secs, None);
        assert_eq!(metrics.reconnect_count, 0);
    }

    fn incoming(topic: &str, payload: Vec<u8>) -> Publish {
        Publish {
            dup: false,
            qos: QoS::AtLeastOnce,
            retain: false,
            topic: Bytes::from(topic.to_string()),
            pkid: 42,
            payload: Bytes::from(payload),
            properties: None,
        }
    }

    fn scraper_task(task_id: &str) -> Vec<u8> {
        serde_json::to_vec(&TaskEnvelope {
            task_id: task_id.to_string(),
            task_type: TaskKind::ScrapeWeb,
            task_payload: json!({"url": "https://example.com"}),
            agent_id: "scraper-1".to_string(),
        })
        .unwrap()
    }

    async fn next_request(rx: &mut mpsc::UnboundedReceiver<Request>) -> Request {
        tokio::time::timeout(Duration::from_secs(1), rx.recv())
            .await
            .expect("request expected")
            .expect("request queue closed")
    }

    /// Channel with every queue and every event topic tracked, never connected
    async fn fully_subscribed_channel() -> MqttChannel {
        let channel = MqttChannel::new(test_config(), Duration::from_millis(10)).unwrap();
        for capability in Capability::ALL {
            channel
                .subscribe(capability, Arc::new(RecordingTaskHandler::new()))
                .await
                .unwrap();
        }
        channel
            .subscribe_events(&EventType::ALL, Arc::new(RecordingEventHandler::new()))
            .await
            .unwrap();
        channel
    }

    #[tokio::test]
    async fn test_resubscribe_does_not_wait_on_client_queue() {
        // Arrange: more topics than the client queue holds, event loop never polled
        let channel = fully_subscribed_channel().await;
        let topic_count = channel.routes.topics.lock().await.len();
        assert!(topic_count > 10);

        let (requests_tx, requests_rx) = mpsc::unbounded_channel();
        let supervisor = channel.supervisor(requests_tx);
        let pump = tokio::spawn(run_request_pump(
            channel.client.clone(),
            requests_rx,
            channel.shutdown_tx.subscribe(),
        ));

        // Act
        let resubscribed =
            tokio::time::timeout(Duration::from_secs(2), supervisor.resubscribe()).await;

        // Assert: supervisor returned and publishers can still take the client
        assert!(resubscribed.is_ok());
        let client = tokio::time::timeout(Duration::from_secs(1), channel.client.lock()).await;
        assert!(client.is_ok());

        pump.abort();
    }

    #[tokio::test]
    async fn test_conn_ack_queues_every_tracked_subscription() {
        // Arrange
        let channel = fully_subscribed_channel().await;
        let expected = channel.routes.topics.lock().await.clone();
        let mut event_loop = channel.event_loop.lock().await.take().unwrap();
        let (requests_tx, mut requests_rx) = mpsc::unbounded_channel();
        let mut supervisor = channel.supervisor(requests_tx);

        // Act
        let keep_running = supervisor
            .process_event_route(EventRoute::ConnectionAcknowledged, &mut event_loop)
            .await;

        // Assert
        assert!(keep_running);
        assert!(channel.is_connected());
        let mut topics = Vec::new();
        while let Ok(request) = requests_rx.try_recv() {
            match request {
                Request::Subscribe(topic) => topics.push(topic),
                other => panic!("unexpected request {other:?}"),
            }
        }
        assert_eq!(topics, expected);
    }

    #[tokio::test]
    async fn test_accepted_task_is_acked() {
        // Arrange
        let channel = MqttChannel::new(test_config(), Duration::from_millis(10)).unwrap();
        let handler = Arc::new(RecordingTaskHandler::new());
        channel.subscribe(Capability::Scraper, handler.clone()).await.unwrap();
        let (requests_tx, mut requests_rx) = mpsc::unbounded_channel();
        let supervisor = channel.supervisor(requests_tx);

        // Act
        supervisor
            .handle_publish(incoming("/coordinator/queues/scraper/tasks", scraper_task("scr-1")))
            .await;

        // Assert
        match next_request(&mut requests_rx).await {
            Request::Ack(publish) => assert_eq!(publish.pkid, 42),
            other => panic!("expected ack, got {other:?}"),
        }
        assert_eq!(handler.received().await[0].task_id, "scr-1");
    }

    #[tokio::test]
    async fn test_rejected_task_is_requeued_before_ack() {
        // Arrange
        let channel = MqttChannel::new(test_config(), Duration::from_millis(10)).unwrap();
        let handler = Arc::new(RecordingTaskHandler::failing_first(1));
        channel.subscribe(Capability::Scraper, handler.clone()).await.unwrap();
        let (requests_tx, mut requests_rx) = mpsc::unbounded_channel();
        let supervisor = channel.supervisor(requests_tx);

        // Act
        supervisor
            .handle_publish(incoming("/coordinator/queues/scraper/tasks", scraper_task("scr-2")))
            .await;

        // Assert
        match next_request(&mut requests_rx).await {
            Request::Requeue {
                capability,
                envelope,
            } => {
                assert_eq!(capability, Capability::Scraper);
                assert_eq!(envelope.task_id, "scr-2");
            }
            other => panic!("expected requeue, got {other:?}"),
        }
        assert!(matches!(next_request(&mut requests_rx).await, Request::Ack(_)));
        assert_eq!(handler.attempts(), 1);
        assert!(handler.received().await.is_empty());
    }

    #[tokio::test]
    async fn test_task_without_local_consumer_is_requeued() {
        let channel = MqttChannel::new(test_config(), Duration::from_millis(10)).unwrap();
        let (requests_tx, mut requests_rx) = mpsc::unbounded_channel();
        let supervisor = channel.supervisor(requests_tx);

        supervisor
            .handle_publish(incoming("/coordinator/queues/scraper/tasks", scraper_task("scr-3")))
            .await;

        assert!(matches!(
            next_request(&mut requests_rx).await,
            Request::Requeue { .. }
        ));
        assert!(matches!(next_request(&mut requests_rx).await, Request::Ack(_)));
    }

    #[tokio::test]
    async fn test_malformed_task_is_acked_and_dropped() {
        // Arrange
        let channel = MqttChannel::new(test_config(), Duration::from_millis(10)).unwrap();
        let handler = Arc::new(RecordingTaskHandler::new());
        channel.subscribe(Capability::Scraper, handler.clone()).await.unwrap();
        let (requests_tx, mut requests_rx) = mpsc::unbounded_channel();
        let supervisor = channel.supervisor(requests_tx);

        // Act
        supervisor
            .handle_publish(incoming("/coordinator/queues/scraper/tasks", b"not json".to_vec()))
            .await;

        // Assert
        assert!(matches!(next_request(&mut requests_rx).await, Request::Ack(_)));
        assert!(requests_rx.try_recv().is_err());
        assert_eq!(handler.attempts(), 0);
    }

    #[tokio::test]
    async fn test_event_is_dispatched_and_acked() {
        // Arrange
        let channel = MqttChannel::new(test_config(), Duration::from_millis(10)).unwrap();
        let handler = Arc::new(RecordingEventHandler::new());
        channel
            .subscribe_events(&[EventType::TaskCompleted], handler.clone())
            .await
            .unwrap();
        let (requests_tx, mut requests_rx) = mpsc::unbounded_channel();
        let supervisor = channel.supervisor(requests_tx);
        let event = EventEnvelope::new(EventType::TaskCompleted, json!({"task_id": "scr-4"}));

        // Act
        supervisor
            .handle_publish(incoming(
                "/coordinator/events/task.completed",
                serde_json::to_vec(&event).unwrap(),
            ))
            .await;

        // Assert
        assert!(matches!(next_request(&mut requests_rx).await, Request::Ack(_)));
        assert!(handler.wait_for(1, Duration::from_secs(1)).await);
        assert_eq!(handler.events().await[0].payload["task_id"], "scr-4");
    }
}
