//! Impure I/O operations for MQTT client
//!
//! This module owns the rumqttc client and event loop: the reconnection
//! supervisor task, bounded publishing, and inbound queue subscriptions.

use super::connection::{
    configure_mqtt_options, ConnectionState, MqttError, PublishPolicy, ReconnectConfig,
};
use super::health_monitor::{ConnectionEvent, HealthMetrics, HealthMonitor, ReconnectionDecision};
use super::message_handler::{EventRoute, MessageForwarder, MessageHandler};
use crate::config::MqttSection;
use crate::mqtt_span;
use crate::observability::metrics;
use crate::protocol::{routing_key_to_mqtt_topic, Command};
use crate::transport::{InboundMessage, Transport};
use async_trait::async_trait;
use rumqttc::v5::{mqttbytes::QoS, AsyncClient, EventLoop};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, watch, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn, Instrument};

/// Request channel capacity of the rumqttc client
const REQUEST_CHANNEL_CAPACITY: usize = 64;

/// MQTT transport client for the device network
pub struct MqttClient {
    service_id: String,
    client: Arc<Mutex<AsyncClient>>,
    event_loop: Option<Arc<Mutex<EventLoop>>>,
    config: MqttSection,
    publish_policy: PublishPolicy,
    event_loop_handle: Option<JoinHandle<()>>,
    state_rx: Option<watch::Receiver<ConnectionState>>,
    state_tx: Option<watch::Sender<ConnectionState>>,
    shutdown_tx: Option<watch::Sender<bool>>,
    reconnect_config: ReconnectConfig,
    subscribed_topics: Arc<Mutex<Vec<String>>>,
    message_forwarder: Arc<Mutex<MessageForwarder>>,
    connect_time: Option<Instant>,
    last_message_time: Arc<std::sync::Mutex<Option<Instant>>>,
    reconnect_count: Arc<AtomicU32>,
}

/// Shared handles owned by the reconnection supervisor task
struct Supervisor {
    service_id: String,
    config: MqttSection,
    reconnect_config: ReconnectConfig,
    client: Arc<Mutex<AsyncClient>>,
    state_tx: watch::Sender<ConnectionState>,
    shutdown_rx: watch::Receiver<bool>,
    subscribed_topics: Arc<Mutex<Vec<String>>>,
    message_forwarder: Arc<Mutex<MessageForwarder>>,
    last_message_time: Arc<std::sync::Mutex<Option<Instant>>>,
    reconnect_count: Arc<AtomicU32>,
    reconnect_attempts: u32,
}

impl MqttClient {
    pub async fn new(service_id: &str, config: MqttSection) -> Result<Self, MqttError> {
        let (client, event_loop) = Self::create_connection(service_id, &config)?;

        Ok(MqttClient {
            service_id: service_id.to_string(),
            client: Arc::new(Mutex::new(client)),
            event_loop: Some(Arc::new(Mutex::new(event_loop))),
            publish_policy: PublishPolicy::from_config(&config),
            config,
            event_loop_handle: None,
            state_rx: None,
            state_tx: None,
            shutdown_tx: None,
            reconnect_config: ReconnectConfig::default(),
            subscribed_topics: Arc::new(Mutex::new(Vec::new())),
            message_forwarder: Arc::new(Mutex::new(MessageForwarder::new())),
            connect_time: None,
            last_message_time: Arc::new(std::sync::Mutex::new(None)),
            reconnect_count: Arc::new(AtomicU32::new(0)),
        })
    }

    /// Override the reconnection policy; must be called before `connect`
    pub fn with_reconnect_config(mut self, reconnect_config: ReconnectConfig) -> Self {
        self.reconnect_config = reconnect_config;
        self
    }

    pub fn publish_policy(&self) -> PublishPolicy {
        self.publish_policy
    }

    /// Create a new client and event loop for the first connection or a
    /// reconnection attempt
    fn create_connection(
        service_id: &str,
        config: &MqttSection,
    ) -> Result<(AsyncClient, EventLoop), MqttError> {
        let mqtt_options = configure_mqtt_options(service_id, config)?;
        Ok(AsyncClient::new(mqtt_options, REQUEST_CHANNEL_CAPACITY))
    }

    /// Create connection state and shutdown channels
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

    /// Wait for connection confirmation (ConnAck) with timeout
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
                    ConnectionState::Disconnected(ref reason) => {
                        return Err(MqttError::ConnectionFailedStr(reason.clone()));
                    }
                    ConnectionState::PermanentlyDisconnected(ref reason) => {
                        return Err(MqttError::ConnectionFailedStr(format!(
                            "Permanently disconnected: {reason}"
                        )));
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

    /// Connect to the broker and start the reconnection supervisor.
    ///
    /// Returns only after the broker acknowledged the connection.
    pub async fn connect(&mut self) -> Result<(), MqttError> {
        HealthMonitor::validate_connection_config(&self.reconnect_config)
            .map_err(MqttError::ConnectionFailedStr)?;

        let event_loop = self
            .event_loop
            .take()
            .and_then(|shared| Arc::try_unwrap(shared).ok())
            .map(Mutex::into_inner)
            .ok_or_else(|| {
                MqttError::ConnectionFailedStr("Event loop already started".to_string())
            })?;

        let ((state_tx, state_rx), (shutdown_tx, shutdown_rx)) = Self::setup_connection_channels();
        self.state_rx = Some(state_rx.clone());
        self.state_tx = Some(state_tx.clone());
        self.shutdown_tx = Some(shutdown_tx);

        metrics().mqtt_connection_attempt();

        let supervisor = Supervisor {
            service_id: self.service_id.clone(),
            config: self.config.clone(),
            reconnect_config: self.reconnect_config.clone(),
            client: self.client.clone(),
            state_tx,
            shutdown_rx,
            subscribed_topics: self.subscribed_topics.clone(),
            message_forwarder: self.message_forwarder.clone(),
            last_message_time: self.last_message_time.clone(),
            reconnect_count: self.reconnect_count.clone(),
            reconnect_attempts: 0,
        };
        let span = mqtt_span!(operation = "supervisor", broker = %self.config.broker_url);
        self.event_loop_handle = Some(tokio::spawn(supervisor.run(event_loop).instrument(span)));

        let connection_timeout =
            HealthMonitor::calculate_connection_timeout(&self.reconnect_config);
        if let Err(e) = Self::wait_for_connection_confirmation(state_rx, connection_timeout).await {
            metrics().mqtt_connection_failed();
            return Err(e);
        }

        self.connect_time = Some(Instant::now());
        Ok(())
    }

    /// Stop the supervisor and disconnect from the broker
    pub async fn disconnect(&mut self) -> Result<(), MqttError> {
        if let Some(shutdown_tx) = &self.shutdown_tx {
            let _ = shutdown_tx.send(true);
            info!("Sent shutdown signal to reconnection supervisor");
        }

        let Some(handle) = self.event_loop_handle.take() else {
            debug!("MQTT client was never connected, nothing to disconnect");
            return Ok(());
        };

        let disconnect_result = {
            let client = self.client.lock().await;
            client.disconnect().await
        };

        if let Some(state_tx) = &self.state_tx {
            let _ = state_tx.send(ConnectionState::Disconnected(
                "Client disconnected".to_string(),
            ));
        }
        metrics().mqtt_connection_lost();

        match tokio::time::timeout(Duration::from_secs(2), handle).await {
            Ok(Ok(())) => info!("Event loop task shut down gracefully"),
            Ok(Err(e)) if !e.is_cancelled() => warn!("Event loop task ended with error: {}", e),
            Err(_) => warn!("Event loop task didn't shut down gracefully, forcing abort"),
            _ => {}
        }

        disconnect_result.map_err(|e| MqttError::ConnectionFailed(Box::new(e)))?;
        info!("MQTT client disconnected");
        Ok(())
    }

    /// Current connection state, None before `connect`
    pub fn connection_state(&self) -> Option<ConnectionState> {
        self.state_rx.as_ref().map(|rx| rx.borrow().clone())
    }

    pub fn is_permanently_disconnected(&self) -> bool {
        matches!(
            self.connection_state(),
            Some(ConnectionState::PermanentlyDisconnected(_))
        )
    }

    pub fn get_health_metrics(&self) -> HealthMetrics {
        let last_message_time = self
            .last_message_time
            .lock()
            .ok()
            .and_then(|guard| *guard);
        HealthMonitor::calculate_health_metrics(
            self.connect_time,
            last_message_time,
            self.reconnect_count.load(Ordering::Relaxed),
        )
    }

    fn check_connection_state(&self) -> Result<(), MqttError> {
        let state_rx = self.state_rx.as_ref().ok_or_else(|| {
            MqttError::ConnectionFailedStr("Client not connected: state_rx is None".to_string())
        })?;

        let current_state = state_rx.borrow().clone();
        if !HealthMonitor::can_publish(&current_state) {
            return Err(MqttError::NotConnected {
                state: current_state,
            });
        }

        Ok(())
    }

    /// Publish a payload to a routing key at QoS 1, never retained.
    ///
    /// Each attempt is bounded by the publish timeout. With `retry`, transient
    /// failures are retried up to the configured count.
    pub async fn publish_to_routing_key(
        &self,
        routing_key: &str,
        payload: Vec<u8>,
        retry: bool,
    ) -> Result<(), MqttError> {
        let topic = routing_key_to_mqtt_topic(routing_key);
        let attempts = self.publish_policy.attempts(retry);
        let mut attempt = 1;

        loop {
            match self.publish_once(routing_key, &topic, payload.clone()).await {
                Ok(()) => {
                    metrics().mqtt_message_published();
                    debug!(routing_key, attempt, "Published message");
                    return Ok(());
                }
                Err(e) if attempt < attempts && e.is_transient() => {
                    warn!(routing_key, attempt, error = %e, "Publish failed, retrying");
                    tokio::time::sleep(self.publish_policy.retry_delay).await;
                    attempt += 1;
                }
                Err(e) => {
                    metrics().mqtt_publish_failed();
                    return Err(e);
                }
            }
        }
    }

    async fn publish_once(
        &self,
        routing_key: &str,
        topic: &str,
        payload: Vec<u8>,
    ) -> Result<(), MqttError> {
        self.check_connection_state()?;

        let client = self.client.lock().await;
        let publish = client.publish(topic, QoS::AtLeastOnce, false, payload);
        match tokio::time::timeout(self.publish_policy.timeout, publish).await {
            Ok(result) => result.map_err(|e| MqttError::PublishFailed(Box::new(e))),
            Err(_) => Err(MqttError::PublishTimeout {
                routing_key: routing_key.to_string(),
                timeout_ms: self.publish_policy.timeout.as_millis() as u64,
            }),
        }
    }

    /// Bind to the inbound queues of the given commands.
    ///
    /// Filters are remembered and re-subscribed after every reconnection.
    pub async fn subscribe_to_commands(&mut self, commands: &[Command]) -> Result<(), MqttError> {
        if let Some(state_rx) = &self.state_rx {
            let current_state = state_rx.borrow().clone();
            if !HealthMonitor::can_subscribe(&current_state) {
                return Err(MqttError::NotConnected {
                    state: current_state,
                });
            }
        }

        let topics =
            MessageHandler::build_subscription_topics(commands, self.config.share_group.as_deref());

        let client = self.client.lock().await;
        let mut subscribed = self.subscribed_topics.lock().await;
        for topic in topics {
            client
                .subscribe(topic.as_str(), QoS::AtLeastOnce)
                .await
                .map_err(|e| {
                    MqttError::SubscriptionFailed(format!("Failed to subscribe to {topic}: {e}").into())
                })?;
            info!("Subscribed to: {}", topic);

            if !subscribed.contains(&topic) {
                subscribed.push(topic);
            }
        }

        Ok(())
    }

    /// Set the sender receiving every consumed inbound message
    pub async fn set_message_sender(&self, sender: mpsc::Sender<InboundMessage>) {
        let mut forwarder = self.message_forwarder.lock().await;
        forwarder.set_message_sender(sender);
    }
}

impl Supervisor {
    async fn run(mut self, event_loop: EventLoop) {
        info!("Starting MQTT event loop for service: {}", self.service_id);
        let mut current_event_loop = event_loop;

        loop {
            tokio::select! {
                _ = self.shutdown_rx.changed() => {
                    if *self.shutdown_rx.borrow() {
                        info!("Shutdown signal received, stopping reconnection supervisor");
                        break;
                    }
                }

                event_result = current_event_loop.poll() => {
                    let keep_running = match event_result {
                        Ok(event) => {
                            let route = MessageHandler::route_mqtt_event(&event);
                            self.process_event_route(route, &mut current_event_loop).await
                        }
                        Err(e) => self.handle_event_loop_error(e, &mut current_event_loop).await,
                    };
                    if !keep_running {
                        break;
                    }
                }
            }
        }
        info!("MQTT event loop stopped for service: {}", self.service_id);
    }

    fn transition(&self, event: ConnectionEvent) {
        let previous = self.state_tx.borrow().clone();
        let next = HealthMonitor::determine_next_state(event);
        HealthMonitor::log_state_transition(&previous, &next);
        let _ = self.state_tx.send(next);
    }

    /// Returns true to continue the loop, false to stop
    async fn process_event_route(
        &mut self,
        route: EventRoute,
        current_event_loop: &mut EventLoop,
    ) -> bool {
        match route {
            EventRoute::ConnectionAcknowledged => {
                self.transition(ConnectionEvent::ConnAckReceived);
                metrics().mqtt_connection_established();
                self.reconnect_attempts = 0;
                self.resubscribe_to_topics().await;
                true
            }
            EventRoute::MessageReceived {
                topic,
                payload,
                retain,
            } => {
                self.handle_message_received(&topic, &payload, retain).await;
                true
            }
            EventRoute::Disconnected => {
                self.transition(ConnectionEvent::DisconnectedByBroker);
                metrics().mqtt_connection_lost();
                self.should_attempt_reconnection(current_event_loop).await
            }
            EventRoute::SubscriptionConfirmed {
                packet_id,
                return_codes,
            } => {
                if let Err(e) = MessageHandler::validate_subscription_success(&return_codes) {
                    error!(packet_id, "{}", e);
                } else {
                    debug!(target: "mqtt_transport", packet_id, "Subscription confirmed");
                }
                true
            }
            EventRoute::InfrastructureEvent(event_str) => {
                debug!(target: "mqtt_transport", "MQTT event: {}", event_str);
                true
            }
            EventRoute::OutgoingEvent => true,
        }
    }

    async fn handle_event_loop_error(
        &mut self,
        error: rumqttc::v5::ConnectionError,
        current_event_loop: &mut EventLoop,
    ) -> bool {
        error!("MQTT event loop error for service {}: {}", self.service_id, error);
        self.transition(ConnectionEvent::NetworkError(error.to_string()));
        metrics().mqtt_connection_lost();
        self.should_attempt_reconnection(current_event_loop).await
    }

    async fn handle_message_received(&self, topic: &str, payload: &[u8], retain: bool) {
        debug!(target: "mqtt_transport", "Received MQTT message on topic: {}", topic);

        if !MessageHandler::should_process_message(topic, retain) {
            return;
        }

        metrics().mqtt_message_received();
        if let Ok(mut last) = self.last_message_time.lock() {
            *last = Some(Instant::now());
        }

        let message = MessageHandler::to_inbound_message(topic, payload);
        let forwarder = self.message_forwarder.lock().await;
        if let Err(e) = forwarder.forward_message(message).await {
            error!("Failed to forward inbound message: {}", e);
        }
    }

    /// Sleep unless shutdown is requested first. Returns false on shutdown.
    async fn interruptible_sleep(mut shutdown_rx: watch::Receiver<bool>, delay_ms: u64) -> bool {
        tokio::select! {
            _ = shutdown_rx.changed() => {
                if *shutdown_rx.borrow() {
                    info!("Shutdown signal received during reconnection delay, stopping");
                    return false;
                }
                true
            }
            _ = tokio::time::sleep(Duration::from_millis(delay_ms)) => true,
        }
    }

    /// Swap in a fresh client and event loop. Failures keep the old loop so
    /// the next poll error retries.
    async fn apply_new_connection(&self, current_event_loop: &mut EventLoop) {
        match MqttClient::create_connection(&self.service_id, &self.config) {
            Ok((new_client, new_event_loop)) => {
                *current_event_loop = new_event_loop;
                let mut client_guard = self.client.lock().await;
                *client_guard = new_client;
                info!("Created new connection for reconnection attempt");
            }
            Err(e) => error!("Failed to create new connection: {}", e),
        }
    }

    async fn resubscribe_to_topics(&self) {
        let topics = self.subscribed_topics.lock().await.clone();
        let client_guard = self.client.lock().await;
        for topic in &topics {
            if let Err(e) = client_guard.subscribe(topic.as_str(), QoS::AtLeastOnce).await {
                error!("Failed to re-subscribe to {}: {}", topic, e);
            } else {
                debug!(target: "mqtt_transport", "Re-subscribed to: {}", topic);
            }
        }
    }

    async fn should_attempt_reconnection(&mut self, current_event_loop: &mut EventLoop) -> bool {
        let decision = HealthMonitor::should_attempt_reconnection(
            self.reconnect_attempts,
            &self.reconnect_config,
            *self.shutdown_rx.borrow(),
        );

        match decision {
            ReconnectionDecision::Proceed { attempt, delay_ms } => {
                self.reconnect_attempts = attempt;
                self.reconnect_count.fetch_add(1, Ordering::Relaxed);
                self.transition(ConnectionEvent::ReconnectionStarted(attempt));
                metrics().mqtt_connection_attempt();

                let max_display = self
                    .reconnect_config
                    .max_attempts
                    .map_or("unlimited".to_string(), |max| max.to_string());
                info!(
                    "Attempting reconnection {}/{} after {}ms delay",
                    attempt, max_display, delay_ms
                );

                if !Self::interruptible_sleep(self.shutdown_rx.clone(), delay_ms).await {
                    return false;
                }
                if *self.shutdown_rx.borrow() {
                    info!("Shutdown signal received, aborting reconnection");
                    return false;
                }

                self.apply_new_connection(current_event_loop).await;
                true
            }
            ReconnectionDecision::AbortShutdownRequested => {
                info!("Shutdown signal received, stopping reconnection");
                false
            }
            ReconnectionDecision::AbortMaxAttemptsExceeded { max_attempts } => {
                let reason = format!("Max reconnection attempts ({max_attempts}) exceeded");
                self.transition(ConnectionEvent::PermanentFailure(reason));
                metrics().mqtt_connection_failed();
                false
            }
        }
    }
}

#[async_trait]
impl Transport for MqttClient {
    type Error = MqttError;

    async fn connect(&mut self) -> Result<(), Self::Error> {
        MqttClient::connect(self).await
    }

    async fn disconnect(&mut self) -> Result<(), Self::Error> {
        MqttClient::disconnect(self).await
    }

    async fn publish(
        &self,
        routing_key: &str,
        payload: Vec<u8>,
        retry: bool,
    ) -> Result<(), Self::Error> {
        self.publish_to_routing_key(routing_key, payload, retry).await
    }

    async fn subscribe(&mut self, commands: &[Command]) -> Result<(), Self::Error> {
        self.subscribe_to_commands(commands).await
    }

    fn is_connected(&self) -> bool {
        matches!(self.connection_state(), Some(ConnectionState::Connected))
    }

    fn connection_state(&self) -> Option<ConnectionState> {
        MqttClient::connection_state(self)
    }

    fn is_permanently_disconnected(&self) -> bool {
        MqttClient::is_permanently_disconnected(self)
    }

    fn set_message_sender(&self, sender: mpsc::Sender<InboundMessage>) {
        match self.message_forwarder.try_lock() {
            Ok(mut forwarder) => forwarder.set_message_sender(sender),
            Err(_) => {
                let message_forwarder = self.message_forwarder.clone();
                tokio::spawn(async move {
                    message_forwarder.lock().await.set_message_sender(sender);
                });
            }
        }
    }
}

impl Drop for MqttClient {
    fn drop(&mut self) {
        if let Some(shutdown_tx) = &self.shutdown_tx {
            let _ = shutdown_tx.send(true);
        }

        // Drop cannot await a graceful disconnect; call disconnect() for that
        if let Some(handle) = self.event_loop_handle.take() {
            handle.abort();
        }
    }
}
