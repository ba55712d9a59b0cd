//! Consumer loop for device messages
//!
//! One message is handled at a time. Handler errors are logged and counted;
//! they never stop the loop and the message is considered consumed.

use super::coordinator::ConfigSyncCoordinator;
use super::parser::{DeviceEvent, MessageParser, ParsedMessage};
use crate::error::{ControlError, ControlResult};
use crate::message_span;
use crate::observability::{metrics, HealthServer};
use crate::protocol::{Command, OutboundPacket};
use crate::state::StateChange;
use crate::storage::{AlertStore, DeviceStore};
use crate::transport::{InboundMessage, MessageBody, Transport};
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::{broadcast, mpsc, watch};
use tracing::{debug, error, info, warn, Instrument};

/// Routes parsed device messages to the coordinator and publishes replies
pub struct DeviceRouter<T: Transport, S: AlertStore + DeviceStore + ?Sized> {
    transport: Arc<T>,
    coordinator: ConfigSyncCoordinator<S>,
    parser: MessageParser,
    health_server: Option<Arc<HealthServer>>,
}

impl<T: Transport, S: AlertStore + DeviceStore + ?Sized> DeviceRouter<T, S> {
    pub fn new(transport: Arc<T>, coordinator: ConfigSyncCoordinator<S>) -> Self {
        Self {
            transport,
            coordinator,
            parser: MessageParser::new(),
            health_server: None,
        }
    }

    /// Report handled messages to the health endpoints
    pub fn with_health_server(mut self, health_server: Arc<HealthServer>) -> Self {
        self.health_server = Some(health_server);
        self
    }

    pub fn coordinator(&self) -> &ConfigSyncCoordinator<S> {
        &self.coordinator
    }

    /// Consume inbound messages and state changes until shutdown is signalled
    /// or the inbound channel closes
    pub async fn run(
        &self,
        mut inbound: mpsc::Receiver<InboundMessage>,
        mut changes: broadcast::Receiver<StateChange>,
        mut shutdown: watch::Receiver<bool>,
    ) {
        let mut listening_for_changes = true;
        info!("Device router started");

        loop {
            tokio::select! {
                result = shutdown.changed() => {
                    if result.is_err() || *shutdown.borrow() {
                        info!("Device router shutting down");
                        break;
                    }
                }
                message = inbound.recv() => match message {
                    Some(message) => self.process(message).await,
                    None => {
                        info!("Inbound channel closed, device router stopping");
                        break;
                    }
                },
                change = changes.recv(), if listening_for_changes => match change {
                    Ok(change) => {
                        if let Err(e) = self.broadcast_state_change(&change).await {
                            error!(error = %e, "Failed to broadcast simple configs");
                        }
                    }
                    Err(RecvError::Lagged(skipped)) => {
                        warn!(skipped, "Missed state changes, broadcasting current configs");
                        if let Err(e) = self.broadcast_current().await {
                            error!(error = %e, "Failed to broadcast simple configs");
                        }
                    }
                    Err(RecvError::Closed) => {
                        debug!("State change channel closed");
                        listening_for_changes = false;
                    }
                },
            }
        }
    }

    /// Handle one message, logging and counting the outcome
    pub async fn process(&self, message: InboundMessage) {
        let start = Instant::now();
        let span = message_span!(routing_key = %message.routing_key);
        let result = self.handle_message(message).instrument(span.clone()).await;

        let _enter = span.enter();
        match &result {
            Ok(Some(packet)) => debug!(sent_to = %packet.routing_key, "Message handled"),
            Ok(None) => debug!("Message handled"),
            Err(e) if e.is_retryable() => warn!(error = %e, "Message handling failed"),
            Err(e) => error!(error = %e, kind = ?e.kind(), "Message handling failed"),
        }
        metrics().message_handled(start.elapsed(), result.is_ok());
        if let Some(health_server) = &self.health_server {
            health_server.set_last_message_handled(chrono::Utc::now().timestamp().max(0) as u64);
        }
    }

    /// Parse and dispatch one message. Returns the packet published in reply.
    pub async fn handle_message(
        &self,
        message: InboundMessage,
    ) -> ControlResult<Option<OutboundPacket>> {
        match self.parser.parse(&message.routing_key, message.body)? {
            ParsedMessage::Event(event) => self.handle_event(event).await,
            ParsedMessage::Passthrough(body) => match passthrough_event(&body) {
                Some(event) => self.handle_event(event).await,
                None => {
                    debug!(
                        routing_key = %message.routing_key,
                        "Dropping message that is not a device event"
                    );
                    metrics().passthrough_dropped();
                    Ok(None)
                }
            },
        }
    }

    /// Dispatch a normalized event by command
    pub async fn handle_event(&self, event: DeviceEvent) -> ControlResult<Option<OutboundPacket>> {
        match event.command.parse::<Command>() {
            Ok(Command::Cup | Command::Sup) => {
                let packet = self.coordinator.on_status_update(&event).await?;
                if let Some(packet) = &packet {
                    self.publish_packet(packet).await?;
                }
                Ok(packet)
            }
            Ok(Command::Nack) => {
                warn!(
                    device_type = %event.device_type,
                    device_uid = %event.device_uid,
                    task_id = event.task_id.as_deref().unwrap_or(""),
                    "Device rejected task"
                );
                self.coordinator.record_liveness(&event, Command::Nack.as_str()).await?;
                Ok(None)
            }
            Ok(command @ (Command::Ack | Command::Pong | Command::Info)) => {
                self.coordinator.record_liveness(&event, command.as_str()).await?;
                Ok(None)
            }
            Ok(Command::Ping) | Err(_) => {
                debug!(command = %event.command, "Ignoring command");
                Ok(None)
            }
        }
    }

    /// Push the simple device configs for a new current state
    pub async fn broadcast_state_change(&self, change: &StateChange) -> ControlResult<usize> {
        info!(
            from = change.previous.as_deref().unwrap_or("none"),
            to = %change.current.name,
            "Broadcasting simple configs for new state"
        );
        self.broadcast_current().await
    }

    /// Publish the simple device configs of the current state.
    ///
    /// Every packet is attempted; the count of successful publishes is
    /// returned unless all of them failed.
    pub async fn broadcast_current(&self) -> ControlResult<usize> {
        let packets = self.coordinator.broadcast_simple_configs().await?;
        let mut published = 0;
        let mut last_error = None;

        for packet in &packets {
            match self.publish_packet(packet).await {
                Ok(()) => published += 1,
                Err(e) => {
                    warn!(routing_key = %packet.routing_key, error = %e, "Simple config publish failed");
                    last_error = Some(e);
                }
            }
        }

        match last_error {
            Some(e) if published == 0 => Err(e),
            _ => Ok(published),
        }
    }

    pub async fn publish_packet(&self, packet: &OutboundPacket) -> ControlResult<()> {
        let payload = packet
            .to_bytes()
            .map_err(|e| ControlError::publish_failure(&packet.routing_key, e))?;
        self.transport
            .publish(&packet.routing_key, payload, true)
            .await
            .map_err(|e| ControlError::publish_failure(&packet.routing_key, e))
    }
}

/// Interpret a passthrough body as an already normalized event
fn passthrough_event(body: &MessageBody) -> Option<DeviceEvent> {
    match body {
        MessageBody::Structured(value) => serde_json::from_value(value.clone()).ok(),
        MessageBody::Text(text) => serde_json::from_str(text).ok(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_passthrough_event_requires_identity_fields() {
        let body = MessageBody::Structured(json!({
            "device_type": "lock",
            "device_uid": "A1",
            "command": "sup",
            "hash": "abc",
        }));
        let event = passthrough_event(&body).unwrap();
        assert_eq!(event.device_uid, "A1");

        assert!(passthrough_event(&MessageBody::Text("{\"hash\":\"abc\"}".to_string())).is_none());
        assert!(passthrough_event(&MessageBody::Text("garbage".to_string())).is_none());
    }
}
