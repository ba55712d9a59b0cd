//! Pure message routing and processing logic for MQTT events
//!
//! Maps rumqttc events onto routing decisions and converts accepted
//! publishes into [`InboundMessage`]s for the device router.

use crate::protocol::{inbound_filter, mqtt_topic_to_routing_key, Command, INBOUND_MARKER};
use crate::transport::{InboundMessage, MessageBody};
use rumqttc::v5::Event;
use tokio::sync::mpsc;
use tracing::{debug, warn};

/// Pure message routing decisions based on MQTT events
pub struct MessageHandler;

impl MessageHandler {
    /// Decide whether a received publish belongs to an inbound queue
    pub fn should_process_message(topic: &str, retain: bool) -> bool {
        // Retained device replies are stale by the time we see them
        if retain {
            debug!("Ignoring retained message on topic: {}", topic);
            return false;
        }

        if topic.trim_start_matches('/').split('/').next() != Some(INBOUND_MARKER) {
            debug!("Ignoring message outside inbound queues: {}", topic);
            return false;
        }

        true
    }

    /// Convert a received publish into an inbound message
    pub fn to_inbound_message(topic: &str, payload: &[u8]) -> InboundMessage {
        InboundMessage::new(
            mqtt_topic_to_routing_key(topic),
            MessageBody::from_bytes(payload),
        )
    }

    /// Route MQTT event to appropriate handler
    pub fn route_mqtt_event(event: &Event) -> EventRoute {
        match event {
            Event::Incoming(incoming) => {
                use rumqttc::v5::mqttbytes::v5::Packet;
                match incoming {
                    Packet::ConnAck(_) => EventRoute::ConnectionAcknowledged,
                    Packet::Publish(publish) => EventRoute::MessageReceived {
                        topic: String::from_utf8_lossy(&publish.topic).to_string(),
                        payload: publish.payload.to_vec(),
                        retain: publish.retain,
                    },
                    Packet::Disconnect(_) => EventRoute::Disconnected,
                    Packet::SubAck(suback) => EventRoute::SubscriptionConfirmed {
                        packet_id: suback.pkid,
                        return_codes: suback.return_codes.iter().map(|_c| 0x01).collect(),
                    },
                    other => EventRoute::InfrastructureEvent(format!("{other:?}")),
                }
            }
            Event::Outgoing(_) => EventRoute::OutgoingEvent,
        }
    }

    /// Subscription filters for the inbound command queues
    pub fn build_subscription_topics(commands: &[Command], share_group: Option<&str>) -> Vec<String> {
        commands
            .iter()
            .map(|command| inbound_filter(*command, share_group))
            .collect()
    }

    /// Validate subscription success from SubAck
    pub fn validate_subscription_success(return_codes: &[u8]) -> Result<(), String> {
        if return_codes.iter().any(|&code| code >= 0x80) {
            Err(format!(
                "Subscription failed with return codes: {return_codes:?}"
            ))
        } else {
            Ok(())
        }
    }
}

/// Routing decisions for MQTT events
#[derive(Debug, Clone)]
pub enum EventRoute {
    /// Connection acknowledged - ready to publish/subscribe
    ConnectionAcknowledged,
    /// Message received on subscribed topic
    MessageReceived {
        topic: String,
        payload: Vec<u8>,
        retain: bool,
    },
    /// MQTT broker disconnected
    Disconnected,
    /// Subscription confirmed with return codes
    SubscriptionConfirmed {
        packet_id: u16,
        return_codes: Vec<u8>,
    },
    /// Infrastructure event (PingResp, etc.)
    InfrastructureEvent(String),
    /// Outgoing event (handled automatically)
    OutgoingEvent,
}

/// Forwards inbound messages to the consumer channel
pub struct MessageForwarder {
    message_sender: Option<mpsc::Sender<InboundMessage>>,
}

impl MessageForwarder {
    pub fn new() -> Self {
        Self {
            message_sender: None,
        }
    }

    pub fn set_message_sender(&mut self, sender: mpsc::Sender<InboundMessage>) {
        self.message_sender = Some(sender);
    }

    /// Forward one message; waits while the consumer channel is full
    pub async fn forward_message(&self, message: InboundMessage) -> Result<(), String> {
        if let Some(ref sender) = self.message_sender {
            debug!(routing_key = %message.routing_key, "Forwarding inbound message");

            sender
                .send(message)
                .await
                .map_err(|e| format!("Failed to forward message to router: {e}"))?;
            Ok(())
        } else {
            warn!("Received MQTT message but no message sender configured - message dropped");
            Err("No message sender configured".to_string())
        }
    }
}

impl Default for MessageForwarder {
    fn default() -> Self {
        Self::new()
    }
}
