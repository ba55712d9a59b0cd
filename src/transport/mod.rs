//! Transport layer for device communication
//!
//! This module provides the transport abstraction and its MQTT implementation.
//! Transports speak routing keys (`lock.A1.cup`); mapping them onto the wire
//! format is the implementation's business.

use crate::protocol::Command;
use chrono::{DateTime, Utc};
use serde_json::Value;
use tokio::sync::mpsc;

pub mod mqtt;

/// Body of a message delivered by the transport
#[derive(Debug, Clone, PartialEq)]
pub enum MessageBody {
    /// Already decoded mapping, used as-is
    Structured(Value),
    /// Raw text as received from the wire
    Text(String),
}

impl MessageBody {
    /// Lossy UTF-8 view of raw wire bytes
    pub fn from_bytes(bytes: &[u8]) -> Self {
        MessageBody::Text(String::from_utf8_lossy(bytes).into_owned())
    }
}

/// A message consumed from one of the inbound queues
#[derive(Debug, Clone, PartialEq)]
pub struct InboundMessage {
    pub routing_key: String,
    pub body: MessageBody,
    pub received_at: DateTime<Utc>,
}

impl InboundMessage {
    pub fn new(routing_key: impl Into<String>, body: MessageBody) -> Self {
        Self {
            routing_key: routing_key.into(),
            body,
            received_at: Utc::now(),
        }
    }

    pub fn text(routing_key: impl Into<String>, body: impl Into<String>) -> Self {
        Self::new(routing_key, MessageBody::Text(body.into()))
    }
}

/// Transport trait for device communication
///
/// This trait provides an abstraction over different transport mechanisms
/// (primarily MQTT) to enable dependency injection and testing.
#[async_trait::async_trait]
pub trait Transport: Send + Sync {
    type Error: std::error::Error + Send + Sync + 'static;

    /// Connect to the transport broker/server
    async fn connect(&mut self) -> Result<(), Self::Error>;

    /// Disconnect from the transport broker/server
    async fn disconnect(&mut self) -> Result<(), Self::Error>;

    /// Publish a payload to a routing key.
    ///
    /// With `retry`, transient failures are retried within the transport's
    /// configured bounds before an error is returned.
    async fn publish(&self, routing_key: &str, payload: Vec<u8>, retry: bool)
        -> Result<(), Self::Error>;

    /// Start consuming the inbound queues for the given commands
    async fn subscribe(&mut self, commands: &[Command]) -> Result<(), Self::Error>;

    /// Check if transport is currently connected
    fn is_connected(&self) -> bool;

    /// Get current connection state
    fn connection_state(&self) -> Option<crate::transport::mqtt::ConnectionState>;

    /// Check if the connection is permanently disconnected
    fn is_permanently_disconnected(&self) -> bool;

    /// Set the sender that receives every consumed message
    fn set_message_sender(&self, sender: mpsc::Sender<InboundMessage>);
}

/// Type alias for MQTT transport
pub type MqttTransport = mqtt::MqttClient;
