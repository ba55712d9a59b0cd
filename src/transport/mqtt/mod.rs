//! MQTT client for the device network
//!
//! The client is split into pure decision logic and the I/O that acts on it:
//!
//! - [`connection`] - Connection states, backoff, publish policy and broker options
//! - [`message_handler`] - Event routing and inbound message conversion
//! - [`health_monitor`] - Reconnection decisions and link health
//! - [`client`] - The rumqttc client, reconnection supervisor and publishing
//!
//! # Usage
//!
//! ```rust,no_run
//! use alert_control::config::MqttSection;
//! use alert_control::protocol::Command;
//! use alert_control::transport::mqtt::MqttClient;
//!
//! # tokio_test::block_on(async {
//! let config = MqttSection {
//!     broker_url: "mqtt://localhost:1883".to_string(),
//!     username_env: None,
//!     password_env: None,
//!     share_group: Some("alert-control".to_string()),
//!     publish_timeout_ms: 5000,
//!     publish_retries: 3,
//!     retry_delay_ms: 200,
//!     ping_interval_secs: 10,
//! };
//!
//! let mut client = MqttClient::new("controller-1", config).await?;
//! client.connect().await?;
//! client.subscribe_to_commands(&Command::INBOUND).await?;
//! client.publish_to_routing_key("lock.all.ping", b"{}".to_vec(), false).await?;
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! # });
//! ```

pub mod client;
pub mod connection;
pub mod health_monitor;
pub mod message_handler;

pub use client::MqttClient;
pub use connection::{ConnectionState, MqttError, PublishPolicy, ReconnectConfig};
pub use health_monitor::{ConnectionEvent, HealthMetrics, HealthMonitor, ReconnectionDecision};
pub use message_handler::{EventRoute, MessageForwarder, MessageHandler};
