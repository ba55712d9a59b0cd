//! Pure connection state management for MQTT client
//!
//! Connection states, reconnection backoff, publish policy and broker
//! option construction. Nothing here touches the network.

use crate::config::MqttSection;
use rumqttc::Transport as RumqttcTransport;
use rumqttc::v5::MqttOptions;
use std::time::Duration;
use thiserror::Error;
use url::Url;

/// Connection state for MQTT client
#[derive(Debug, Clone, PartialEq)]
pub enum ConnectionState {
    /// Initial state - attempting to connect
    Connecting,
    /// Successfully connected and ready for operations
    Connected,
    /// Disconnected with reason
    Disconnected(String),
    /// Attempting to reconnect (attempt count)
    Reconnecting(u32),
    /// Permanently disconnected - max reconnection attempts exceeded
    PermanentlyDisconnected(String),
}

/// Reconnection configuration
#[derive(Debug, Clone)]
pub struct ReconnectConfig {
    /// Maximum number of reconnection attempts (None = unlimited)
    pub max_attempts: Option<u32>,
    /// Backoff pattern in milliseconds
    pub backoff_pattern: Vec<u64>,
    /// Delay to use after pattern is exhausted
    pub sustained_delay: u64,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            max_attempts: None,
            backoff_pattern: vec![25, 50, 100, 250],
            sustained_delay: 250,
        }
    }
}

impl ReconnectConfig {
    /// Maximum total time for all reconnection attempts, None when unlimited
    pub fn calculate_max_total_time(&self) -> Option<u64> {
        self.max_attempts.map(|max_attempts| {
            (1..=max_attempts)
                .map(|attempt| self.calculate_backoff_delay(attempt))
                .sum()
        })
    }

    /// Backoff delay for the given attempt (1-based)
    pub fn calculate_backoff_delay(&self, attempt: u32) -> u64 {
        let index = attempt.saturating_sub(1) as usize;
        self.backoff_pattern
            .get(index)
            .copied()
            .unwrap_or(self.sustained_delay)
    }
}

/// Bounds applied to a single outbound publish
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PublishPolicy {
    /// How long one attempt may wait on the client request channel
    pub timeout: Duration,
    /// Extra attempts made when the caller asked for retry
    pub retries: u32,
    /// Pause between attempts
    pub retry_delay: Duration,
}

impl PublishPolicy {
    pub fn from_config(config: &MqttSection) -> Self {
        Self {
            timeout: Duration::from_millis(config.publish_timeout_ms),
            retries: config.publish_retries,
            retry_delay: Duration::from_millis(config.retry_delay_ms),
        }
    }

    /// Total attempts for one publish
    pub fn attempts(&self, retry: bool) -> u32 {
        if retry {
            self.retries + 1
        } else {
            1
        }
    }
}

impl Default for PublishPolicy {
    fn default() -> Self {
        Self {
            timeout: Duration::from_millis(5000),
            retries: 3,
            retry_delay: Duration::from_millis(200),
        }
    }
}

/// MQTT transport errors
#[derive(Debug, Error)]
pub enum MqttError {
    #[error("Connection failed")]
    ConnectionFailed(#[source] Box<dyn std::error::Error + Send + Sync>),
    #[error("Publishing failed")]
    PublishFailed(#[source] Box<dyn std::error::Error + Send + Sync>),
    #[error("Publish to {routing_key} timed out after {timeout_ms}ms")]
    PublishTimeout { routing_key: String, timeout_ms: u64 },
    #[error("Subscription failed")]
    SubscriptionFailed(#[source] Box<dyn std::error::Error + Send + Sync>),
    #[error("Invalid broker URL: {0}")]
    InvalidBrokerUrl(String),
    #[error("Not connected - current state: {state:?}")]
    NotConnected { state: ConnectionState },
    #[error("Connection failed: {0}")]
    ConnectionFailedStr(String),
}

impl MqttError {
    /// Whether another publish attempt could succeed
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            MqttError::PublishFailed(_)
                | MqttError::PublishTimeout { .. }
                | MqttError::NotConnected { .. }
        )
    }
}

/// Build MQTT options from config, shared by the first connection and
/// every reconnection attempt
pub fn configure_mqtt_options(
    service_id: &str,
    config: &MqttSection,
) -> Result<MqttOptions, MqttError> {
    let url = Url::parse(&config.broker_url)
        .map_err(|_| MqttError::InvalidBrokerUrl(config.broker_url.clone()))?;

    let host = url
        .host_str()
        .ok_or_else(|| MqttError::InvalidBrokerUrl(config.broker_url.clone()))?;
    let port = url
        .port()
        .unwrap_or(if url.scheme() == "mqtts" { 8883 } else { 1883 });

    // Unique client id per attempt so a half-closed session never collides
    let client_id = format!(
        "alert-control-{service_id}-{}",
        chrono::Utc::now().timestamp_millis()
    );
    let mut mqtt_options = MqttOptions::new(client_id, host, port);

    if url.scheme() == "mqtts" {
        mqtt_options.set_transport(RumqttcTransport::tls_with_default_config());
    }

    if let Some(username_env) = &config.username_env {
        if let Ok(username) = std::env::var(username_env) {
            let password = config
                .password_env
                .as_ref()
                .and_then(|env_name| std::env::var(env_name).ok())
                .unwrap_or_default();
            mqtt_options.set_credentials(&username, &password);
        }
    }

    mqtt_options.set_keep_alive(Duration::from_secs(60));
    mqtt_options.set_max_packet_size(Some(256 * 1024));

    Ok(mqtt_options)
}
