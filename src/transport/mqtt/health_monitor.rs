//! Pure health monitoring and reconnection logic for MQTT client

use super::connection::{ConnectionState, ReconnectConfig};
use std::time::{Duration, Instant};
use tracing::{error, info, warn};

/// Silence on the inbound queues after which the link is considered stale
pub const MESSAGE_STALENESS: Duration = Duration::from_secs(300);

/// Pure health monitoring and reconnection decision logic
pub struct HealthMonitor;

impl HealthMonitor {
    /// Determine if reconnection should be attempted
    pub fn should_attempt_reconnection(
        current_attempts: u32,
        config: &ReconnectConfig,
        shutdown_requested: bool,
    ) -> ReconnectionDecision {
        if shutdown_requested {
            return ReconnectionDecision::AbortShutdownRequested;
        }

        if let Some(max_attempts) = config.max_attempts {
            if current_attempts >= max_attempts {
                return ReconnectionDecision::AbortMaxAttemptsExceeded { max_attempts };
            }
        }

        ReconnectionDecision::Proceed {
            attempt: current_attempts + 1,
            delay_ms: config.calculate_backoff_delay(current_attempts + 1),
        }
    }

    /// Time to wait for the first ConnAck
    pub fn calculate_connection_timeout(config: &ReconnectConfig) -> Duration {
        match config.calculate_max_total_time() {
            Some(max_total_time) => Duration::from_millis(max_total_time + 30000),
            None => Duration::from_secs(60),
        }
    }

    /// Determine next state after connection event
    pub fn determine_next_state(event: ConnectionEvent) -> ConnectionState {
        match event {
            ConnectionEvent::ConnAckReceived => ConnectionState::Connected,
            ConnectionEvent::DisconnectedByBroker => {
                ConnectionState::Disconnected("Broker disconnected".to_string())
            }
            ConnectionEvent::NetworkError(error) => ConnectionState::Disconnected(error),
            ConnectionEvent::ReconnectionStarted(attempt) => ConnectionState::Reconnecting(attempt),
            ConnectionEvent::PermanentFailure(reason) => {
                ConnectionState::PermanentlyDisconnected(reason)
            }
        }
    }

    pub fn can_publish(state: &ConnectionState) -> bool {
        matches!(state, ConnectionState::Connected)
    }

    pub fn can_subscribe(state: &ConnectionState) -> bool {
        matches!(state, ConnectionState::Connected)
    }

    /// Calculate health metrics for connection
    pub fn calculate_health_metrics(
        connect_time: Option<Instant>,
        last_message_time: Option<Instant>,
        reconnect_count: u32,
    ) -> HealthMetrics {
        let now = Instant::now();

        let uptime = connect_time.map(|t| now.duration_since(t));
        let time_since_last_message = last_message_time.map(|t| now.duration_since(t));

        HealthMetrics {
            uptime,
            time_since_last_message,
            reconnect_count,
            is_healthy: Self::determine_health_status(uptime, time_since_last_message),
        }
    }

    fn determine_health_status(
        uptime: Option<Duration>,
        time_since_last_message: Option<Duration>,
    ) -> bool {
        match (uptime, time_since_last_message) {
            (Some(_), None) => true,
            (Some(_), Some(last_msg)) => last_msg < MESSAGE_STALENESS,
            _ => false,
        }
    }

    /// Log a connection state transition at the level it deserves
    pub fn log_state_transition(from: &ConnectionState, to: &ConnectionState) {
        match (from, to) {
            (ConnectionState::Connecting, ConnectionState::Connected) => {
                info!("MQTT connection established");
            }
            (_, ConnectionState::Disconnected(reason)) => {
                warn!("MQTT connection lost: {}", reason);
            }
            (_, ConnectionState::Reconnecting(attempt)) => {
                info!("Starting reconnection attempt {}", attempt);
            }
            (ConnectionState::Reconnecting(_), ConnectionState::Connected) => {
                info!("Reconnection successful");
            }
            (_, ConnectionState::PermanentlyDisconnected(reason)) => {
                error!("MQTT connection permanently failed: {}", reason);
            }
            _ => {
                info!("MQTT connection state: {:?} -> {:?}", from, to);
            }
        }
    }

    /// Validate connection configuration
    pub fn validate_connection_config(config: &ReconnectConfig) -> Result<(), String> {
        if config.max_attempts == Some(0) {
            return Err("max_attempts must be greater than 0 or None for unlimited".to_string());
        }

        if config.sustained_delay == 0 {
            return Err("sustained_delay must be greater than 0".to_string());
        }

        Ok(())
    }
}

/// Decision result for reconnection attempts
#[derive(Debug, PartialEq)]
pub enum ReconnectionDecision {
    Proceed { attempt: u32, delay_ms: u64 },
    AbortShutdownRequested,
    AbortMaxAttemptsExceeded { max_attempts: u32 },
}

/// Connection events that trigger state transitions
#[derive(Debug, Clone)]
pub enum ConnectionEvent {
    ConnAckReceived,
    DisconnectedByBroker,
    NetworkError(String),
    ReconnectionStarted(u32),
    PermanentFailure(String),
}

/// Health metrics for connection monitoring
#[derive(Debug, Clone)]
pub struct HealthMetrics {
    /// Time since connection established
    pub uptime: Option<Duration>,
    /// Time since last message received
    pub time_since_last_message: Option<Duration>,
    /// Number of reconnections since start
    pub reconnect_count: u32,
    pub is_healthy: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_should_attempt_reconnection() {
        let config = ReconnectConfig::default();

        assert_eq!(
            HealthMonitor::should_attempt_reconnection(0, &config, false),
            ReconnectionDecision::Proceed {
                attempt: 1,
                delay_ms: 25
            }
        );
        assert_eq!(
            HealthMonitor::should_attempt_reconnection(0, &config, true),
            ReconnectionDecision::AbortShutdownRequested
        );
        assert_eq!(
            HealthMonitor::should_attempt_reconnection(5, &config, false),
            ReconnectionDecision::Proceed {
                attempt: 6,
                delay_ms: 250
            }
        );

        let limited_config = ReconnectConfig {
            max_attempts: Some(5),
            ..Default::default()
        };
        assert_eq!(
            HealthMonitor::should_attempt_reconnection(5, &limited_config, false),
            ReconnectionDecision::AbortMaxAttemptsExceeded { max_attempts: 5 }
        );
    }

    #[test]
    fn test_calculate_connection_timeout() {
        assert_eq!(
            HealthMonitor::calculate_connection_timeout(&ReconnectConfig::default()),
            Duration::from_secs(60)
        );

        let limited_config = ReconnectConfig {
            max_attempts: Some(4),
            ..Default::default()
        };
        assert_eq!(
            HealthMonitor::calculate_connection_timeout(&limited_config),
            Duration::from_millis(25 + 50 + 100 + 250 + 30000)
        );
    }

    #[test]
    fn test_determine_next_state() {
        assert_eq!(
            HealthMonitor::determine_next_state(ConnectionEvent::ConnAckReceived),
            ConnectionState::Connected
        );
        assert_eq!(
            HealthMonitor::determine_next_state(ConnectionEvent::DisconnectedByBroker),
            ConnectionState::Disconnected("Broker disconnected".to_string())
        );
        assert_eq!(
            HealthMonitor::determine_next_state(ConnectionEvent::NetworkError(
                "timeout".to_string()
            )),
            ConnectionState::Disconnected("timeout".to_string())
        );
        assert_eq!(
            HealthMonitor::determine_next_state(ConnectionEvent::ReconnectionStarted(1)),
            ConnectionState::Reconnecting(1)
        );
        assert_eq!(
            HealthMonitor::determine_next_state(ConnectionEvent::PermanentFailure(
                "max attempts".to_string()
            )),
            ConnectionState::PermanentlyDisconnected("max attempts".to_string())
        );
    }

    #[test]
    fn test_can_publish_only_when_connected() {
        assert!(HealthMonitor::can_publish(&ConnectionState::Connected));
        assert!(!HealthMonitor::can_publish(&ConnectionState::Connecting));
        assert!(!HealthMonitor::can_publish(&ConnectionState::Reconnecting(1)));
        assert!(!HealthMonitor::can_subscribe(&ConnectionState::Disconnected(
            "test".to_string()
        )));
    }

    #[test]
    fn test_calculate_health_metrics() {
        let now = Instant::now();
        let metrics = HealthMonitor::calculate_health_metrics(
            Some(now - Duration::from_secs(3600)),
            Some(now - Duration::from_secs(60)),
            2,
        );
        assert!(metrics.uptime.is_some());
        assert_eq!(metrics.reconnect_count, 2);
        assert!(metrics.is_healthy);

        let stale = HealthMonitor::calculate_health_metrics(
            Some(now - Duration::from_secs(3600)),
            Some(now - Duration::from_secs(400)),
            0,
        );
        assert!(!stale.is_healthy);

        let disconnected = HealthMonitor::calculate_health_metrics(None, None, 0);
        assert!(!disconnected.is_healthy);
    }

    #[test]
    fn test_validate_connection_config() {
        assert!(HealthMonitor::validate_connection_config(&ReconnectConfig::default()).is_ok());
        assert!(HealthMonitor::validate_connection_config(&ReconnectConfig {
            max_attempts: Some(0),
            ..Default::default()
        })
        .is_err());
        assert!(HealthMonitor::validate_connection_config(&ReconnectConfig {
            sustained_delay: 0,
            ..Default::default()
        })
        .is_err());
    }
}
