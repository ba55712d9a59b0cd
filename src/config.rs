//! Configuration system for the alert control plane
//!
//! The configuration is a TOML file loaded once at process start and handed to
//! the transport, the state engine and the coordinator. Besides connection
//! settings it carries the seed data for states, smart device configurations
//! and per-state simple device configurations.

use crate::protocol::{classify, DeviceKind, SimpleDevice};
use crate::state::StateSeed;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::Path;
use thiserror::Error;

/// Main configuration structure
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ControlConfig {
    pub service: ServiceSection,
    pub mqtt: MqttSection,
    #[serde(default)]
    pub alert: AlertSection,
    #[serde(default)]
    pub states: Vec<StateSeed>,
    #[serde(default)]
    pub devices: Vec<DeviceSeed>,
    #[serde(default)]
    pub simple_configs: Vec<SimpleConfigSeed>,
}

/// Service identity
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ServiceSection {
    /// Service identifier (must match [a-zA-Z0-9._-]+), used in the MQTT client id
    pub id: String,
    #[serde(default)]
    pub description: String,
}

/// MQTT section
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct MqttSection {
    /// MQTT broker URL with protocol and port
    pub broker_url: String,
    /// Environment variable containing username
    pub username_env: Option<String>,
    /// Environment variable containing password
    pub password_env: Option<String>,
    /// Shared subscription group for competing consumers
    #[serde(default)]
    pub share_group: Option<String>,
    /// How long a publish may wait for the client request channel
    #[serde(default = "default_publish_timeout_ms")]
    pub publish_timeout_ms: u64,
    /// Extra attempts for publishes requested with retry
    #[serde(default = "default_publish_retries")]
    pub publish_retries: u32,
    /// Delay between publish attempts
    #[serde(default = "default_retry_delay_ms")]
    pub retry_delay_ms: u64,
    /// Device ping interval in seconds, 0 disables the pinger
    #[serde(default = "default_ping_interval")]
    pub ping_interval_secs: u64,
}

fn default_publish_timeout_ms() -> u64 {
    5000
}

fn default_publish_retries() -> u32 {
    3
}

fn default_retry_delay_ms() -> u64 {
    200
}

fn default_ping_interval() -> u64 {
    10
}

/// Alert state engine settings
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AlertSection {
    /// Comment stored on counters created without one
    #[serde(default = "default_comment")]
    pub default_comment: String,
    /// Attempts for the current state swap before giving up
    #[serde(default = "default_max_swap_retries")]
    pub max_swap_retries: u32,
    /// Counter written at startup when the ledger is empty
    #[serde(default)]
    pub initial_counter: Option<i64>,
}

fn default_comment() -> String {
    "changed by system".to_string()
}

fn default_max_swap_retries() -> u32 {
    3
}

impl Default for AlertSection {
    fn default() -> Self {
        Self {
            default_comment: default_comment(),
            max_swap_retries: default_max_swap_retries(),
            initial_counter: None,
        }
    }
}

/// Server-side configuration of one smart device
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DeviceSeed {
    pub device_type: String,
    pub device_uid: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub device_addr: Option<String>,
    #[serde(default)]
    pub ignored: bool,
    pub config: serde_json::Value,
    /// Explicit fingerprint; computed from `config` when absent
    #[serde(default)]
    pub hash: Option<String>,
}

/// Configuration a simple device type receives while a state is current
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SimpleConfigSeed {
    pub device_type: String,
    pub state: String,
    pub config: serde_json::Value,
}

/// Configuration loading errors
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    FileRead(#[from] std::io::Error),
    #[error("Failed to parse TOML: {0}")]
    TomlParse(#[from] toml::de::Error),
    #[error("Environment variable not found: {0}")]
    EnvVarNotFound(String),
    #[error("Invalid service ID format: {0}")]
    InvalidServiceId(String),
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),
}

impl ControlConfig {
    /// Load configuration from TOML file and validate it
    pub fn load_from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        Self::from_toml_str(&content)
    }

    /// Parse and validate configuration from TOML text
    pub fn from_toml_str(content: &str) -> Result<Self, ConfigError> {
        let config: ControlConfig = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Check identity, broker URL and seed data consistency
    pub fn validate(&self) -> Result<(), ConfigError> {
        validate_service_id(&self.service.id)?;
        validate_broker_url(&self.mqtt.broker_url)?;

        if self.alert.max_swap_retries == 0 {
            return Err(ConfigError::InvalidConfig(
                "alert.max_swap_retries must be at least 1".to_string(),
            ));
        }

        self.validate_states()?;
        self.validate_devices()?;
        self.validate_simple_configs()
    }

    fn validate_states(&self) -> Result<(), ConfigError> {
        let mut names = HashSet::new();
        let mut orders = HashSet::new();
        let mut thresholds = HashSet::new();
        let mut current = 0;

        for state in &self.states {
            if state.name.is_empty() {
                return Err(ConfigError::InvalidConfig(
                    "state name cannot be empty".to_string(),
                ));
            }
            if !names.insert(state.name.as_str()) {
                return Err(ConfigError::InvalidConfig(format!(
                    "duplicate state name '{}'",
                    state.name
                )));
            }
            if !orders.insert(state.order) {
                return Err(ConfigError::InvalidConfig(format!(
                    "duplicate state order {}",
                    state.order
                )));
            }
            if state.threshold >= 0 && !thresholds.insert(state.threshold) {
                return Err(ConfigError::InvalidConfig(format!(
                    "duplicate in-game threshold {}",
                    state.threshold
                )));
            }
            if state.current {
                current += 1;
            }
        }

        if current > 1 {
            return Err(ConfigError::InvalidConfig(
                "at most one seeded state may be current".to_string(),
            ));
        }
        Ok(())
    }

    fn validate_devices(&self) -> Result<(), ConfigError> {
        let mut seen = HashSet::new();
        for device in &self.devices {
            if !matches!(classify(&device.device_type), DeviceKind::Smart(_)) {
                return Err(ConfigError::InvalidConfig(format!(
                    "device '{}.{}' is not a smart device type",
                    device.device_type, device.device_uid
                )));
            }
            if device.device_uid.is_empty() || device.device_uid.contains('.') {
                return Err(ConfigError::InvalidConfig(format!(
                    "invalid device uid '{}'",
                    device.device_uid
                )));
            }
            if !seen.insert((device.device_type.as_str(), device.device_uid.as_str())) {
                return Err(ConfigError::InvalidConfig(format!(
                    "duplicate device '{}.{}'",
                    device.device_type, device.device_uid
                )));
            }
        }
        Ok(())
    }

    fn validate_simple_configs(&self) -> Result<(), ConfigError> {
        for entry in &self.simple_configs {
            match classify(&entry.device_type) {
                DeviceKind::Simple(SimpleDevice::Scale) => {
                    return Err(ConfigError::InvalidConfig(
                        "scale configuration is derived from the alert counter".to_string(),
                    ));
                }
                DeviceKind::Simple(_) => {}
                _ => {
                    return Err(ConfigError::InvalidConfig(format!(
                        "'{}' is not a simple device type",
                        entry.device_type
                    )));
                }
            }
            if !self.states.iter().any(|s| s.name == entry.state) {
                return Err(ConfigError::InvalidConfig(format!(
                    "simple config for '{}' references unknown state '{}'",
                    entry.device_type, entry.state
                )));
            }
        }
        Ok(())
    }

    /// Helper method to get environment variable with consistent error handling
    fn get_env_var_optional(env_var_name: Option<&String>) -> Option<String> {
        env_var_name.and_then(|name| std::env::var(name).ok())
    }

    /// Get MQTT username from environment variable
    pub fn get_mqtt_username(&self) -> Option<String> {
        Self::get_env_var_optional(self.mqtt.username_env.as_ref())
    }

    /// Get MQTT password from environment variable
    pub fn get_mqtt_password(&self) -> Option<String> {
        Self::get_env_var_optional(self.mqtt.password_env.as_ref())
    }

    /// Get MQTT password, failing when the variable is configured but unset
    pub fn require_mqtt_password(&self) -> Result<Option<String>, ConfigError> {
        match &self.mqtt.password_env {
            Some(name) => std::env::var(name)
                .map(Some)
                .map_err(|_| ConfigError::EnvVarNotFound(name.clone())),
            None => Ok(None),
        }
    }

    /// Create a test configuration for unit testing
    #[cfg(test)]
    pub fn test_config() -> Self {
        let toml_content = r#"
[service]
id = "test-control"

[mqtt]
broker_url = "mqtt://localhost:1883"

[[states]]
name = "white"
order = 0
info = "out of game"
threshold = -1

[[states]]
name = "green"
order = 1
info = "normal"
threshold = 0
current = true

[[states]]
name = "red"
order = 2
info = "alarm"
threshold = 100
"#;
        toml::from_str(toml_content).expect("Test config should parse")
    }
}

/// Validate service ID format
fn validate_service_id(service_id: &str) -> Result<(), ConfigError> {
    let valid_chars = service_id
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || c == '.' || c == '_' || c == '-');

    if service_id.is_empty() || !valid_chars {
        return Err(ConfigError::InvalidServiceId(format!(
            "Service ID '{service_id}' must match pattern [a-zA-Z0-9._-]+"
        )));
    }

    Ok(())
}

fn validate_broker_url(broker_url: &str) -> Result<(), ConfigError> {
    let url = url::Url::parse(broker_url)
        .map_err(|e| ConfigError::InvalidConfig(format!("broker_url '{broker_url}': {e}")))?;
    match url.scheme() {
        "mqtt" | "mqtts" | "tcp" => Ok(()),
        other => Err(ConfigError::InvalidConfig(format!(
            "unsupported broker scheme '{other}'"
        ))),
    }
}
