//! Device records kept by the persistence layer
//!
//! Smart devices own a server-side configuration and its fingerprint. Every
//! device that talks to the server gets a liveness record.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};

/// Attributes shared by every device record
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DeviceAttributes {
    pub name: String,
    pub device_type: String,
    pub device_addr: Option<String>,
    /// Last registration time
    pub timestamp: DateTime<Utc>,
    /// Excluded from configuration pushes
    pub ignored: bool,
}

/// Stored configuration of one smart device
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DeviceConfigRecord {
    pub device_uid: String,
    pub attributes: DeviceAttributes,
    pub config: Value,
    pub hash: String,
}

impl DeviceConfigRecord {
    pub fn device_type(&self) -> &str {
        &self.attributes.device_type
    }

    pub fn is_ignored(&self) -> bool {
        self.attributes.ignored
    }
}

/// Last-seen liveness record
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DeviceStatusRecord {
    pub device_type: String,
    pub device_uid: String,
    pub command: String,
    pub hash: String,
    /// Device-reported unix timestamp, or the receive time when absent
    pub timestamp: i64,
    #[serde(default)]
    pub datahold: Value,
}

/// Hex SHA-256 of the canonical JSON encoding of a config payload.
///
/// `serde_json` maps keep their keys sorted, so equal payloads always produce
/// equal fingerprints regardless of the order they were written in.
pub fn config_fingerprint(config: &Value) -> String {
    let mut hasher = Sha256::new();
    hasher.update(config.to_string().as_bytes());
    hex::encode(hasher.finalize())
}
