//! Routing key grammar for device channels
//!
//! Devices publish replies to `ask.<device_type>.<device_uid>.<command>` and
//! listen on `<device_type>.<device_uid>.<command>`. On the MQTT wire the same
//! keys use `/` separators; the broker bridge (and our transport) converts
//! between the two forms.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// First routing key segment of every device reply
pub const INBOUND_MARKER: &str = "ask";

/// Device uid addressing every device of a type
pub const BROADCAST_UID: &str = "all";

/// Device channel commands
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Command {
    /// Config push (or config request when sent by a device)
    Cup,
    /// Status update without configuration payload
    Sup,
    Info,
    Ack,
    Nack,
    Ping,
    Pong,
}

impl Command {
    /// Commands the inbound queue set is bound to
    pub const INBOUND: [Command; 6] = [
        Command::Cup,
        Command::Sup,
        Command::Info,
        Command::Ack,
        Command::Nack,
        Command::Pong,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Cup => "cup",
            Self::Sup => "sup",
            Self::Info => "info",
            Self::Ack => "ack",
            Self::Nack => "nack",
            Self::Ping => "ping",
            Self::Pong => "pong",
        }
    }
}

#[derive(Debug, Error, PartialEq)]
#[error("unknown command '{0}'")]
pub struct UnknownCommand(pub String);

impl FromStr for Command {
    type Err = UnknownCommand;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "cup" => Ok(Self::Cup),
            "sup" => Ok(Self::Sup),
            "info" => Ok(Self::Info),
            "ack" => Ok(Self::Ack),
            "nack" => Ok(Self::Nack),
            "ping" => Ok(Self::Ping),
            "pong" => Ok(Self::Pong),
            other => Err(UnknownCommand(other.to_string())),
        }
    }
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Parsed `<device_type>.<device_uid>.<command>` triple
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RoutingKey {
    pub device_type: String,
    pub device_uid: String,
    pub command: String,
}

/// Result of splitting an inbound routing key
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RoutingKeyMatch {
    /// Device reply carrying the inbound marker
    Reply(RoutingKey),
    /// Key without the marker; payload is assumed already normalized
    Internal,
}

/// Split a routing key, stripping the inbound marker.
///
/// Returns `Err` with the offending key when a marked key does not have
/// exactly three remaining segments.
pub fn split_routing_key(routing_key: &str) -> Result<RoutingKeyMatch, String> {
    let mut segments = routing_key.split('.');
    if segments.next() != Some(INBOUND_MARKER) {
        return Ok(RoutingKeyMatch::Internal);
    }

    let rest: Vec<&str> = segments.collect();
    match rest.as_slice() {
        [device_type, device_uid, command] => Ok(RoutingKeyMatch::Reply(RoutingKey {
            device_type: (*device_type).to_string(),
            device_uid: (*device_uid).to_string(),
            command: (*command).to_string(),
        })),
        _ => Err(routing_key.to_string()),
    }
}

/// Build outbound routing key: `<device_type>.<device_uid>.<command>`
pub fn device_routing_key(device_type: &str, device_uid: &str, command: Command) -> String {
    format!("{device_type}.{device_uid}.{command}")
}

/// Convert an MQTT topic (`ask/lock/A1/sup`) to a routing key (`ask.lock.A1.sup`)
pub fn mqtt_topic_to_routing_key(topic: &str) -> String {
    topic.trim_matches('/').replace('/', ".")
}

/// Convert a routing key to an MQTT topic
pub fn routing_key_to_mqtt_topic(routing_key: &str) -> String {
    routing_key.replace('.', "/")
}

/// MQTT subscription filter for one inbound command queue
pub fn inbound_filter(command: Command, share_group: Option<&str>) -> String {
    let filter = format!("{INBOUND_MARKER}/+/+/{command}");
    match share_group {
        Some(group) => format!("$share/{group}/{filter}"),
        None => filter,
    }
}
