//! Outbound device packets
//!
//! Every packet is a JSON object with `timestamp`, `task_id` and `datahold`;
//! config pushes to smart devices also carry the server's config `hash` so the
//! device can report it back in later status updates.

use super::topics::{device_routing_key, Command, BROADCAST_UID};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

/// Task id used for pushes to simple devices
pub const SIMPLE_TASK_ID: &str = "simple";

/// JSON body of an outbound packet
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PacketPayload {
    pub timestamp: i64,
    pub task_id: String,
    #[serde(default)]
    pub datahold: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hash: Option<String>,
}

/// A packet ready to hand to the transport
#[derive(Debug, Clone, PartialEq)]
pub struct OutboundPacket {
    pub routing_key: String,
    pub command: Command,
    pub payload: PacketPayload,
}

impl OutboundPacket {
    /// Full configuration push to `<device_type>.<device_uid>.cup`
    pub fn config_push(
        device_type: &str,
        device_uid: &str,
        datahold: Value,
        task_id: String,
        hash: Option<String>,
    ) -> Self {
        Self {
            routing_key: device_routing_key(device_type, device_uid, Command::Cup),
            command: Command::Cup,
            payload: PacketPayload {
                timestamp: now_timestamp(),
                task_id,
                datahold,
                hash,
            },
        }
    }

    /// Liveness probe for every device of a type
    pub fn ping(device_type: &str) -> Self {
        Self {
            routing_key: device_routing_key(device_type, BROADCAST_UID, Command::Ping),
            command: Command::Ping,
            payload: PacketPayload {
                timestamp: now_timestamp(),
                task_id: new_task_id("ping"),
                datahold: Value::Object(Default::default()),
                hash: None,
            },
        }
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>, serde_json::Error> {
        serde_json::to_vec(&self.payload)
    }
}

/// Unique task id: `<name>-<random hex>`
pub fn new_task_id(name: &str) -> String {
    format!("{name}-{}", Uuid::new_v4().simple())
}

/// Task id for a device push, named after the last four uid characters
pub fn device_task_id(device_uid: &str) -> String {
    let chars: Vec<char> = device_uid.chars().collect();
    let suffix: String = chars[chars.len().saturating_sub(4)..].iter().collect();
    new_task_id(&suffix)
}

/// Current unix timestamp in seconds
pub fn now_timestamp() -> i64 {
    Utc::now().timestamp()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_config_push_packet() {
        let packet = OutboundPacket::config_push(
            "lock",
            "A1",
            json!({"closed": true}),
            "A1-x".to_string(),
            Some("abc".to_string()),
        );
        assert_eq!(packet.routing_key, "lock.A1.cup");
        assert_eq!(packet.command, Command::Cup);

        let body: Value = serde_json::from_slice(&packet.to_bytes().unwrap()).unwrap();
        assert_eq!(body["datahold"]["closed"], true);
        assert_eq!(body["hash"], "abc");
        assert_eq!(body["task_id"], "A1-x");
        assert!(body["timestamp"].as_i64().unwrap() > 0);
    }

    #[test]
    fn test_hash_omitted_when_absent() {
        let packet = OutboundPacket::config_push(
            "power",
            BROADCAST_UID,
            json!({"on": true}),
            SIMPLE_TASK_ID.to_string(),
            None,
        );
        let body: Value = serde_json::from_slice(&packet.to_bytes().unwrap()).unwrap();
        assert!(body.get("hash").is_none());
        assert_eq!(packet.routing_key, "power.all.cup");
    }

    #[test]
    fn test_ping_packet() {
        let packet = OutboundPacket::ping("terminal");
        assert_eq!(packet.routing_key, "terminal.all.ping");
        assert!(packet.payload.task_id.starts_with("ping-"));
    }

    #[test]
    fn test_device_task_id_uses_uid_suffix() {
        assert!(device_task_id("term-00ab12").starts_with("ab12-"));
        assert!(device_task_id("A1").starts_with("A1-"));
        assert_ne!(device_task_id("A1"), device_task_id("A1"));
    }
}
