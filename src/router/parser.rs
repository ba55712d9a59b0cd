//! Inbound message normalization
//!
//! Device replies arrive as `ask.<device_type>.<device_uid>.<command>` with a
//! JSON body. Smart devices report `timestamp`, `task_id`, `datahold` and
//! `hash`; simple devices send arbitrary top-level fields.

use crate::error::{ControlError, ControlResult};
use crate::observability::metrics;
use crate::protocol::{classify, split_routing_key, DeviceKind, RoutingKey, RoutingKeyMatch};
use crate::transport::MessageBody;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tracing::warn;

/// Timestamp of simple device events that report none
pub const MISSING_TIMESTAMP: i64 = 1;

/// Normalized device message
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DeviceEvent {
    pub device_type: String,
    pub device_uid: String,
    pub command: String,
    #[serde(default)]
    pub timestamp: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub task_id: Option<String>,
    #[serde(default = "empty_object")]
    pub datahold: Value,
    #[serde(default)]
    pub hash: String,
    /// Remaining top-level fields reported by simple devices
    #[serde(flatten)]
    pub fields: Map<String, Value>,
}

fn empty_object() -> Value {
    Value::Object(Map::new())
}

/// Result of parsing one inbound message
#[derive(Debug, Clone, PartialEq)]
pub enum ParsedMessage {
    Event(DeviceEvent),
    /// Routing key without the inbound marker; body returned unchanged
    Passthrough(MessageBody),
}

/// Stateless parser for inbound transport messages
#[derive(Debug, Clone, Copy, Default)]
pub struct MessageParser;

impl MessageParser {
    pub fn new() -> Self {
        Self
    }

    /// Parse a routing key and body into a [`DeviceEvent`] or a passthrough
    pub fn parse(&self, routing_key: &str, body: MessageBody) -> ControlResult<ParsedMessage> {
        let key = match split_routing_key(routing_key) {
            Ok(RoutingKeyMatch::Reply(key)) => key,
            Ok(RoutingKeyMatch::Internal) => return Ok(ParsedMessage::Passthrough(body)),
            Err(bad_key) => {
                metrics().malformed_routing_key();
                return Err(ControlError::malformed_routing_key(bad_key));
            }
        };

        let data = decode_payload(&key, &body);

        let event = match classify(&key.device_type) {
            DeviceKind::Smart(_) => smart_event(key, data),
            DeviceKind::Simple(_) => simple_event(key, data),
            DeviceKind::Unknown => {
                warn!(
                    device_type = %key.device_type,
                    device_uid = %key.device_uid,
                    "Unknown device type, handling as simple device"
                );
                metrics().unknown_device_type();
                simple_event(key, data)
            }
        };

        Ok(ParsedMessage::Event(event))
    }
}

/// Decode a message body into a JSON mapping.
///
/// Undecodable or non-mapping bodies are logged and replaced by an empty
/// mapping; they never fail the message.
pub fn decode_payload(key: &RoutingKey, body: &MessageBody) -> Map<String, Value> {
    let decoded = match body {
        MessageBody::Structured(value) => Ok(value.clone()),
        MessageBody::Text(text) => serde_json::from_str::<Value>(text),
    };

    match decoded {
        Ok(Value::Object(map)) => map,
        Ok(other) => {
            decode_failure(key, &format!("expected a JSON object, got {other}"));
            Map::new()
        }
        Err(e) => {
            decode_failure(key, &e.to_string());
            Map::new()
        }
    }
}

fn decode_failure(key: &RoutingKey, reason: &str) {
    let error = ControlError::PayloadDecodeFailure {
        message: reason.to_string(),
    };
    warn!(
        device_type = %key.device_type,
        device_uid = %key.device_uid,
        command = %key.command,
        error = %error,
        "Substituting empty payload"
    );
    metrics().payload_decode_failure();
}

/// Decode JSON objects and arrays embedded as strings, at any depth
pub fn decode_nested(value: Value) -> Value {
    match value {
        Value::String(text) => match serde_json::from_str::<Value>(&text) {
            Ok(inner @ (Value::Object(_) | Value::Array(_))) => decode_nested(inner),
            _ => Value::String(text),
        },
        Value::Object(map) => Value::Object(
            map.into_iter()
                .map(|(k, v)| (k, decode_nested(v)))
                .collect(),
        ),
        Value::Array(items) => Value::Array(items.into_iter().map(decode_nested).collect()),
        other => other,
    }
}

fn smart_event(key: RoutingKey, mut data: Map<String, Value>) -> DeviceEvent {
    let timestamp = data.get("timestamp").and_then(as_timestamp).unwrap_or(0);
    let task_id = data
        .get("task_id")
        .and_then(as_text)
        .unwrap_or_else(|| "0".to_string());
    let datahold = datahold_of(&key, &mut data);
    let hash = data.get("hash").and_then(as_text).unwrap_or_default();

    DeviceEvent {
        device_type: key.device_type,
        device_uid: key.device_uid,
        command: key.command,
        timestamp,
        task_id: Some(task_id),
        datahold,
        hash,
        fields: Map::new(),
    }
}

fn simple_event(key: RoutingKey, mut data: Map<String, Value>) -> DeviceEvent {
    let datahold = datahold_of(&key, &mut data);
    let timestamp = data
        .remove("timestamp")
        .as_ref()
        .and_then(as_timestamp)
        .or_else(|| datahold.get("timestamp").and_then(as_timestamp))
        .unwrap_or(MISSING_TIMESTAMP);
    let task_id = data.remove("task_id").as_ref().and_then(as_text);
    let hash = data
        .remove("hash")
        .as_ref()
        .and_then(as_text)
        .unwrap_or_default();
    for reserved in ["device_type", "device_uid", "command"] {
        data.remove(reserved);
    }

    DeviceEvent {
        device_type: key.device_type,
        device_uid: key.device_uid,
        command: key.command,
        timestamp,
        task_id,
        datahold,
        hash,
        fields: data,
    }
}

/// `datahold` is always a mapping; anything else is logged and emptied
fn datahold_of(key: &RoutingKey, data: &mut Map<String, Value>) -> Value {
    match data.remove("datahold").map(decode_nested) {
        Some(value @ Value::Object(_)) => value,
        Some(Value::Null) | None => empty_object(),
        Some(other) => {
            decode_failure(key, &format!("expected a JSON object in datahold, got {other}"));
            empty_object()
        }
    }
}

fn as_timestamp(value: &Value) -> Option<i64> {
    match value {
        Value::Number(n) => n.as_i64().or_else(|| n.as_f64().map(|f| f as i64)),
        Value::String(s) => s.trim().parse::<f64>().ok().map(|f| f as i64),
        _ => None,
    }
}

fn as_text(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        Value::Null => None,
        other => Some(other.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn parse(routing_key: &str, body: &str) -> ControlResult<ParsedMessage> {
        MessageParser::new().parse(routing_key, MessageBody::Text(body.to_string()))
    }

    fn event(parsed: ControlResult<ParsedMessage>) -> DeviceEvent {
        match parsed.unwrap() {
            ParsedMessage::Event(event) => event,
            other => panic!("expected event, got {other:?}"),
        }
    }

    #[test]
    fn test_smart_event_fields() {
        let event = event(parse(
            "ask.lock.A1.sup",
            r#"{"timestamp":100,"task_id":7,"datahold":{"open":false},"hash":"abc"}"#,
        ));
        assert_eq!(event.device_type, "lock");
        assert_eq!(event.device_uid, "A1");
        assert_eq!(event.command, "sup");
        assert_eq!(event.timestamp, 100);
        assert_eq!(event.task_id.as_deref(), Some("7"));
        assert_eq!(event.datahold, json!({"open": false}));
        assert_eq!(event.hash, "abc");
    }

    #[test]
    fn test_smart_event_defaults() {
        let event = event(parse("ask.terminal.T9.sup", "{}"));
        assert_eq!(event.timestamp, 0);
        assert_eq!(event.task_id.as_deref(), Some("0"));
        assert_eq!(event.datahold, json!({}));
        assert_eq!(event.hash, "");
    }

    #[test]
    fn test_nested_datahold_is_decoded() {
        let body = json!({"datahold": "{\"menu\": \"{\\\"items\\\": [1, 2]}\"}"}).to_string();
        let event = event(parse("ask.terminal.T1.sup", &body));
        assert_eq!(event.datahold, json!({"menu": {"items": [1, 2]}}));
    }

    #[test]
    fn test_non_mapping_datahold_is_emptied() {
        let before = metrics().get_metrics().messages.payload_decode_failures;

        let lock = event(parse(
            "ask.lock.A1.sup",
            r#"{"hash":"abc","datahold":"not json"}"#,
        ));
        assert_eq!(lock.datahold, json!({}));
        assert_eq!(lock.hash, "abc");

        let terminal = event(parse("ask.terminal.T1.sup", r#"{"datahold":42}"#));
        assert_eq!(terminal.datahold, json!({}));

        let light = event(parse("ask.light.L1.pong", r#"{"datahold":[1,2]}"#));
        assert_eq!(light.datahold, json!({}));

        assert!(metrics().get_metrics().messages.payload_decode_failures >= before + 3);
    }

    #[test]
    fn test_non_json_body_gives_empty_datahold() {
        let event = event(parse("ask.scale.A1.sup", "not json at all"));
        assert_eq!(event.datahold, json!({}));
        assert_eq!(event.timestamp, MISSING_TIMESTAMP);
    }

    #[test]
    fn test_simple_event_merges_fields() {
        let event = event(parse(
            "ask.power.P1.info",
            r#"{"voltage": 220, "datahold": {"timestamp": 55}}"#,
        ));
        assert_eq!(event.timestamp, 55);
        assert_eq!(event.fields.get("voltage"), Some(&json!(220)));
        assert!(event.task_id.is_none());
    }

    #[test]
    fn test_simple_event_top_level_timestamp_wins() {
        let event = event(parse(
            "ask.light.L1.sup",
            r#"{"timestamp": 10, "datahold": {"timestamp": 55}}"#,
        ));
        assert_eq!(event.timestamp, 10);
    }

    #[test]
    fn test_unknown_device_handled_as_simple() {
        let event = event(parse("ask.toaster.X1.sup", r#"{"heat": 3}"#));
        assert_eq!(event.device_type, "toaster");
        assert_eq!(event.fields.get("heat"), Some(&json!(3)));
    }

    #[test]
    fn test_structured_body_used_as_is() {
        let parsed = MessageParser::new()
            .parse(
                "ask.lock.A1.sup",
                MessageBody::Structured(json!({"hash": "h1"})),
            )
            .unwrap();
        let ParsedMessage::Event(event) = parsed else {
            panic!("expected event");
        };
        assert_eq!(event.hash, "h1");
    }

    #[test]
    fn test_passthrough_without_marker() {
        let parsed = parse("lock.A1.cup", "anything").unwrap();
        assert_eq!(
            parsed,
            ParsedMessage::Passthrough(MessageBody::Text("anything".to_string()))
        );
    }

    #[test]
    fn test_malformed_routing_key() {
        let err = parse("ask.lock.A1", "{}").unwrap_err();
        assert!(matches!(err, ControlError::MalformedRoutingKey { .. }));
        assert!(parse("ask.lock.A1.sup.x", "{}").is_err());
    }

    #[test]
    fn test_device_event_deserializes_with_defaults() {
        let event: DeviceEvent = serde_json::from_value(json!({
            "device_type": "lock",
            "device_uid": "A1",
            "command": "sup",
            "hash": "abc",
        }))
        .unwrap();
        assert_eq!(event.hash, "abc");
        assert_eq!(event.datahold, json!({}));
        assert!(event.fields.is_empty());
    }

    #[test]
    fn test_decode_nested_leaves_plain_strings() {
        assert_eq!(decode_nested(json!("123")), json!("123"));
        assert_eq!(decode_nested(json!("hello")), json!("hello"));
        assert_eq!(decode_nested(json!("[1]")), json!([1]));
    }
}
