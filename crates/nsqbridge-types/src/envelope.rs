//! Envelope codec
//!
//! Converts application payloads to the outbound wire envelope and turns
//! broker bodies back into handler data. Both directions are infallible.

use bytes::Bytes;
use chrono::{SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::message::{MessageId, Payload};

/// Component name stamped on envelopes when the caller does not supply one
pub const DEFAULT_COMPONENT: &str = "nsq-bridge";

/// Envelope metadata
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Meta {
    /// Correlation id carried across services
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub transaction_id: Option<String>,

    /// Name of the emitting component
    pub component: String,

    /// Dispatch time, RFC 3339 UTC
    pub timestamp: String,

    /// Any other caller-supplied keys
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// Outbound wire envelope
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutboundEnvelope {
    pub meta: Meta,
    pub data: Value,
    #[serde(default)]
    pub options: Map<String, Value>,
}

impl OutboundEnvelope {
    /// Serialize the part of the envelope the broker receives
    ///
    /// Options steer the publish itself and are not sent.
    pub fn to_body(&self) -> serde_json::Result<Bytes> {
        #[derive(Serialize)]
        struct Body<'a> {
            meta: &'a Meta,
            data: &'a Value,
        }

        let bytes = serde_json::to_vec(&Body {
            meta: &self.meta,
            data: &self.data,
        })?;
        Ok(Bytes::from(bytes))
    }
}

/// Build an outbound envelope from an application payload
///
/// `options` and `meta` are lifted out of an object payload. The payload's
/// `meta` is merged over `supplied_meta`; `timestamp` is always overwritten.
pub fn encode(payload: Value, supplied_meta: Option<Map<String, Value>>) -> OutboundEnvelope {
    let mut merged = supplied_meta.unwrap_or_default();

    let (data, options) = match payload {
        Value::Object(mut fields) => {
            let options = match fields.remove("options") {
                Some(Value::Object(options)) => options,
                _ => Map::new(),
            };
            if let Some(Value::Object(payload_meta)) = fields.remove("meta") {
                merged.extend(payload_meta);
            }
            (Value::Object(fields), options)
        }
        other => (other, Map::new()),
    };

    let transaction_id = match merged.remove("transactionId") {
        Some(Value::String(id)) => Some(id),
        Some(Value::Null) | None => None,
        Some(other) => Some(other.to_string()),
    };
    let component = match merged.remove("component") {
        Some(Value::String(component)) if !component.is_empty() => component,
        _ => DEFAULT_COMPONENT.to_string(),
    };
    merged.remove("timestamp");

    OutboundEnvelope {
        meta: Meta {
            transaction_id,
            component,
            timestamp: Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true),
            extra: merged,
        },
        data,
        options,
    }
}

/// Decoded inbound message
#[derive(Debug, Clone, PartialEq)]
pub struct IncomingPacket<P> {
    pub id: MessageId,
    pub data: Payload,
    /// Routing pattern supplied by the caller, never read from the body
    pub pattern: P,
}

/// Decode a broker body, falling back to the raw bytes when it is not JSON
pub fn decode<P>(id: MessageId, body: &Bytes, pattern: P) -> IncomingPacket<P> {
    let data = match serde_json::from_slice::<Value>(body) {
        Ok(value) => Payload::Json(value),
        Err(_) => Payload::Raw(body.clone()),
    };

    IncomingPacket { id, data, pattern }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::DateTime;
    use serde_json::json;

    fn object(value: Value) -> Map<String, Value> {
        match value {
            Value::Object(map) => map,
            _ => panic!("expected object"),
        }
    }

    #[test]
    fn test_encode_without_meta() {
        let envelope = encode(json!({"ipsum": "lorem02"}), None);

        assert_eq!(envelope.data, json!({"ipsum": "lorem02"}));
        assert_eq!(envelope.meta.component, DEFAULT_COMPONENT);
        assert_eq!(envelope.meta.transaction_id, None);
        assert!(envelope.options.is_empty());

        let stamped = DateTime::parse_from_rfc3339(&envelope.meta.timestamp).unwrap();
        let age = Utc::now().signed_duration_since(stamped);
        assert!(age.num_seconds() < 5);
        assert!(envelope.meta.timestamp.ends_with('Z'));
    }

    #[test]
    fn test_encode_payload_meta_is_extracted() {
        let envelope = encode(
            json!({
                "ipsum": "lorem",
                "meta": {"component": "my-component", "foo": "bar", "timestamp": "yesterday"}
            }),
            None,
        );

        assert_eq!(envelope.data, json!({"ipsum": "lorem"}));
        assert_eq!(envelope.meta.component, "my-component");
        assert_eq!(envelope.meta.extra.get("foo"), Some(&json!("bar")));
        assert_ne!(envelope.meta.timestamp, "yesterday");
    }

    #[test]
    fn test_encode_options_are_extracted() {
        let envelope = encode(
            json!({"ipsum": "lorem03", "options": {"retry": {"retries": 3}}}),
            None,
        );

        assert_eq!(envelope.data, json!({"ipsum": "lorem03"}));
        assert_eq!(envelope.options.get("retry"), Some(&json!({"retries": 3})));
    }

    #[test]
    fn test_encode_merges_supplied_meta() {
        let supplied = object(json!({"transactionId": "tx-1", "region": "eu", "component": "base"}));
        let envelope = encode(json!({"a": 1, "meta": {"component": "override"}}), Some(supplied));

        assert_eq!(envelope.meta.transaction_id.as_deref(), Some("tx-1"));
        assert_eq!(envelope.meta.component, "override");
        assert_eq!(envelope.meta.extra.get("region"), Some(&json!("eu")));
    }

    #[test]
    fn test_encode_non_object_payload() {
        let envelope = encode(json!("just a string"), None);
        assert_eq!(envelope.data, json!("just a string"));
        assert!(envelope.options.is_empty());
    }

    #[test]
    fn test_body_excludes_options() {
        let envelope = encode(json!({"x": 1, "options": {"delay": 10}}), None);
        let body: Value = serde_json::from_slice(&envelope.to_body().unwrap()).unwrap();

        assert_eq!(body["data"], json!({"x": 1}));
        assert_eq!(body["meta"]["component"], json!(DEFAULT_COMPONENT));
        assert!(body.get("options").is_none());
    }

    #[test]
    fn test_decode_json_and_raw() {
        let json_body = Bytes::from_static(br#"{"eventId":"e1","foo":"bar"}"#);
        let packet = decode(MessageId::from("0123456789abcdef"), &json_body, ("t", "c"));
        assert_eq!(packet.data, Payload::Json(json!({"eventId": "e1", "foo": "bar"})));
        assert_eq!(packet.pattern, ("t", "c"));

        let raw_body = Bytes::from_static(b"plain text");
        let packet = decode(MessageId::from("0123456789abcdef"), &raw_body, ());
        assert_eq!(packet.data, Payload::Raw(raw_body));
    }
}
