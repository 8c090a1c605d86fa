//! Transport message envelope and integrity checksum.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};
use uuid::Uuid;

use super::TransportError;

/// Resubmissions allowed before a buffered message is dropped.
pub const DEFAULT_MAX_RETRIES: u32 = 5;

/// Message type used by latency probes. Receivers acknowledge but do not
/// forward it.
pub const HEARTBEAT_TYPE: &str = "heartbeat";

/// A unit of outbound or inbound traffic.
///
/// The checksum is computed at construction over the canonical form of the
/// payload and must be re-validated by every receiver. Only `retry_count`
/// changes after construction.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransportMessage {
    pub msg_id: String,
    pub timestamp: DateTime<Utc>,
    pub msg_type: String,
    pub payload: Value,
    pub checksum: String,
    #[serde(default)]
    pub priority: i32,
    #[serde(default)]
    pub retry_count: u32,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
}

fn default_max_retries() -> u32 {
    DEFAULT_MAX_RETRIES
}

impl TransportMessage {
    pub fn new(msg_type: impl Into<String>, payload: Value) -> Self {
        let checksum = compute_checksum(&payload);
        Self {
            msg_id: Uuid::new_v4().to_string(),
            timestamp: Utc::now(),
            msg_type: msg_type.into(),
            payload,
            checksum,
            priority: 0,
            retry_count: 0,
            max_retries: DEFAULT_MAX_RETRIES,
        }
    }

    pub fn heartbeat() -> Self {
        Self::new(HEARTBEAT_TYPE, Value::Null)
    }

    #[must_use]
    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    #[must_use]
    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    pub fn is_heartbeat(&self) -> bool {
        self.msg_type == HEARTBEAT_TYPE
    }

    /// Recompute the payload hash and compare with the carried checksum.
    pub fn validate_checksum(&self) -> bool {
        compute_checksum(&self.payload) == self.checksum
    }

    /// First eight hex digits of the id, used in spool file names.
    pub fn short_id(&self) -> String {
        self.msg_id
            .chars()
            .filter(|c| c.is_ascii_hexdigit())
            .take(8)
            .collect()
    }

    /// Canonical JSON bytes (keys sorted at every level).
    pub fn encode(&self) -> Result<Vec<u8>, TransportError> {
        let value = serde_json::to_value(self)?;
        Ok(canonical_json(&value).into_bytes())
    }

    /// Parse without checking integrity.
    pub fn decode(bytes: &[u8]) -> Result<Self, TransportError> {
        Ok(serde_json::from_slice(bytes)?)
    }

    /// Parse and reject anything whose checksum does not match.
    pub fn decode_verified(bytes: &[u8]) -> Result<Self, TransportError> {
        let message = Self::decode(bytes)?;
        if !message.validate_checksum() {
            return Err(TransportError::Integrity {
                msg_id: message.msg_id,
            });
        }
        Ok(message)
    }
}

/// SHA-256 (hex) of the canonical payload encoding.
pub fn compute_checksum(payload: &Value) -> String {
    let digest = Sha256::digest(canonical_json(payload).as_bytes());
    hex::encode(digest)
}

/// Deterministic JSON: object keys sorted, no insignificant whitespace.
///
/// Sorting is done explicitly so the output does not depend on whether
/// `serde_json` was built with `preserve_order`.
pub fn canonical_json(value: &Value) -> String {
    let mut out = String::new();
    write_canonical(value, &mut out);
    out
}

fn write_canonical(value: &Value, out: &mut String) {
    match value {
        Value::Object(map) => {
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();
            out.push('{');
            for (i, key) in keys.into_iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                out.push_str(&Value::String(key.clone()).to_string());
                out.push(':');
                write_canonical(&map[key], out);
            }
            out.push('}');
        }
        Value::Array(items) => {
            out.push('[');
            for (i, item) in items.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                write_canonical(item, out);
            }
            out.push(']');
        }
        scalar => out.push_str(&scalar.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_checksum_ignores_key_order() {
        let a = json!({"symbol": "EURUSD", "volume": 1.0, "meta": {"b": 1, "a": 2}});
        let b = json!({"meta": {"a": 2, "b": 1}, "volume": 1.0, "symbol": "EURUSD"});
        assert_eq!(compute_checksum(&a), compute_checksum(&b));
        assert_eq!(
            canonical_json(&a),
            r#"{"meta":{"a":2,"b":1},"symbol":"EURUSD","volume":1.0}"#
        );
    }

    #[test]
    fn test_encode_decode_preserves_fields() {
        let msg = TransportMessage::new("order", json!({"ticket": 42, "side": "buy"}))
            .with_priority(7)
            .with_max_retries(3);
        let bytes = msg.encode().unwrap();
        let decoded = TransportMessage::decode_verified(&bytes).unwrap();
        assert_eq!(decoded, msg);
        assert!(decoded.validate_checksum());
    }

    #[test]
    fn test_tampered_payload_is_rejected() {
        let msg = TransportMessage::new("order", json!({"ticket": 42}));
        let text = String::from_utf8(msg.encode().unwrap()).unwrap();
        let tampered = text.replace("\"ticket\":42", "\"ticket\":43");
        assert_ne!(text, tampered);

        match TransportMessage::decode_verified(tampered.as_bytes()) {
            Err(TransportError::Integrity { msg_id }) => assert_eq!(msg_id, msg.msg_id),
            other => panic!("expected integrity failure, got {:?}", other),
        }
    }

    #[test]
    fn test_short_id_is_hex_prefix() {
        let msg = TransportMessage::heartbeat();
        let short = msg.short_id();
        assert_eq!(short.len(), 8);
        assert!(msg.msg_id.starts_with(&short));
        assert!(msg.is_heartbeat());
    }
}
