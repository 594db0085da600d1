//! Request envelopes and correlated result messages
//!
//! The envelope is the only shape the bridge inspects. Its `payload` is
//! handed to the operation untouched, and the `request_id` is echoed on the
//! result so callers can correlate it.

use crate::error::BridgeError;
use chrono::{SecondsFormat, Utc};
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;
use strum::{AsRefStr, Display, EnumString};
use uuid::Uuid;

/// A decoded request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RequestEnvelope {
    /// Correlation key for the whole transaction (caller generated).
    pub request_id: String,
    /// Logical endpoint, e.g. `/player/get-by-name`.
    pub endpoint: String,
    /// Method name on the endpoint.
    #[serde(default)]
    pub method: String,
    /// Operation-specific payload, opaque to the bridge.
    #[serde(default)]
    pub payload: Value,
    /// Caller timestamp in epoch milliseconds.
    #[serde(default)]
    pub timestamp: i64,
}

impl RequestEnvelope {
    /// Create an envelope with a fresh request id.
    pub fn new(endpoint: impl Into<String>, method: impl Into<String>, payload: Value) -> Self {
        Self::with_request_id(Uuid::new_v4().to_string(), endpoint, method, payload)
    }

    /// Create an envelope with an explicit request id.
    pub fn with_request_id(
        request_id: impl Into<String>,
        endpoint: impl Into<String>,
        method: impl Into<String>,
        payload: Value,
    ) -> Self {
        Self {
            request_id: request_id.into(),
            endpoint: endpoint.into(),
            method: method.into(),
            payload,
            timestamp: Utc::now().timestamp_millis(),
        }
    }

    /// Decode raw delivery bytes.
    ///
    /// Fails on malformed JSON, missing required fields, or a blank request id.
    pub fn decode(bytes: &[u8]) -> Result<Self, BridgeError> {
        let envelope: RequestEnvelope =
            serde_json::from_slice(bytes).map_err(|e| BridgeError::Decode(e.to_string()))?;

        if envelope.request_id.trim().is_empty() {
            return Err(BridgeError::Decode("requestId is empty".to_string()));
        }

        Ok(envelope)
    }

    /// Encode for publishing.
    pub fn encode(&self) -> Result<Vec<u8>, BridgeError> {
        Ok(serde_json::to_vec(self)?)
    }
}

/// Outcome status of a result message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[derive(Display, AsRefStr, EnumString)]
#[strum(serialize_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum ResultStatus {
    Completed,
    Failed,
}

const UNKNOWN_ERROR: &str = "unknown error";

/// Correlated outcome published back to the caller.
///
/// `completed` results always carry `data` and never `error`; `failed`
/// results always carry `error` and never `data`.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ResultMessage {
    request_id: String,
    status: ResultStatus,
    data: Option<Value>,
    error: Option<String>,
    timestamp: String,
    source: String,
}

impl ResultMessage {
    /// Successful outcome. A JSON `null` output is reported as `true`.
    pub fn completed(request_id: impl Into<String>, data: Value, source: impl Into<String>) -> Self {
        let data = if data.is_null() { Value::Bool(true) } else { data };
        Self {
            request_id: request_id.into(),
            status: ResultStatus::Completed,
            data: Some(data),
            error: None,
            timestamp: now_iso8601(),
            source: source.into(),
        }
    }

    /// Failed outcome.
    pub fn failed(
        request_id: impl Into<String>,
        error: impl Into<String>,
        source: impl Into<String>,
    ) -> Self {
        let error = error.into();
        let error = if error.trim().is_empty() {
            UNKNOWN_ERROR.to_string()
        } else {
            error
        };
        Self {
            request_id: request_id.into(),
            status: ResultStatus::Failed,
            data: None,
            error: Some(error),
            timestamp: now_iso8601(),
            source: source.into(),
        }
    }

    pub fn request_id(&self) -> &str {
        &self.request_id
    }

    pub fn status(&self) -> ResultStatus {
        self.status
    }

    pub fn data(&self) -> Option<&Value> {
        self.data.as_ref()
    }

    pub fn error(&self) -> Option<&str> {
        self.error.as_deref()
    }

    pub fn timestamp(&self) -> &str {
        &self.timestamp
    }

    pub fn source(&self) -> &str {
        &self.source
    }

    pub fn is_completed(&self) -> bool {
        self.status == ResultStatus::Completed
    }

    pub fn encode(&self) -> Result<Vec<u8>, BridgeError> {
        Ok(serde_json::to_vec(self)?)
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, BridgeError> {
        serde_json::from_slice(bytes).map_err(|e| BridgeError::Decode(e.to_string()))
    }
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawResultMessage {
    request_id: String,
    status: ResultStatus,
    #[serde(default)]
    data: Option<Value>,
    #[serde(default)]
    error: Option<String>,
    timestamp: String,
    source: String,
}

impl<'de> Deserialize<'de> for ResultMessage {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        use serde::de::Error;

        let raw = RawResultMessage::deserialize(deserializer)?;
        let consistent = match raw.status {
            ResultStatus::Completed => raw.data.is_some() && raw.error.is_none(),
            ResultStatus::Failed => raw.data.is_none() && raw.error.is_some(),
        };
        if !consistent {
            return Err(D::Error::custom(format!(
                "result {} violates status exclusivity",
                raw.request_id
            )));
        }

        Ok(Self {
            request_id: raw.request_id,
            status: raw.status,
            data: raw.data,
            error: raw.error,
            timestamp: raw.timestamp,
            source: raw.source,
        })
    }
}

fn now_iso8601() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true)
}

/// An exchange/routing-key pair. On Redis Streams it maps to one stream key.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Destination {
    pub exchange: String,
    pub routing_key: String,
}

impl Destination {
    pub fn new(exchange: impl Into<String>, routing_key: impl Into<String>) -> Self {
        Self {
            exchange: exchange.into(),
            routing_key: routing_key.into(),
        }
    }

    /// Stream key for this destination: `<exchange>:<routing_key>`.
    pub fn stream_key(&self) -> String {
        format!("{}:{}", self.exchange, self.routing_key)
    }
}

impl std::fmt::Display for Destination {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.exchange, self.routing_key)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_decode_envelope() {
        let bytes = br#"{"requestId":"r1","endpoint":"/player/get-by-name","method":"GET","payload":"Alice","timestamp":1700000000000}"#;
        let envelope = RequestEnvelope::decode(bytes).unwrap();

        assert_eq!(envelope.request_id, "r1");
        assert_eq!(envelope.endpoint, "/player/get-by-name");
        assert_eq!(envelope.payload, json!("Alice"));
        assert_eq!(envelope.timestamp, 1_700_000_000_000);
    }

    #[test]
    fn test_decode_defaults_missing_payload() {
        let bytes = br#"{"requestId":"r2","endpoint":"/player/get-all"}"#;
        let envelope = RequestEnvelope::decode(bytes).unwrap();

        assert_eq!(envelope.payload, Value::Null);
        assert_eq!(envelope.method, "");
    }

    #[test]
    fn test_decode_rejects_garbage() {
        assert!(matches!(
            RequestEnvelope::decode(b"\xff\xfenot json"),
            Err(BridgeError::Decode(_))
        ));
        assert!(matches!(
            RequestEnvelope::decode(br#"{"endpoint":"/x"}"#),
            Err(BridgeError::Decode(_))
        ));
        assert!(matches!(
            RequestEnvelope::decode(br#"{"requestId":"  ","endpoint":"/x"}"#),
            Err(BridgeError::Decode(_))
        ));
    }

    #[test]
    fn test_payload_passes_through_untouched() {
        let payload = json!({"name": "Alice", "nested": {"list": [1, 2.5, null, "x"]}});
        let envelope = RequestEnvelope::new("/player/insert", "POST", payload.clone());
        let decoded = RequestEnvelope::decode(&envelope.encode().unwrap()).unwrap();

        assert_eq!(decoded.payload, payload);
        assert_eq!(decoded.request_id, envelope.request_id);
    }

    #[test]
    fn test_completed_result_shape() {
        let result = ResultMessage::completed("r1", json!({"name": "Alice"}), "rpc-bridge");
        let value: Value = serde_json::from_slice(&result.encode().unwrap()).unwrap();

        assert_eq!(value["requestId"], "r1");
        assert_eq!(value["status"], "completed");
        assert_eq!(value["data"]["name"], "Alice");
        assert_eq!(value["error"], Value::Null);
        assert_eq!(value["source"], "rpc-bridge");
        assert!(value["timestamp"].as_str().unwrap().ends_with('Z'));
    }

    #[test]
    fn test_status_exclusivity_by_construction() {
        let completed = ResultMessage::completed("r1", Value::Null, "src");
        assert_eq!(completed.data(), Some(&Value::Bool(true)));
        assert!(completed.error().is_none());

        let failed = ResultMessage::failed("r2", "", "src");
        assert_eq!(failed.error(), Some("unknown error"));
        assert!(failed.data().is_none());
    }

    #[test]
    fn test_result_decode_rejects_inconsistent_message() {
        let both = br#"{"requestId":"r","status":"completed","data":1,"error":"x","timestamp":"t","source":"s"}"#;
        assert!(ResultMessage::decode(both).is_err());

        let neither = br#"{"requestId":"r","status":"failed","data":null,"error":null,"timestamp":"t","source":"s"}"#;
        assert!(ResultMessage::decode(neither).is_err());

        let ok = br#"{"requestId":"r","status":"failed","data":null,"error":"boom","timestamp":"t","source":"s"}"#;
        let result = ResultMessage::decode(ok).unwrap();
        assert_eq!(result.status(), ResultStatus::Failed);
        assert_eq!(result.error(), Some("boom"));
    }

    #[test]
    fn test_destination_stream_key() {
        let destination = Destination::new("bridge.results", "result");
        assert_eq!(destination.stream_key(), "bridge.results:result");
        assert_eq!(destination.to_string(), "bridge.results/result");
    }
}
