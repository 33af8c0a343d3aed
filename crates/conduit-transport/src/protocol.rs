//! Envelope exchanged with agents over the persistent transport.

use chrono::{DateTime, Utc};
use conduit_core::{ConduitError, ConduitResult};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Liveness probe, sent by either side.
pub const HEARTBEAT: &str = "heartbeat";
/// Reply to [`HEARTBEAT`], echoing its correlation id.
pub const HEARTBEAT_RESPONSE: &str = "heartbeat_response";
/// First frame the client sends after the socket opens.
pub const HANDSHAKE: &str = "connection_handshake";
/// Agent's acceptance of the handshake.
pub const ACKNOWLEDGED: &str = "connection_acknowledged";
/// Unsolicited notification from an agent.
pub const EVENT: &str = "event";
/// Business-level failure reported in place of a response.
pub const ERROR: &str = "error";

const REQUEST_SUFFIX: &str = "_request";
const RESPONSE_SUFFIX: &str = "_response";

/// One JSON text frame on the persistent transport.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    /// Frame type, serialized as `type`.
    #[serde(rename = "type")]
    pub msg_type: String,
    /// Pairs a response with its request.
    #[serde(default)]
    pub correlation_id: Option<String>,
    /// Frame body; an empty object when absent.
    #[serde(default = "empty_object")]
    pub payload: Value,
    /// Sender's wall-clock time.
    #[serde(default = "Utc::now")]
    pub timestamp: DateTime<Utc>,
    /// Set on unsolicited `event` frames.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub event_name: Option<String>,
}

fn empty_object() -> Value {
    Value::Object(serde_json::Map::new())
}

/// Classification of an envelope by its `type` field.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MessageKind {
    /// `heartbeat`
    Heartbeat,
    /// `heartbeat_response`
    HeartbeatResponse,
    /// `connection_handshake`
    Handshake,
    /// `connection_acknowledged`
    Acknowledged,
    /// `event`
    Event,
    /// `error`
    Error,
    /// `<capability>_request`
    Request(String),
    /// `<capability>_response`
    Response(String),
    /// Anything else, by its raw type.
    Other(String),
}

impl Envelope {
    /// A frame of `msg_type` with no correlation id.
    pub fn new(msg_type: impl Into<String>, payload: Value) -> Self {
        Self {
            msg_type: msg_type.into(),
            correlation_id: None,
            payload,
            timestamp: Utc::now(),
            event_name: None,
        }
    }

    /// Set the correlation id.
    pub fn with_correlation_id(mut self, id: impl Into<String>) -> Self {
        self.correlation_id = Some(id.into());
        self
    }

    /// A `<capability>_request` with a fresh correlation id.
    pub fn request(capability: &str, payload: Value) -> Self {
        Self::new(format!("{capability}{REQUEST_SUFFIX}"), payload)
            .with_correlation_id(new_correlation_id())
    }

    /// The `<capability>_response` answering `request`.
    pub fn response_to(request: &Envelope, payload: Value) -> Self {
        let msg_type = match request.kind() {
            MessageKind::Request(capability) => format!("{capability}{RESPONSE_SUFFIX}"),
            _ => format!("{}{RESPONSE_SUFFIX}", request.msg_type),
        };
        let mut response = Self::new(msg_type, payload);
        response.correlation_id = request.correlation_id.clone();
        response
    }

    /// A liveness ping with a fresh correlation id.
    pub fn heartbeat() -> Self {
        Self::new(HEARTBEAT, empty_object()).with_correlation_id(new_correlation_id())
    }

    /// The pong for a ping with `correlation_id`.
    pub fn heartbeat_response(correlation_id: Option<String>) -> Self {
        let mut env = Self::new(HEARTBEAT_RESPONSE, empty_object());
        env.correlation_id = correlation_id;
        env
    }

    /// Client hello announcing who is connecting and what it expects to call.
    pub fn handshake(agent: &str, capabilities: &[String]) -> Self {
        Self::new(
            HANDSHAKE,
            serde_json::json!({ "agent": agent, "capabilities": capabilities }),
        )
        .with_correlation_id(new_correlation_id())
    }

    /// Server reply completing a handshake.
    pub fn acknowledged(correlation_id: Option<String>) -> Self {
        let mut env = Self::new(ACKNOWLEDGED, empty_object());
        env.correlation_id = correlation_id;
        env
    }

    /// An unsolicited event frame.
    pub fn event(name: impl Into<String>, payload: Value) -> Self {
        let mut env = Self::new(EVENT, payload);
        env.event_name = Some(name.into());
        env
    }

    /// Classify by `type`.
    pub fn kind(&self) -> MessageKind {
        match self.msg_type.as_str() {
            HEARTBEAT => MessageKind::Heartbeat,
            HEARTBEAT_RESPONSE => MessageKind::HeartbeatResponse,
            HANDSHAKE => MessageKind::Handshake,
            ACKNOWLEDGED => MessageKind::Acknowledged,
            EVENT => MessageKind::Event,
            ERROR => MessageKind::Error,
            other => {
                if let Some(cap) = other.strip_suffix(REQUEST_SUFFIX) {
                    MessageKind::Request(cap.to_string())
                } else if let Some(cap) = other.strip_suffix(RESPONSE_SUFFIX) {
                    MessageKind::Response(cap.to_string())
                } else {
                    MessageKind::Other(other.to_string())
                }
            }
        }
    }

    /// Key used to look up an event handler: `event_name`, else the type.
    pub fn routing_key(&self) -> &str {
        self.event_name.as_deref().unwrap_or(&self.msg_type)
    }

    /// Serialize to a text frame.
    pub fn to_text(&self) -> ConduitResult<String> {
        Ok(serde_json::to_string(self)?)
    }

    /// Parse a text frame. Anything that is not an envelope is a `Validation` error.
    pub fn from_text(text: &str) -> ConduitResult<Self> {
        serde_json::from_str(text)
            .map_err(|e| ConduitError::Validation(format!("malformed envelope: {e}")))
    }
}

/// Fresh UUID v4 correlation id.
pub fn new_correlation_id() -> String {
    uuid::Uuid::new_v4().to_string()
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_request_and_response_pairing() {
        let req = Envelope::request("fetch_data", json!({"sql": "select 1"}));
        assert_eq!(req.msg_type, "fetch_data_request");
        assert_eq!(req.kind(), MessageKind::Request("fetch_data".into()));
        let id = req.correlation_id.clone().unwrap();
        assert_eq!(id.len(), 36);

        let resp = Envelope::response_to(&req, json!({"rows": []}));
        assert_eq!(resp.msg_type, "fetch_data_response");
        assert_eq!(resp.correlation_id.as_deref(), Some(id.as_str()));
        assert_eq!(resp.kind(), MessageKind::Response("fetch_data".into()));
    }

    #[test]
    fn test_wire_shape() {
        let env = Envelope::request("understand_query", json!({"query": "sales"}));
        let v: Value = serde_json::from_str(&env.to_text().unwrap()).unwrap();
        assert_eq!(v["type"], "understand_query_request");
        assert!(v["correlation_id"].is_string());
        assert_eq!(v["payload"]["query"], "sales");
        assert!(v["timestamp"].as_str().unwrap().contains('T'));
        assert!(v.get("event_name").is_none());

        let hb = Envelope::heartbeat_response(None);
        let v: Value = serde_json::from_str(&hb.to_text().unwrap()).unwrap();
        assert!(v["correlation_id"].is_null());
    }

    #[test]
    fn test_lenient_parse() {
        let env = Envelope::from_text(r#"{"type":"heartbeat"}"#).unwrap();
        assert_eq!(env.kind(), MessageKind::Heartbeat);
        assert!(env.correlation_id.is_none());
        assert!(env.payload.is_object());

        assert!(matches!(
            Envelope::from_text("not json"),
            Err(ConduitError::Validation(_))
        ));
        assert!(Envelope::from_text(r#"{"payload":{}}"#).is_err());
    }

    #[test]
    fn test_routing_key() {
        let ev = Envelope::event("progress_update", json!({"pct": 40}));
        assert_eq!(ev.kind(), MessageKind::Event);
        assert_eq!(ev.routing_key(), "progress_update");

        let other = Envelope::new("schema_changed", json!({}));
        assert_eq!(other.routing_key(), "schema_changed");
        assert_eq!(other.kind(), MessageKind::Other("schema_changed".into()));
    }

    #[test]
    fn test_handshake_payload() {
        let hs = Envelope::handshake("conduit", &["fetch_data".to_string()]);
        assert_eq!(hs.kind(), MessageKind::Handshake);
        assert_eq!(hs.payload["agent"], "conduit");
        assert_eq!(hs.payload["capabilities"][0], "fetch_data");
    }
}
