//! GraphQL-over-WebSocket wire model
//!
//! Frames are JSON text messages tagged by `type`, following the `graphql-ws`
//! sub-protocol: the client opens with `connection_init`, waits for
//! `connection_ack`, then sends one `start` per operation and receives `data`,
//! `error` and `complete` frames for it.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

/// Sub-protocol advertised on the WebSocket upgrade request
pub const GRAPHQL_WS_PROTOCOL: &str = "graphql-ws";

/// Reported when a server error frame carries no usable message
pub const UNKNOWN_SUBSCRIPTION_ERROR: &str = "Unknown subscription error";

/// Request id used in `start` / `stop` frames
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SubscriptionId(Uuid);

impl SubscriptionId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for SubscriptionId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for SubscriptionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Payload of a `start` frame
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StartPayload {
    pub query: String,
    #[serde(default)]
    pub variables: Map<String, Value>,
    #[serde(
        rename = "operationName",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub operation_name: Option<String>,
}

/// One frame of the subscription protocol
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ProtocolMessage {
    ConnectionInit {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        payload: Option<Value>,
    },
    ConnectionAck {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        payload: Option<Value>,
    },
    ConnectionError {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        payload: Option<Value>,
    },
    Start {
        id: String,
        payload: StartPayload,
    },
    Data {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        id: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        payload: Option<Value>,
    },
    Error {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        id: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        payload: Option<Value>,
    },
    Complete {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        id: Option<String>,
    },
    Stop {
        id: String,
    },
    ConnectionTerminate,
    #[serde(rename = "ka")]
    KeepAlive,
    Ping {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        payload: Option<Value>,
    },
    Pong {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        payload: Option<Value>,
    },
    /// Any frame type this client does not know about
    #[serde(other)]
    Unknown,
}

/// What a `data` frame asks the client to do
#[derive(Debug, Clone, PartialEq)]
pub enum DataEvent {
    /// Deliver `payload.data` to the callback
    Deliver(Value),
    /// Server reported errors for the operation
    Failed(String),
    /// Neither data nor errors; nothing to do
    Empty,
}

impl ProtocolMessage {
    /// `connection_init` carrying the bearer token as a connection parameter
    pub fn connection_init(token: &str) -> Self {
        ProtocolMessage::ConnectionInit {
            payload: Some(serde_json::json!({
                "Authorization": format!("Bearer {}", token)
            })),
        }
    }

    pub fn start(id: &SubscriptionId, payload: StartPayload) -> Self {
        ProtocolMessage::Start {
            id: id.to_string(),
            payload,
        }
    }

    pub fn stop(id: &SubscriptionId) -> Self {
        ProtocolMessage::Stop { id: id.to_string() }
    }

    /// Wire name of the frame type, for logs and error messages
    pub fn kind(&self) -> &'static str {
        match self {
            ProtocolMessage::ConnectionInit { .. } => "connection_init",
            ProtocolMessage::ConnectionAck { .. } => "connection_ack",
            ProtocolMessage::ConnectionError { .. } => "connection_error",
            ProtocolMessage::Start { .. } => "start",
            ProtocolMessage::Data { .. } => "data",
            ProtocolMessage::Error { .. } => "error",
            ProtocolMessage::Complete { .. } => "complete",
            ProtocolMessage::Stop { .. } => "stop",
            ProtocolMessage::ConnectionTerminate => "connection_terminate",
            ProtocolMessage::KeepAlive => "ka",
            ProtocolMessage::Ping { .. } => "ping",
            ProtocolMessage::Pong { .. } => "pong",
            ProtocolMessage::Unknown => "unknown",
        }
    }

    pub fn to_json(&self) -> crate::Result<String> {
        Ok(serde_json::to_string(self)?)
    }

    pub fn from_json(text: &str) -> crate::Result<Self> {
        Ok(serde_json::from_str(text)?)
    }
}

/// Interpret the payload of a `data` frame.
///
/// Present, non-null `data` wins; otherwise `errors` makes the frame a failure,
/// reported with the first error's message when `errors` is a list.
pub fn classify_data(payload: Option<&Value>) -> DataEvent {
    let Some(payload) = payload else {
        return DataEvent::Empty;
    };

    match payload.get("data") {
        Some(data) if !data.is_null() => return DataEvent::Deliver(data.clone()),
        _ => {}
    }

    match payload.get("errors") {
        Some(Value::Array(errors)) => DataEvent::Failed(
            errors
                .first()
                .and_then(error_message)
                .unwrap_or_else(|| UNKNOWN_SUBSCRIPTION_ERROR.to_string()),
        ),
        Some(_) => DataEvent::Failed(UNKNOWN_SUBSCRIPTION_ERROR.to_string()),
        None => DataEvent::Empty,
    }
}

/// Message of an `error` or `connection_error` payload, which servers send
/// either as a single error object or as a list of them.
pub fn payload_message(payload: Option<&Value>) -> String {
    let message = match payload {
        Some(Value::Array(errors)) => errors.first().and_then(error_message),
        Some(Value::String(text)) => Some(text.clone()),
        Some(other) => error_message(other),
        None => None,
    };
    message.unwrap_or_else(|| UNKNOWN_SUBSCRIPTION_ERROR.to_string())
}

fn error_message(error: &Value) -> Option<String> {
    error
        .get("message")
        .and_then(Value::as_str)
        .map(str::to_string)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_start_frame_shape() {
        let id = SubscriptionId::new();
        let mut variables = Map::new();
        variables.insert("var".to_string(), json!("value"));

        let frame = ProtocolMessage::start(
            &id,
            StartPayload {
                query: "subscription { test }".to_string(),
                variables,
                operation_name: None,
            },
        );

        let value: Value = serde_json::from_str(&frame.to_json().unwrap()).unwrap();
        assert_eq!(value["type"], "start");
        assert_eq!(value["id"], id.to_string());
        assert_eq!(value["payload"]["query"], "subscription { test }");
        assert_eq!(value["payload"]["variables"]["var"], "value");
        assert!(value["payload"].get("operationName").is_none());
    }

    #[test]
    fn test_connection_init_carries_bearer_token() {
        let value: Value =
            serde_json::from_str(&ProtocolMessage::connection_init("abc").to_json().unwrap())
                .unwrap();
        assert_eq!(value["type"], "connection_init");
        assert_eq!(value["payload"]["Authorization"], "Bearer abc");
    }

    #[test]
    fn test_server_frames_parse() {
        assert!(matches!(
            ProtocolMessage::from_json(r#"{"type":"connection_ack"}"#).unwrap(),
            ProtocolMessage::ConnectionAck { payload: None }
        ));
        assert!(matches!(
            ProtocolMessage::from_json(r#"{"type":"complete"}"#).unwrap(),
            ProtocolMessage::Complete { id: None }
        ));
        assert_eq!(
            ProtocolMessage::from_json(r#"{"type":"ka"}"#).unwrap(),
            ProtocolMessage::KeepAlive
        );

        let data =
            ProtocolMessage::from_json(r#"{"type":"data","id":"1","payload":{"data":{"test":"v"}}}"#)
                .unwrap();
        match data {
            ProtocolMessage::Data { id, payload } => {
                assert_eq!(id.as_deref(), Some("1"));
                assert_eq!(payload.unwrap()["data"]["test"], "v");
            }
            other => panic!("unexpected frame: {:?}", other),
        }
    }

    #[test]
    fn test_unrecognized_type_is_unknown() {
        let frame =
            ProtocolMessage::from_json(r#"{"type":"next","payload":{"data":{}}}"#).unwrap();
        assert_eq!(frame, ProtocolMessage::Unknown);
    }

    #[test]
    fn test_malformed_frame_is_parse_error() {
        let err = ProtocolMessage::from_json("not json").unwrap_err();
        assert!(matches!(err, crate::Error::Parse { .. }));
    }

    #[test]
    fn test_classify_data_payloads() {
        let payload = json!({"data": {"test": "value1"}});
        assert_eq!(
            classify_data(Some(&payload)),
            DataEvent::Deliver(json!({"test": "value1"}))
        );

        let payload = json!({"errors": [{"message": "first"}, {"message": "second"}]});
        assert_eq!(
            classify_data(Some(&payload)),
            DataEvent::Failed("first".to_string())
        );

        let payload = json!({"errors": "boom"});
        assert_eq!(
            classify_data(Some(&payload)),
            DataEvent::Failed(UNKNOWN_SUBSCRIPTION_ERROR.to_string())
        );

        let payload = json!({"data": null});
        assert_eq!(classify_data(Some(&payload)), DataEvent::Empty);
        assert_eq!(classify_data(None), DataEvent::Empty);
    }

    #[test]
    fn test_payload_message_shapes() {
        assert_eq!(payload_message(Some(&json!({"message": "bad token"}))), "bad token");
        assert_eq!(payload_message(Some(&json!([{"message": "listed"}]))), "listed");
        assert_eq!(payload_message(Some(&json!("plain"))), "plain");
        assert_eq!(payload_message(None), UNKNOWN_SUBSCRIPTION_ERROR);
    }
}
