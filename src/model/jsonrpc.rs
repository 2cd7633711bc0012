use std::fmt::Display;

use serde::{Deserialize, Serialize};

use super::{ErrorData, Meta};

/// The literal `"2.0"` the spec requires on every frame. Serializes and
/// deserializes as that string; any other value fails deserialization.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct JsonRpcVersion2_0;

impl Serialize for JsonRpcVersion2_0 {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.serialize_str("2.0")
    }
}

impl<'de> Deserialize<'de> for JsonRpcVersion2_0 {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        if s == "2.0" {
            Ok(JsonRpcVersion2_0)
        } else {
            Err(serde::de::Error::custom(format!(
                "unsupported jsonrpc version: {s}"
            )))
        }
    }
}

/// Client-assigned request identifier. Monotone per connection by
/// convention, but the wire format also allows arbitrary strings (§3).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(untagged)]
pub enum RequestId {
    Number(u64),
    String(String),
}

impl Display for RequestId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RequestId::Number(n) => Display::fmt(n, f),
            RequestId::String(s) => Display::fmt(s, f),
        }
    }
}

impl From<u64> for RequestId {
    fn from(value: u64) -> Self {
        RequestId::Number(value)
    }
}

impl From<String> for RequestId {
    fn from(value: String) -> Self {
        RequestId::String(value)
    }
}

/// A method call awaiting a response: `{id, method, params, _meta}`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Request {
    pub jsonrpc: JsonRpcVersion2_0,
    pub id: RequestId,
    pub method: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub params: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Meta::is_empty")]
    pub meta: Meta,
}

/// A fire-and-forget call: `{method, params, _meta}`, no `id`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Notification {
    pub jsonrpc: JsonRpcVersion2_0,
    pub method: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub params: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Meta::is_empty")]
    pub meta: Meta,
}

/// A successful reply: `{id, result}`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Response {
    pub jsonrpc: JsonRpcVersion2_0,
    pub id: RequestId,
    pub result: serde_json::Value,
}

/// A failed reply: `{id, error: {code, message, data?}}`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JsonRpcError {
    pub jsonrpc: JsonRpcVersion2_0,
    pub id: RequestId,
    pub error: ErrorData,
}

// The four wire shapes below exist twice only in name: `JsonRpcRequest` and
// `JsonRpcNotification` are aliases kept for readability at call sites that
// already say "JsonRpcResponse" / "JsonRpcError"; they are the same types.
pub type JsonRpcRequest = Request;
pub type JsonRpcNotification = Notification;
pub type JsonRpcResponse = Response;

/// A single frame on the wire, tagged by shape rather than by role. Both
/// `ClientJsonRpcMessage` and `ServerJsonRpcMessage` are this type: either
/// peer may send a request, a notification, a response, or an error — the
/// *role* only constrains which method names are meaningful, not the
/// envelope, and the core does not interpret method names at all (§1).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Message {
    Request(Request),
    Notification(Notification),
    Response(Response),
    Error(JsonRpcError),
}

pub type ClientJsonRpcMessage = Message;
pub type ServerJsonRpcMessage = Message;

impl Message {
    pub fn request(
        id: RequestId,
        method: impl Into<String>,
        params: Option<serde_json::Value>,
    ) -> Self {
        Message::Request(Request {
            jsonrpc: JsonRpcVersion2_0,
            id,
            method: method.into(),
            params,
            meta: Meta::default(),
        })
    }

    pub fn notification(method: impl Into<String>, params: Option<serde_json::Value>) -> Self {
        Message::Notification(Notification {
            jsonrpc: JsonRpcVersion2_0,
            method: method.into(),
            params,
            meta: Meta::default(),
        })
    }

    pub fn result(id: RequestId, result: serde_json::Value) -> Self {
        Message::Response(Response {
            jsonrpc: JsonRpcVersion2_0,
            id,
            result,
        })
    }

    pub fn error(id: RequestId, error: ErrorData) -> Self {
        Message::Error(JsonRpcError {
            jsonrpc: JsonRpcVersion2_0,
            id,
            error,
        })
    }

    /// The request id this frame correlates to, if it carries one. Requests
    /// and final replies carry an id; notifications never do.
    pub fn request_id(&self) -> Option<&RequestId> {
        match self {
            Message::Request(r) => Some(&r.id),
            Message::Notification(_) => None,
            Message::Response(r) => Some(&r.id),
            Message::Error(e) => Some(&e.id),
        }
    }

    pub fn method(&self) -> Option<&str> {
        match self {
            Message::Request(r) => Some(&r.method),
            Message::Notification(n) => Some(&n.method),
            Message::Response(_) | Message::Error(_) => None,
        }
    }

    pub fn is_request(&self) -> bool {
        matches!(self, Message::Request(_))
    }

    pub fn is_notification(&self) -> bool {
        matches!(self, Message::Notification(_))
    }

    pub fn is_final_response(&self) -> bool {
        matches!(self, Message::Response(_) | Message::Error(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_a_request() {
        let msg = Message::request(
            RequestId::Number(1),
            "ping",
            Some(serde_json::json!({})),
        );
        let text = serde_json::to_string(&msg).unwrap();
        let back: Message = serde_json::from_str(&text).unwrap();
        assert_eq!(back.method(), Some("ping"));
        assert_eq!(back.request_id(), Some(&RequestId::Number(1)));
    }

    #[test]
    fn rejects_wrong_jsonrpc_version() {
        let text = r#"{"jsonrpc":"1.0","id":1,"method":"ping"}"#;
        let result: Result<Message, _> = serde_json::from_str(text);
        assert!(result.is_err());
    }

    #[test]
    fn error_frame_has_no_method() {
        let msg = Message::error(RequestId::Number(2), ErrorData::method_not_found("x"));
        assert_eq!(msg.method(), None);
        assert!(msg.is_final_response());
    }

    #[test]
    fn notification_carries_no_id() {
        let msg = Message::notification("notifications/cancelled", None);
        assert_eq!(msg.request_id(), None);
        assert!(msg.is_notification());
    }
}
