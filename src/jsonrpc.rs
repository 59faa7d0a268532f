//! Minimal JSON-RPC 2.0 value types shared by the backend transport and router.
//!
//! Bodies are treated as opaque value trees per the design notes: only the
//! envelope fields (`jsonrpc`, `id`, `method`, `params`, `result`, `error`)
//! are typed here. Everything inside `params`/`result` stays `serde_json::Value`.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;

/// A JSON-RPC request id: either a number or a string, never null on the wire
/// for requests (notifications omit `id` entirely).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(untagged)]
pub enum RequestId {
    Number(i64),
    String(String),
}

impl fmt::Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RequestId::Number(n) => write!(f, "{n}"),
            RequestId::String(s) => write!(f, "{s}"),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JsonRpcError {
    pub code: i64,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

impl fmt::Display for JsonRpcError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} (code {})", self.message, self.code)
    }
}

/// One line of the wire protocol: a request, a response, or a notification.
/// All three share this shape; which one a value represents is determined by
/// which optional fields are present (see `Kind`).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JsonRpcMessage {
    pub jsonrpc: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<RequestId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub method: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub params: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<JsonRpcError>,
}

pub enum Kind<'a> {
    /// Has `id` and `method`: an outbound/inbound request.
    Request { id: &'a RequestId, method: &'a str },
    /// Has `id`, no `method`: a response (success or error).
    Response { id: &'a RequestId },
    /// Has `method`, no `id`: a notification.
    Notification { method: &'a str },
    /// Matches none of the above — malformed for our purposes.
    Malformed,
}

impl JsonRpcMessage {
    pub fn request(id: RequestId, method: impl Into<String>, params: Option<Value>) -> Self {
        Self {
            jsonrpc: "2.0".to_string(),
            id: Some(id),
            method: Some(method.into()),
            params,
            result: None,
            error: None,
        }
    }

    pub fn notification(method: impl Into<String>, params: Option<Value>) -> Self {
        Self {
            jsonrpc: "2.0".to_string(),
            id: None,
            method: Some(method.into()),
            params,
            result: None,
            error: None,
        }
    }

    pub fn kind(&self) -> Kind<'_> {
        match (&self.id, &self.method) {
            (Some(id), Some(method)) => Kind::Request { id, method },
            (Some(id), None) => Kind::Response { id },
            (None, Some(method)) => Kind::Notification { method },
            (None, None) => Kind::Malformed,
        }
    }

    /// Resolve `result`/`error` into a single `Result`, as a waiter would want it.
    pub fn into_result(self) -> Result<Value, JsonRpcError> {
        if let Some(err) = self.error {
            Err(err)
        } else {
            Ok(self.result.unwrap_or(Value::Null))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn request_id_roundtrips_both_variants() {
        let n: RequestId = serde_json::from_value(json!(7)).unwrap();
        assert_eq!(n, RequestId::Number(7));
        let s: RequestId = serde_json::from_value(json!("abc")).unwrap();
        assert_eq!(s, RequestId::String("abc".to_string()));
    }

    #[test]
    fn kind_classifies_request_response_notification() {
        let req = JsonRpcMessage::request(RequestId::Number(0), "initialize", None);
        assert!(matches!(req.kind(), Kind::Request { .. }));

        let resp = JsonRpcMessage {
            jsonrpc: "2.0".into(),
            id: Some(RequestId::Number(0)),
            method: None,
            params: None,
            result: Some(json!({"ok": true})),
            error: None,
        };
        assert!(matches!(resp.kind(), Kind::Response { .. }));

        let notif = JsonRpcMessage::notification("notifications/initialized", None);
        assert!(matches!(notif.kind(), Kind::Notification { .. }));
    }

    #[test]
    fn malformed_message_has_neither_id_nor_method() {
        let msg = JsonRpcMessage {
            jsonrpc: "2.0".into(),
            id: None,
            method: None,
            params: None,
            result: Some(json!(1)),
            error: None,
        };
        assert!(matches!(msg.kind(), Kind::Malformed));
    }

    #[test]
    fn error_response_converts_to_err() {
        let msg = JsonRpcMessage {
            jsonrpc: "2.0".into(),
            id: Some(RequestId::Number(1)),
            method: None,
            params: None,
            result: None,
            error: Some(JsonRpcError {
                code: -32601,
                message: "method not found".into(),
                data: None,
            }),
        };
        assert!(msg.into_result().is_err());
    }
}
