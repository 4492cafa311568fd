//! JSON-RPC 2.0 envelope validation and construction.
//!
//! Enforces wire-format correctness before any routing decision is made.
//! Parsing keeps the raw JSON value alongside the validated view so the
//! router can forward the body unchanged (field order included; see the
//! `preserve_order` feature on serde_json).
//!
//! # JSON-RPC 2.0 Compliance
//!
//! - Requests have `method`, optional `params`, and an optional `id`
//! - Notifications are requests without `id`
//! - Responses carry `result` or `error` plus the request's `id`
//! - `id` type (string or integer) MUST be preserved in responses
//!
//! # Security Note
//!
//! This module parses untrusted input. Size limits are enforced at the HTTP
//! layer (see `server`).

use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::Value;
use std::borrow::Cow;
use uuid::Uuid;

use crate::error::GatewayError;
use crate::error::jsonrpc::JsonRpcError;

/// Protocol version the gateway speaks.
pub const PROTOCOL_VERSION: &str = "2025-11-25";

/// Older revision still accepted for backwards compatibility.
pub const FALLBACK_PROTOCOL_VERSION: &str = "2025-03-26";

/// Header carrying the declared protocol version.
pub const PROTOCOL_VERSION_HEADER: &str = "mcp-protocol-version";

/// Header carrying the opaque session token.
pub const SESSION_ID_HEADER: &str = "mcp-session-id";

/// JSON-RPC 2.0 version constant.
const JSONRPC_VERSION: &str = "2.0";

/// Validate the declared protocol version header.
///
/// A missing or empty header is compatible: the gateway proceeds assuming
/// [`FALLBACK_PROTOCOL_VERSION`]. A present header must name the current or
/// fallback version.
pub fn validate_protocol_version(declared: Option<&str>) -> Result<(), GatewayError> {
    match declared.map(str::trim) {
        None | Some("") => Ok(()),
        Some(v) if v == PROTOCOL_VERSION || v == FALLBACK_PROTOCOL_VERSION => Ok(()),
        Some(v) => Err(GatewayError::UnsupportedProtocolVersion {
            version: v.to_string(),
        }),
    }
}

/// JSON-RPC 2.0 request ID.
///
/// The spec allows string or integer IDs; the exact type is preserved so
/// responses use the same type as requests — if the client sends `"id": 1`,
/// it gets back `"id": 1`, never `"id": "1"`. An explicit `"id": null` is
/// valid (though unusual) and distinct from a missing `id` field, which
/// marks a notification.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum JsonRpcId {
    /// Integer ID (e.g., `"id": 1`)
    Number(i64),
    /// String ID (e.g., `"id": "abc-123"`)
    String(String),
    /// Explicit null ID
    Null,
}

impl JsonRpcId {
    /// Extract an ID from a JSON value, rejecting floats and other types.
    fn from_value(value: &Value) -> Option<Self> {
        match value {
            Value::Number(n) => n.as_i64().map(JsonRpcId::Number),
            Value::String(s) => Some(JsonRpcId::String(s.clone())),
            Value::Null => Some(JsonRpcId::Null),
            _ => None,
        }
    }
}

impl Serialize for JsonRpcId {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            JsonRpcId::Number(n) => serializer.serialize_i64(*n),
            JsonRpcId::String(s) => serializer.serialize_str(s),
            JsonRpcId::Null => serializer.serialize_none(),
        }
    }
}

impl<'de> Deserialize<'de> for JsonRpcId {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let value = Value::deserialize(deserializer)?;
        JsonRpcId::from_value(&value)
            .ok_or_else(|| serde::de::Error::custom("JSON-RPC ID must be string, integer, or null"))
    }
}

/// Which of the three envelope shapes a message is.
#[derive(Debug, Clone, PartialEq)]
pub enum MessageKind {
    /// A call: `method` plus an `id`; expects exactly one matching response.
    Request(JsonRpcId),
    /// A notification: `method` with no `id`; no response is expected.
    Notification,
    /// A response: `result` or `error` plus the originating `id`.
    Response(JsonRpcId),
}

/// The finite set of methods the gateway treats specially.
///
/// Everything the gateway does not recognize is forwarded untouched; only
/// session establishment changes routing behavior (it is sent session-less
/// so the backend can mint its own session).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MethodDispatch {
    /// The `initialize` handshake — forwarded without a backend session id.
    Initialize,
    /// Any other method — forwarded with the mapped backend session id.
    Forward,
}

impl MethodDispatch {
    /// Classify a method name.
    pub fn of(method: Option<&str>) -> Self {
        match method {
            Some("initialize") => MethodDispatch::Initialize,
            _ => MethodDispatch::Forward,
        }
    }
}

/// A validated protocol message with gateway-internal tracking.
///
/// The raw value is retained verbatim for forwarding; the parsed fields are
/// the gateway's read-only view of it.
#[derive(Debug, Clone)]
pub struct GatewayMessage {
    raw: Value,
    kind: MessageKind,
    method: Option<String>,
    /// Unique correlation ID for tracing this message through the gateway
    pub correlation_id: Uuid,
    /// When the gateway accepted the message
    pub received_at: DateTime<Utc>,
}

impl GatewayMessage {
    /// The message body exactly as the client sent it.
    pub fn raw(&self) -> &Value {
        &self.raw
    }

    /// The envelope shape.
    pub fn kind(&self) -> &MessageKind {
        &self.kind
    }

    /// The method name, for requests and notifications.
    pub fn method(&self) -> Option<&str> {
        self.method.as_deref()
    }

    /// The message ID, when one is present.
    pub fn id(&self) -> Option<&JsonRpcId> {
        match &self.kind {
            MessageKind::Request(id) | MessageKind::Response(id) => Some(id),
            MessageKind::Notification => None,
        }
    }

    /// True for notifications: no ID, no synchronous response body.
    pub fn is_notification(&self) -> bool {
        matches!(self.kind, MessageKind::Notification)
    }

    /// Routing classification of the method.
    pub fn dispatch(&self) -> MethodDispatch {
        MethodDispatch::of(self.method())
    }
}

/// Parse and validate a raw message body.
///
/// # Errors
///
/// * [`GatewayError::ParseError`] (-32700) — body is not valid JSON
/// * [`GatewayError::InvalidRequest`] (-32600) — valid JSON but not a valid
///   JSON-RPC 2.0 envelope
pub fn parse_message(bytes: &[u8]) -> Result<GatewayMessage, GatewayError> {
    let raw: Value = serde_json::from_slice(bytes).map_err(|e| GatewayError::ParseError {
        details: format!("Invalid JSON: {}", e),
    })?;

    let obj = raw.as_object().ok_or_else(|| GatewayError::InvalidRequest {
        details: "Message must be a JSON object".to_string(),
    })?;

    // The envelope marker must be the exact protocol tag.
    match obj.get("jsonrpc").and_then(Value::as_str) {
        Some(JSONRPC_VERSION) => {}
        Some(v) => {
            return Err(GatewayError::InvalidRequest {
                details: format!("jsonrpc field must be \"2.0\", got \"{}\"", v),
            });
        }
        None => {
            return Err(GatewayError::InvalidRequest {
                details: "Missing required field: jsonrpc".to_string(),
            });
        }
    }

    let id = match obj.get("id") {
        None => None,
        Some(v) => Some(
            JsonRpcId::from_value(v).ok_or_else(|| GatewayError::InvalidRequest {
                details: "'id' must be a string, integer, or null".to_string(),
            })?,
        ),
    };

    let has_method = obj.contains_key("method");
    let has_payload = obj.contains_key("result") || obj.contains_key("error");

    let (kind, method) = match (has_method, has_payload) {
        (true, true) => {
            return Err(GatewayError::InvalidRequest {
                details: "Message must not combine 'method' with 'result'/'error'".to_string(),
            });
        }
        (false, false) => {
            return Err(GatewayError::InvalidRequest {
                details: "Message must have 'method' (request/notification) or 'result'/'error' \
                          (response)"
                    .to_string(),
            });
        }
        (true, false) => {
            let method = obj
                .get("method")
                .and_then(Value::as_str)
                .ok_or_else(|| GatewayError::InvalidRequest {
                    details: "'method' must be a string".to_string(),
                })?
                .to_string();
            let kind = match id {
                Some(id) => MessageKind::Request(id),
                None => MessageKind::Notification,
            };
            (kind, Some(method))
        }
        (false, true) => {
            let id = id.ok_or_else(|| GatewayError::InvalidRequest {
                details: "Responses must carry an 'id' field".to_string(),
            })?;
            (MessageKind::Response(id), None)
        }
    };

    Ok(GatewayMessage {
        raw,
        kind,
        method,
        correlation_id: Uuid::new_v4(),
        received_at: Utc::now(),
    })
}

/// Best-effort ID recovery from a body that failed validation.
///
/// Parse-error responses echo the caller's id when one can be salvaged from
/// the malformed body, else `null`.
pub fn recover_id(bytes: &[u8]) -> Option<JsonRpcId> {
    let value: Value = serde_json::from_slice(bytes).ok()?;
    value.as_object()?.get("id").and_then(JsonRpcId::from_value)
}

/// JSON-RPC 2.0 response envelope.
///
/// # ID Serialization
///
/// Per spec the `id` field is REQUIRED in responses: the request's id for
/// normal responses, `null` when it could not be determined (parse errors).
/// `None` therefore always serializes as `"id": null` here, unlike requests
/// where a missing id means "notification".
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JsonRpcResponse {
    /// Always "2.0"
    pub jsonrpc: Cow<'static, str>,
    /// Request ID — always serialized; `None` becomes `null`
    pub id: Option<JsonRpcId>,
    /// Result (mutually exclusive with error)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    /// Error (mutually exclusive with result)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<JsonRpcError>,
}

impl JsonRpcResponse {
    /// Create a success response echoing the request's id.
    pub fn success(id: Option<JsonRpcId>, result: Value) -> Self {
        Self {
            jsonrpc: Cow::Borrowed(JSONRPC_VERSION),
            id,
            result: Some(result),
            error: None,
        }
    }

    /// Create an error response.
    ///
    /// Pass `None` as the id when the request id could not be determined —
    /// this serializes as `"id": null` per the JSON-RPC 2.0 spec.
    pub fn error(id: Option<JsonRpcId>, error: JsonRpcError) -> Self {
        Self {
            jsonrpc: Cow::Borrowed(JSONRPC_VERSION),
            id,
            result: None,
            error: Some(error),
        }
    }
}
