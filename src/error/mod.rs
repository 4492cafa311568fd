//! Error handling for the arena gateway.
//!
//! Every failure a client can observe maps to a fixed JSON-RPC error code so
//! callers can branch on cause: the standard codes (-32700 to -32603) cover
//! malformed traffic, and the gateway's custom range (-32001 to -32004)
//! covers routing conditions — "your message was malformed" is always
//! distinguishable from "the backend is gone".
//!
//! ## Module Organization
//!
//! - `jsonrpc` - the wire-format error object
//! - `GatewayError` - everything that can go wrong between client and backend

pub mod jsonrpc;

use jsonrpc::JsonRpcError;
use thiserror::Error;

/// Maximum backend response body length carried in error diagnostics.
const MAX_STATUS_BODY_LEN: usize = 500;

/// All error conditions the gateway can surface to a client.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum GatewayError {
    /// Declared protocol version is not one the gateway speaks.
    ///
    /// Answered at the HTTP layer (400) before any parsing; this never
    /// becomes a JSON-RPC envelope.
    #[error("Unsupported protocol version: {version}")]
    UnsupportedProtocolVersion {
        /// The version string the client declared
        version: String,
    },

    /// Request body is not valid JSON.
    #[error("Invalid JSON: {details}")]
    ParseError {
        /// Description of the parse failure
        details: String,
    },

    /// Body is valid JSON but not a valid JSON-RPC 2.0 envelope.
    #[error("Invalid JSON-RPC message: {details}")]
    InvalidRequest {
        /// What makes the envelope invalid
        details: String,
    },

    /// The requested method does not exist.
    ///
    /// Reserved in the taxonomy; the gateway forwards unknown methods, so in
    /// practice only backends mint this code.
    #[error("Method '{method}' not found")]
    MethodNotFound {
        /// The method name that was not found
        method: String,
    },

    /// No challenge backend is registered with the gateway.
    #[error("No active challenge backend")]
    NoActiveBackend,

    /// The active backend answered with a non-success HTTP status.
    #[error("Backend server error: HTTP {status}")]
    BackendStatus {
        /// The HTTP status the backend returned
        status: u16,
        /// Response body, truncated to [`MAX_STATUS_BODY_LEN`]
        body: String,
    },

    /// Cannot connect to the active backend.
    #[error("Cannot connect to backend server")]
    BackendUnreachable {
        /// The backend address that refused the connection
        url: String,
    },

    /// The active backend did not respond within the request timeout.
    #[error("Backend server timeout")]
    BackendTimeout,

    /// Anything unexpected; carries diagnostic text, never a stack trace.
    #[error("Internal routing error")]
    Internal {
        /// Description of the underlying failure
        details: String,
    },
}

impl GatewayError {
    /// Build a `BackendStatus` error, truncating the body for diagnostics.
    pub fn backend_status(status: u16, body: &str) -> Self {
        let body = if body.len() > MAX_STATUS_BODY_LEN {
            let mut end = MAX_STATUS_BODY_LEN;
            while !body.is_char_boundary(end) {
                end -= 1;
            }
            body[..end].to_string()
        } else {
            body.to_string()
        };
        Self::BackendStatus { status, body }
    }

    /// Maps the error to its fixed JSON-RPC 2.0 code.
    ///
    /// Standard codes (-32700 to -32603) cover protocol errors; the gateway
    /// custom range (-32001 to -32004) covers routing conditions.
    pub fn to_jsonrpc_code(&self) -> i32 {
        match self {
            // Standard JSON-RPC codes
            Self::ParseError { .. } => -32700,
            Self::InvalidRequest { .. } | Self::UnsupportedProtocolVersion { .. } => -32600,
            Self::MethodNotFound { .. } => -32601,
            Self::Internal { .. } => -32603,

            // Gateway custom codes
            Self::NoActiveBackend => -32001,
            Self::BackendStatus { .. } => -32002,
            Self::BackendUnreachable { .. } => -32003,
            Self::BackendTimeout => -32004,
        }
    }

    /// Returns the error type name for logging and traffic statistics.
    pub fn error_type_name(&self) -> &'static str {
        match self {
            Self::UnsupportedProtocolVersion { .. } => "unsupported_protocol_version",
            Self::ParseError { .. } => "parse_error",
            Self::InvalidRequest { .. } => "invalid_request",
            Self::MethodNotFound { .. } => "method_not_found",
            Self::NoActiveBackend => "no_active_backend",
            Self::BackendStatus { .. } => "backend_status",
            Self::BackendUnreachable { .. } => "backend_unreachable",
            Self::BackendTimeout => "backend_timeout",
            Self::Internal { .. } => "internal_error",
        }
    }

    /// Diagnostic `data` payload for the error response.
    ///
    /// Only operator-actionable hints go here; backend internals beyond the
    /// truncated status body are never exposed.
    pub fn error_data(&self) -> Option<serde_json::Value> {
        match self {
            Self::NoActiveBackend => Some(serde_json::json!(
                "Deploy a challenge first, then register its backend with the gateway"
            )),
            Self::BackendUnreachable { url } => Some(serde_json::json!(format!(
                "Backend at {url} is not responding. Is it running?"
            ))),
            Self::BackendTimeout => {
                Some(serde_json::json!("Backend server took too long to respond"))
            }
            Self::BackendStatus { status, body } => Some(serde_json::json!({
                "status": status,
                "body": body,
            })),
            Self::ParseError { details }
            | Self::InvalidRequest { details }
            | Self::Internal { details } => Some(serde_json::json!(details)),
            Self::MethodNotFound { method } => Some(serde_json::json!({ "method": method })),
            Self::UnsupportedProtocolVersion { .. } => None,
        }
    }

    /// Converts the error into a JSON-RPC error object.
    pub fn to_jsonrpc_error(&self) -> JsonRpcError {
        JsonRpcError {
            code: self.to_jsonrpc_code(),
            message: self.to_string(),
            data: self.error_data(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Every variant maps to its fixed code.
    #[test]
    fn test_error_code_mapping() {
        assert_eq!(
            GatewayError::ParseError {
                details: "test".to_string()
            }
            .to_jsonrpc_code(),
            -32700
        );
        assert_eq!(
            GatewayError::InvalidRequest {
                details: "test".to_string()
            }
            .to_jsonrpc_code(),
            -32600
        );
        assert_eq!(
            GatewayError::MethodNotFound {
                method: "test".to_string()
            }
            .to_jsonrpc_code(),
            -32601
        );
        assert_eq!(
            GatewayError::Internal {
                details: "test".to_string()
            }
            .to_jsonrpc_code(),
            -32603
        );
        assert_eq!(GatewayError::NoActiveBackend.to_jsonrpc_code(), -32001);
        assert_eq!(
            GatewayError::backend_status(502, "bad gateway").to_jsonrpc_code(),
            -32002
        );
        assert_eq!(
            GatewayError::BackendUnreachable {
                url: "http://localhost:9001".to_string()
            }
            .to_jsonrpc_code(),
            -32003
        );
        assert_eq!(GatewayError::BackendTimeout.to_jsonrpc_code(), -32004);
    }

    #[test]
    fn test_error_type_names() {
        assert_eq!(
            GatewayError::NoActiveBackend.error_type_name(),
            "no_active_backend"
        );
        assert_eq!(
            GatewayError::BackendTimeout.error_type_name(),
            "backend_timeout"
        );
        assert_eq!(
            GatewayError::ParseError {
                details: "x".to_string()
            }
            .error_type_name(),
            "parse_error"
        );
    }

    #[test]
    fn test_backend_status_body_truncated() {
        let long_body = "x".repeat(2000);
        let err = GatewayError::backend_status(500, &long_body);
        if let GatewayError::BackendStatus { status, body } = &err {
            assert_eq!(*status, 500);
            assert_eq!(body.len(), MAX_STATUS_BODY_LEN);
        } else {
            panic!("expected BackendStatus");
        }
    }

    #[test]
    fn test_backend_status_truncation_respects_char_boundary() {
        // 4-byte characters straddle the 500-byte cutoff
        let body = "🦀".repeat(200);
        let err = GatewayError::backend_status(500, &body);
        if let GatewayError::BackendStatus { body, .. } = err {
            assert!(body.len() <= MAX_STATUS_BODY_LEN);
            assert!(body.chars().all(|c| c == '🦀'));
        } else {
            panic!("expected BackendStatus");
        }
    }

    #[test]
    fn test_unreachable_hint_names_backend() {
        let err = GatewayError::BackendUnreachable {
            url: "http://localhost:9001".to_string(),
        };
        let data = err.error_data().expect("should carry a hint");
        let hint = data.as_str().expect("hint is a string");
        assert!(hint.contains("http://localhost:9001"));
        assert!(hint.contains("running"));
    }

    #[test]
    fn test_to_jsonrpc_error_shape() {
        let err = GatewayError::NoActiveBackend;
        let rpc = err.to_jsonrpc_error();
        assert_eq!(rpc.code, -32001);
        assert_eq!(rpc.message, "No active challenge backend");
        assert!(rpc.data.is_some());
    }
}
