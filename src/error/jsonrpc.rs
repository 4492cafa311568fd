//! JSON-RPC 2.0 error object.
//!
//! This structure is embedded in error responses and follows the JSON-RPC
//! 2.0 specification: a numeric `code`, a human-readable `message`, and an
//! optional `data` payload carrying sanitized diagnostics.

use serde::{Deserialize, Serialize};

/// JSON-RPC 2.0 error object.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JsonRpcError {
    /// Error code (standard JSON-RPC or gateway-specific)
    pub code: i32,

    /// Human-readable error message
    pub message: String,

    /// Additional diagnostic data (optional, safe for client consumption)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<serde_json::Value>,
}

impl JsonRpcError {
    /// Create an error object without diagnostic data.
    pub fn new(code: i32, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            data: None,
        }
    }
}
