//! Stable error codes for the control surface
//!
//! Every failure that crosses the daemon boundary carries one of these codes
//! so callers can branch on it without parsing messages.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Machine-readable error code
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ErrorCode {
    /// The named backend is not in the server catalog
    BackendNotFound,
    /// No live connection matches the given id or key
    ConnectionNotFound,
    /// The backend exists but the requested instance is not connected
    NotConnected,
    /// The backend does not expose the named tool
    ToolNotFound,
    /// A connection id could not be parsed
    InvalidIdFormat,
    /// The request body or arguments are malformed
    InvalidRequest,
    /// The backend call or command failed
    ExecutionFailed,
}

impl ErrorCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorCode::BackendNotFound => "backend-not-found",
            ErrorCode::ConnectionNotFound => "connection-not-found",
            ErrorCode::NotConnected => "not-connected",
            ErrorCode::ToolNotFound => "tool-not-found",
            ErrorCode::InvalidIdFormat => "invalid-id-format",
            ErrorCode::InvalidRequest => "invalid-request",
            ErrorCode::ExecutionFailed => "execution-failed",
        }
    }
}

impl std::fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Error carried in the failure envelope
#[derive(Debug, Clone, Serialize, Deserialize, thiserror::Error)]
#[error("{code}: {message}")]
pub struct ApiError {
    pub code: ErrorCode,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub details: Option<Value>,
}

impl ApiError {
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            details: None,
        }
    }

    /// Attach structured details
    pub fn with_details(mut self, details: Value) -> Self {
        self.details = Some(details);
        self
    }

    pub fn backend_not_found(name: &str) -> Self {
        Self::new(
            ErrorCode::BackendNotFound,
            format!("Server '{}' not found in config", name),
        )
    }

    pub fn connection_not_found(what: impl std::fmt::Display) -> Self {
        Self::new(
            ErrorCode::ConnectionNotFound,
            format!("Connection {} not found", what),
        )
    }

    pub fn not_connected(name: &str, instance: &str) -> Self {
        Self::new(
            ErrorCode::NotConnected,
            format!("Server '{}' instance '{}' is not connected", name, instance),
        )
    }

    pub fn tool_not_found(server: &str, tool: &str) -> Self {
        Self::new(
            ErrorCode::ToolNotFound,
            format!("Tool '{}' not found on server '{}'", tool, server),
        )
    }

    pub fn invalid_id(raw: &str) -> Self {
        Self::new(
            ErrorCode::InvalidIdFormat,
            format!("'{}' is not a valid connection id", raw),
        )
    }

    pub fn invalid_request(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::InvalidRequest, message)
    }

    pub fn execution_failed(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::ExecutionFailed, message)
    }
}
