//! Backend client seam
//!
//! The pool only talks to backends through [`Connector`] and
//! [`BackendClient`]. The production implementation speaks MCP through
//! `rmcp`; tests plug in in-memory fakes.

mod mcp_client;

use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::config::ServerConfig;

pub use mcp_client::{McpBackendClient, McpConnector};

/// Errors raised while talking to a backend
#[derive(Debug, thiserror::Error)]
pub enum BackendError {
    #[error("invalid config for server '{server}': {reason}")]
    InvalidConfig { server: String, reason: String },

    #[error("failed to spawn server '{server}': {source}")]
    Spawn {
        server: String,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to initialize server '{server}': {message}")]
    Handshake { server: String, message: String },

    #[error("request to server '{server}' failed: {message}")]
    Request { server: String, message: String },

    #[error("connection to server '{server}' is closed")]
    Closed { server: String },
}

/// Information about a tool
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolInfo {
    pub server: String,
    pub name: String,
    pub description: Option<String>,
    pub input_schema: Option<Value>,
}

/// Content from a tool call
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolContent {
    #[serde(rename = "type")]
    pub content_type: String,
    pub text: Option<String>,
}

/// Result of a tool call
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolCallResult {
    pub content: Vec<ToolContent>,
    pub is_error: bool,
}

impl ToolCallResult {
    /// Successful result with a single text block
    pub fn text(text: impl Into<String>) -> Self {
        Self {
            content: vec![ToolContent {
                content_type: "text".to_string(),
                text: Some(text.into()),
            }],
            is_error: false,
        }
    }

    /// Text blocks joined by newlines; non-text blocks are skipped
    pub fn joined_text(&self) -> String {
        self.content
            .iter()
            .filter_map(|c| c.text.as_deref())
            .collect::<Vec<_>>()
            .join("\n")
    }
}

/// One live connection to a backend
///
/// Implementations are not expected to handle concurrent calls well; the
/// batch scheduler serializes calls per backend.
#[async_trait]
pub trait BackendClient: Send + Sync {
    async fn list_tools(&self) -> Result<Vec<ToolInfo>, BackendError>;

    async fn call_tool(
        &self,
        tool: &str,
        arguments: Option<Map<String, Value>>,
    ) -> Result<ToolCallResult, BackendError>;

    /// Release the transport; later calls fail with [`BackendError::Closed`]
    async fn close(&self) -> Result<(), BackendError>;
}

/// Establishes connections from a server config
#[async_trait]
pub trait Connector: Send + Sync {
    async fn connect(
        &self,
        server: &str,
        config: &ServerConfig,
    ) -> Result<Arc<dyn BackendClient>, BackendError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_joined_text_skips_non_text() {
        let result = ToolCallResult {
            content: vec![
                ToolContent {
                    content_type: "text".into(),
                    text: Some("one".into()),
                },
                ToolContent {
                    content_type: "image".into(),
                    text: None,
                },
                ToolContent {
                    content_type: "text".into(),
                    text: Some("two".into()),
                },
            ],
            is_error: false,
        };
        assert_eq!(result.joined_text(), "one\ntwo");
    }
}
