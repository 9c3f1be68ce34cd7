//! MCP backend client built on `rmcp`
//!
//! Stdio servers are spawned as child processes; remote servers are reached
//! over streamable HTTP. Either way the handshake happens once in
//! [`McpConnector::connect`] and the running service is kept until `close`.

use std::sync::Arc;

use async_trait::async_trait;
use rmcp::{
    model::{CallToolRequestParam, RawContent},
    service::RunningService,
    transport::{StreamableHttpClientTransport, TokioChildProcess},
    Peer, RoleClient, ServiceExt,
};
use serde_json::{Map, Value};
use tokio::process::Command;
use tokio::sync::Mutex;

use super::{BackendClient, BackendError, Connector, ToolCallResult, ToolContent, ToolInfo};
use crate::config::{ServerConfig, Transport};

/// Connector that performs the MCP handshake
#[derive(Debug, Clone, Copy, Default)]
pub struct McpConnector;

#[async_trait]
impl Connector for McpConnector {
    async fn connect(
        &self,
        server: &str,
        config: &ServerConfig,
    ) -> Result<Arc<dyn BackendClient>, BackendError> {
        let transport = config
            .transport()
            .map_err(|reason| BackendError::InvalidConfig {
                server: server.to_string(),
                reason,
            })?;

        let service = match transport {
            Transport::Stdio {
                command,
                args,
                env,
                cwd,
            } => {
                tracing::info!("Starting MCP server: {}", server);

                let mut cmd = Command::new(command);
                if !args.is_empty() {
                    cmd.args(args);
                }
                for (key, value) in env {
                    let expanded =
                        shellexpand::env(value).unwrap_or_else(|_| value.clone().into());
                    cmd.env(key, expanded.as_ref());
                }
                if let Some(dir) = cwd {
                    cmd.current_dir(dir);
                }

                let transport = TokioChildProcess::new(cmd).map_err(|source| {
                    BackendError::Spawn {
                        server: server.to_string(),
                        source,
                    }
                })?;

                ().serve(transport)
                    .await
                    .map_err(|e| BackendError::Handshake {
                        server: server.to_string(),
                        message: e.to_string(),
                    })?
            }
            Transport::Http { url } => {
                tracing::info!("Connecting to remote MCP server: {} ({})", server, url);

                let transport = StreamableHttpClientTransport::from_uri(url.to_string());
                ().serve(transport)
                    .await
                    .map_err(|e| BackendError::Handshake {
                        server: server.to_string(),
                        message: e.to_string(),
                    })?
            }
        };

        tracing::info!("MCP server connected: {}", server);
        Ok(Arc::new(McpBackendClient {
            server: server.to_string(),
            service: Mutex::new(Some(service)),
        }))
    }
}

/// Live MCP session with one backend
pub struct McpBackendClient {
    server: String,
    service: Mutex<Option<RunningService<RoleClient, ()>>>,
}

impl McpBackendClient {
    /// Clone the peer so requests do not hold the lock while in flight
    async fn peer(&self) -> Result<Peer<RoleClient>, BackendError> {
        let guard = self.service.lock().await;
        guard
            .as_ref()
            .map(|service| service.peer().clone())
            .ok_or_else(|| BackendError::Closed {
                server: self.server.clone(),
            })
    }

    fn request_error(&self, message: String) -> BackendError {
        BackendError::Request {
            server: self.server.clone(),
            message,
        }
    }
}

#[async_trait]
impl BackendClient for McpBackendClient {
    async fn list_tools(&self) -> Result<Vec<ToolInfo>, BackendError> {
        let peer = self.peer().await?;

        let response = peer
            .list_tools(Default::default())
            .await
            .map_err(|e| self.request_error(format!("Failed to list tools: {}", e)))?;

        let tools = response
            .tools
            .into_iter()
            .map(|t| ToolInfo {
                server: self.server.clone(),
                name: t.name.to_string(),
                description: t.description.map(|d| d.to_string()),
                input_schema: serde_json::to_value(&t.input_schema).ok(),
            })
            .collect::<Vec<_>>();

        tracing::debug!("Server '{}': {} tools discovered", self.server, tools.len());
        Ok(tools)
    }

    async fn call_tool(
        &self,
        tool: &str,
        arguments: Option<Map<String, Value>>,
    ) -> Result<ToolCallResult, BackendError> {
        let peer = self.peer().await?;

        let result = peer
            .call_tool(CallToolRequestParam {
                name: tool.to_string().into(),
                arguments,
                task: None,
            })
            .await
            .map_err(|e| self.request_error(format!("Failed to call tool '{}': {}", tool, e)))?;

        let content = result
            .content
            .into_iter()
            .map(|c| match &c.raw {
                RawContent::Text(t) => ToolContent {
                    content_type: "text".to_string(),
                    text: Some(t.text.to_string()),
                },
                _ => ToolContent {
                    content_type: "other".to_string(),
                    text: None,
                },
            })
            .collect();

        Ok(ToolCallResult {
            content,
            is_error: result.is_error.unwrap_or(false),
        })
    }

    async fn close(&self) -> Result<(), BackendError> {
        let service = self.service.lock().await.take();
        if let Some(service) = service {
            tracing::info!("Stopping MCP server: {}", self.server);
            service
                .cancel()
                .await
                .map_err(|e| self.request_error(format!("Error canceling service: {}", e)))?;
        }
        Ok(())
    }
}
