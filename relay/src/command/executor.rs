//! Command executor
//!
//! Performs one unit of work against the pool and the server catalog. The
//! typed operations return [`ApiError`] so the HTTP routes can map them onto
//! the envelope directly; [`CommandRunner::run`] renders the same
//! operations as a [`CommandOutput`].

use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use relay_common::ApiError;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use super::{CommandKind, CommandOutput, CommandRequest, CommandRunner};
use crate::backend::{BackendError, ToolCallResult, ToolInfo};
use crate::batch::{BatchOutcome, BatchRequest, BatchScheduler, BatchValidationError};
use crate::catalog::ServerCatalog;
use crate::config::ServerConfig;
use crate::pool::{ConnectionPool, ConnectionRecord, PoolError, PooledConnection};

/// One configured backend as shown in listings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServerSummary {
    pub name: String,
    pub transport: String,
    pub connections: usize,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub config: Option<ServerConfig>,
}

/// Executes commands against one pool and catalog
#[derive(Clone)]
pub struct CommandExecutor {
    pool: Arc<ConnectionPool>,
    catalog: Arc<ServerCatalog>,
    batch_dir: PathBuf,
}

impl CommandExecutor {
    pub fn new(pool: Arc<ConnectionPool>, catalog: Arc<ServerCatalog>, batch_dir: PathBuf) -> Self {
        Self {
            pool,
            catalog,
            batch_dir,
        }
    }

    pub fn pool(&self) -> &Arc<ConnectionPool> {
        &self.pool
    }

    pub fn catalog(&self) -> &Arc<ServerCatalog> {
        &self.catalog
    }

    // ========================================================================
    // Typed operations
    // ========================================================================

    pub async fn server_config(&self, name: &str) -> Result<ServerConfig, ApiError> {
        self.catalog
            .get(name)
            .await
            .ok_or_else(|| ApiError::backend_not_found(name))
    }

    pub async fn list_servers(&self) -> Vec<ServerSummary> {
        let mut summaries = Vec::new();
        for (name, config) in self.catalog.list().await {
            let connections = self.pool.list_for_backend(&name).await.len();
            summaries.push(ServerSummary {
                transport: config.transport_label().to_string(),
                name,
                connections,
                config: None,
            });
        }
        summaries
    }

    pub async fn describe_server(&self, name: &str) -> Result<ServerSummary, ApiError> {
        let config = self.server_config(name).await?;
        Ok(ServerSummary {
            name: name.to_string(),
            transport: config.transport_label().to_string(),
            connections: self.pool.list_for_backend(name).await.len(),
            config: Some(config),
        })
    }

    /// Connection to use for a request
    ///
    /// The default instance is connected on demand; a tagged instance must
    /// already be connected.
    pub async fn connection(
        &self,
        name: &str,
        instance: Option<&str>,
    ) -> Result<PooledConnection, ApiError> {
        let config = self.server_config(name).await?;
        match instance {
            None => self
                .pool
                .get_or_create(name, &config, None)
                .await
                .map_err(pool_error),
            Some(tag) => self
                .pool
                .get(name, Some(tag))
                .await
                .ok_or_else(|| ApiError::not_connected(name, tag)),
        }
    }

    pub async fn list_tools(
        &self,
        name: &str,
        instance: Option<&str>,
    ) -> Result<Vec<ToolInfo>, ApiError> {
        let conn = self.connection(name, instance).await?;
        let result = conn.client.list_tools().await;
        self.backend_result(&conn, result)
    }

    /// Tools of every configured backend; backends that fail are logged and skipped
    pub async fn list_all_tools(&self) -> Vec<ToolInfo> {
        let mut tools = Vec::new();
        for name in self.catalog.names().await {
            match self.list_tools(&name, None).await {
                Ok(found) => tools.extend(found),
                Err(e) => tracing::warn!("Skipping tools of '{}': {}", name, e),
            }
        }
        tools
    }

    pub async fn describe_tool(
        &self,
        name: &str,
        tool: &str,
        instance: Option<&str>,
    ) -> Result<ToolInfo, ApiError> {
        self.list_tools(name, instance)
            .await?
            .into_iter()
            .find(|t| t.name == tool)
            .ok_or_else(|| ApiError::tool_not_found(name, tool))
    }

    pub async fn invoke_tool(
        &self,
        name: &str,
        tool: &str,
        arguments: Option<Map<String, Value>>,
        instance: Option<&str>,
    ) -> Result<ToolCallResult, ApiError> {
        let conn = self.connection(name, instance).await?;
        tracing::debug!("Invoking {}/{} on connection {}", name, tool, conn.record.id);
        let result = conn.client.call_tool(tool, arguments).await;
        self.backend_result(&conn, result)
    }

    /// Connect a backend instance; `generate_tag` picks the next free tag
    pub async fn connect(
        &self,
        name: &str,
        instance: Option<&str>,
        generate_tag: bool,
    ) -> Result<PooledConnection, ApiError> {
        let config = self.server_config(name).await?;
        if generate_tag && instance.is_some() {
            return Err(ApiError::invalid_request(
                "'generate' and 'instance' cannot be combined",
            ));
        }
        let result = if generate_tag {
            self.pool.get_or_create_with_generated_tag(name, &config).await
        } else {
            self.pool.get_or_create(name, &config, instance).await
        };
        result.map_err(pool_error)
    }

    pub async fn disconnect(
        &self,
        name: &str,
        instance: Option<&str>,
    ) -> Result<ConnectionRecord, ApiError> {
        if let Some(record) = self.pool.disconnect(name, instance).await {
            return Ok(record);
        }
        self.server_config(name).await?;
        Err(ApiError::connection_not_found(match instance {
            Some(tag) => format!("{}#{}", name, tag),
            None => name.to_string(),
        }))
    }

    pub async fn disconnect_by_id(&self, id: u64) -> Result<ConnectionRecord, ApiError> {
        self.pool
            .disconnect_by_id(id)
            .await
            .ok_or_else(|| ApiError::connection_not_found(id))
    }

    pub async fn reconnect(
        &self,
        name: &str,
        instance: Option<&str>,
    ) -> Result<PooledConnection, ApiError> {
        self.server_config(name).await?;
        self.pool
            .reconnect(name, instance)
            .await
            .map_err(|e| match e {
                PoolError::NoCachedConfig { .. } => {
                    ApiError::not_connected(name, instance.unwrap_or("default"))
                }
                other => pool_error(other),
            })
    }

    pub async fn list_connections(&self, name: Option<&str>) -> Vec<ConnectionRecord> {
        match name {
            Some(name) => self.pool.list_for_backend(name).await,
            None => self.pool.list_all().await,
        }
    }

    pub async fn reload_config(&self) -> Result<usize, ApiError> {
        self.catalog
            .reload()
            .await
            .map_err(|e| ApiError::execution_failed(format!("{:#}", e)))
    }

    pub async fn set_config(&self, name: &str, params: &Map<String, Value>) -> Result<bool, ApiError> {
        let config: ServerConfig = serde_json::from_value(Value::Object(params.clone()))
            .map_err(|e| ApiError::invalid_request(format!("invalid server config: {}", e)))?;
        config
            .transport()
            .map_err(|reason| ApiError::invalid_request(format!("invalid server config: {}", reason)))?;
        let replaced = self.catalog.set(name, config).await.is_some();
        tracing::info!(
            "{} server '{}'",
            if replaced { "Updated" } else { "Added" },
            name
        );
        Ok(replaced)
    }

    pub async fn run_batch(&self, request: &BatchRequest) -> Result<BatchOutcome, BatchValidationError> {
        BatchScheduler::new(Arc::new(self.clone()), self.batch_dir.clone())
            .execute(request)
            .await
    }

    /// Purge a connection whose transport has gone away
    fn backend_result<T>(
        &self,
        conn: &PooledConnection,
        result: Result<T, BackendError>,
    ) -> Result<T, ApiError> {
        result.map_err(|e| {
            if matches!(e, BackendError::Closed { .. }) {
                let id = conn.record.id;
                let pool = self.pool.clone();
                tokio::spawn(async move {
                    pool.disconnect_by_id(id).await;
                });
            }
            ApiError::execution_failed(e.to_string())
        })
    }

    // ========================================================================
    // Command dispatch
    // ========================================================================

    async fn dispatch(&self, kind: CommandKind, request: &CommandRequest) -> CommandOutput {
        match kind {
            CommandKind::ListServers => render(Ok::<_, ApiError>(self.list_servers().await)),
            CommandKind::ListTools => match request.arg(0) {
                Some(name) => render(self.list_tools(name, None).await),
                None => render(Ok::<_, ApiError>(self.list_all_tools().await)),
            },
            CommandKind::DescribeTool => match (request.arg(0), request.arg(1)) {
                (Some(name), Some(tool)) => render(self.describe_tool(name, tool, None).await),
                (Some(name), None) => render(self.list_tools(name, None).await),
                _ => CommandOutput::usage("usage: describe-tool <server> [tool]"),
            },
            CommandKind::InvokeTool => self.dispatch_invoke(request).await,
            CommandKind::Connect => match request.arg(0) {
                Some(name) => render(
                    self.connect(name, request.arg(1), false)
                        .await
                        .map(|c| c.record),
                ),
                None => CommandOutput::usage("usage: connect <server> [instance]"),
            },
            CommandKind::Disconnect => match request.arg(0) {
                Some(target) => render(self.disconnect_target(target, request.arg(1)).await),
                None => CommandOutput::usage("usage: disconnect <server|id> [instance]"),
            },
            CommandKind::Reconnect => match request.arg(0) {
                Some(name) => render(
                    self.reconnect(name, request.arg(1))
                        .await
                        .map(|c| c.record),
                ),
                None => CommandOutput::usage("usage: reconnect <server> [instance]"),
            },
            CommandKind::ListConnections => {
                render(Ok::<_, ApiError>(self.list_connections(request.arg(0)).await))
            }
            CommandKind::ReloadConfig => render(
                self.reload_config()
                    .await
                    .map(|count| serde_json::json!({ "servers": count })),
            ),
            CommandKind::SetConfig => match request.arg(0) {
                Some(name) => render(
                    self.set_config(name, &request.params)
                        .await
                        .map(|replaced| serde_json::json!({ "server": name, "replaced": replaced })),
                ),
                None => CommandOutput::usage("usage: set-config <server> (config in params)"),
            },
            CommandKind::Batch => self.dispatch_batch(request).await,
        }
    }

    async fn dispatch_invoke(&self, request: &CommandRequest) -> CommandOutput {
        let (Some(name), Some(tool)) = (request.arg(0), request.arg(1)) else {
            return CommandOutput::usage("usage: invoke-tool <server> <tool> [json-args]");
        };

        let mut arguments = match request.arg(2) {
            None => Map::new(),
            Some(raw) => match serde_json::from_str::<Value>(raw) {
                Ok(Value::Object(map)) => map,
                _ => return CommandOutput::usage("tool arguments must be a JSON object"),
            },
        };
        arguments.extend(request.params.clone());
        let arguments = (!arguments.is_empty()).then_some(arguments);

        match self.invoke_tool(name, tool, arguments, None).await {
            Ok(result) if result.is_error => CommandOutput::failure(result.joined_text()),
            Ok(result) => CommandOutput::ok(result.joined_text()),
            Err(e) => CommandOutput::failure(e.to_string()),
        }
    }

    /// Numeric targets that are not server names are connection ids
    async fn disconnect_target(
        &self,
        target: &str,
        instance: Option<&str>,
    ) -> Result<ConnectionRecord, ApiError> {
        if instance.is_none() && self.catalog.get(target).await.is_none() {
            if let Ok(id) = target.parse::<u64>() {
                return self.disconnect_by_id(id).await;
            }
        }
        self.disconnect(target, instance).await
    }

    async fn dispatch_batch(&self, request: &CommandRequest) -> CommandOutput {
        let batch: BatchRequest = match serde_json::from_value(Value::Object(request.params.clone())) {
            Ok(batch) => batch,
            Err(e) => return CommandOutput::usage(format!("invalid batch request: {}", e)),
        };
        match self.run_batch(&batch).await {
            Ok(outcome) => {
                let success = outcome.success();
                let mut output = render(Ok::<_, ApiError>(&outcome));
                if !success {
                    output.success = false;
                    output.exit_code = super::EXIT_FAILURE;
                }
                output
            }
            Err(e) => CommandOutput::usage(e.to_string()),
        }
    }
}

#[async_trait]
impl CommandRunner for CommandExecutor {
    async fn run(&self, request: &CommandRequest) -> CommandOutput {
        match CommandKind::parse(&request.command) {
            Some(kind) => self.dispatch(kind, request).await,
            None => CommandOutput::usage(format!("unknown command '{}'", request.command)),
        }
    }
}

fn pool_error(e: PoolError) -> ApiError {
    ApiError::execution_failed(e.to_string())
}

fn render<T: Serialize>(result: Result<T, ApiError>) -> CommandOutput {
    match result {
        Ok(data) => match serde_json::to_string_pretty(&data) {
            Ok(text) => CommandOutput::ok(text),
            Err(e) => CommandOutput::failure(format!("failed to serialize output: {}", e)),
        },
        Err(e) => CommandOutput::failure(e.to_string()),
    }
}
