//! Shared setup: in-memory backends and a daemon on an ephemeral port

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use mcp_relay::backend::{BackendClient, BackendError, Connector, ToolCallResult, ToolInfo};
use mcp_relay::catalog::ServerCatalog;
use mcp_relay::config::{DaemonConfig, ServerConfig};
use mcp_relay::daemon::Daemon;
use serde_json::{Map, Value};

/// Backends known to every test daemon
pub const SERVERS: &[&str] = &["alpha", "beta"];

#[derive(Default)]
pub struct StubConnector {
    fail_close: bool,
    pub connects: AtomicUsize,
    pub closes: Arc<AtomicUsize>,
}

impl StubConnector {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn failing_close() -> Self {
        Self {
            fail_close: true,
            ..Self::default()
        }
    }

    pub fn close_count(&self) -> usize {
        self.closes.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Connector for StubConnector {
    async fn connect(
        &self,
        server: &str,
        _config: &ServerConfig,
    ) -> Result<Arc<dyn BackendClient>, BackendError> {
        self.connects.fetch_add(1, Ordering::SeqCst);
        Ok(Arc::new(StubClient {
            server: server.to_string(),
            fail_close: self.fail_close,
            closes: self.closes.clone(),
        }))
    }
}

struct StubClient {
    server: String,
    fail_close: bool,
    closes: Arc<AtomicUsize>,
}

#[async_trait]
impl BackendClient for StubClient {
    async fn list_tools(&self) -> Result<Vec<ToolInfo>, BackendError> {
        Ok(["echo", "sleep"]
            .iter()
            .map(|name| ToolInfo {
                server: self.server.clone(),
                name: name.to_string(),
                description: None,
                input_schema: None,
            })
            .collect())
    }

    async fn call_tool(
        &self,
        tool: &str,
        arguments: Option<Map<String, Value>>,
    ) -> Result<ToolCallResult, BackendError> {
        let args = arguments.unwrap_or_default();
        match tool {
            "echo" => Ok(ToolCallResult::text(format!(
                "{}:{}",
                self.server,
                Value::Object(args)
            ))),
            "sleep" => {
                let ms = args.get("ms").and_then(Value::as_u64).unwrap_or(10);
                tokio::time::sleep(Duration::from_millis(ms)).await;
                Ok(ToolCallResult::text(format!("slept {}", ms)))
            }
            other => Err(BackendError::Request {
                server: self.server.clone(),
                message: format!("no tool named '{}'", other),
            }),
        }
    }

    async fn close(&self) -> Result<(), BackendError> {
        self.closes.fetch_add(1, Ordering::SeqCst);
        if self.fail_close {
            return Err(BackendError::Request {
                server: self.server.clone(),
                message: "close failed".to_string(),
            });
        }
        Ok(())
    }
}

pub fn catalog() -> ServerCatalog {
    ServerCatalog::from_servers(
        SERVERS
            .iter()
            .map(|name| (name.to_string(), ServerConfig::stdio(format!("{}-mcp", name), &[])))
            .collect::<BTreeMap<_, _>>(),
    )
}

/// Start a daemon rooted at `dir` with the given connector
pub async fn start_daemon(dir: &Path, connector: Arc<StubConnector>) -> Daemon {
    start_with_config(DaemonConfig::new(dir), connector).await
}

pub async fn start_with_config(config: DaemonConfig, connector: Arc<StubConnector>) -> Daemon {
    Daemon::start_with_connector(config, catalog(), connector)
        .await
        .expect("Failed to start daemon")
}

/// Wait for the daemon to stop, failing the test after `secs`
pub async fn wait_stopped(daemon: &Daemon, secs: u64) {
    tokio::time::timeout(Duration::from_secs(secs), daemon.wait())
        .await
        .expect("Daemon did not stop in time");
}
