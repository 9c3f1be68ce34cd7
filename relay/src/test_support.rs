//! In-memory backends for unit tests

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{Map, Value};

use crate::backend::{BackendClient, BackendError, Connector, ToolCallResult, ToolInfo};
use crate::config::ServerConfig;

/// Tools every fake backend exposes
pub const FAKE_TOOLS: &[&str] = &["echo", "sleep", "hang", "big", "fail"];

#[derive(Default)]
pub struct FakeConnector {
    fail_connect: HashSet<String>,
    fail_close: bool,
    pub connects: AtomicUsize,
    pub closes: Arc<AtomicUsize>,
    log: Arc<Mutex<Vec<String>>>,
}

impl FakeConnector {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn failing_connect(mut self, server: &str) -> Self {
        self.fail_connect.insert(server.to_string());
        self
    }

    pub fn failing_close(mut self) -> Self {
        self.fail_close = true;
        self
    }

    /// Tool calls in the order they started, as `server:tool:label`
    pub fn calls(&self) -> Vec<String> {
        self.log.lock().unwrap().clone()
    }

    pub fn connect_count(&self) -> usize {
        self.connects.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Connector for FakeConnector {
    async fn connect(
        &self,
        server: &str,
        _config: &ServerConfig,
    ) -> Result<Arc<dyn BackendClient>, BackendError> {
        self.connects.fetch_add(1, Ordering::SeqCst);
        if self.fail_connect.contains(server) {
            return Err(BackendError::Handshake {
                server: server.to_string(),
                message: "refused".to_string(),
            });
        }
        Ok(Arc::new(FakeClient {
            server: server.to_string(),
            fail_close: self.fail_close,
            closes: self.closes.clone(),
            log: self.log.clone(),
            closed: AtomicBool::new(false),
        }))
    }
}

struct FakeClient {
    server: String,
    fail_close: bool,
    closes: Arc<AtomicUsize>,
    log: Arc<Mutex<Vec<String>>>,
    closed: AtomicBool,
}

#[async_trait]
impl BackendClient for FakeClient {
    async fn list_tools(&self) -> Result<Vec<ToolInfo>, BackendError> {
        Ok(FAKE_TOOLS
            .iter()
            .map(|name| ToolInfo {
                server: self.server.clone(),
                name: name.to_string(),
                description: Some(format!("fake {}", name)),
                input_schema: Some(serde_json::json!({"type": "object"})),
            })
            .collect())
    }

    async fn call_tool(
        &self,
        tool: &str,
        arguments: Option<Map<String, Value>>,
    ) -> Result<ToolCallResult, BackendError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(BackendError::Closed {
                server: self.server.clone(),
            });
        }
        let args = arguments.unwrap_or_default();
        let label = args
            .get("label")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();
        self.log
            .lock()
            .unwrap()
            .push(format!("{}:{}:{}", self.server, tool, label));

        match tool {
            "echo" => Ok(ToolCallResult::text(Value::Object(args).to_string())),
            "sleep" => {
                let ms = args.get("ms").and_then(Value::as_u64).unwrap_or(10);
                tokio::time::sleep(Duration::from_millis(ms)).await;
                Ok(ToolCallResult::text(format!("slept {}", ms)))
            }
            "hang" => std::future::pending().await,
            "big" => {
                let size = args.get("size").and_then(Value::as_u64).unwrap_or(0) as usize;
                Ok(ToolCallResult::text("x".repeat(size)))
            }
            "fail" => {
                let mut result = ToolCallResult::text("boom");
                result.is_error = true;
                Ok(result)
            }
            other => Err(BackendError::Request {
                server: self.server.clone(),
                message: format!("no tool named '{}'", other),
            }),
        }
    }

    async fn close(&self) -> Result<(), BackendError> {
        self.closed.store(true, Ordering::SeqCst);
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
