//! Client for talking to a running daemon over its control surface

use std::time::Duration;

use anyhow::{Context, Result};
use relay_common::Envelope;
use serde::de::DeserializeOwned;
use serde_json::Value;

use super::api::DaemonStatus;
use super::registry::{DaemonDescriptor, DaemonSelector, DiscoveryRegistry};
use crate::command::{CommandOutput, CommandRequest};

/// Timeout for health probes
const HEALTH_TIMEOUT: Duration = Duration::from_secs(2);

/// HTTP client for one daemon
#[derive(Clone)]
pub struct DaemonClient {
    base_url: String,
    http: reqwest::Client,
}

impl DaemonClient {
    /// Client for a daemon listening on `127.0.0.1:<port>`
    pub fn new(port: u16) -> Self {
        Self::with_base_url(format!("http://127.0.0.1:{}", port))
    }

    pub fn with_base_url(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
            http: reqwest::Client::new(),
        }
    }

    pub fn for_descriptor(descriptor: &DaemonDescriptor) -> Self {
        Self::with_base_url(descriptor.base_url())
    }

    /// Locate a daemon through the registry
    pub fn discover(registry: &DiscoveryRegistry, selector: DaemonSelector) -> Result<Self> {
        let descriptor = registry.select(selector)?;
        tracing::debug!(
            "Using daemon pid {} on port {}",
            descriptor.pid,
            descriptor.port
        );
        Ok(Self::for_descriptor(&descriptor))
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// Daemon status
    pub async fn status(&self) -> Result<DaemonStatus> {
        self.get_data("/status").await
    }

    /// Whether the daemon answers `GET /status` promptly
    pub async fn is_healthy(&self) -> bool {
        let probe = self
            .http
            .get(format!("{}/status", self.base_url))
            .timeout(HEALTH_TIMEOUT)
            .send()
            .await;
        matches!(probe, Ok(response) if response.status().is_success())
    }

    /// Run one command through `POST /execute`
    pub async fn execute(&self, request: &CommandRequest) -> Result<CommandOutput> {
        let response = self
            .http
            .post(format!("{}/execute", self.base_url))
            .json(request)
            .send()
            .await
            .with_context(|| format!("Failed to reach daemon at {}", self.base_url))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            if let Ok(output) = serde_json::from_str::<CommandOutput>(&body) {
                return Ok(output);
            }
            anyhow::bail!("Daemon rejected command ({}): {}", status, body);
        }
        response
            .json::<CommandOutput>()
            .await
            .context("Failed to parse command output")
    }

    /// Ask the daemon to shut down
    pub async fn shutdown(&self) -> Result<()> {
        let response = self
            .http
            .post(format!("{}/shutdown", self.base_url))
            .send()
            .await
            .with_context(|| format!("Failed to reach daemon at {}", self.base_url))?;
        let envelope: Envelope<Value> = response
            .json()
            .await
            .context("Failed to parse shutdown response")?;
        envelope.into_result()?;
        Ok(())
    }

    /// GET a route and unwrap its envelope
    pub async fn get_data<T: DeserializeOwned>(&self, path: &str) -> Result<T> {
        let response = self
            .http
            .get(format!("{}{}", self.base_url, path))
            .send()
            .await
            .with_context(|| format!("Failed to reach daemon at {}", self.base_url))?;
        let envelope: Envelope<T> = response
            .json()
            .await
            .with_context(|| format!("Failed to parse response from {}", path))?;
        Ok(envelope.into_result()?)
    }
}

/// Refuse to start a singleton when a healthy one is already running
pub async fn ensure_no_running_singleton(registry: &DiscoveryRegistry) -> Result<()> {
    for descriptor in registry.singletons() {
        if DaemonClient::for_descriptor(&descriptor).is_healthy().await {
            anyhow::bail!(
                "A daemon is already running (pid {}, port {})",
                descriptor.pid,
                descriptor.port
            );
        }
        tracing::debug!(
            "Singleton pid {} on port {} is not answering, ignoring it",
            descriptor.pid,
            descriptor.port
        );
    }
    Ok(())
}
