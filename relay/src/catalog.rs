//! Server catalog
//!
//! The set of configured backends, loaded from the servers file and
//! patchable at runtime.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use anyhow::Result;
use tokio::sync::RwLock;

use crate::config::{ServerConfig, ServersFile};

/// Configured backends by name
#[derive(Debug, Default)]
pub struct ServerCatalog {
    servers: RwLock<BTreeMap<String, ServerConfig>>,
    source: Option<PathBuf>,
}

impl ServerCatalog {
    /// In-memory catalog with no backing file
    pub fn from_servers(servers: BTreeMap<String, ServerConfig>) -> Self {
        Self {
            servers: RwLock::new(servers),
            source: None,
        }
    }

    /// Load from the located servers file; empty when none is found
    pub fn load(explicit: Option<&Path>) -> Result<Self> {
        let Some(path) = ServersFile::locate(explicit) else {
            tracing::info!("No servers file found, starting with an empty catalog");
            return Ok(Self::default());
        };

        let file = ServersFile::load_from_path(&path)?;
        tracing::info!(
            "Loaded {} servers from {}",
            file.mcp_servers.len(),
            path.display()
        );
        Ok(Self {
            servers: RwLock::new(file.mcp_servers),
            source: Some(path),
        })
    }

    pub fn source(&self) -> Option<&Path> {
        self.source.as_deref()
    }

    pub async fn get(&self, name: &str) -> Option<ServerConfig> {
        self.servers.read().await.get(name).cloned()
    }

    pub async fn names(&self) -> Vec<String> {
        self.servers.read().await.keys().cloned().collect()
    }

    pub async fn list(&self) -> Vec<(String, ServerConfig)> {
        self.servers
            .read()
            .await
            .iter()
            .map(|(name, config)| (name.clone(), config.clone()))
            .collect()
    }

    /// Insert or replace one backend; returns the previous entry
    pub async fn set(&self, name: &str, config: ServerConfig) -> Option<ServerConfig> {
        self.servers.write().await.insert(name.to_string(), config)
    }

    /// Re-read the backing file; returns the new server count
    ///
    /// A catalog without a backing file keeps its entries.
    pub async fn reload(&self) -> Result<usize> {
        let Some(path) = &self.source else {
            return Ok(self.servers.read().await.len());
        };
        let file = ServersFile::load_from_path(path)?;
        let count = file.mcp_servers.len();
        *self.servers.write().await = file.mcp_servers;
        tracing::info!("Reloaded {} servers from {}", count, path.display());
        Ok(count)
    }
}
