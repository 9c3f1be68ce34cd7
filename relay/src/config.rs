//! Configuration loading
//!
//! Two sources feed the daemon:
//! - the server catalog (`.mcp.json`, `{"mcpServers": {...}}`) describing backends
//! - daemon settings: defaults, then `<data_dir>/settings.toml`, then env/CLI overrides

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::pool::PoolOptions;

/// Name of the server catalog file searched for on disk
pub const SERVERS_FILE_NAME: &str = ".mcp.json";

/// Name of the optional daemon settings file inside the data directory
pub const SETTINGS_FILE_NAME: &str = "settings.toml";

/// Parent liveness poll interval for session daemons
pub const DEFAULT_PARENT_POLL_INTERVAL: Duration = Duration::from_secs(5);

/// Find a config file by walking up the directory tree, then checking global config.
///
/// Search order:
/// 1. Current directory and parent directories (walking up to root)
/// 2. Global config at ~/.config/mcp-relay/
fn find_config_file(filename: &str) -> Option<PathBuf> {
    let mut current = std::env::current_dir().ok()?;

    loop {
        let candidate = current.join(filename);
        if candidate.exists() {
            return Some(candidate);
        }

        match current.parent() {
            Some(parent) => current = parent.to_path_buf(),
            None => break,
        }
    }

    if let Some(config_dir) = dirs::config_dir() {
        let global_path = config_dir.join("mcp-relay").join(filename);
        if global_path.exists() {
            return Some(global_path);
        }
    }

    None
}

/// Backend server configuration (one entry of `mcpServers`)
///
/// A stdio backend sets `command` (plus optional `args`, `env`, `cwd`); a
/// remote backend sets `url`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub command: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub args: Vec<String>,
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub env: HashMap<String, String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cwd: Option<PathBuf>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
}

/// How a backend is reached
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transport<'a> {
    Stdio {
        command: &'a str,
        args: &'a [String],
        env: &'a HashMap<String, String>,
        cwd: Option<&'a Path>,
    },
    Http {
        url: &'a str,
    },
}

impl ServerConfig {
    /// Config for a stdio backend
    pub fn stdio(command: impl Into<String>, args: &[&str]) -> Self {
        Self {
            command: Some(command.into()),
            args: args.iter().map(|a| a.to_string()).collect(),
            ..Default::default()
        }
    }

    /// Config for a remote backend
    pub fn http(url: impl Into<String>) -> Self {
        Self {
            url: Some(url.into()),
            ..Default::default()
        }
    }

    /// Resolve the transport, rejecting configs that set both or neither
    pub fn transport(&self) -> Result<Transport<'_>, String> {
        match (self.command.as_deref(), self.url.as_deref()) {
            (Some(command), None) if !command.trim().is_empty() => Ok(Transport::Stdio {
                command,
                args: &self.args,
                env: &self.env,
                cwd: self.cwd.as_deref(),
            }),
            (None, Some(url)) if !url.trim().is_empty() => Ok(Transport::Http { url }),
            (Some(_), Some(_)) => Err("both 'command' and 'url' are set".to_string()),
            _ => Err("one of 'command' or 'url' is required".to_string()),
        }
    }

    /// Short label for listings
    pub fn transport_label(&self) -> &'static str {
        match self.transport() {
            Ok(Transport::Stdio { .. }) => "stdio",
            Ok(Transport::Http { .. }) => "http",
            Err(_) => "invalid",
        }
    }
}

/// Server catalog file contents
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct ServersFile {
    #[serde(rename = "mcpServers", default)]
    pub mcp_servers: BTreeMap<String, ServerConfig>,
}

impl ServersFile {
    /// Locate the catalog file: explicit path first, then the directory walk
    pub fn locate(explicit: Option<&Path>) -> Option<PathBuf> {
        match explicit {
            Some(path) => Some(path.to_path_buf()),
            None => find_config_file(SERVERS_FILE_NAME),
        }
    }

    /// Load from a specific path
    pub fn load_from_path(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read {}", path.display()))?;
        let file: ServersFile = serde_json::from_str(&content)
            .with_context(|| format!("Failed to parse {}", path.display()))?;
        Ok(file)
    }
}

// ============================================================================
// Daemon settings (settings.toml)
// ============================================================================

/// Top-level settings file
#[derive(Debug, Default, Deserialize)]
pub struct SettingsFile {
    #[serde(default)]
    pub daemon: DaemonSection,
}

/// `[daemon]` section; every field is optional so the file can be partial
#[derive(Debug, Default, Deserialize)]
pub struct DaemonSection {
    pub idle_timeout_secs: Option<u64>,
    pub reap_interval_secs: Option<u64>,
    pub auto_disconnect: Option<bool>,
    pub servers_file: Option<PathBuf>,
}

impl SettingsFile {
    /// Load `settings.toml` from the data directory, defaults when absent
    pub fn load(data_dir: &Path) -> Result<Self> {
        let path = data_dir.join(SETTINGS_FILE_NAME);
        if !path.exists() {
            tracing::debug!("No {} found, using defaults", path.display());
            return Ok(Self::default());
        }
        let content = std::fs::read_to_string(&path)
            .with_context(|| format!("Failed to read {}", path.display()))?;
        let settings: SettingsFile = toml::from_str(&content)
            .with_context(|| format!("Failed to parse {}", path.display()))?;
        Ok(settings)
    }
}

/// Values supplied on the command line or through the environment
#[derive(Debug, Clone, Default)]
pub struct ConfigOverrides {
    pub data_dir: Option<PathBuf>,
    pub port: Option<u16>,
    pub parent_pid: Option<u32>,
    pub idle_timeout_secs: Option<u64>,
    pub auto_disconnect: Option<bool>,
    pub servers_file: Option<PathBuf>,
}

/// Fully resolved daemon configuration
#[derive(Debug, Clone)]
pub struct DaemonConfig {
    /// Root for descriptors, settings, and batch side files
    pub data_dir: PathBuf,
    /// 0 asks the OS for an ephemeral port
    pub port: u16,
    /// 0 = singleton daemon; otherwise the process whose exit stops this daemon
    pub parent_pid: u32,
    pub pool: PoolOptions,
    /// How often a session daemon checks that its parent is still alive
    pub parent_poll_interval: Duration,
    pub servers_file: Option<PathBuf>,
}

impl DaemonConfig {
    /// Defaults rooted at `data_dir`
    pub fn new(data_dir: impl Into<PathBuf>) -> Self {
        Self {
            data_dir: data_dir.into(),
            port: 0,
            parent_pid: 0,
            pool: PoolOptions::default(),
            parent_poll_interval: DEFAULT_PARENT_POLL_INTERVAL,
            servers_file: None,
        }
    }

    /// Merge defaults, settings.toml, and overrides (highest precedence last)
    pub fn resolve(overrides: ConfigOverrides) -> Result<Self> {
        let data_dir = overrides.data_dir.clone().unwrap_or_else(default_data_dir);
        let settings = SettingsFile::load(&data_dir)?;
        Ok(Self::from_parts(data_dir, settings, overrides))
    }

    fn from_parts(data_dir: PathBuf, settings: SettingsFile, overrides: ConfigOverrides) -> Self {
        let mut config = Self::new(data_dir);
        let section = settings.daemon;

        if let Some(secs) = section.idle_timeout_secs {
            config.pool.idle_timeout = Duration::from_secs(secs);
        }
        if let Some(secs) = section.reap_interval_secs {
            config.pool.reap_interval = Duration::from_secs(secs.max(1));
        }
        if let Some(enabled) = section.auto_disconnect {
            config.pool.auto_disconnect = enabled;
        }
        config.servers_file = section.servers_file;

        if let Some(port) = overrides.port {
            config.port = port;
        }
        if let Some(pid) = overrides.parent_pid {
            config.parent_pid = pid;
        }
        if let Some(secs) = overrides.idle_timeout_secs {
            config.pool.idle_timeout = Duration::from_secs(secs);
        }
        if let Some(enabled) = overrides.auto_disconnect {
            config.pool.auto_disconnect = enabled;
        }
        if overrides.servers_file.is_some() {
            config.servers_file = overrides.servers_file;
        }

        config
    }

    /// Directory holding one descriptor file per live daemon
    pub fn registry_dir(&self) -> PathBuf {
        registry_dir(&self.data_dir)
    }

    /// Directory receiving batch outputs that are too large to inline
    pub fn batch_output_dir(&self) -> PathBuf {
        self.data_dir.join("batch-outputs")
    }
}

/// Default data directory (`~/.local/share/mcp-relay` on Linux)
pub fn default_data_dir() -> PathBuf {
    dirs::data_local_dir()
        .unwrap_or_else(|| PathBuf::from("/tmp"))
        .join("mcp-relay")
}

/// Registry directory under a data root
pub fn registry_dir(data_dir: &Path) -> PathBuf {
    data_dir.join("daemons")
}
