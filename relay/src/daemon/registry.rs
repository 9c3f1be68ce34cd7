//! Discovery registry
//!
//! One small JSON descriptor per running daemon, stored as
//! `<dir>/daemon-<parentPid>-<pid>.json`. Readers re-check every pid and
//! delete descriptors whose process is gone.

use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::process::pid_alive;

/// Registry errors
#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    #[error("registry I/O error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to encode descriptor: {0}")]
    Encode(#[from] serde_json::Error),

    #[error("no running daemon found{0}")]
    NoDaemon(String),
}

/// A running daemon as seen by other processes
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DaemonDescriptor {
    pub pid: u32,
    /// 0 for a singleton daemon
    pub parent_pid: u32,
    pub port: u16,
    pub start_time: DateTime<Utc>,
}

impl DaemonDescriptor {
    pub fn is_singleton(&self) -> bool {
        self.parent_pid == 0
    }

    pub fn file_name(&self) -> String {
        format!("daemon-{}-{}.json", self.parent_pid, self.pid)
    }

    pub fn base_url(&self) -> String {
        format!("http://127.0.0.1:{}", self.port)
    }
}

/// Explicit daemon choice; empty means "pick by policy"
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DaemonSelector {
    pub port: Option<u16>,
    pub pid: Option<u32>,
    pub parent_pid: Option<u32>,
}

impl DaemonSelector {
    fn is_empty(&self) -> bool {
        self.port.is_none() && self.pid.is_none() && self.parent_pid.is_none()
    }

    fn matches(&self, d: &DaemonDescriptor) -> bool {
        self.port.map_or(true, |p| p == d.port)
            && self.pid.map_or(true, |p| p == d.pid)
            && self.parent_pid.map_or(true, |p| p == d.parent_pid)
    }
}

impl std::fmt::Display for DaemonSelector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut parts = Vec::new();
        if let Some(port) = self.port {
            parts.push(format!("port {}", port));
        }
        if let Some(pid) = self.pid {
            parts.push(format!("pid {}", pid));
        }
        if let Some(ppid) = self.parent_pid {
            parts.push(format!("parent {}", ppid));
        }
        if !parts.is_empty() {
            write!(f, " for {}", parts.join(", "))?;
        }
        Ok(())
    }
}

/// Descriptor directory
#[derive(Debug, Clone)]
pub struct DiscoveryRegistry {
    dir: PathBuf,
}

impl DiscoveryRegistry {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn path_for(&self, descriptor: &DaemonDescriptor) -> PathBuf {
        self.dir.join(descriptor.file_name())
    }

    /// Write a descriptor atomically (temp file + rename)
    pub fn register(&self, descriptor: &DaemonDescriptor) -> Result<PathBuf, RegistryError> {
        std::fs::create_dir_all(&self.dir).map_err(|source| RegistryError::Io {
            path: self.dir.clone(),
            source,
        })?;

        let path = self.path_for(descriptor);
        let tmp = path.with_extension("json.tmp");
        let body = serde_json::to_vec_pretty(descriptor)?;

        std::fs::write(&tmp, body).map_err(|source| RegistryError::Io {
            path: tmp.clone(),
            source,
        })?;
        std::fs::rename(&tmp, &path).map_err(|source| RegistryError::Io {
            path: path.clone(),
            source,
        })?;

        tracing::debug!("Registered daemon descriptor {}", path.display());
        Ok(path)
    }

    /// Remove a descriptor; a missing file is not an error
    pub fn remove(&self, descriptor: &DaemonDescriptor) -> Result<(), RegistryError> {
        let path = self.path_for(descriptor);
        match std::fs::remove_file(&path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(source) => Err(RegistryError::Io { path, source }),
        }
    }

    /// Live descriptors, newest first; stale and unreadable files are deleted
    pub fn list(&self) -> Vec<DaemonDescriptor> {
        let entries = match std::fs::read_dir(&self.dir) {
            Ok(entries) => entries,
            Err(_) => return Vec::new(),
        };

        let mut live = Vec::new();
        for entry in entries.flatten() {
            let path = entry.path();
            let is_descriptor = path
                .file_name()
                .and_then(|n| n.to_str())
                .is_some_and(|n| n.starts_with("daemon-") && n.ends_with(".json"));
            if !is_descriptor {
                continue;
            }

            match read_descriptor(&path) {
                Some(d) if pid_alive(d.pid) => live.push(d),
                Some(d) => {
                    tracing::debug!("Removing stale descriptor for pid {}", d.pid);
                    let _ = std::fs::remove_file(&path);
                }
                None => {
                    tracing::debug!("Removing unreadable descriptor {}", path.display());
                    let _ = std::fs::remove_file(&path);
                }
            }
        }

        live.sort_by(|a, b| b.start_time.cmp(&a.start_time));
        live
    }

    pub fn find_by_parent(&self, parent_pid: u32) -> Option<DaemonDescriptor> {
        self.list().into_iter().find(|d| d.parent_pid == parent_pid)
    }

    /// Most recently started live daemon
    pub fn find_latest(&self) -> Option<DaemonDescriptor> {
        self.list().into_iter().next()
    }

    /// Live singleton daemons, newest first
    pub fn singletons(&self) -> Vec<DaemonDescriptor> {
        self.list().into_iter().filter(|d| d.is_singleton()).collect()
    }

    /// Pick the daemon a caller should talk to
    ///
    /// An explicit selector must match. Otherwise the newest singleton wins,
    /// then the newest session daemon.
    pub fn select(&self, selector: DaemonSelector) -> Result<DaemonDescriptor, RegistryError> {
        let live = self.list();

        let found = if selector.is_empty() {
            live.iter()
                .find(|d| d.is_singleton())
                .or_else(|| live.first())
                .cloned()
        } else {
            live.into_iter().find(|d| selector.matches(d))
        };

        found.ok_or_else(|| RegistryError::NoDaemon(selector.to_string()))
    }
}

fn read_descriptor(path: &Path) -> Option<DaemonDescriptor> {
    let raw = std::fs::read_to_string(path).ok()?;
    serde_json::from_str(&raw).ok()
}
