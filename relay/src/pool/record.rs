//! Connection identity and snapshots

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Lookup key: backend name plus optional instance tag
///
/// An absent tag is the backend's default instance.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionKey {
    pub backend: String,
    pub instance: Option<String>,
}

impl ConnectionKey {
    pub fn new(backend: &str, instance: Option<&str>) -> Self {
        Self {
            backend: backend.to_string(),
            instance: instance.map(str::to_string),
        }
    }
}

impl std::fmt::Display for ConnectionKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.instance {
            Some(tag) => write!(f, "{}#{}", self.backend, tag),
            None => write!(f, "{}", self.backend),
        }
    }
}

/// Connection state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionStatus {
    Connected,
    Disconnected,
}

impl std::fmt::Display for ConnectionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConnectionStatus::Connected => write!(f, "connected"),
            ConnectionStatus::Disconnected => write!(f, "disconnected"),
        }
    }
}

/// Snapshot of one managed connection
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConnectionRecord {
    /// Process-wide id, starting at 1, never reused
    pub id: u64,
    pub backend: String,
    pub instance: Option<String>,
    pub status: ConnectionStatus,
    pub connected_at: DateTime<Utc>,
    pub last_used_at: DateTime<Utc>,
    pub closed_at: Option<DateTime<Utc>>,
}

impl ConnectionRecord {
    pub fn key(&self) -> ConnectionKey {
        ConnectionKey::new(&self.backend, self.instance.as_deref())
    }

    pub fn is_connected(&self) -> bool {
        self.status == ConnectionStatus::Connected
    }
}
