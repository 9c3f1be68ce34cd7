//! Commands accepted by the daemon
//!
//! Every unit of work (a single `POST /execute`, one call inside a batch)
//! is a [`CommandRequest`] naming one [`CommandKind`]. The kind table decides
//! whether a command may appear inside a batch and which backend it targets.

mod executor;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

pub use executor::{CommandExecutor, ServerSummary};

/// Closed set of commands
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CommandKind {
    ListServers,
    ListTools,
    DescribeTool,
    InvokeTool,
    Connect,
    Disconnect,
    Reconnect,
    ListConnections,
    ReloadConfig,
    SetConfig,
    Batch,
}

/// Whether a command may run inside a batch
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BatchPolicy {
    /// Read-only, allowed
    Allowed,
    /// Mutating or recursive, rejected outright
    Denied,
    /// Neither allowed nor explicitly denied; rejected
    Unlisted,
}

/// Scheduling bucket a batch call lands in
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum BatchTarget {
    Backend(String),
    /// Calls that touch no single backend
    Global,
    /// Calls whose backend cannot be determined
    Unknown,
}

impl BatchTarget {
    pub fn label(&self) -> &str {
        match self {
            BatchTarget::Backend(name) => name,
            BatchTarget::Global => "<global>",
            BatchTarget::Unknown => "<unknown>",
        }
    }
}

impl CommandKind {
    pub const ALL: [CommandKind; 11] = [
        CommandKind::ListServers,
        CommandKind::ListTools,
        CommandKind::DescribeTool,
        CommandKind::InvokeTool,
        CommandKind::Connect,
        CommandKind::Disconnect,
        CommandKind::Reconnect,
        CommandKind::ListConnections,
        CommandKind::ReloadConfig,
        CommandKind::SetConfig,
        CommandKind::Batch,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            CommandKind::ListServers => "list-servers",
            CommandKind::ListTools => "list-tools",
            CommandKind::DescribeTool => "describe-tool",
            CommandKind::InvokeTool => "invoke-tool",
            CommandKind::Connect => "connect",
            CommandKind::Disconnect => "disconnect",
            CommandKind::Reconnect => "reconnect",
            CommandKind::ListConnections => "list-connections",
            CommandKind::ReloadConfig => "reload-config",
            CommandKind::SetConfig => "set-config",
            CommandKind::Batch => "batch",
        }
    }

    pub fn parse(name: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|kind| kind.name() == name)
    }

    pub fn batch_policy(&self) -> BatchPolicy {
        match self {
            CommandKind::InvokeTool
            | CommandKind::ListServers
            | CommandKind::ListTools
            | CommandKind::DescribeTool => BatchPolicy::Allowed,
            CommandKind::Connect
            | CommandKind::Disconnect
            | CommandKind::Reconnect
            | CommandKind::ReloadConfig
            | CommandKind::SetConfig
            | CommandKind::Batch => BatchPolicy::Denied,
            CommandKind::ListConnections => BatchPolicy::Unlisted,
        }
    }

    pub fn batch_target(&self, args: &[String]) -> BatchTarget {
        let first = args.first().filter(|a| !a.is_empty());
        match (self, first) {
            (CommandKind::InvokeTool | CommandKind::DescribeTool, Some(server)) => {
                BatchTarget::Backend(server.clone())
            }
            (CommandKind::ListTools, Some(server)) => BatchTarget::Backend(server.clone()),
            (CommandKind::ListTools, None) | (CommandKind::ListServers, _) => BatchTarget::Global,
            _ => BatchTarget::Unknown,
        }
    }
}

impl std::fmt::Display for CommandKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

/// A parsed command
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CommandRequest {
    pub command: String,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default, skip_serializing_if = "Map::is_empty")]
    pub params: Map<String, Value>,
}

impl CommandRequest {
    pub fn new(command: &str, args: &[&str]) -> Self {
        Self {
            command: command.to_string(),
            args: args.iter().map(|a| a.to_string()).collect(),
            params: Map::new(),
        }
    }

    pub fn with_params(mut self, params: Map<String, Value>) -> Self {
        self.params = params;
        self
    }

    pub fn arg(&self, index: usize) -> Option<&str> {
        self.args.get(index).map(String::as_str)
    }
}

/// Exit code for a successful command
pub const EXIT_OK: i32 = 0;
/// Exit code for a command that ran and failed
pub const EXIT_FAILURE: i32 = 1;
/// Exit code for a malformed command
pub const EXIT_USAGE: i32 = 2;

/// Uniform command result
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CommandOutput {
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(rename = "exitCode")]
    pub exit_code: i32,
}

impl CommandOutput {
    pub fn ok(output: impl Into<String>) -> Self {
        Self {
            success: true,
            output: Some(output.into()),
            error: None,
            exit_code: EXIT_OK,
        }
    }

    pub fn failure(error: impl Into<String>) -> Self {
        Self {
            success: false,
            output: None,
            error: Some(error.into()),
            exit_code: EXIT_FAILURE,
        }
    }

    pub fn usage(error: impl Into<String>) -> Self {
        Self {
            exit_code: EXIT_USAGE,
            ..Self::failure(error)
        }
    }
}

/// Runs one command to completion
#[async_trait]
pub trait CommandRunner: Send + Sync {
    async fn run(&self, request: &CommandRequest) -> CommandOutput;
}
