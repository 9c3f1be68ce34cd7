use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use serde_json::{Map, Value};

use mcp_relay::catalog::ServerCatalog;
use mcp_relay::command::CommandRequest;
use mcp_relay::config::{default_data_dir, registry_dir, ConfigOverrides, DaemonConfig};
use mcp_relay::daemon::{
    ensure_no_running_singleton, Daemon, DaemonClient, DaemonSelector, DiscoveryRegistry,
};

#[derive(Parser)]
#[command(name = "mcp-relay")]
#[command(about = "Multiplexing daemon for MCP tool servers")]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Root for descriptors, settings and batch outputs
    #[arg(long, global = true, env = "MCP_RELAY_DATA_DIR")]
    data_dir: Option<PathBuf>,

    /// Port to listen on (daemon) or to connect to (clients)
    #[arg(long, global = true, env = "MCP_RELAY_PORT")]
    port: Option<u16>,

    /// Parent process id; the daemon exits when it does
    #[arg(long, global = true, env = "MCP_RELAY_PARENT_PID")]
    parent_pid: Option<u32>,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the daemon in the foreground
    Daemon {
        /// Seconds a connection may sit unused before it is closed
        #[arg(long, env = "MCP_RELAY_IDLE_TIMEOUT")]
        idle_timeout: Option<u64>,

        /// Close idle connections automatically
        #[arg(long, env = "MCP_RELAY_AUTO_DISCONNECT")]
        auto_disconnect: Option<bool>,

        /// Server catalog file (.mcp.json format)
        #[arg(long, env = "MCP_RELAY_SERVERS")]
        servers: Option<PathBuf>,
    },
    /// Show the status of a running daemon
    Status {
        /// Pick the daemon with this pid
        #[arg(long)]
        pid: Option<u32>,
    },
    /// Stop a running daemon
    Stop {
        /// Pick the daemon with this pid
        #[arg(long)]
        pid: Option<u32>,
    },
    /// Run one command on a running daemon
    Exec {
        /// Command name (list-servers, invoke-tool, batch, ...)
        command: String,

        /// Positional arguments
        #[arg(trailing_var_arg = true, allow_hyphen_values = true)]
        args: Vec<String>,

        /// Named parameters as a JSON object
        #[arg(long)]
        params: Option<String>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    relay_common::init_tracing("mcp_relay")?;

    let cli = Cli::parse();

    match cli.command {
        Commands::Daemon {
            idle_timeout,
            auto_disconnect,
            servers,
        } => {
            let overrides = ConfigOverrides {
                data_dir: cli.data_dir,
                port: cli.port,
                parent_pid: cli.parent_pid,
                idle_timeout_secs: idle_timeout,
                auto_disconnect,
                servers_file: servers,
            };
            run_daemon(overrides).await?;
        }
        Commands::Status { pid } => {
            let client = discover(cli.data_dir, cli.port, pid, cli.parent_pid)?;
            let status = client.status().await?;
            println!("{}", serde_json::to_string_pretty(&status)?);
        }
        Commands::Stop { pid } => {
            let client = discover(cli.data_dir, cli.port, pid, cli.parent_pid)?;
            client.shutdown().await?;
            println!("Daemon at {} is shutting down.", client.base_url());
        }
        Commands::Exec {
            command,
            args,
            params,
        } => {
            let client = discover(cli.data_dir, cli.port, None, cli.parent_pid)?;
            let request = CommandRequest {
                command,
                args,
                params: parse_params(params.as_deref())?,
            };
            let output = client.execute(&request).await?;
            if let Some(text) = &output.output {
                println!("{}", text);
            }
            if let Some(error) = &output.error {
                eprintln!("Error: {}", error);
            }
            if output.exit_code != 0 {
                std::process::exit(output.exit_code);
            }
        }
    }

    Ok(())
}

async fn run_daemon(overrides: ConfigOverrides) -> Result<()> {
    let config = DaemonConfig::resolve(overrides)?;

    if config.parent_pid == 0 {
        ensure_no_running_singleton(&DiscoveryRegistry::new(config.registry_dir())).await?;
    }

    let catalog = ServerCatalog::load(config.servers_file.as_deref())?;
    let daemon = Daemon::start(config, catalog).await?;
    println!("mcp-relay listening on {}", daemon.base_url());

    tokio::select! {
        _ = shutdown_signal() => {
            tracing::info!("Received shutdown signal");
            daemon.shutdown().await;
        }
        _ = daemon.wait() => {}
    }

    Ok(())
}

fn discover(
    data_dir: Option<PathBuf>,
    port: Option<u16>,
    pid: Option<u32>,
    parent_pid: Option<u32>,
) -> Result<DaemonClient> {
    let data_dir = data_dir.unwrap_or_else(default_data_dir);
    let registry = DiscoveryRegistry::new(registry_dir(&data_dir));
    let selector = DaemonSelector {
        port,
        pid,
        parent_pid,
    };
    DaemonClient::discover(&registry, selector)
}

fn parse_params(raw: Option<&str>) -> Result<Map<String, Value>> {
    let Some(raw) = raw else {
        return Ok(Map::new());
    };
    match serde_json::from_str(raw).context("--params is not valid JSON")? {
        Value::Object(map) => Ok(map),
        _ => anyhow::bail!("--params must be a JSON object"),
    }
}

/// Ctrl-C, or SIGTERM on unix
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::warn!("Failed to listen for Ctrl-C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                tracing::warn!("Failed to listen for SIGTERM: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
}
