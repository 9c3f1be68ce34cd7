//! Daemon lifecycle
//!
//! `Starting -> Listening -> (MonitoringParent) -> ShuttingDown -> Stopped`
//!
//! The daemon owns one pool, one registry entry and one HTTP listener.
//! Shutdown runs every teardown step even when an earlier one fails.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use tokio::net::TcpListener;
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use super::api::{router, ApiState};
use super::process::pid_alive;
use super::registry::{DaemonDescriptor, DiscoveryRegistry};
use crate::backend::{Connector, McpConnector};
use crate::catalog::ServerCatalog;
use crate::command::CommandExecutor;
use crate::config::DaemonConfig;
use crate::pool::ConnectionPool;

/// Longest wait for the listener to drain during shutdown
pub const LISTENER_CLOSE_TIMEOUT: Duration = Duration::from_secs(5);

/// Daemon state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum DaemonState {
    Starting,
    Listening,
    MonitoringParent,
    ShuttingDown,
    Stopped,
}

struct DaemonInner {
    descriptor: DaemonDescriptor,
    registry: DiscoveryRegistry,
    executor: CommandExecutor,
    state: watch::Sender<DaemonState>,
    shutdown_requested: CancellationToken,
    monitor: CancellationToken,
    listener_stop: CancellationToken,
    server_task: Mutex<Option<JoinHandle<()>>>,
    shutting_down: AtomicBool,
}

/// Handle to a running daemon
#[derive(Clone)]
pub struct Daemon {
    inner: Arc<DaemonInner>,
}

impl Daemon {
    /// Start a daemon that talks MCP to its backends
    pub async fn start(config: DaemonConfig, catalog: ServerCatalog) -> Result<Self> {
        Self::start_with_connector(config, catalog, Arc::new(McpConnector)).await
    }

    pub async fn start_with_connector(
        config: DaemonConfig,
        catalog: ServerCatalog,
        connector: Arc<dyn Connector>,
    ) -> Result<Self> {
        let (state, _) = watch::channel(DaemonState::Starting);

        let addr = SocketAddr::from(([127, 0, 0, 1], config.port));
        let listener = TcpListener::bind(addr)
            .await
            .with_context(|| format!("Failed to bind to {}", addr))?;
        let port = listener
            .local_addr()
            .context("Failed to read listener address")?
            .port();

        let pool = Arc::new(ConnectionPool::new(connector, config.pool.clone()));
        let executor =
            CommandExecutor::new(pool.clone(), Arc::new(catalog), config.batch_output_dir());

        let descriptor = DaemonDescriptor {
            pid: std::process::id(),
            parent_pid: config.parent_pid,
            port,
            start_time: Utc::now(),
        };
        let registry = DiscoveryRegistry::new(config.registry_dir());
        registry
            .register(&descriptor)
            .context("Failed to write daemon descriptor")?;

        let shutdown_requested = CancellationToken::new();
        let listener_stop = CancellationToken::new();

        let api_state = ApiState {
            executor: executor.clone(),
            descriptor: descriptor.clone(),
            started: Instant::now(),
            state: state.subscribe(),
            shutdown: shutdown_requested.clone(),
        };
        let app = router(api_state);
        let stop = listener_stop.clone();
        let server_task = tokio::spawn(async move {
            let server = axum::serve(listener, app).with_graceful_shutdown(async move {
                stop.cancelled().await;
                tracing::debug!("Control surface draining");
            });
            if let Err(e) = server.await {
                tracing::error!("Control surface error: {}", e);
            }
        });

        let daemon = Self {
            inner: Arc::new(DaemonInner {
                descriptor,
                registry,
                executor,
                state,
                shutdown_requested,
                monitor: CancellationToken::new(),
                listener_stop,
                server_task: Mutex::new(Some(server_task)),
                shutting_down: AtomicBool::new(false),
            }),
        };
        daemon.set_state(DaemonState::Listening);
        tracing::info!(
            "Daemon {} listening on 127.0.0.1:{}",
            daemon.inner.descriptor.pid,
            port
        );

        if config.pool.auto_disconnect {
            pool.start_reaper();
        }

        let parent = config.parent_pid;
        if parent > 0 && pid_alive(parent) {
            daemon.spawn_parent_monitor(parent, config.parent_poll_interval);
            daemon.set_state(DaemonState::MonitoringParent);
        } else if parent > 0 {
            tracing::warn!(
                "Parent process {} is not running; parent monitoring disabled",
                parent
            );
        }

        daemon.spawn_supervisor();
        Ok(daemon)
    }

    pub fn descriptor(&self) -> &DaemonDescriptor {
        &self.inner.descriptor
    }

    pub fn port(&self) -> u16 {
        self.inner.descriptor.port
    }

    pub fn base_url(&self) -> String {
        self.inner.descriptor.base_url()
    }

    pub fn state(&self) -> DaemonState {
        *self.inner.state.borrow()
    }

    pub fn registry(&self) -> &DiscoveryRegistry {
        &self.inner.registry
    }

    pub fn executor(&self) -> &CommandExecutor {
        &self.inner.executor
    }

    pub fn pool(&self) -> &Arc<ConnectionPool> {
        self.inner.executor.pool()
    }

    /// Ask the daemon to shut down from its own supervisor task
    pub fn request_shutdown(&self) {
        self.inner.shutdown_requested.cancel();
    }

    /// Ordered, idempotent teardown
    ///
    /// Parent monitor, then pooled connections, then the descriptor, then
    /// the listener. Failures are logged and the next step still runs.
    pub async fn shutdown(&self) {
        let inner = &self.inner;
        if inner.shutting_down.swap(true, Ordering::SeqCst) {
            self.wait().await;
            return;
        }

        self.set_state(DaemonState::ShuttingDown);
        tracing::info!("Daemon {} shutting down", inner.descriptor.pid);
        inner.shutdown_requested.cancel();

        inner.monitor.cancel();

        let report = inner.executor.pool().shutdown().await;
        if report.failed > 0 {
            tracing::warn!(
                "{} of {} connections failed to close cleanly",
                report.failed,
                report.closed + report.failed
            );
        }

        if let Err(e) = inner.registry.remove(&inner.descriptor) {
            tracing::warn!("Failed to remove daemon descriptor: {}", e);
        }

        inner.listener_stop.cancel();
        let server_task = inner.server_task.lock().await.take();
        if let Some(handle) = server_task {
            let abort = handle.abort_handle();
            match tokio::time::timeout(LISTENER_CLOSE_TIMEOUT, handle).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => tracing::warn!("Control surface task failed: {}", e),
                Err(_) => {
                    tracing::warn!(
                        "Listener did not close within {:?}, aborting",
                        LISTENER_CLOSE_TIMEOUT
                    );
                    abort.abort();
                }
            }
        }

        self.set_state(DaemonState::Stopped);
        tracing::info!("Daemon {} stopped", inner.descriptor.pid);
    }

    /// Resolve once the daemon has stopped
    pub async fn wait(&self) {
        let mut rx = self.inner.state.subscribe();
        let _ = rx.wait_for(|s| *s == DaemonState::Stopped).await;
    }

    fn set_state(&self, state: DaemonState) {
        self.inner.state.send_replace(state);
    }

    fn spawn_parent_monitor(&self, parent: u32, every: Duration) {
        let stop = self.inner.monitor.clone();
        let shutdown = self.inner.shutdown_requested.clone();
        tracing::info!("Monitoring parent process {} every {:?}", parent, every);

        tokio::spawn(async move {
            let mut interval = tokio::time::interval(every);
            loop {
                tokio::select! {
                    _ = stop.cancelled() => break,
                    _ = interval.tick() => {
                        if !pid_alive(parent) {
                            tracing::info!("Parent process {} exited", parent);
                            shutdown.cancel();
                            break;
                        }
                    }
                }
            }
        });
    }

    /// Runs the shutdown sequence once a shutdown has been requested
    fn spawn_supervisor(&self) {
        let daemon = self.clone();
        tokio::spawn(async move {
            daemon.inner.shutdown_requested.cancelled().await;
            daemon.shutdown().await;
        });
    }
}
