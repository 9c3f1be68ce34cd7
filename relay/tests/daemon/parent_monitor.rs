//! Session daemons exit when their parent does

use std::sync::Arc;
use std::time::Duration;

use mcp_relay::config::DaemonConfig;
use mcp_relay::daemon::DaemonState;

use crate::support::{start_with_config, wait_stopped, StubConnector};

#[cfg(unix)]
#[tokio::test]
async fn test_daemon_stops_after_parent_exits() {
    let dir = tempfile::tempdir().unwrap();
    let mut parent = tokio::process::Command::new("sleep")
        .arg("30")
        .spawn()
        .expect("Failed to spawn stand-in parent");
    let parent_pid = parent.id().expect("child has no pid");

    let mut config = DaemonConfig::new(dir.path());
    config.parent_pid = parent_pid;
    config.parent_poll_interval = Duration::from_millis(50);

    let daemon = start_with_config(config, Arc::new(StubConnector::new())).await;
    assert_eq!(daemon.state(), DaemonState::MonitoringParent);
    assert_eq!(
        daemon.registry().find_by_parent(parent_pid),
        Some(daemon.descriptor().clone())
    );

    // Reap the child so its pid stops resolving
    parent.kill().await.unwrap();

    wait_stopped(&daemon, 10).await;
    assert!(daemon.registry().find_by_parent(parent_pid).is_none());
}

#[tokio::test]
async fn test_singleton_has_no_parent_monitor() {
    let dir = tempfile::tempdir().unwrap();
    let daemon = start_with_config(DaemonConfig::new(dir.path()), Arc::new(StubConnector::new())).await;

    assert_eq!(daemon.state(), DaemonState::Listening);
    assert!(daemon.descriptor().is_singleton());
    assert_eq!(daemon.registry().singletons().len(), 1);

    daemon.shutdown().await;
}
