//! Refusing a second singleton daemon

use std::sync::Arc;

use chrono::Utc;
use mcp_relay::daemon::{ensure_no_running_singleton, DaemonDescriptor, DiscoveryRegistry};

use crate::support::{start_daemon, StubConnector};

#[tokio::test]
async fn test_running_singleton_blocks_another() {
    let dir = tempfile::tempdir().unwrap();
    let daemon = start_daemon(dir.path(), Arc::new(StubConnector::new())).await;

    let err = ensure_no_running_singleton(daemon.registry())
        .await
        .unwrap_err();
    assert!(
        err.to_string().contains(&daemon.port().to_string()),
        "unexpected error: {}",
        err
    );

    daemon.shutdown().await;
    ensure_no_running_singleton(daemon.registry()).await.unwrap();
}

#[tokio::test]
async fn test_silent_singleton_is_ignored() {
    let dir = tempfile::tempdir().unwrap();
    let registry = DiscoveryRegistry::new(dir.path().join("daemons"));

    // Live pid, but nothing listens on the port
    let port = {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        listener.local_addr().unwrap().port()
    };
    let descriptor = DaemonDescriptor {
        pid: std::process::id(),
        parent_pid: 0,
        port,
        start_time: Utc::now(),
    };
    registry.register(&descriptor).unwrap();
    assert_eq!(registry.singletons(), vec![descriptor]);

    ensure_no_running_singleton(&registry).await.unwrap();
}
