//! Ordered teardown and discovery cleanup

use std::sync::Arc;

use mcp_relay::daemon::{DaemonClient, DaemonSelector, DaemonState};
use serde_json::Value;

use crate::support::{start_daemon, wait_stopped, StubConnector, SERVERS};

#[tokio::test]
async fn test_shutdown_closes_everything_despite_close_failures() {
    let dir = tempfile::tempdir().unwrap();
    let connector = Arc::new(StubConnector::failing_close());
    let daemon = start_daemon(dir.path(), connector.clone()).await;
    let port = daemon.port();

    for name in SERVERS {
        daemon
            .executor()
            .connect(name, None, false)
            .await
            .unwrap();
    }
    assert_eq!(daemon.pool().len().await, 2);

    let descriptor_path = daemon.registry().path_for(daemon.descriptor());
    assert!(descriptor_path.exists());

    daemon.shutdown().await;

    assert_eq!(daemon.state(), DaemonState::Stopped);
    assert_eq!(connector.close_count(), 2);
    assert!(daemon.pool().is_empty().await);
    assert!(!descriptor_path.exists());
    assert!(daemon.registry().list().is_empty());

    let refused = tokio::net::TcpStream::connect(("127.0.0.1", port)).await;
    assert!(refused.is_err(), "listener still accepting on {}", port);
}

#[tokio::test]
async fn test_shutdown_route_stops_daemon() {
    let dir = tempfile::tempdir().unwrap();
    let daemon = start_daemon(dir.path(), Arc::new(StubConnector::new())).await;
    let client = DaemonClient::for_descriptor(daemon.descriptor());

    client.shutdown().await.unwrap();
    wait_stopped(&daemon, 10).await;

    assert!(daemon.registry().list().is_empty());
    assert!(!client.is_healthy().await);
}

#[tokio::test]
async fn test_shutdown_response_arrives_before_teardown() {
    let dir = tempfile::tempdir().unwrap();
    let daemon = start_daemon(dir.path(), Arc::new(StubConnector::new())).await;

    let body: Value = reqwest::Client::new()
        .post(format!("{}/shutdown", daemon.base_url()))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(body["success"], true);

    wait_stopped(&daemon, 10).await;
}

#[tokio::test]
async fn test_discovery_finds_running_daemon() {
    let dir = tempfile::tempdir().unwrap();
    let daemon = start_daemon(dir.path(), Arc::new(StubConnector::new())).await;

    let selector = DaemonSelector {
        port: Some(daemon.port()),
        ..Default::default()
    };
    let client = DaemonClient::discover(daemon.registry(), selector).unwrap();
    assert_eq!(client.base_url(), daemon.base_url());

    let wrong_port = DaemonSelector {
        port: Some(daemon.port().wrapping_add(1)),
        ..Default::default()
    };
    assert!(DaemonClient::discover(daemon.registry(), wrong_port).is_err());

    daemon.shutdown().await;
    assert!(DaemonClient::discover(daemon.registry(), DaemonSelector::default()).is_err());
}
