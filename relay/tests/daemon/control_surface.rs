//! REST routes, status codes and the response envelope

use std::sync::Arc;

use mcp_relay::daemon::{DaemonClient, DaemonState};
use reqwest::StatusCode;
use serde_json::{json, Value};

use crate::support::{start_daemon, StubConnector};

async fn get_json(url: String) -> (StatusCode, Value) {
    let response = reqwest::get(url).await.expect("request failed");
    let status = response.status();
    (status, response.json().await.expect("body is not JSON"))
}

#[tokio::test]
async fn test_status_reports_descriptor() {
    let dir = tempfile::tempdir().unwrap();
    let daemon = start_daemon(dir.path(), Arc::new(StubConnector::new())).await;

    let client = DaemonClient::for_descriptor(daemon.descriptor());
    assert!(client.is_healthy().await);

    let status = client.status().await.unwrap();
    assert_eq!(status.pid, std::process::id());
    assert_eq!(status.port, daemon.port());
    assert_eq!(status.parent_pid, 0);
    assert_eq!(status.state, DaemonState::Listening);
    assert_eq!(status.servers, 2);
    assert_eq!(status.connections, 0);

    daemon.shutdown().await;
}

#[tokio::test]
async fn test_connect_then_noop_then_disconnect() {
    let dir = tempfile::tempdir().unwrap();
    let connector = Arc::new(StubConnector::new());
    let daemon = start_daemon(dir.path(), connector.clone()).await;
    let http = reqwest::Client::new();
    let url = format!("{}/servers/alpha/connections", daemon.base_url());

    let first = http.post(&url).send().await.unwrap();
    assert_eq!(first.status(), StatusCode::CREATED);
    let body: Value = first.json().await.unwrap();
    assert_eq!(body["success"], true);
    assert_eq!(body["data"]["status"], "created");
    assert_eq!(body["data"]["connection"]["id"], 1);

    let second = http.post(&url).send().await.unwrap();
    assert_eq!(second.status(), StatusCode::OK);
    let body: Value = second.json().await.unwrap();
    assert_eq!(body["data"]["status"], "noop");
    assert_eq!(body["data"]["connection"]["id"], 1);
    assert_eq!(connector.connects.load(std::sync::atomic::Ordering::SeqCst), 1);

    let tagged = http
        .post(&url)
        .json(&json!({"instance": "work"}))
        .send()
        .await
        .unwrap();
    assert_eq!(tagged.status(), StatusCode::CREATED);

    let (status, listing) = get_json(format!("{}/connections", daemon.base_url())).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(listing["meta"]["count"], 2);

    let deleted = http.delete(&url).send().await.unwrap();
    assert_eq!(deleted.status(), StatusCode::OK);
    let body: Value = deleted.json().await.unwrap();
    assert_eq!(body["data"]["status"], "disconnected");

    // Disconnected records are purged
    let (status, body) = get_json(format!("{}/connections/1", daemon.base_url())).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body["error"]["code"], "connection-not-found");

    daemon.shutdown().await;
}

#[tokio::test]
async fn test_error_envelopes() {
    let dir = tempfile::tempdir().unwrap();
    let daemon = start_daemon(dir.path(), Arc::new(StubConnector::new())).await;
    let base = daemon.base_url();

    let (status, body) = get_json(format!("{}/connections/abc", base)).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["success"], false);
    assert_eq!(body["error"]["code"], "invalid-id-format");

    let (status, body) = get_json(format!("{}/servers/missing", base)).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body["error"]["code"], "backend-not-found");

    let (status, body) = get_json(format!("{}/servers/alpha/connections/nope", base)).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body["error"]["code"], "connection-not-found");

    let reconnect = reqwest::Client::new()
        .post(format!("{}/servers/beta/reconnect", base))
        .send()
        .await
        .unwrap();
    assert_eq!(reconnect.status(), StatusCode::CONFLICT);

    daemon.shutdown().await;
}

#[tokio::test]
async fn test_tools_and_invoke() {
    let dir = tempfile::tempdir().unwrap();
    let daemon = start_daemon(dir.path(), Arc::new(StubConnector::new())).await;
    let base = daemon.base_url();

    let (status, body) = get_json(format!("{}/servers/beta/tools", base)).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["meta"]["count"], 2);

    let (status, body) = get_json(format!("{}/servers/beta/tools/nope", base)).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body["error"]["code"], "tool-not-found");

    let invoked: Value = reqwest::Client::new()
        .post(format!("{}/servers/beta/tools/echo/invoke", base))
        .json(&json!({"arguments": {"q": 1}}))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(invoked["success"], true);
    assert_eq!(invoked["data"]["content"][0]["text"], r#"beta:{"q":1}"#);

    daemon.shutdown().await;
}

#[tokio::test]
async fn test_malformed_requests_get_error_envelopes() {
    let dir = tempfile::tempdir().unwrap();
    let daemon = start_daemon(dir.path(), Arc::new(StubConnector::new())).await;
    let base = daemon.base_url();
    let http = reqwest::Client::new();

    let execute = http
        .post(format!("{}/execute", base))
        .header("content-type", "application/json")
        .body("not json")
        .send()
        .await
        .unwrap();
    assert_eq!(execute.status(), StatusCode::BAD_REQUEST);
    let body: Value = execute.json().await.unwrap();
    assert_eq!(body["success"], false);
    assert_eq!(body["exitCode"], 2);

    let connect_url = format!("{}/servers/alpha/connections", base);
    for bad in [json!({"instance": 5}), json!({"generate": true, "instance": "x"})] {
        let response = http.post(&connect_url).json(&bad).send().await.unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST, "body {}", bad);
        let body: Value = response.json().await.unwrap();
        assert_eq!(body["success"], false);
        assert_eq!(body["error"]["code"], "invalid-request");
    }
    assert!(daemon.pool().is_empty().await);

    let invoke = http
        .post(format!("{}/servers/alpha/tools/echo/invoke", base))
        .header("content-type", "application/json")
        .body("{\"arguments\": ")
        .send()
        .await
        .unwrap();
    assert_eq!(invoke.status(), StatusCode::BAD_REQUEST);
    let body: Value = invoke.json().await.unwrap();
    assert_eq!(body["error"]["code"], "invalid-request");

    daemon.shutdown().await;
}

#[tokio::test]
async fn test_unknown_server_codes_match_across_routes() {
    let dir = tempfile::tempdir().unwrap();
    let daemon = start_daemon(dir.path(), Arc::new(StubConnector::new())).await;
    let base = daemon.base_url();
    let http = reqwest::Client::new();

    let (status, body) = get_json(format!("{}/servers/missing/connections", base)).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body["error"]["code"], "backend-not-found");

    let deleted = http
        .delete(format!("{}/servers/missing/connections", base))
        .send()
        .await
        .unwrap();
    assert_eq!(deleted.status(), StatusCode::NOT_FOUND);
    let body: Value = deleted.json().await.unwrap();
    assert_eq!(body["error"]["code"], "backend-not-found");

    let deleted = http
        .delete(format!("{}/servers/alpha/connections", base))
        .send()
        .await
        .unwrap();
    let body: Value = deleted.json().await.unwrap();
    assert_eq!(body["error"]["code"], "connection-not-found");

    daemon.shutdown().await;
}
