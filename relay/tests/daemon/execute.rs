//! Freeform commands through `POST /execute`

use std::sync::Arc;

use mcp_relay::batch::BatchOutcome;
use mcp_relay::command::{CommandRequest, EXIT_FAILURE, EXIT_OK, EXIT_USAGE};
use mcp_relay::daemon::DaemonClient;
use serde_json::{json, Map, Value};

use crate::support::{start_daemon, StubConnector};

fn params(value: Value) -> Map<String, Value> {
    match value {
        Value::Object(map) => map,
        _ => panic!("params must be an object"),
    }
}

#[tokio::test]
async fn test_simple_commands() {
    let dir = tempfile::tempdir().unwrap();
    let daemon = start_daemon(dir.path(), Arc::new(StubConnector::new())).await;
    let client = DaemonClient::new(daemon.port());

    let listed = client
        .execute(&CommandRequest::new("list-servers", &[]))
        .await
        .unwrap();
    assert!(listed.success);
    assert_eq!(listed.exit_code, EXIT_OK);
    let servers: Value = serde_json::from_str(listed.output.as_deref().unwrap()).unwrap();
    assert_eq!(servers.as_array().unwrap().len(), 2);

    let invoked = client
        .execute(&CommandRequest::new(
            "invoke-tool",
            &["alpha", "echo", r#"{"n": 7}"#],
        ))
        .await
        .unwrap();
    assert!(invoked.success);
    assert_eq!(invoked.output.as_deref(), Some(r#"alpha:{"n":7}"#));

    let unknown = client
        .execute(&CommandRequest::new("frobnicate", &[]))
        .await
        .unwrap();
    assert!(!unknown.success);
    assert_eq!(unknown.exit_code, EXIT_USAGE);

    let missing = client
        .execute(&CommandRequest::new("describe-tool", &["alpha", "nope"]))
        .await
        .unwrap();
    assert!(!missing.success);
    assert_eq!(missing.exit_code, EXIT_FAILURE);

    daemon.shutdown().await;
}

#[tokio::test]
async fn test_batch_across_backends() {
    let dir = tempfile::tempdir().unwrap();
    let daemon = start_daemon(dir.path(), Arc::new(StubConnector::new())).await;
    let client = DaemonClient::new(daemon.port());

    let request = CommandRequest::new("batch", &[]).with_params(params(json!({
        "calls": {
            "a1": {"command": "invoke-tool", "args": ["alpha", "sleep", "{\"ms\": 50}"]},
            "a2": {"command": "invoke-tool", "args": ["alpha", "echo"]},
            "b1": {"command": "invoke-tool", "args": ["beta", "echo"]},
            "servers": {"command": "list-servers"}
        },
        "responseMode": "full"
    })));
    let output = client.execute(&request).await.unwrap();
    assert!(output.success, "batch failed: {:?}", output.error);

    let outcome: BatchOutcome = serde_json::from_str(output.output.as_deref().unwrap()).unwrap();
    assert_eq!(outcome.summary.total, 4);
    assert_eq!(outcome.summary.succeeded, 4);
    assert!(!outcome.timed_out);
    assert_eq!(outcome.order.len(), 4);
    assert_eq!(outcome.results["a2"].output.as_deref(), Some("alpha:{}"));

    // Calls on one backend run in key order
    let pos = |key: &str| outcome.order.iter().position(|k| k == key).unwrap();
    assert!(pos("a1") < pos("a2"));

    daemon.shutdown().await;
}

#[tokio::test]
async fn test_batch_rejections_are_usage_errors() {
    let dir = tempfile::tempdir().unwrap();
    let daemon = start_daemon(dir.path(), Arc::new(StubConnector::new())).await;
    let client = DaemonClient::new(daemon.port());

    let request = CommandRequest::new("batch", &[]).with_params(params(json!({
        "calls": {
            "x": {"command": "connect", "args": ["alpha"]},
            "y": {"command": "nonsense"}
        }
    })));
    let output = client.execute(&request).await.unwrap();
    assert!(!output.success);
    assert_eq!(output.exit_code, EXIT_USAGE);
    let error = output.error.unwrap();
    assert!(error.contains("[x]"), "unexpected error: {}", error);
    assert!(error.contains("[y]"), "unexpected error: {}", error);

    // Nothing ran
    assert!(daemon.pool().is_empty().await);

    daemon.shutdown().await;
}
