use std::sync::Arc;
use std::time::Duration;

use axum::body::Body;
use axum::http::{Request, StatusCode};
use axum::Router;
use serde_json::{json, Value};
use tower::ServiceExt;

use loom_core::config::{AppConfig, GatewayConfig};
use loom_core::types::EntryPointSpec;
use loom_engine::{EdgeSpec, GraphSpec, NoBackoff, NodeRegistry, NodeSpec, Runtime};
use loom_gateway::GatewayServer;
use loom_test_utils::{ScriptedNode, SleepyNode};

async fn runtime(start: bool) -> Arc<Runtime> {
    let graph = GraphSpec::new("api", "greet")
        .with_node(NodeSpec::new("greet", "Greet"))
        .with_node(NodeSpec::new("slow", "Slow"))
        .with_edge(EdgeSpec::conditional("greet", "slow", "slow == True"))
        .with_terminal("slow");
    let registry = NodeRegistry::new()
        .with("greet", Arc::new(ScriptedNode::succeeding(json!({"greeting": "hello"}))))
        .with("slow", Arc::new(SleepyNode::new(Duration::from_millis(500))));
    let rt = Runtime::new(graph, registry, AppConfig::default())
        .unwrap()
        .with_backoff(Arc::new(NoBackoff));
    rt.register_entry_point(EntryPointSpec::new("main", "Main", "greet")).unwrap();
    let rt = Arc::new(rt);
    if start {
        rt.start().await.unwrap();
    }
    rt
}

fn app(rt: &Arc<Runtime>) -> Router {
    GatewayServer::new(GatewayConfig::default(), rt.clone()).router()
}

async fn send(app: Router, method: &str, uri: &str, body: Option<Value>) -> (StatusCode, Value) {
    let body = match body {
        Some(v) => Body::from(v.to_string()),
        None => Body::empty(),
    };
    let request = Request::builder()
        .method(method)
        .uri(uri)
        .header("content-type", "application/json")
        .body(body)
        .unwrap();
    let response = app.oneshot(request).await.unwrap();
    let status = response.status();
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
    let value = if bytes.is_empty() {
        Value::Null
    } else {
        serde_json::from_slice(&bytes).unwrap()
    };
    (status, value)
}

#[tokio::test]
async fn health_and_status() {
    let rt = runtime(true).await;

    let (status, body) = send(app(&rt), "GET", "/health", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "ok");

    let (status, body) = send(app(&rt), "GET", "/status", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["runtime"]["running"], true);
    assert_eq!(body["runtime"]["entry_points"][0]["id"], "main");
    rt.stop().await.unwrap();
}

#[tokio::test]
async fn trigger_then_fetch_result() {
    let rt = runtime(true).await;

    let (status, body) = send(app(&rt), "POST", "/trigger/main", Some(json!({"slow": false}))).await;
    assert_eq!(status, StatusCode::ACCEPTED);
    let execution_id = body["execution_id"].as_str().unwrap().to_string();

    let uri = format!("/executions/main/{}", execution_id);
    let mut fetched = None;
    for _ in 0..100 {
        let (status, body) = send(app(&rt), "GET", &uri, None).await;
        if status == StatusCode::OK {
            fetched = Some(body);
            break;
        }
        assert_eq!(status, StatusCode::NOT_FOUND);
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    let result = fetched.expect("result should become available");
    assert_eq!(result["success"], true);
    assert_eq!(result["node_path"], json!(["greet"]));
    assert_eq!(result["output"]["greeting"], "hello");
    rt.stop().await.unwrap();
}

#[tokio::test]
async fn trigger_error_statuses() {
    let rt = runtime(true).await;

    let (status, _) = send(app(&rt), "POST", "/trigger/nope", Some(json!({}))).await;
    assert_eq!(status, StatusCode::NOT_FOUND);

    let (status, body) = send(
        app(&rt),
        "POST",
        "/trigger/main",
        Some(json!({"cmd": "eval(payload)"})),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert!(body["error"].as_str().unwrap().contains("code execution"));

    let (status, _) = send(app(&rt), "GET", "/executions/main/unknown", None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);

    rt.stop().await.unwrap();
    let (status, _) = send(app(&rt), "POST", "/trigger/main", None).await;
    assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
}

#[tokio::test]
async fn wait_returns_result_or_timeout() {
    let rt = runtime(true).await;

    let (status, body) = send(app(&rt), "POST", "/trigger/main/wait", Some(json!({"slow": false}))).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["success"], true);

    let (status, body) = send(
        app(&rt),
        "POST",
        "/trigger/main/wait?timeout_ms=20",
        Some(json!({"slow": true})),
    )
    .await;
    assert_eq!(status, StatusCode::REQUEST_TIMEOUT);
    assert_eq!(body["status"], "timeout");
    assert!(body["execution_id"].is_string());
    rt.stop().await.unwrap();
}

#[tokio::test]
async fn stop_is_accepted_once() {
    let rt = runtime(true).await;

    let (status, body) = send(app(&rt), "POST", "/stop", None).await;
    assert_eq!(status, StatusCode::ACCEPTED);
    assert_eq!(body["status"], "stopping");

    for _ in 0..100 {
        if !rt.is_running() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    let (status, body) = send(app(&rt), "POST", "/stop", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "stopped");
}
