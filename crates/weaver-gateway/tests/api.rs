use std::sync::Arc;

use axum::body::Body;
use axum::http::{Request, StatusCode};
use axum::Router;
use serde_json::{json, Value};
use tower::ServiceExt;

use weaver_core::config::{ApiKeyConfig, ApiKeyRole, GatewayConfig};
use weaver_core::types::ExecutionStatus;
use weaver_engine::WorkflowEngine;
use weaver_gateway::GatewayServer;
use weaver_test_utils::{approval_gate, gated, linear, test_config, ScriptedRunner};

fn setup(gateway: GatewayConfig) -> (Router, WorkflowEngine) {
    let engine = WorkflowEngine::new(test_config(), Arc::new(ScriptedRunner::new()));
    let router = GatewayServer::new(gateway, engine.clone()).router();
    (router, engine)
}

fn open() -> (Router, WorkflowEngine) {
    setup(GatewayConfig::default())
}

async fn send(router: &Router, request: Request<Body>) -> (StatusCode, String) {
    let response = router.clone().oneshot(request).await.unwrap();
    let status = response.status();
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    (status, String::from_utf8(bytes.to_vec()).unwrap())
}

async fn send_json(router: &Router, request: Request<Body>) -> (StatusCode, Value) {
    let (status, body) = send(router, request).await;
    (status, serde_json::from_str(&body).unwrap_or(Value::Null))
}

fn get(uri: &str) -> Request<Body> {
    Request::builder().uri(uri).body(Body::empty()).unwrap()
}

fn post(uri: &str, body: Value) -> Request<Body> {
    Request::builder()
        .method("POST")
        .uri(uri)
        .header("content-type", "application/json")
        .body(Body::from(body.to_string()))
        .unwrap()
}

async fn start(router: &Router, workflow: Value) -> String {
    let (status, body) = send_json(router, post("/api/executions", json!({ "workflow": workflow }))).await;
    assert_eq!(status, StatusCode::CREATED, "{body}");
    body["executionId"].as_str().unwrap().to_string()
}

async fn finish(engine: &WorkflowEngine, id: &str) -> ExecutionStatus {
    engine.execution(id).await.unwrap().wait_terminal().await
}

#[tokio::test(start_paused = true)]
async fn health_is_public() {
    let (router, _) = setup(GatewayConfig {
        token: Some("secret".into()),
        ..Default::default()
    });
    let (status, body) = send_json(&router, get("/api/health")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "ok");
}

#[tokio::test(start_paused = true)]
async fn start_get_and_list() {
    let (router, engine) = open();
    let id = start(&router, serde_json::to_value(linear(&["a", "b"])).unwrap()).await;
    assert_eq!(finish(&engine, &id).await, ExecutionStatus::Completed);

    let (status, body) = send_json(&router, get(&format!("/api/executions/{id}"))).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "completed");
    assert_eq!(body["nodeStates"]["b"]["status"], "completed");
    assert_eq!(body["events"][0]["type"], "execution_started");

    let (status, body) = send_json(&router, get("/api/executions?status=completed&pageSize=5")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["total"], 1);
    assert_eq!(body["items"][0]["executionId"], id.as_str());
}

#[tokio::test(start_paused = true)]
async fn invalid_workflow_is_bad_request() {
    let (router, _) = open();
    let workflow = json!({
        "nodes": [{ "id": "a", "type": "coder" }],
        "transitions": [{ "from": "a", "to": "missing", "condition": { "type": "always" } }],
    });
    let (status, body) = send_json(&router, post("/api/executions", json!({ "workflow": workflow }))).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["error"]["code"], "invalid_workflow");
}

#[tokio::test(start_paused = true)]
async fn unknown_execution_is_not_found() {
    let (router, _) = open();
    for uri in ["/api/executions/nope", "/api/executions/nope/events", "/api/executions/nope/gates"] {
        let (status, body) = send_json(&router, get(uri)).await;
        assert_eq!(status, StatusCode::NOT_FOUND, "{uri}");
        assert_eq!(body["error"]["code"], "execution_not_found");
    }
}

#[tokio::test(start_paused = true)]
async fn control_on_finished_execution_conflicts() {
    let (router, engine) = open();
    let id = start(&router, serde_json::to_value(linear(&["a"])).unwrap()).await;
    finish(&engine, &id).await;

    let (status, body) = send_json(&router, post(&format!("/api/executions/{id}/pause"), json!({}))).await;
    assert_eq!(status, StatusCode::CONFLICT);
    assert_eq!(body["error"]["code"], "invalid_state");

    let (status, _) = send_json(
        &router,
        post(&format!("/api/executions/{id}/abort"), json!({ "reason": "late" })),
    )
    .await;
    assert_eq!(status, StatusCode::CONFLICT);
}

#[tokio::test(start_paused = true)]
async fn gate_decision_over_http() {
    let (router, engine) = open();
    let id = start(&router, serde_json::to_value(gated(approval_gate())).unwrap()).await;
    let exec = engine.execution(&id).await.unwrap();
    exec.watch_status()
        .wait_for(|s| *s == ExecutionStatus::WaitingGate)
        .await
        .unwrap();

    let (status, body) = send_json(&router, get(&format!("/api/executions/{id}/gates"))).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body[0]["gateId"], "g1");
    assert_eq!(body[0]["status"], "pending");

    let uri = format!("/api/executions/{id}/gates/g1/decision");
    let (status, body) = send_json(
        &router,
        post(&uri, json!({ "nodeId": "review", "selectedOption": "maybe" })),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["error"]["code"], "invalid_gate_option");

    let (status, body) = send_json(
        &router,
        post(&uri, json!({ "nodeId": "review", "selectedOption": "approve" })),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["nextNodeId"], "b");
    assert_eq!(exec.wait_terminal().await, ExecutionStatus::Completed);

    let gates = engine.list_gates(&id).await.unwrap();
    assert_eq!(gates[0].decision.as_ref().unwrap().decided_by, "anonymous");
}

#[tokio::test(start_paused = true)]
async fn event_stream_replays_and_closes() {
    let (router, engine) = open();
    let id = start(&router, serde_json::to_value(linear(&["a"])).unwrap()).await;
    finish(&engine, &id).await;
    let end = engine.get(&id).await.unwrap().events.last().unwrap().id;

    let (status, body) = send(&router, get(&format!("/api/executions/{id}/events?lastEventId=0"))).await;
    assert_eq!(status, StatusCode::OK);
    let ids: Vec<&str> = body
        .lines()
        .filter_map(|l| l.strip_prefix("id:"))
        .map(str::trim)
        .collect();
    assert_eq!(ids.first().copied(), Some("1"));
    assert_eq!(ids.last().copied(), Some(end.to_string().as_str()));
    let kinds: Vec<&str> = body
        .lines()
        .filter_map(|l| l.strip_prefix("event:"))
        .map(str::trim)
        .collect();
    assert_eq!(kinds.first().copied(), Some("connected"));
    assert_eq!(kinds.get(1).copied(), Some("execution_started"));
    assert_eq!(kinds.last().copied(), Some("stream_end"));

    let request = Request::builder()
        .uri(format!("/api/executions/{id}/events"))
        .header("last-event-id", end.to_string())
        .body(Body::empty())
        .unwrap();
    let (status, body) = send_json(&router, request).await;
    assert_eq!(status, StatusCode::GONE);
    assert_eq!(body["error"]["code"], "stream_closed");

    let request = Request::builder()
        .uri(format!("/api/executions/{id}/events"))
        .header("last-event-id", "abc")
        .body(Body::empty())
        .unwrap();
    let (status, _) = send(&router, request).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
}

#[tokio::test(start_paused = true)]
async fn auth_roles_are_enforced() {
    let (router, _) = setup(GatewayConfig {
        token: Some("secret".into()),
        api_keys: vec![ApiKeyConfig {
            name: "watcher".into(),
            key: "wk_view".into(),
            role: ApiKeyRole::Viewer,
        }],
        ..Default::default()
    });

    let (status, body) = send_json(&router, get("/api/executions")).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
    assert_eq!(body["error"]["code"], "unauthorized");

    let request = Request::builder()
        .uri("/api/executions")
        .header("authorization", "Bearer wk_view")
        .body(Body::empty())
        .unwrap();
    let (status, _) = send(&router, request).await;
    assert_eq!(status, StatusCode::OK);

    let workflow = serde_json::to_value(linear(&["a"])).unwrap();
    let request = Request::builder()
        .method("POST")
        .uri("/api/executions")
        .header("authorization", "Bearer wk_view")
        .header("content-type", "application/json")
        .body(Body::from(json!({ "workflow": workflow }).to_string()))
        .unwrap();
    let (status, _) = send(&router, request).await;
    assert_eq!(status, StatusCode::FORBIDDEN);

    let (status, _) = send(&router, get("/api/executions?token=secret")).await;
    assert_eq!(status, StatusCode::OK);
}
