use std::convert::Infallible;
use std::sync::Arc;

use axum::extract::{Path, Query, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::sse::{Event, Sse};
use axum::Json;
use futures::{Stream, StreamExt};
use tracing::{debug, info};

use weaver_core::types::{
    ExecutionSnapshot, ExecutionSummary, GateDecisionResult, GateInstance, Page, StartedExecution,
    StatusChange,
};
use weaver_engine::{ListQuery, StartRequest};

use crate::error::{ApiError, ApiResult};
use crate::middleware::Authenticated;
use crate::protocol::{sse_event, AbortBody, DecisionBody, EventsQuery};
use crate::state::AppState;

// GET /api/health: no auth required
pub async fn health() -> Json<serde_json::Value> {
    Json(serde_json::json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION"),
    }))
}

// POST /api/executions: requires Operator+
pub async fn start_execution(
    auth: Authenticated,
    State(state): State<Arc<AppState>>,
    Json(body): Json<StartRequest>,
) -> ApiResult<(StatusCode, Json<StartedExecution>)> {
    auth.require_operator()?;
    let started = state.engine.start(body).await?;
    info!(execution_id = %started.execution_id, by = %auth.0.name, "Execution started via API");
    Ok((StatusCode::CREATED, Json(started)))
}

// GET /api/executions?status=&workflowId=&page=&pageSize=: requires Viewer+
pub async fn list_executions(
    auth: Authenticated,
    State(state): State<Arc<AppState>>,
    Query(query): Query<ListQuery>,
) -> ApiResult<Json<Page<ExecutionSummary>>> {
    auth.require_viewer()?;
    Ok(Json(state.engine.list(query).await))
}

// GET /api/executions/{id}: requires Viewer+
pub async fn get_execution(
    auth: Authenticated,
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> ApiResult<Json<ExecutionSnapshot>> {
    auth.require_viewer()?;
    Ok(Json(state.engine.get(&id).await?))
}

// POST /api/executions/{id}/pause: requires Operator+
pub async fn pause_execution(
    auth: Authenticated,
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> ApiResult<Json<StatusChange>> {
    auth.require_operator()?;
    Ok(Json(state.engine.pause(&id).await?))
}

// POST /api/executions/{id}/resume: requires Operator+
pub async fn resume_execution(
    auth: Authenticated,
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> ApiResult<Json<StatusChange>> {
    auth.require_operator()?;
    Ok(Json(state.engine.resume(&id).await?))
}

// POST /api/executions/{id}/abort: requires Operator+, body optional
pub async fn abort_execution(
    auth: Authenticated,
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    body: Option<Json<AbortBody>>,
) -> ApiResult<Json<StatusChange>> {
    auth.require_operator()?;
    let reason = body.and_then(|Json(b)| b.reason);
    info!(execution_id = %id, by = %auth.0.name, "Abort requested");
    Ok(Json(state.engine.abort(&id, reason).await?))
}

// GET /api/executions/{id}/gates: requires Viewer+
pub async fn list_gates(
    auth: Authenticated,
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> ApiResult<Json<Vec<GateInstance>>> {
    auth.require_viewer()?;
    Ok(Json(state.engine.list_gates(&id).await?))
}

// POST /api/executions/{id}/gates/{gate_id}/decision: requires Operator+
pub async fn decide_gate(
    auth: Authenticated,
    State(state): State<Arc<AppState>>,
    Path((id, gate_id)): Path<(String, String)>,
    Json(body): Json<DecisionBody>,
) -> ApiResult<Json<GateDecisionResult>> {
    auth.require_operator()?;
    let decided_by = body.decided_by.unwrap_or_else(|| auth.0.name.clone());
    let result = state
        .engine
        .decide_gate(
            &id,
            &gate_id,
            &body.node_id,
            &body.selected_option,
            &decided_by,
            body.reason,
        )
        .await?;
    Ok(Json(result))
}

// GET /api/executions/{id}/events: SSE, requires Viewer+
pub async fn execution_events(
    auth: Authenticated,
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    Query(query): Query<EventsQuery>,
    headers: HeaderMap,
) -> ApiResult<Sse<impl Stream<Item = Result<Event, Infallible>>>> {
    auth.require_viewer()?;
    let last_event_id = match headers.get("last-event-id") {
        Some(value) => Some(
            value
                .to_str()
                .ok()
                .and_then(|s| s.trim().parse::<u64>().ok())
                .ok_or_else(|| ApiError::BadRequest("invalid Last-Event-ID header".into()))?,
        ),
        None => query.last_event_id,
    };

    let frames = state.engine.event_stream(&id, last_event_id).await?;
    debug!(execution_id = %id, last_event_id = ?last_event_id, "Event stream opened");
    Ok(Sse::new(frames.map(sse_event)))
}
