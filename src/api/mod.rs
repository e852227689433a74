//! HTTP ingress
//!
//! Fixed-shape boundary for external collaborators: node registration and
//! heartbeats, recording lifecycle, history, capacity and scaling views,
//! recorder event callbacks, and the WebSocket push channel. Every response
//! uses the `{success, data|error}` envelope.

mod ws;

use crate::dispatch::RecorderCallback;
use crate::jobs::{JobFilter, JobStatus, StartRecordingRequest};
use crate::orchestrator::Orchestrator;
use crate::registry::{RecorderDecl, RoomServerDecl};
use crate::repository::{JobHistoryFilter, Paging};
use crate::Error;
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{delete, get, post};
use axum::{Json, Router};
use chrono::{DateTime, Utc};
use serde::Deserialize;
use serde_json::json;
use std::sync::Arc;
use tower_http::cors::{Any, CorsLayer};

/// Shared handler state
#[derive(Clone)]
pub struct ApiState {
    pub orchestrator: Arc<Orchestrator>,
}

/// Build the ingress router.
pub fn build_router(orchestrator: Arc<Orchestrator>) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        // Health probes
        .route("/health", get(health_check))
        .route("/ready", get(ready_check))
        // Node management
        .route("/api/v1/room-servers/register", post(register_room_server))
        .route("/api/v1/recorders/register", post(register_recorder))
        .route(
            "/api/v1/room-servers/:id/heartbeat",
            post(room_server_heartbeat),
        )
        .route("/api/v1/recorders/:id/heartbeat", post(recorder_heartbeat))
        .route("/api/v1/nodes", get(list_nodes))
        .route("/api/v1/nodes/:id", delete(remove_node))
        // Recording lifecycle
        .route("/api/v1/recordings", post(start_recording).get(list_recordings))
        .route("/api/v1/recordings/history", get(recording_history))
        .route("/api/v1/recordings/:id", get(get_recording))
        .route("/api/v1/recordings/:id/stop", post(stop_recording))
        .route("/api/v1/callbacks/recorder", post(recorder_callback))
        // Fleet views
        .route("/api/v1/capacity", get(capacity_view))
        .route("/api/v1/scaling/recommendations", get(scaling_recommendations))
        .route("/api/v1/alerts", get(alert_status))
        // Push channel
        .route("/api/v1/events", get(ws::events_handler))
        .layer(cors)
        .with_state(ApiState { orchestrator })
}

fn ok<T: serde::Serialize>(data: T) -> Response {
    Json(json!({ "success": true, "data": data })).into_response()
}

fn fail(status: StatusCode, error: impl std::fmt::Display) -> Response {
    (
        status,
        Json(json!({ "success": false, "error": error.to_string() })),
    )
        .into_response()
}

fn error_response(e: &Error) -> Response {
    let status = match e {
        Error::NoRoomServer(_) | Error::NodeNotFound(_) | Error::JobNotFound(_) => {
            StatusCode::NOT_FOUND
        }
        Error::NoRecorderAvailable => StatusCode::SERVICE_UNAVAILABLE,
        Error::InvalidTransition { .. } => StatusCode::INTERNAL_SERVER_ERROR,
        Error::Timeout => StatusCode::GATEWAY_TIMEOUT,
        Error::Rpc(_) => StatusCode::BAD_GATEWAY,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    };
    fail(status, e)
}

async fn health_check() -> Response {
    ok(json!({ "status": "ok" }))
}

async fn ready_check(State(state): State<ApiState>) -> Response {
    ok(json!({
        "status": "ready",
        "recorders": state.orchestrator.registry.healthy_recorders().await.len(),
    }))
}

async fn register_room_server(
    State(state): State<ApiState>,
    Json(decl): Json<RoomServerDecl>,
) -> Response {
    let orchestrator = &state.orchestrator;
    let id = orchestrator.registry.register_room_server(decl).await;
    if let Some(server) = orchestrator.registry.get_room_server(&id).await {
        orchestrator.persist_room_server(&server).await;
    }
    ok(json!({ "id": id }))
}

async fn register_recorder(
    State(state): State<ApiState>,
    Json(decl): Json<RecorderDecl>,
) -> Response {
    let orchestrator = &state.orchestrator;
    let id = orchestrator.registry.register_recorder(decl).await;
    let Some(node) = orchestrator.registry.get_recorder(&id).await else {
        return fail(StatusCode::INTERNAL_SERVER_ERROR, "registration lost");
    };
    orchestrator.persist_recorder(&node).await;
    ok(json!({ "id": id, "capacity": node.capacity }))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct HeartbeatBody {
    #[serde(default)]
    load: u32,
    #[serde(default)]
    rooms: Option<Vec<String>>,
    #[serde(default)]
    active_jobs: Option<Vec<String>>,
}

async fn room_server_heartbeat(
    State(state): State<ApiState>,
    Path(id): Path<String>,
    Json(body): Json<HeartbeatBody>,
) -> Response {
    let known = state
        .orchestrator
        .registry
        .room_server_heartbeat(&id, body.load, body.rooms)
        .await;
    if known {
        ok(json!({ "acknowledged": true }))
    } else {
        fail(StatusCode::NOT_FOUND, format!("unknown room server {id}"))
    }
}

async fn recorder_heartbeat(
    State(state): State<ApiState>,
    Path(id): Path<String>,
    Json(body): Json<HeartbeatBody>,
) -> Response {
    let known = state
        .orchestrator
        .registry
        .recorder_heartbeat(&id, body.load, body.active_jobs)
        .await;
    if known {
        ok(json!({ "acknowledged": true }))
    } else {
        fail(StatusCode::NOT_FOUND, format!("unknown recorder {id}"))
    }
}

async fn list_nodes(State(state): State<ApiState>) -> Response {
    ok(state.orchestrator.registry.snapshot().await)
}

async fn remove_node(State(state): State<ApiState>, Path(id): Path<String>) -> Response {
    if state.orchestrator.registry.remove(&id).await {
        ok(json!({ "removed": id }))
    } else {
        fail(StatusCode::NOT_FOUND, format!("unknown node {id}"))
    }
}

async fn start_recording(
    State(state): State<ApiState>,
    Json(request): Json<StartRecordingRequest>,
) -> Response {
    if request.rtp_streams.is_empty() {
        return fail(StatusCode::BAD_REQUEST, "request carries no RTP streams");
    }
    match state.orchestrator.dispatcher.start_recording(request).await {
        Ok(job) => ok(job),
        Err(e) => error_response(&e),
    }
}

async fn stop_recording(State(state): State<ApiState>, Path(id): Path<String>) -> Response {
    match state.orchestrator.dispatcher.stop_recording(&id).await {
        Ok(job) => ok(job),
        Err(e) => error_response(&e),
    }
}

async fn get_recording(State(state): State<ApiState>, Path(id): Path<String>) -> Response {
    if let Some(job) = state.orchestrator.jobs.get(&id) {
        return ok(job);
    }
    // Terminal jobs remain queryable through the repository
    let filter = JobHistoryFilter {
        job_id: Some(id.clone()),
        ..Default::default()
    };
    match state
        .orchestrator
        .repository
        .query_job_history(&filter, &Paging::default())
        .await
    {
        Ok(mut jobs) => match jobs.pop() {
            Some(job) => ok(job),
            None => fail(StatusCode::NOT_FOUND, format!("unknown job {id}")),
        },
        Err(e) => error_response(&e),
    }
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ListQuery {
    #[serde(default)]
    room_server_id: Option<String>,
    #[serde(default)]
    room_id: Option<String>,
    #[serde(default)]
    status: Option<JobStatus>,
}

async fn list_recordings(
    State(state): State<ApiState>,
    Query(query): Query<ListQuery>,
) -> Response {
    let filter = JobFilter {
        room_server_id: query.room_server_id,
        room_id: query.room_id,
        status: query.status,
    };
    ok(state.orchestrator.jobs.list_active(&filter))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct HistoryQuery {
    #[serde(default)]
    job_id: Option<String>,
    #[serde(default)]
    room_server_id: Option<String>,
    #[serde(default)]
    room_id: Option<String>,
    #[serde(default)]
    peer_id: Option<String>,
    #[serde(default)]
    status: Option<JobStatus>,
    #[serde(default)]
    started_after: Option<DateTime<Utc>>,
    #[serde(default)]
    started_before: Option<DateTime<Utc>>,
    #[serde(default)]
    offset: usize,
    #[serde(default)]
    limit: Option<usize>,
}

async fn recording_history(
    State(state): State<ApiState>,
    Query(query): Query<HistoryQuery>,
) -> Response {
    let filter = JobHistoryFilter {
        job_id: query.job_id,
        room_server_id: query.room_server_id,
        room_id: query.room_id,
        peer_id: query.peer_id,
        status: query.status,
        started_after: query.started_after,
        started_before: query.started_before,
    };
    let paging = Paging {
        offset: query.offset,
        limit: query.limit.unwrap_or_else(|| Paging::default().limit),
    };
    match state
        .orchestrator
        .repository
        .query_job_history(&filter, &paging)
        .await
    {
        Ok(jobs) => ok(jobs),
        Err(e) => error_response(&e),
    }
}

async fn recorder_callback(
    State(state): State<ApiState>,
    Json(callback): Json<RecorderCallback>,
) -> Response {
    match state
        .orchestrator
        .dispatcher
        .handle_recorder_event(callback)
        .await
    {
        Ok(job) => ok(job),
        // A callback racing a terminal transition is dropped idempotently
        Err(Error::InvalidTransition { .. }) => ok(serde_json::Value::Null),
        Err(e) => error_response(&e),
    }
}

async fn capacity_view(State(state): State<ApiState>) -> Response {
    ok(state.orchestrator.metrics.collect().await)
}

async fn scaling_recommendations(State(state): State<ApiState>) -> Response {
    ok(state.orchestrator.metrics.recommendations())
}

async fn alert_status(State(state): State<ApiState>) -> Response {
    ok(state.orchestrator.metrics.alert_status())
}
