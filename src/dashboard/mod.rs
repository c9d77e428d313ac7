//! JSON API over the controller, plus a live status page.

use std::net::SocketAddr;
use std::sync::Arc;

use axum::{
    extract::{
        rejection::{JsonRejection, PathRejection, QueryRejection},
        Path, Query, State,
    },
    http::StatusCode,
    response::{Html, IntoResponse, Response},
    routing::{delete, get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tower_http::cors::{Any, CorsLayer};

use crate::controller::{StatusSnapshot, SwarmController};
use crate::error::SwarmError;
use crate::registry::{AgentStatus, NewAgent};
use crate::scheduler::{NewTask, Task, TaskStatus};
use crate::tracker::Assignment;
use crate::types::{AgentId, AssignmentId, TaskId};

#[derive(Clone)]
pub struct DashboardState {
    pub controller: Arc<SwarmController>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub error: String,
    pub code: String,
}

impl IntoResponse for SwarmError {
    fn into_response(self) -> Response {
        let status = match &self {
            SwarmError::UnknownAgent(_)
            | SwarmError::UnknownTask(_)
            | SwarmError::UnknownAssignment(_) => StatusCode::NOT_FOUND,
            SwarmError::InvalidAgent(_)
            | SwarmError::InvalidTask(_)
            | SwarmError::InvalidProgress(_)
            | SwarmError::InvalidRequest(_)
            | SwarmError::Config(_) => StatusCode::BAD_REQUEST,
            SwarmError::DuplicateAgent(_)
            | SwarmError::RetriesExhausted { .. }
            | SwarmError::CapacityExceeded { .. }
            | SwarmError::InvalidState(_)
            | SwarmError::NotCancellable(_) => StatusCode::CONFLICT,
            SwarmError::QueueFull(_) => StatusCode::SERVICE_UNAVAILABLE,
        };
        let body = ErrorResponse {
            error: self.to_string(),
            code: self.code().to_string(),
        };
        (status, Json(body)).into_response()
    }
}

type ApiResult<T> = Result<Json<T>, SwarmError>;

// Extractor rejections are turned into the same JSON error body as every
// other failure. `invalid` picks the error kind for a body that fails to parse.
fn body<T>(
    payload: Result<Json<T>, JsonRejection>,
    invalid: fn(String) -> SwarmError,
) -> Result<T, SwarmError> {
    payload.map(|Json(value)| value).map_err(|e| invalid(e.body_text()))
}

fn path<T>(id: Result<Path<T>, PathRejection>) -> Result<T, SwarmError> {
    id.map(|Path(value)| value)
        .map_err(|e| SwarmError::InvalidRequest(e.body_text()))
}

fn query<T>(params: Result<Query<T>, QueryRejection>) -> Result<T, SwarmError> {
    params
        .map(|Query(value)| value)
        .map_err(|e| SwarmError::InvalidRequest(e.body_text()))
}

#[derive(Debug, Serialize, Deserialize)]
pub struct SubmitTaskRequest {
    /// Signed so that non-positive demands reach validation instead of
    /// failing to parse.
    pub required_units: i64,
    #[serde(default)]
    pub priority: i32,
    #[serde(default)]
    pub preferred_location: Option<String>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct SubmitTaskResponse {
    pub task_id: TaskId,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct RegisterAgentResponse {
    pub agent_id: AgentId,
}

#[derive(Debug, Default, Serialize, Deserialize)]
pub struct HeartbeatRequest {
    #[serde(default)]
    pub reported_load: Option<u32>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct AgentStatusResponse {
    pub agent_id: AgentId,
    pub status: AgentStatus,
}

#[derive(Debug, Default, Deserialize)]
pub struct DeregisterQuery {
    #[serde(default)]
    pub force: bool,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ProgressRequest {
    pub fraction: f64,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct FailRequest {
    pub reason: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct TaskStatusResponse {
    pub task_id: TaskId,
    pub status: TaskStatus,
}

/// All routes, without CORS. Exposed so tests can drive the real handlers.
pub fn router(state: DashboardState) -> Router {
    Router::new()
        .route("/", get(index_handler))
        .route("/api/status", get(status_handler))
        .route("/api/tasks", post(submit_task_handler))
        .route("/api/tasks/:id", get(get_task_handler))
        .route("/api/tasks/:id/cancel", post(cancel_task_handler))
        .route("/api/agents", post(register_agent_handler))
        .route("/api/agents/:id", delete(deregister_agent_handler))
        .route("/api/agents/:id/heartbeat", post(heartbeat_handler))
        .route("/api/agents/:id/assignments", get(agent_assignments_handler))
        .route("/api/assignments/:id/progress", post(progress_handler))
        .route("/api/assignments/:id/complete", post(complete_handler))
        .route("/api/assignments/:id/fail", post(fail_handler))
        .with_state(state)
}

/// Serve the API until `shutdown` is cancelled.
pub async fn run_dashboard(
    addr: SocketAddr,
    state: DashboardState,
    shutdown: CancellationToken,
) -> std::io::Result<()> {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);
    let app = router(state).layer(cors);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    tracing::info!(addr = %addr, "Starting API server");

    axum::serve(listener, app)
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await
}

async fn index_handler() -> Html<&'static str> {
    Html(include_str!("index.html"))
}

async fn status_handler(State(state): State<DashboardState>) -> Json<StatusSnapshot> {
    Json(state.controller.get_status())
}

async fn submit_task_handler(
    State(state): State<DashboardState>,
    payload: Result<Json<SubmitTaskRequest>, JsonRejection>,
) -> Result<(StatusCode, Json<SubmitTaskResponse>), SwarmError> {
    let payload = body(payload, SwarmError::InvalidTask)?;
    let required_units = u32::try_from(payload.required_units)
        .ok()
        .filter(|units| *units > 0)
        .ok_or_else(|| {
            SwarmError::InvalidTask(format!(
                "required_units must be a positive integer, got {}",
                payload.required_units
            ))
        })?;

    let task_id = state.controller.submit_task(NewTask {
        required_units,
        priority: payload.priority,
        preferred_location: payload.preferred_location,
    })?;
    Ok((StatusCode::CREATED, Json(SubmitTaskResponse { task_id })))
}

async fn get_task_handler(
    State(state): State<DashboardState>,
    id: Result<Path<TaskId>, PathRejection>,
) -> ApiResult<Task> {
    let id = path(id)?;
    Ok(Json(state.controller.get_task(&id)?))
}

async fn cancel_task_handler(
    State(state): State<DashboardState>,
    id: Result<Path<TaskId>, PathRejection>,
) -> ApiResult<TaskStatusResponse> {
    let id = path(id)?;
    state.controller.cancel_task(&id)?;
    let task = state.controller.get_task(&id)?;
    Ok(Json(TaskStatusResponse {
        task_id: id,
        status: task.status,
    }))
}

async fn register_agent_handler(
    State(state): State<DashboardState>,
    payload: Result<Json<NewAgent>, JsonRejection>,
) -> Result<(StatusCode, Json<RegisterAgentResponse>), SwarmError> {
    let agent_id = state
        .controller
        .register_agent(body(payload, SwarmError::InvalidAgent)?)?;
    Ok((StatusCode::CREATED, Json(RegisterAgentResponse { agent_id })))
}

async fn deregister_agent_handler(
    State(state): State<DashboardState>,
    id: Result<Path<AgentId>, PathRejection>,
    params: Result<Query<DeregisterQuery>, QueryRejection>,
) -> ApiResult<AgentStatusResponse> {
    let id = path(id)?;
    let params = query(params)?;
    let status = state.controller.deregister_agent(&id, params.force)?;
    Ok(Json(AgentStatusResponse {
        agent_id: id,
        status,
    }))
}

async fn heartbeat_handler(
    State(state): State<DashboardState>,
    id: Result<Path<AgentId>, PathRejection>,
    payload: Result<Json<HeartbeatRequest>, JsonRejection>,
) -> ApiResult<AgentStatusResponse> {
    let id = path(id)?;
    let payload = body(payload, SwarmError::InvalidRequest)?;
    let status = state.controller.heartbeat(&id, payload.reported_load)?;
    Ok(Json(AgentStatusResponse {
        agent_id: id,
        status,
    }))
}

async fn agent_assignments_handler(
    State(state): State<DashboardState>,
    id: Result<Path<AgentId>, PathRejection>,
) -> ApiResult<Vec<Assignment>> {
    let id = path(id)?;
    Ok(Json(state.controller.assignments_for_agent(&id)?))
}

async fn progress_handler(
    State(state): State<DashboardState>,
    id: Result<Path<AssignmentId>, PathRejection>,
    payload: Result<Json<ProgressRequest>, JsonRejection>,
) -> ApiResult<Assignment> {
    let id = path(id)?;
    let payload = body(payload, SwarmError::InvalidRequest)?;
    state.controller.report_progress(&id, payload.fraction)?;
    Ok(Json(state.controller.get_assignment(&id)?))
}

async fn complete_handler(
    State(state): State<DashboardState>,
    id: Result<Path<AssignmentId>, PathRejection>,
) -> ApiResult<Assignment> {
    let id = path(id)?;
    Ok(Json(state.controller.complete_assignment(&id)?))
}

async fn fail_handler(
    State(state): State<DashboardState>,
    id: Result<Path<AssignmentId>, PathRejection>,
    payload: Result<Json<FailRequest>, JsonRejection>,
) -> ApiResult<TaskStatusResponse> {
    let id = path(id)?;
    let payload = body(payload, SwarmError::InvalidRequest)?;
    let assignment = state.controller.get_assignment(&id)?;
    let status = state.controller.fail_assignment(&id, &payload.reason)?;
    Ok(Json(TaskStatusResponse {
        task_id: assignment.task_id,
        status,
    }))
}
