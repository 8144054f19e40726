use std::sync::Arc;

use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::Deserialize;
use serde_json::json;

use crate::error::OrchestratorError;
use crate::hub::HubHandle;
use crate::orchestrator::Orchestrator;
use crate::workspace::{LogLine, NewWorkspace, Workspace, WorkspaceAction, WorkspaceStatusEvent};

#[derive(Clone)]
pub struct ApiState {
    pub orchestrator: Arc<Orchestrator>,
    pub hub: HubHandle,
}

#[derive(Debug, Deserialize)]
pub struct ActionRequest {
    pub user_id: u64,
}

#[derive(Debug, Deserialize)]
pub struct DeleteQuery {
    #[serde(default)]
    pub user_id: u64,
}

pub fn api_router(state: ApiState) -> Router {
    Router::new()
        .route("/api/workspaces", post(create_workspace))
        .route(
            "/api/workspaces/{id}",
            get(get_workspace).delete(delete_workspace),
        )
        .route("/api/workspaces/{id}/actions/{action}", post(request_action))
        .route("/api/workspaces/{id}/logs", get(get_logs))
        .route("/api/workspaces/{id}/events", get(get_events))
        .route("/api/hub", get(hub_stats))
        .with_state(state)
}

async fn create_workspace(
    State(state): State<ApiState>,
    Json(new): Json<NewWorkspace>,
) -> Result<impl IntoResponse, OrchestratorError> {
    let (workspace, job_id) = state.orchestrator.create_workspace(new).await?;
    Ok((
        StatusCode::CREATED,
        Json(json!({ "workspace": workspace, "job_id": job_id })),
    ))
}

async fn request_action(
    State(state): State<ApiState>,
    Path((id, action)): Path<(u64, String)>,
    Json(req): Json<ActionRequest>,
) -> Response {
    let action = match action.parse::<WorkspaceAction>() {
        Ok(action) => action,
        Err(e) => return (StatusCode::BAD_REQUEST, Json(json!({ "error": e }))).into_response(),
    };
    match state.orchestrator.request_action(action, id, req.user_id).await {
        Ok(job_id) => (StatusCode::ACCEPTED, Json(json!({ "job_id": job_id }))).into_response(),
        Err(e) => e.into_response(),
    }
}

async fn delete_workspace(
    State(state): State<ApiState>,
    Path(id): Path<u64>,
    Query(query): Query<DeleteQuery>,
) -> Result<impl IntoResponse, OrchestratorError> {
    let job_id = state.orchestrator.delete_workspace(id, query.user_id).await?;
    Ok((StatusCode::ACCEPTED, Json(json!({ "job_id": job_id }))))
}

async fn get_workspace(
    State(state): State<ApiState>,
    Path(id): Path<u64>,
) -> Result<Json<Workspace>, OrchestratorError> {
    let workspace = state
        .orchestrator
        .collaborators()
        .workspaces
        .get_workspace(id, false)
        .await?;
    Ok(Json(workspace))
}

async fn get_logs(
    State(state): State<ApiState>,
    Path(id): Path<u64>,
) -> Result<Json<Vec<LogLine>>, OrchestratorError> {
    Ok(Json(state.orchestrator.collaborators().logs.latest_logs(id).await?))
}

async fn get_events(
    State(state): State<ApiState>,
    Path(id): Path<u64>,
) -> Result<Json<Vec<WorkspaceStatusEvent>>, OrchestratorError> {
    Ok(Json(
        state
            .orchestrator
            .collaborators()
            .events
            .list_status_events(id)
            .await?,
    ))
}

async fn hub_stats(State(state): State<ApiState>) -> Response {
    match state.hub.stats().await {
        Some(stats) => Json(stats).into_response(),
        None => StatusCode::SERVICE_UNAVAILABLE.into_response(),
    }
}
