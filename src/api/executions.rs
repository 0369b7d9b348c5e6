//! Run lifecycle REST API endpoints

use crate::{
    api::{workflows::AppState, ApiError},
    execution::{
        orchestrator::StartRequest,
        types::{TriggerSource, WorkflowExecution},
    },
    workflow::types::DataMap,
};
use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::Json,
    routing::{get, post},
    Router,
};
use serde::Deserialize;
use serde_json::{json, Value};
use uuid::Uuid;

/// Body of a run start
#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StartExecutionRequest {
    #[serde(default)]
    pub input_data: DataMap,
    #[serde(default)]
    pub wait_for_completion: bool,
    #[serde(default)]
    pub tenant_id: Option<String>,
    /// Defaults to `api`
    #[serde(default)]
    pub trigger_source: Option<TriggerSource>,
}

pub fn create_execution_routes() -> Router<AppState> {
    Router::new()
        .route("/api/workflows/{id}/executions", post(start_execution).get(list_executions))
        .route("/api/executions/{id}", get(get_execution))
        .route("/api/executions/{id}/cancel", post(cancel_execution))
        .route("/api/executions/{id}/retry", post(retry_execution))
}

/// Start a run
///
/// POST /api/workflows/{id}/executions
/// Body: { "inputData": {...}, "waitForCompletion": true }
/// 200 with the full trace when waiting, otherwise 202 with the execution id.
async fn start_execution(
    State(state): State<AppState>,
    Path(workflow_id): Path<String>,
    Json(body): Json<StartExecutionRequest>,
) -> Result<(StatusCode, Json<Value>), ApiError> {
    let request = StartRequest {
        workflow_id,
        tenant_id: body.tenant_id,
        input_data: body.input_data,
        trigger_source: body.trigger_source.unwrap_or(TriggerSource::Api),
        wait_for_completion: body.wait_for_completion,
    };

    let started = state.orchestrator.start(request).await?;
    let status = if started.execution.is_some() {
        StatusCode::OK
    } else {
        StatusCode::ACCEPTED
    };

    Ok((
        status,
        Json(json!({
            "executionId": started.execution_id,
            "execution": started.execution,
        })),
    ))
}

/// GET /api/workflows/{id}/executions
async fn list_executions(
    State(state): State<AppState>,
    Path(workflow_id): Path<String>,
) -> Result<Json<Value>, ApiError> {
    let executions = state.orchestrator.list(&workflow_id).await?;
    Ok(Json(json!({ "executions": executions })))
}

/// GET /api/executions/{id}
async fn get_execution(
    State(state): State<AppState>,
    Path(execution_id): Path<Uuid>,
) -> Result<Json<WorkflowExecution>, ApiError> {
    Ok(Json(state.orchestrator.get(execution_id).await?))
}

/// POST /api/executions/{id}/cancel
/// Returns { "success": false } unless the run was Running
async fn cancel_execution(
    State(state): State<AppState>,
    Path(execution_id): Path<Uuid>,
) -> Result<Json<Value>, ApiError> {
    let success = state.orchestrator.cancel(execution_id).await?;
    Ok(Json(json!({ "success": success })))
}

/// POST /api/executions/{id}/retry
/// Returns { "success": false } unless the run was Failed
async fn retry_execution(
    State(state): State<AppState>,
    Path(execution_id): Path<Uuid>,
) -> Result<Json<Value>, ApiError> {
    let success = state.orchestrator.retry(execution_id).await?;
    Ok(Json(json!({ "success": success })))
}
