//! Workflow management REST API endpoints
//!
//! Every save validates first; only definitions that pass are written to
//! storage and hot-reloaded into the registry and the cron scheduler.

use crate::{
    api::ApiError,
    execution::orchestrator::ExecutionOrchestrator,
    runtime::scheduler::CronSchedulerService,
    workflow::{
        registry::WorkflowRegistry,
        storage::WorkflowStorage,
        types::{Workflow, WorkflowConnection, WorkflowDefinition},
        validator::ConnectionValidator,
    },
};
use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::Json,
    routing::{get, post},
    Router,
};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::sync::Arc;

/// Application state containing shared resources
#[derive(Clone)]
pub struct AppState {
    /// Workflow storage for persistence
    pub storage: WorkflowStorage,
    /// Hot-reload registry for active definitions
    pub registry: Arc<WorkflowRegistry>,
    /// Run lifecycle
    pub orchestrator: Arc<ExecutionOrchestrator>,
    /// Cron scheduler service for scheduled Start steps
    pub scheduler: Arc<CronSchedulerService>,
}

/// Response for workflow creation/update operations
#[derive(Debug, Serialize)]
pub struct WorkflowResponse {
    pub id: String,
    pub message: String,
    /// Normalized definition now active
    pub workflow: Workflow,
}

/// Request body for workflow creation and update
#[derive(Debug, Deserialize)]
pub struct CreateWorkflowRequest {
    pub workflow: Workflow,
}

pub fn create_workflow_routes() -> Router<AppState> {
    Router::new()
        .route("/api/workflows", post(create_workflow).get(list_workflows))
        .route("/api/workflows/validate", post(validate_definition))
        .route(
            "/api/workflows/{id}",
            get(get_workflow).put(update_workflow).delete(delete_workflow),
        )
        .route("/api/workflows/{id}/connections", post(add_connection))
}

/// Create a new workflow
///
/// POST /api/workflows
/// Body: { "workflow": { "id": "...", "name": "...", "definition": { "steps": [...], "connections": [...] } } }
async fn create_workflow(
    State(state): State<AppState>,
    Json(payload): Json<CreateWorkflowRequest>,
) -> Result<Json<WorkflowResponse>, ApiError> {
    let workflow = payload.workflow;
    if workflow.id.is_empty() || workflow.name.is_empty() {
        return Err(StatusCode::BAD_REQUEST.into());
    }

    match state.storage.get_workflow(&workflow.id).await {
        Ok(Some(_)) => return Err(StatusCode::CONFLICT.into()),
        Ok(None) => {}
        Err(e) => {
            tracing::error!("Failed to look up workflow {}: {}", workflow.id, e);
            return Err(StatusCode::INTERNAL_SERVER_ERROR.into());
        }
    }

    let workflow = save_and_activate(&state, workflow).await?;
    tracing::info!("🔥 Created workflow: {} ({})", workflow.id, workflow.name);

    Ok(Json(WorkflowResponse {
        id: workflow.id.clone(),
        message: format!("Workflow '{}' created successfully", workflow.name),
        workflow,
    }))
}

/// GET /api/workflows
async fn list_workflows(State(state): State<AppState>) -> Result<Json<Value>, StatusCode> {
    match state.storage.list_workflows().await {
        Ok(workflows) => Ok(Json(json!({ "workflows": workflows }))),
        Err(e) => {
            tracing::error!("Failed to list workflows: {}", e);
            Err(StatusCode::INTERNAL_SERVER_ERROR)
        }
    }
}

/// GET /api/workflows/{id}
async fn get_workflow(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<Value>, StatusCode> {
    let workflow = match state.storage.get_workflow(&id).await {
        Ok(Some(workflow)) => workflow,
        Ok(None) => return Err(StatusCode::NOT_FOUND),
        Err(e) => {
            tracing::error!("Failed to get workflow {}: {}", id, e);
            return Err(StatusCode::INTERNAL_SERVER_ERROR);
        }
    };

    let stats = state.registry.get_workflow(&id).map(|active| active.stats);
    Ok(Json(json!({
        "workflow": workflow,
        "executionCount": stats.as_ref().map(|stats| stats.execution_count()).unwrap_or(0),
        "lastExecutedAt": stats.and_then(|stats| stats.last_executed_at()),
    })))
}

/// Replace an existing workflow
///
/// PUT /api/workflows/{id}
async fn update_workflow(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(payload): Json<CreateWorkflowRequest>,
) -> Result<Json<WorkflowResponse>, ApiError> {
    let mut workflow = payload.workflow;
    workflow.id = id.clone();
    if workflow.name.is_empty() {
        return Err(StatusCode::BAD_REQUEST.into());
    }

    match state.storage.get_workflow(&id).await {
        Ok(Some(_)) => {}
        Ok(None) => return Err(StatusCode::NOT_FOUND.into()),
        Err(e) => {
            tracing::error!("Failed to look up workflow {}: {}", id, e);
            return Err(StatusCode::INTERNAL_SERVER_ERROR.into());
        }
    }

    let workflow = save_and_activate(&state, workflow).await?;
    tracing::info!("🔥 Hot-reloaded workflow: {} ({})", workflow.id, workflow.name);

    Ok(Json(WorkflowResponse {
        id: workflow.id.clone(),
        message: format!("Workflow '{}' updated successfully", workflow.name),
        workflow,
    }))
}

/// DELETE /api/workflows/{id}
async fn delete_workflow(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<Value>, StatusCode> {
    state.scheduler.remove_workflow_schedules(&id).await;
    state.registry.remove_workflow(&id);

    match state.storage.delete_workflow(&id).await {
        Ok(true) => {
            tracing::info!("Deleted workflow: {}", id);
            Ok(Json(json!({ "message": "Workflow deleted successfully" })))
        }
        Ok(false) => Err(StatusCode::NOT_FOUND),
        Err(e) => {
            tracing::error!("Failed to delete workflow: {}", e);
            Err(StatusCode::INTERNAL_SERVER_ERROR)
        }
    }
}

/// Validate a definition without saving it
///
/// POST /api/workflows/validate
/// Returns the normalized definition, or 422 with { "errors": [...] }
async fn validate_definition(
    State(state): State<AppState>,
    Json(definition): Json<WorkflowDefinition>,
) -> Result<Json<WorkflowDefinition>, ApiError> {
    Ok(Json(state.registry.validator().validate(&definition)?))
}

/// Add one connection to a stored workflow
///
/// POST /api/workflows/{id}/connections
/// Rejected with 422 when an endpoint or port is unknown or the edge would close a cycle.
async fn add_connection(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(connection): Json<WorkflowConnection>,
) -> Result<Json<WorkflowResponse>, ApiError> {
    let active = state.registry.get_workflow(&id).ok_or(StatusCode::NOT_FOUND)?;
    let mut workflow = (*active.workflow).clone();

    if workflow.definition.connections.iter().any(|existing| existing.id == connection.id) {
        return Err(StatusCode::CONFLICT.into());
    }
    ConnectionValidator::new().check(&connection, &workflow.definition)?;

    tracing::info!("🔗 Adding connection {} to workflow {}", connection.id, id);
    workflow.definition.connections.push(connection);
    let workflow = save_and_activate(&state, workflow).await?;

    Ok(Json(WorkflowResponse {
        id: workflow.id.clone(),
        message: "Connection added".to_string(),
        workflow,
    }))
}

/// Validate, persist, then hot-reload into the registry and scheduler
///
/// Validation covers cron syntax, so nothing is written for a workflow whose
/// schedules the scheduler would refuse.
async fn save_and_activate(state: &AppState, workflow: Workflow) -> Result<Workflow, ApiError> {
    let workflow = state.registry.validate(workflow)?;

    if let Err(e) = state.storage.save_workflow(&workflow).await {
        tracing::error!("Failed to save workflow {}: {}", workflow.id, e);
        return Err(StatusCode::INTERNAL_SERVER_ERROR.into());
    }

    let active = state.registry.upsert(workflow)?;

    if let Err(e) = state.scheduler.add_or_update_workflow_schedules(&active).await {
        tracing::error!("❌ Failed to register schedules for workflow {}: {}", active.id, e);
        return Err(StatusCode::INTERNAL_SERVER_ERROR.into());
    }

    Ok((*active).clone())
}
