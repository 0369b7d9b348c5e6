//! HTTP API Layer
//!
//! - Workflow CRUD, validation and edit-time connection checks
//! - Run start, query, cancel and retry
//! - Webhook-triggered synchronous runs

use crate::execution::orchestrator::OrchestratorError;
use crate::workflow::validator::ValidationErrors;
use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;

// Workflow management endpoints (POST/GET/PUT/DELETE)
pub mod workflows;

// Run lifecycle endpoints
pub mod executions;

// Webhook trigger endpoint
pub mod webhooks;

pub use executions::create_execution_routes;
pub use webhooks::create_webhook_routes;
pub use workflows::{create_workflow_routes, AppState};

/// Handler error mapped to a status code (and a body where one helps)
#[derive(Debug)]
pub enum ApiError {
    Status(StatusCode),
    /// 422 with the full list of validation messages
    Invalid(ValidationErrors),
    Orchestrator(OrchestratorError),
}

impl From<StatusCode> for ApiError {
    fn from(status: StatusCode) -> Self {
        ApiError::Status(status)
    }
}

impl From<ValidationErrors> for ApiError {
    fn from(errors: ValidationErrors) -> Self {
        ApiError::Invalid(errors)
    }
}

impl From<OrchestratorError> for ApiError {
    fn from(error: OrchestratorError) -> Self {
        ApiError::Orchestrator(error)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        match self {
            ApiError::Status(status) => status.into_response(),
            ApiError::Invalid(errors) => (
                StatusCode::UNPROCESSABLE_ENTITY,
                Json(json!({ "errors": errors.messages() })),
            )
                .into_response(),
            ApiError::Orchestrator(error) => {
                let status = match &error {
                    OrchestratorError::WorkflowNotFound(_) | OrchestratorError::ExecutionNotFound(_) => {
                        StatusCode::NOT_FOUND
                    }
                    OrchestratorError::Store(e) => {
                        tracing::error!("Execution store failure: {}", e);
                        StatusCode::INTERNAL_SERVER_ERROR
                    }
                };
                (status, Json(json!({ "error": error.to_string() }))).into_response()
            }
        }
    }
}
