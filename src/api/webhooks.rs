//! Webhook trigger endpoint
//!
//! Any method on /webhook/{workflow_id} runs the workflow synchronously with
//! trigger source `webhook` and answers with the finished execution record.

use crate::{
    api::{workflows::AppState, ApiError},
    execution::{
        orchestrator::StartRequest,
        types::{TriggerSource, WorkflowExecution},
    },
    workflow::types::DataMap,
};
use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::Json,
    routing::{any, Router},
};
use serde_json::Value;
use std::collections::HashMap;

pub fn create_webhook_routes() -> Router<AppState> {
    Router::new().route("/webhook/{workflow_id}", any(execute_webhook))
}

/// Run a workflow from a webhook call
///
/// Input data is the JSON object body, with query parameters filling in keys
/// the body does not set. Run failures are reported inside the record.
async fn execute_webhook(
    State(state): State<AppState>,
    Path(workflow_id): Path<String>,
    Query(query): Query<HashMap<String, String>>,
    body: String,
) -> Result<Json<WorkflowExecution>, ApiError> {
    tracing::info!("📥 Webhook request received: {}", workflow_id);
    tracing::debug!("📄 Request body: {}", body);

    let mut input = parse_body(&body).map_err(|e| {
        tracing::warn!("❌ Invalid webhook payload for {}: {}", workflow_id, e);
        StatusCode::BAD_REQUEST
    })?;
    for (key, value) in query {
        input.entry(key).or_insert(Value::String(value));
    }

    let request = StartRequest::new(&workflow_id, input)
        .triggered_by(TriggerSource::Webhook)
        .wait();
    let started = state.orchestrator.start(request).await?;

    let execution = started.execution.ok_or_else(|| {
        tracing::error!("❌ Synchronous webhook run {} returned no record", started.execution_id);
        StatusCode::INTERNAL_SERVER_ERROR
    })?;

    tracing::info!("🎉 Webhook run {} of {} ended {:?}", execution.id, workflow_id, execution.status);
    Ok(Json(execution))
}

/// Empty bodies are empty input; anything else must be a JSON object
fn parse_body(body: &str) -> Result<DataMap, String> {
    if body.trim().is_empty() {
        return Ok(DataMap::new());
    }

    match serde_json::from_str::<Value>(body) {
        Ok(Value::Object(map)) => Ok(map),
        Ok(other) => Err(format!("expected a JSON object, got {}", other)),
        Err(e) => Err(e.to_string()),
    }
}
