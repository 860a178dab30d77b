//! HTTP handlers for the workflow monitor API
//!
//! Read-only view over the repository:
//! - `GET /healthz` - liveness check
//! - `GET /workflows` - all persisted workflows
//! - `GET /workflows/:correlation_id` - one workflow with step history

use std::sync::Arc;

use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::IntoResponse,
    Json,
};
use serde_json::json;
use tracing::error;

use crate::persistence::WorkflowRepository;

/// Shared state for the monitor API.
#[derive(Clone)]
pub struct MonitorState {
    pub repository: Arc<dyn WorkflowRepository>,
}

/// GET /healthz
pub async fn health_handler() -> impl IntoResponse {
    Json(json!({ "status": "ok" }))
}

/// GET /workflows
pub async fn list_workflows_handler(State(state): State<MonitorState>) -> impl IntoResponse {
    match state.repository.list_workflows().await {
        Ok(workflows) => (StatusCode::OK, Json(json!({ "workflows": workflows }))),
        Err(e) => {
            error!("Failed to list workflows: {}", e);
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(json!({ "error": e.to_string() })),
            )
        }
    }
}

/// GET /workflows/:correlation_id
pub async fn get_workflow_handler(
    State(state): State<MonitorState>,
    Path(correlation_id): Path<String>,
) -> impl IntoResponse {
    match state.repository.get_workflow(&correlation_id).await {
        Ok(Some(workflow)) => (StatusCode::OK, Json(json!(workflow))),
        Ok(None) => (
            StatusCode::NOT_FOUND,
            Json(json!({ "error": format!("no workflow with correlation_id {correlation_id}") })),
        ),
        Err(e) => {
            error!("Failed to fetch workflow {}: {}", correlation_id, e);
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(json!({ "error": e.to_string() })),
            )
        }
    }
}
