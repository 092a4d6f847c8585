//! Health check endpoint

use axum::extract::State;
use axum::Json;
use serde_json::{json, Value};

use crate::AppState;

/// GET /health - liveness plus a summary of the effective configuration
pub async fn health(State(state): State<AppState>) -> Json<Value> {
    Json(json!({
        "status": "ok",
        "module": "assay-server",
        "version": env!("CARGO_PKG_VERSION"),
        "backend_url": state.settings.backend_base_url,
        "retention_days": state.settings.task_retention_days,
    }))
}
