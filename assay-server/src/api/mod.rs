//! HTTP API routes
//!
//! Thin surface over the task record store and the pipeline entry points:
//! read-side task endpoints plus the two-phase session workflow. Heavy
//! request validation, authentication and the dashboard live elsewhere.

pub mod health;
pub mod sessions;
pub mod tasks;

use axum::routing::{get, post};
use axum::Router;

use crate::AppState;

/// Build the API route set
pub fn routes() -> Router<AppState> {
    Router::new()
        .route("/health", get(health::health))
        .route("/api/v1/tasks", get(tasks::list_tasks))
        .route("/api/v1/tasks/:task_id", get(tasks::get_task))
        .route("/api/v1/tasks/:task_id/results", get(tasks::get_results))
        .route("/api/v1/tasks/:task_id/events", get(tasks::get_events))
        .route("/api/v1/lookup/dataset/:dataset_id", get(tasks::lookup_dataset))
        .route(
            "/api/v1/lookup/document/:fingerprint",
            get(tasks::lookup_document),
        )
        .route("/api/v1/assessments", post(sessions::start_assessment))
        .route(
            "/api/v1/assessments/from-datasets",
            post(sessions::start_from_datasets),
        )
        .route("/api/v1/sessions", post(sessions::create_session))
        .route(
            "/api/v1/sessions/:task_id/documents",
            post(sessions::upload_documents),
        )
        .route("/api/v1/sessions/:task_id/start", post(sessions::start_session))
}
