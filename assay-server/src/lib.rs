//! assay-server library interface
//!
//! Document-verification task pipeline service: accepts question sets and
//! evidence files, drives them through upload, deduplication, parsing and
//! concurrent question answering against an inference backend, and exposes
//! the persisted task state over a small HTTP API.

pub mod api;
pub mod backend;
pub mod db;
pub mod error;
pub mod models;
pub mod pipeline;
pub mod sweeper;

pub use crate::error::{ApiError, ApiResult};

use axum::Router;
use sqlx::SqlitePool;
use std::sync::Arc;

use assay_common::config::Settings;

use crate::backend::InferenceBackend;
use crate::pipeline::Pipeline;

/// Application state shared across handlers
#[derive(Clone)]
pub struct AppState {
    /// Database connection pool (the task record store)
    pub db: SqlitePool,
    /// Effective service settings
    pub settings: Arc<Settings>,
    /// Stage sequencer driving assessment runs
    pub pipeline: Arc<Pipeline>,
}

impl AppState {
    pub fn new(db: SqlitePool, backend: Arc<dyn InferenceBackend>, settings: Arc<Settings>) -> Self {
        let pipeline = Arc::new(Pipeline::new(
            db.clone(),
            backend,
            Arc::clone(&settings),
        ));
        Self {
            db,
            settings,
            pipeline,
        }
    }
}

/// Build application router
pub fn build_router(state: AppState) -> Router {
    api::routes()
        .with_state(state)
        .layer(tower_http::cors::CorsLayer::permissive())
}
