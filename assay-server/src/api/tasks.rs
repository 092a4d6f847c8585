//! Read-side task endpoints

use axum::extract::{Path, Query, State};
use axum::Json;
use serde::{Deserialize, Serialize};

use assay_common::pagination::{calculate_pagination, DEFAULT_PAGE_SIZE};

use crate::db::tasks::DocumentOccurrence;
use crate::db::{events, tasks};
use crate::error::{ApiError, ApiResult};
use crate::models::{TaskEvent, TaskStatus};
use crate::pipeline::{paginated_results, ResultsPage};
use crate::AppState;

#[derive(Debug, Deserialize)]
pub struct PageParams {
    pub page: Option<i64>,
    pub page_size: Option<i64>,
}

impl PageParams {
    fn resolve(&self) -> (i64, i64) {
        (
            self.page.unwrap_or(1),
            self.page_size.unwrap_or(DEFAULT_PAGE_SIZE),
        )
    }
}

#[derive(Debug, Serialize)]
pub struct TaskListResponse {
    pub tasks: Vec<TaskStatus>,
    pub total: i64,
    pub page: i64,
    pub page_size: i64,
    pub total_pages: i64,
}

#[derive(Debug, Serialize)]
pub struct TaskEventListResponse {
    pub task_id: String,
    pub events: Vec<TaskEvent>,
    pub total: i64,
    pub page: i64,
    pub page_size: i64,
    pub total_pages: i64,
}

/// GET /api/v1/tasks - list all tasks, newest first
pub async fn list_tasks(
    State(state): State<AppState>,
    Query(params): Query<PageParams>,
) -> ApiResult<Json<TaskListResponse>> {
    let (page, page_size) = params.resolve();
    let (tasks, total) = tasks::list_tasks(&state.db, page, page_size).await?;
    let p = calculate_pagination(total, page, page_size);
    Ok(Json(TaskListResponse {
        tasks,
        total,
        page: p.page,
        page_size: p.page_size,
        total_pages: p.total_pages,
    }))
}

/// GET /api/v1/tasks/:task_id - current task status
pub async fn get_task(
    State(state): State<AppState>,
    Path(task_id): Path<String>,
) -> ApiResult<Json<TaskStatus>> {
    let record = tasks::get_task(&state.db, &task_id)
        .await?
        .ok_or_else(|| ApiError::NotFound(format!("Task {} not found", task_id)))?;
    Ok(Json(record.status))
}

/// GET /api/v1/tasks/:task_id/results - paginated question results
pub async fn get_results(
    State(state): State<AppState>,
    Path(task_id): Path<String>,
    Query(params): Query<PageParams>,
) -> ApiResult<Json<ResultsPage>> {
    let record = tasks::get_task(&state.db, &task_id)
        .await?
        .ok_or_else(|| ApiError::NotFound(format!("Task {} not found", task_id)))?;
    let (page, page_size) = params.resolve();
    Ok(Json(paginated_results(&record, page, page_size)))
}

/// GET /api/v1/tasks/:task_id/events - audit trail, newest first
pub async fn get_events(
    State(state): State<AppState>,
    Path(task_id): Path<String>,
    Query(params): Query<PageParams>,
) -> ApiResult<Json<TaskEventListResponse>> {
    let (page, page_size) = params.resolve();
    let (events, total) = events::list_task_events(&state.db, &task_id, page, page_size).await?;
    let p = calculate_pagination(total, page, page_size);
    Ok(Json(TaskEventListResponse {
        task_id,
        events,
        total,
        page: p.page,
        page_size: p.page_size,
        total_pages: p.total_pages,
    }))
}

/// GET /api/v1/lookup/dataset/:dataset_id - tasks referencing a dataset
pub async fn lookup_dataset(
    State(state): State<AppState>,
    Path(dataset_id): Path<String>,
) -> ApiResult<Json<Vec<TaskStatus>>> {
    let statuses = tasks::find_tasks_by_dataset(&state.db, &dataset_id).await?;
    Ok(Json(statuses))
}

/// GET /api/v1/lookup/document/:fingerprint - content fingerprint lookup
pub async fn lookup_document(
    State(state): State<AppState>,
    Path(fingerprint): Path<String>,
) -> ApiResult<Json<Vec<DocumentOccurrence>>> {
    let occurrences = tasks::find_document_by_fingerprint(&state.db, &fingerprint).await?;
    Ok(Json(occurrences))
}
