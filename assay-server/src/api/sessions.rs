//! Pipeline entry endpoints
//!
//! Single-call assessments and the two-phase session workflow (create,
//! upload documents incrementally, start). Long-running pipeline work is
//! spawned onto the runtime; callers follow progress via the task
//! endpoints.

use axum::extract::{Multipart, Path, State};
use axum::http::StatusCode;
use axum::Json;
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::error;

use crate::error::{ApiError, ApiResult};
use crate::models::{Question, TaskOptions, TaskState};
use crate::pipeline::{SessionCreated, UploadOutcome};
use crate::AppState;

#[derive(Debug, Deserialize)]
pub struct CreateSessionRequest {
    pub questions: Vec<Question>,
    pub dataset_name: Option<String>,
    pub process_vendor_response: Option<bool>,
    pub only_cited_references: Option<bool>,
}

#[derive(Debug, Default, Deserialize)]
pub struct StartSessionRequest {
    pub chat_name: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct FromDatasetsRequest {
    pub questions: Vec<Question>,
    pub dataset_ids: Vec<String>,
    pub chat_name: Option<String>,
    pub process_vendor_response: Option<bool>,
    pub only_cited_references: Option<bool>,
}

fn options_override(
    state: &AppState,
    process_vendor_response: Option<bool>,
    only_cited_references: Option<bool>,
) -> TaskOptions {
    TaskOptions {
        process_vendor_response: process_vendor_response
            .unwrap_or(state.settings.process_vendor_response),
        only_cited_references: only_cited_references
            .unwrap_or(state.settings.only_cited_references),
    }
}

/// POST /api/v1/assessments - single-call workflow.
///
/// Multipart form: a `questions` field holding a JSON array of questions,
/// plus one part per evidence file. Returns 202 with the task id; the
/// pipeline runs in the background.
pub async fn start_assessment(
    State(state): State<AppState>,
    mut multipart: Multipart,
) -> ApiResult<(StatusCode, Json<Value>)> {
    let mut questions: Option<Vec<Question>> = None;
    let mut dataset_name: Option<String> = None;
    let mut chat_name: Option<String> = None;
    let mut files: Vec<(String, Vec<u8>)> = Vec::new();

    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|e| ApiError::BadRequest(format!("Malformed multipart body: {}", e)))?
    {
        let name = field.name().unwrap_or_default().to_string();
        match name.as_str() {
            "questions" => {
                let text = field
                    .text()
                    .await
                    .map_err(|e| ApiError::BadRequest(e.to_string()))?;
                let parsed: Vec<Question> = serde_json::from_str(&text)
                    .map_err(|e| ApiError::BadRequest(format!("Invalid questions JSON: {}", e)))?;
                questions = Some(parsed);
            }
            "dataset_name" => {
                dataset_name = Some(
                    field
                        .text()
                        .await
                        .map_err(|e| ApiError::BadRequest(e.to_string()))?,
                );
            }
            "chat_name" => {
                chat_name = Some(
                    field
                        .text()
                        .await
                        .map_err(|e| ApiError::BadRequest(e.to_string()))?,
                );
            }
            _ => {
                let filename = field.file_name().unwrap_or(&name).to_string();
                let bytes = field
                    .bytes()
                    .await
                    .map_err(|e| ApiError::BadRequest(e.to_string()))?;
                files.push((filename, bytes.to_vec()));
            }
        }
    }

    let questions =
        questions.ok_or_else(|| ApiError::BadRequest("Missing 'questions' field".to_string()))?;
    if files.is_empty() {
        return Err(ApiError::BadRequest(
            "At least one evidence file is required".to_string(),
        ));
    }

    let record = state
        .pipeline
        .create_task(questions, TaskState::Pending, None)
        .await?;
    let task_id = record.task_id.clone();

    let pipeline = state.pipeline.clone();
    let spawn_id = task_id.clone();
    tokio::spawn(async move {
        if let Err(e) = pipeline
            .run_assessment(&spawn_id, files, dataset_name, chat_name)
            .await
        {
            error!(task_id = %spawn_id, error = %e, "Assessment run aborted");
        }
    });

    Ok((
        StatusCode::ACCEPTED,
        Json(json!({ "task_id": task_id, "state": TaskState::Pending })),
    ))
}

/// POST /api/v1/assessments/from-datasets - answer against existing,
/// already-parsed backend datasets
pub async fn start_from_datasets(
    State(state): State<AppState>,
    Json(request): Json<FromDatasetsRequest>,
) -> ApiResult<(StatusCode, Json<Value>)> {
    if request.dataset_ids.is_empty() {
        return Err(ApiError::BadRequest(
            "At least one dataset id is required".to_string(),
        ));
    }
    let options = options_override(
        &state,
        request.process_vendor_response,
        request.only_cited_references,
    );
    let record = state
        .pipeline
        .create_task(request.questions, TaskState::Pending, Some(options))
        .await?;
    let task_id = record.task_id.clone();

    let pipeline = state.pipeline.clone();
    let spawn_id = task_id.clone();
    tokio::spawn(async move {
        if let Err(e) = pipeline
            .run_from_datasets(&spawn_id, request.dataset_ids, request.chat_name)
            .await
        {
            error!(task_id = %spawn_id, error = %e, "Dataset assessment run aborted");
        }
    });

    Ok((
        StatusCode::ACCEPTED,
        Json(json!({ "task_id": task_id, "state": TaskState::Pending })),
    ))
}

/// POST /api/v1/sessions - phase 1 of the two-phase workflow
pub async fn create_session(
    State(state): State<AppState>,
    Json(request): Json<CreateSessionRequest>,
) -> ApiResult<Json<SessionCreated>> {
    let options = options_override(
        &state,
        request.process_vendor_response,
        request.only_cited_references,
    );
    let created = state
        .pipeline
        .create_session(request.questions, request.dataset_name, Some(options))
        .await?;
    Ok(Json(created))
}

/// POST /api/v1/sessions/:task_id/documents - phase 2, repeatable
pub async fn upload_documents(
    State(state): State<AppState>,
    Path(task_id): Path<String>,
    mut multipart: Multipart,
) -> ApiResult<Json<UploadOutcome>> {
    let mut files: Vec<(String, Vec<u8>)> = Vec::new();
    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|e| ApiError::BadRequest(format!("Malformed multipart body: {}", e)))?
    {
        let filename = field
            .file_name()
            .or(field.name())
            .unwrap_or("unnamed")
            .to_string();
        let bytes = field
            .bytes()
            .await
            .map_err(|e| ApiError::BadRequest(e.to_string()))?;
        files.push((filename, bytes.to_vec()));
    }

    let outcome = state.pipeline.add_documents(&task_id, files).await?;
    Ok(Json(outcome))
}

/// POST /api/v1/sessions/:task_id/start - phase 3: claim and run
pub async fn start_session(
    State(state): State<AppState>,
    Path(task_id): Path<String>,
    body: Option<Json<StartSessionRequest>>,
) -> ApiResult<(StatusCode, Json<Value>)> {
    let chat_name = body.and_then(|Json(b)| b.chat_name);

    let record = state.pipeline.claim_start(&task_id).await?;

    let pipeline = state.pipeline.clone();
    let spawn_id = task_id.clone();
    tokio::spawn(async move {
        if let Err(e) = pipeline.run_for_session(&spawn_id, chat_name).await {
            error!(task_id = %spawn_id, error = %e, "Session assessment run aborted");
        }
    });

    Ok((
        StatusCode::ACCEPTED,
        Json(json!({
            "task_id": task_id,
            "state": record.status.state,
            "message": "Assessment started",
        })),
    ))
}
