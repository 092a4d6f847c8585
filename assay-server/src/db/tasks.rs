//! Task record persistence
//!
//! Tasks are stored in a single row: scalar columns for the status fields
//! that queries filter or order on, JSON blobs for the nested collections
//! (backend context, questions, results, document statuses).

use assay_common::{pagination::calculate_pagination, Error, Result};
use chrono::{DateTime, Utc};
use serde::Serialize;
use sqlx::{Row, SqlitePool};

use crate::models::{
    BackendContext, DocumentStatus, PipelineStage, Question, QuestionResult, TaskOptions,
    TaskRecord, TaskState, TaskStatus,
};

fn millis(dt: DateTime<Utc>) -> i64 {
    dt.timestamp_millis()
}

fn from_millis(ms: i64) -> DateTime<Utc> {
    DateTime::from_timestamp_millis(ms).unwrap_or_else(Utc::now)
}

fn record_from_row(row: &sqlx::sqlite::SqliteRow) -> Result<TaskRecord> {
    let task_id: String = row.try_get("task_id")?;
    let state_raw: String = row.try_get("state")?;
    let stage_raw: String = row.try_get("pipeline_stage")?;

    let state = TaskState::parse(&state_raw)
        .ok_or_else(|| Error::Internal(format!("Unknown task state '{}' in store", state_raw)))?;
    let pipeline_stage = PipelineStage::parse(&stage_raw)
        .ok_or_else(|| Error::Internal(format!("Unknown pipeline stage '{}' in store", stage_raw)))?;

    let backend_json: String = row.try_get("backend_json")?;
    let options_json: String = row.try_get("options_json")?;
    let questions_json: String = row.try_get("questions_json")?;
    let results_json: String = row.try_get("results_json")?;
    let doc_statuses_json: String = row.try_get("document_statuses_json")?;

    let backend: BackendContext = serde_json::from_str(&backend_json)?;
    let options: TaskOptions = serde_json::from_str(&options_json)?;
    let questions: Vec<Question> = serde_json::from_str(&questions_json)?;
    let results: Vec<QuestionResult> = serde_json::from_str(&results_json)?;
    let document_statuses: Vec<DocumentStatus> = serde_json::from_str(&doc_statuses_json)?;

    let status = TaskStatus {
        task_id: task_id.clone(),
        state,
        pipeline_stage,
        progress_message: row.try_get("progress_message")?,
        total_questions: row.try_get("total_questions")?,
        questions_processed: row.try_get("questions_processed")?,
        created_at: from_millis(row.try_get("created_at")?),
        updated_at: from_millis(row.try_get("updated_at")?),
        error: row.try_get("error")?,
        dataset_id: None,
        dataset_ids: Vec::new(),
        chat_id: None,
        session_id: None,
        document_ids: Vec::new(),
        document_statuses: Vec::new(),
    };

    let mut record = TaskRecord {
        task_id,
        status,
        backend,
        options,
        questions,
        results,
        document_statuses,
    };
    record.sync_backend_ids();
    Ok(record)
}

/// Insert or fully replace a task record
pub async fn save_task(pool: &SqlitePool, record: &TaskRecord) -> Result<()> {
    let s = &record.status;
    sqlx::query(
        r#"
        INSERT INTO tasks (
            task_id, state, pipeline_stage, progress_message,
            total_questions, questions_processed, error,
            created_at, updated_at,
            backend_json, options_json, questions_json, results_json,
            document_statuses_json
        )
        VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
        ON CONFLICT(task_id) DO UPDATE SET
            state = excluded.state,
            pipeline_stage = excluded.pipeline_stage,
            progress_message = excluded.progress_message,
            total_questions = excluded.total_questions,
            questions_processed = excluded.questions_processed,
            error = excluded.error,
            updated_at = excluded.updated_at,
            backend_json = excluded.backend_json,
            options_json = excluded.options_json,
            questions_json = excluded.questions_json,
            results_json = excluded.results_json,
            document_statuses_json = excluded.document_statuses_json
        "#,
    )
    .bind(&record.task_id)
    .bind(s.state.as_str())
    .bind(s.pipeline_stage.as_str())
    .bind(&s.progress_message)
    .bind(s.total_questions)
    .bind(s.questions_processed)
    .bind(&s.error)
    .bind(millis(s.created_at))
    .bind(millis(s.updated_at))
    .bind(serde_json::to_string(&record.backend)?)
    .bind(serde_json::to_string(&record.options)?)
    .bind(serde_json::to_string(&record.questions)?)
    .bind(serde_json::to_string(&record.results)?)
    .bind(serde_json::to_string(&record.document_statuses)?)
    .execute(pool)
    .await?;

    Ok(())
}

/// Fetch a single task by id
pub async fn get_task(pool: &SqlitePool, task_id: &str) -> Result<Option<TaskRecord>> {
    let row = sqlx::query("SELECT * FROM tasks WHERE task_id = ?")
        .bind(task_id)
        .fetch_optional(pool)
        .await?;

    match row {
        Some(row) => Ok(Some(record_from_row(&row)?)),
        None => Ok(None),
    }
}

/// List task statuses, newest first (paginated)
pub async fn list_tasks(
    pool: &SqlitePool,
    page: i64,
    page_size: i64,
) -> Result<(Vec<TaskStatus>, i64)> {
    let total: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM tasks")
        .fetch_one(pool)
        .await?;

    let p = calculate_pagination(total, page, page_size);
    let rows = sqlx::query("SELECT * FROM tasks ORDER BY created_at DESC LIMIT ? OFFSET ?")
        .bind(p.page_size)
        .bind(p.offset)
        .fetch_all(pool)
        .await?;

    let mut statuses = Vec::with_capacity(rows.len());
    for row in &rows {
        statuses.push(record_from_row(row)?.status);
    }
    Ok((statuses, total))
}

/// Atomically claim a task for a new run.
///
/// The claim succeeds only when the current state is one of `from`; the
/// conditional UPDATE is the single lock primitive coordinating stateless
/// workers over the shared store. Returns true when this caller won.
pub async fn claim_task_state(
    pool: &SqlitePool,
    task_id: &str,
    from: &[TaskState],
    to: TaskState,
) -> Result<bool> {
    if from.is_empty() {
        return Ok(false);
    }
    let placeholders = vec!["?"; from.len()].join(", ");
    let sql = format!(
        "UPDATE tasks SET state = ?, updated_at = ? WHERE task_id = ? AND state IN ({})",
        placeholders
    );
    let mut query = sqlx::query(&sql)
        .bind(to.as_str())
        .bind(millis(Utc::now()))
        .bind(task_id);
    for state in from {
        query = query.bind(state.as_str());
    }
    let result = query.execute(pool).await?;
    Ok(result.rows_affected() == 1)
}

/// One occurrence of a document content fingerprint within a task
#[derive(Debug, Clone, Serialize)]
pub struct DocumentOccurrence {
    pub task_id: String,
    pub document_id: String,
    pub dataset_id: Option<String>,
}

/// Find tasks that reference the given backend dataset id.
///
/// Coarse LIKE prefilter on the JSON blob, confirmed by deserializing, so
/// substring collisions never produce false positives.
pub async fn find_tasks_by_dataset(pool: &SqlitePool, dataset_id: &str) -> Result<Vec<TaskStatus>> {
    let needle = format!("%{}%", dataset_id);
    let rows = sqlx::query("SELECT * FROM tasks WHERE backend_json LIKE ?")
        .bind(&needle)
        .fetch_all(pool)
        .await?;

    let mut matches = Vec::new();
    for row in &rows {
        let record = match record_from_row(row) {
            Ok(r) => r,
            Err(_) => continue,
        };
        if record.backend.dataset_id == dataset_id
            || record.backend.dataset_ids.iter().any(|id| id == dataset_id)
        {
            matches.push(record.status);
        }
    }
    Ok(matches)
}

/// Find occurrences of a document content fingerprint across tasks
pub async fn find_document_by_fingerprint(
    pool: &SqlitePool,
    fingerprint: &str,
) -> Result<Vec<DocumentOccurrence>> {
    let needle = format!("%{}%", fingerprint);
    let rows = sqlx::query("SELECT * FROM tasks WHERE backend_json LIKE ?")
        .bind(&needle)
        .fetch_all(pool)
        .await?;

    let mut found = Vec::new();
    for row in &rows {
        let record = match record_from_row(row) {
            Ok(r) => r,
            Err(_) => continue,
        };
        if let Some(document_id) = record.backend.file_fingerprints.get(fingerprint) {
            let dataset_id = if !record.backend.dataset_id.is_empty() {
                Some(record.backend.dataset_id.clone())
            } else {
                record.backend.dataset_ids.first().cloned()
            };
            found.push(DocumentOccurrence {
                task_id: record.task_id.clone(),
                document_id: document_id.clone(),
                dataset_id,
            });
        }
    }
    Ok(found)
}
