//! Append-only task event log

use assay_common::{pagination::calculate_pagination, Result};
use chrono::{DateTime, Utc};
use sqlx::{Row, SqlitePool};

use crate::models::{PipelineStage, TaskEvent, TaskState};

/// Append one event row for a task
pub async fn add_task_event(
    pool: &SqlitePool,
    task_id: &str,
    event_type: &str,
    state: Option<TaskState>,
    pipeline_stage: Option<PipelineStage>,
    message: &str,
    error: Option<&str>,
    payload: serde_json::Value,
) -> Result<()> {
    sqlx::query(
        r#"
        INSERT INTO task_events
            (task_id, event_type, state, pipeline_stage, message, error, payload_json, created_at)
        VALUES (?, ?, ?, ?, ?, ?, ?, ?)
        "#,
    )
    .bind(task_id)
    .bind(event_type)
    .bind(state.map(|s| s.as_str()))
    .bind(pipeline_stage.map(|s| s.as_str()))
    .bind(message)
    .bind(error)
    .bind(payload.to_string())
    .bind(Utc::now().timestamp_millis())
    .execute(pool)
    .await?;

    Ok(())
}

/// List a task's events, newest first (paginated)
pub async fn list_task_events(
    pool: &SqlitePool,
    task_id: &str,
    page: i64,
    page_size: i64,
) -> Result<(Vec<TaskEvent>, i64)> {
    let total: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM task_events WHERE task_id = ?")
        .bind(task_id)
        .fetch_one(pool)
        .await?;

    let p = calculate_pagination(total, page, page_size);
    let rows = sqlx::query(
        r#"
        SELECT id, task_id, event_type, state, pipeline_stage, message, error,
               payload_json, created_at
        FROM task_events
        WHERE task_id = ?
        ORDER BY created_at DESC, id DESC
        LIMIT ? OFFSET ?
        "#,
    )
    .bind(task_id)
    .bind(p.page_size)
    .bind(p.offset)
    .fetch_all(pool)
    .await?;

    let mut events = Vec::with_capacity(rows.len());
    for row in rows {
        let state: Option<String> = row.try_get("state")?;
        let stage: Option<String> = row.try_get("pipeline_stage")?;
        let payload_json: String = row.try_get("payload_json")?;
        let created_ms: i64 = row.try_get("created_at")?;

        events.push(TaskEvent {
            id: row.try_get("id")?,
            task_id: row.try_get("task_id")?,
            event_type: row.try_get("event_type")?,
            state: state.as_deref().and_then(TaskState::parse),
            pipeline_stage: stage.as_deref().and_then(PipelineStage::parse),
            message: row.try_get("message")?,
            error: row.try_get("error")?,
            payload: serde_json::from_str(&payload_json).unwrap_or(serde_json::Value::Null),
            created_at: DateTime::from_timestamp_millis(created_ms).unwrap_or_else(Utc::now),
        });
    }
    Ok((events, total))
}
