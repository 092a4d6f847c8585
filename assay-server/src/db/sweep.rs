//! Retention purge with cooperative sweep lock
//!
//! Only one worker may run a sweep per cycle. Acquisition is a single
//! conditional upsert against the one-row `sweep_lock` table: it succeeds
//! when the row is absent or its holder went stale, and fails (zero rows
//! affected) while another worker holds it. Losers skip the cycle; there
//! is no retry within an interval.

use assay_common::Result;
use chrono::{Duration, Utc};
use sqlx::SqlitePool;
use tracing::{debug, info};
use uuid::Uuid;

/// A holder older than this is assumed dead and its lock taken over
const STALE_LOCK_SECS: i64 = 3600;

/// Try to claim the sweep lock. Non-blocking: returns false immediately
/// when another live holder has it.
pub async fn try_acquire_sweep_lock(pool: &SqlitePool, holder: &str) -> Result<bool> {
    let now = Utc::now().timestamp_millis();
    let stale_before = now - STALE_LOCK_SECS * 1000;

    let result = sqlx::query(
        r#"
        INSERT INTO sweep_lock (id, holder, acquired_at)
        VALUES (1, ?, ?)
        ON CONFLICT(id) DO UPDATE SET
            holder = excluded.holder,
            acquired_at = excluded.acquired_at
        WHERE sweep_lock.acquired_at < ?
        "#,
    )
    .bind(holder)
    .bind(now)
    .bind(stale_before)
    .execute(pool)
    .await?;

    Ok(result.rows_affected() == 1)
}

/// Release the sweep lock if this holder still owns it
pub async fn release_sweep_lock(pool: &SqlitePool, holder: &str) -> Result<()> {
    sqlx::query("DELETE FROM sweep_lock WHERE id = 1 AND holder = ?")
        .bind(holder)
        .execute(pool)
        .await?;
    Ok(())
}

/// Delete tasks (and their cascade-owned event rows) older than
/// `retention_days`. Returns the number of tasks deleted; 0 when retention
/// is disabled or another worker holds the sweep lock.
pub async fn purge_old_tasks(pool: &SqlitePool, retention_days: i64) -> Result<u64> {
    if retention_days <= 0 {
        return Ok(0);
    }

    let holder = Uuid::new_v4().to_string();
    if !try_acquire_sweep_lock(pool, &holder).await? {
        debug!("Sweep lock held by another instance - skipping this cycle");
        return Ok(0);
    }

    let purge_result = purge_locked(pool, retention_days).await;
    release_sweep_lock(pool, &holder).await?;
    let deleted = purge_result?;

    if deleted > 0 {
        info!(
            deleted = deleted,
            retention_days = retention_days,
            "Purged expired task(s)"
        );
    }
    Ok(deleted)
}

async fn purge_locked(pool: &SqlitePool, retention_days: i64) -> Result<u64> {
    let cutoff = (Utc::now() - Duration::days(retention_days)).timestamp_millis();

    let mut tx = pool.begin().await?;

    // Event rows cascade with their owning task
    sqlx::query(
        "DELETE FROM task_events WHERE task_id IN (SELECT task_id FROM tasks WHERE created_at < ?)",
    )
    .bind(cutoff)
    .execute(&mut *tx)
    .await?;

    let result = sqlx::query("DELETE FROM tasks WHERE created_at < ?")
        .bind(cutoff)
        .execute(&mut *tx)
        .await?;

    tx.commit().await?;
    Ok(result.rows_affected())
}

#[cfg(test)]
mod tests {
    use super::*;
    use sqlx::sqlite::SqlitePoolOptions;

    async fn test_pool() -> SqlitePool {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await
            .unwrap();
        assay_common::db::init_schema(&pool).await.unwrap();
        pool
    }

    #[tokio::test]
    async fn second_acquire_fails_while_held() {
        let pool = test_pool().await;

        assert!(try_acquire_sweep_lock(&pool, "worker-a").await.unwrap());
        assert!(!try_acquire_sweep_lock(&pool, "worker-b").await.unwrap());

        release_sweep_lock(&pool, "worker-a").await.unwrap();
        assert!(try_acquire_sweep_lock(&pool, "worker-b").await.unwrap());
    }

    #[tokio::test]
    async fn release_is_a_noop_for_non_holders() {
        let pool = test_pool().await;
        assert!(try_acquire_sweep_lock(&pool, "worker-a").await.unwrap());

        // Someone else releasing does not free the lock
        release_sweep_lock(&pool, "worker-b").await.unwrap();
        assert!(!try_acquire_sweep_lock(&pool, "worker-c").await.unwrap());
    }

    #[tokio::test]
    async fn purge_skips_cycle_when_lock_held() {
        let pool = test_pool().await;
        assert!(try_acquire_sweep_lock(&pool, "worker-a").await.unwrap());

        let deleted = purge_old_tasks(&pool, 1).await.unwrap();
        assert_eq!(deleted, 0);
    }

    #[tokio::test]
    async fn purge_disabled_when_retention_zero() {
        let pool = test_pool().await;
        assert_eq!(purge_old_tasks(&pool, 0).await.unwrap(), 0);
        // Lock untouched
        assert!(try_acquire_sweep_lock(&pool, "worker-a").await.unwrap());
    }

    #[tokio::test]
    async fn purge_deletes_only_expired_rows() {
        let pool = test_pool().await;
        let now = Utc::now().timestamp_millis();
        let old = now - 10 * 24 * 3600 * 1000;

        for (id, created) in [("old-task", old), ("new-task", now)] {
            sqlx::query(
                "INSERT INTO tasks (task_id, created_at, updated_at) VALUES (?, ?, ?)",
            )
            .bind(id)
            .bind(created)
            .bind(created)
            .execute(&pool)
            .await
            .unwrap();
            sqlx::query(
                "INSERT INTO task_events (task_id, event_type, created_at) VALUES (?, 'task_created', ?)",
            )
            .bind(id)
            .bind(created)
            .execute(&pool)
            .await
            .unwrap();
        }

        let deleted = purge_old_tasks(&pool, 7).await.unwrap();
        assert_eq!(deleted, 1);

        let remaining: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM tasks")
            .fetch_one(&pool)
            .await
            .unwrap();
        assert_eq!(remaining, 1);

        let events_left: Vec<String> =
            sqlx::query_scalar("SELECT task_id FROM task_events")
                .fetch_all(&pool)
                .await
                .unwrap();
        assert_eq!(events_left, vec!["new-task".to_string()]);

        // Lock released after the pass
        assert!(try_acquire_sweep_lock(&pool, "worker-x").await.unwrap());
    }
}
