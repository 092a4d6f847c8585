//! Retention sweeper
//!
//! Background loop that deletes expired task records on a fixed interval.
//! The purge itself is guarded by the cooperative sweep lock, so with
//! several replicas sharing one store exactly one performs each cycle's
//! deletion pass and the rest skip it.

use sqlx::SqlitePool;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{error, info};

use assay_common::config::Settings;

use crate::db::sweep::purge_old_tasks;

/// Spawn the sweep loop. Callers should only do this when retention is
/// enabled (`task_retention_days > 0`); with retention disabled the
/// sweeper is not scheduled at all.
pub fn spawn_sweeper(db: SqlitePool, settings: Arc<Settings>) -> JoinHandle<()> {
    let interval = Duration::from_secs_f64(settings.sweep_interval_hours * 3600.0);
    let retention_days = settings.task_retention_days;
    info!(
        retention_days = retention_days,
        interval_hours = settings.sweep_interval_hours,
        "Retention sweeper scheduled"
    );

    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            match purge_old_tasks(&db, retention_days).await {
                Ok(0) => {}
                Ok(deleted) => info!(deleted = deleted, "Retention sweep removed expired tasks"),
                Err(e) => error!(error = %e, "Retention sweep failed"),
            }
        }
    })
}
