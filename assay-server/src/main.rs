//! assay-server - document-verification task pipeline service

use anyhow::Result;
use std::path::Path;
use std::sync::Arc;
use tracing::info;
use tracing_subscriber::EnvFilter;

use assay_common::config::Settings;
use assay_server::backend::RagClient;
use assay_server::{build_router, sweeper, AppState};

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    info!("Starting assay-server");
    info!("Version: {}", env!("CARGO_PKG_VERSION"));

    let settings = Settings::load().map_err(|e| anyhow::anyhow!("{}", e))?;
    settings.validate().map_err(|e| anyhow::anyhow!("{}", e))?;
    let settings = Arc::new(settings);
    info!("Inference backend: {}", settings.backend_base_url);

    let db = assay_common::db::init_database(Path::new(&settings.database_path))
        .await
        .map_err(|e| anyhow::anyhow!("Database initialization failed: {}", e))?;
    info!("Database: {}", settings.database_path);

    let backend = Arc::new(RagClient::new(&settings).map_err(|e| anyhow::anyhow!("{}", e))?);
    let state = AppState::new(db.clone(), backend, Arc::clone(&settings));

    // Retention sweeper runs only when a retention window is configured
    if settings.task_retention_days > 0 {
        sweeper::spawn_sweeper(db, Arc::clone(&settings));
    }

    let app = build_router(state);
    let addr = format!("{}:{}", settings.host, settings.port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    info!("Listening on http://{}", addr);

    axum::serve(listener, app).await?;

    Ok(())
}
