pub mod address;
pub mod commands;
pub mod config;
pub mod db;
pub mod error;
pub mod excel;
pub mod inference;
pub mod pipeline;
pub mod services;
pub mod session;
pub mod types;

#[cfg(any(test, feature = "test-utils"))]
pub mod test_utils;

use axum::extract::DefaultBodyLimit;
use axum::routing::{delete, get, post};
use axum::Router;
use commands::{AppState, SharedState};
use config::AppConfig;
use db::Db;
use inference::{HttpInferenceClient, InferenceClient};
use services::master_data::{MasterDataStore, UnconfiguredStore};
use std::sync::Arc;
use tokio::net::TcpListener;

/// Room for everything in a request besides the sheet itself.
const REQUEST_SLACK_BYTES: usize = 1024 * 1024;

pub fn router(state: SharedState) -> Router {
    // Large enough for a session token carrying the largest accepted workbook,
    // which also covers that workbook's multipart upload.
    let body_limit = session::max_token_len(state.config.max_upload_bytes, REQUEST_SLACK_BYTES);
    Router::new()
        .route("/api/health", get(commands::health))
        .route("/api/ai/status", get(commands::ai_status))
        .route(
            "/api/master-data",
            get(commands::get_master_data).put(commands::put_master_data),
        )
        .route("/api/master-data/import", post(commands::import_master_data))
        .route("/api/master-data/export", get(commands::export_master_data))
        .route("/api/master-data/:key", delete(commands::delete_master_data_key))
        .route("/api/fill", post(commands::start_fill))
        .route("/api/fill/continue", post(commands::continue_fill))
        .route("/api/fill/correct", post(commands::correct_fill))
        .route("/api/fill/download", post(commands::download_fill))
        .layer(DefaultBodyLimit::max(body_limit))
        .with_state(state)
}

pub async fn run() -> Result<(), Box<dyn std::error::Error>> {
    let config = AppConfig::from_env()?;

    let store: Arc<dyn MasterDataStore> = match Db::new(config.db_path.clone()) {
        Ok(db) => Arc::new(db),
        Err(e) => {
            log::error!(
                "Could not open master data store at {}: {}. Saving is disabled.",
                config.db_path.display(),
                e
            );
            Arc::new(UnconfiguredStore)
        }
    };
    if !config.ai.is_configured() {
        log::warn!("AI_ENDPOINT / AI_API_KEY not set; form filling will find no fields");
    }
    let inference: Arc<dyn InferenceClient> = Arc::new(HttpInferenceClient::new(config.ai.clone()));

    let bind = config.bind;
    let state = Arc::new(AppState {
        config,
        store,
        inference,
    });

    let listener = TcpListener::bind(bind).await?;
    log::info!("Listening on http://{}", bind);
    axum::serve(listener, router(state)).await?;
    Ok(())
}
