//! Health check handlers.

use std::sync::Arc;

use axum::extract::State;
use axum::Json;
use serde::Serialize;

use crate::error::ApiError;
use crate::state::AppState;

/// Health check response.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthResponse {
    pub status: &'static str,
    pub service: &'static str,
    pub version: &'static str,
    /// Platforms with a configured adapter
    pub platforms: Vec<String>,
    pub pending_jobs: i64,
    pub running_jobs: i64,
}

/// Health check endpoint. Touches the database so a broken pool shows up as 500.
pub async fn health(State(state): State<Arc<AppState>>) -> Result<Json<HealthResponse>, ApiError> {
    let stats = state.service.queue().stats().await?;

    Ok(Json(HealthResponse {
        status: "ok",
        service: "cadence",
        version: env!("CARGO_PKG_VERSION"),
        platforms: state.service.platforms().available(),
        pending_jobs: stats.pending,
        running_jobs: stats.running,
    }))
}
