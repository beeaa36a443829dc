//! Tick trigger, called by an external cron-style scheduler.

use std::sync::Arc;

use axum::extract::State;
use axum::http::HeaderMap;
use axum::Json;
use libcadence::types::unix_now;
use libcadence::TickReport;
use serde::Serialize;

use crate::error::ApiError;
use crate::state::{subject_from, AppState};

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TickResponse {
    /// Newly enqueued jobs
    pub processed: usize,
    pub candidates: usize,
    pub duplicates: usize,
    pub skipped: usize,
}

impl From<TickReport> for TickResponse {
    fn from(report: TickReport) -> Self {
        Self {
            processed: report.processed,
            candidates: report.candidates,
            duplicates: report.duplicates,
            skipped: report.skipped,
        }
    }
}

/// Run one decision pass and enqueue its candidates.
pub async fn tick(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
) -> Result<Json<TickResponse>, ApiError> {
    state.admit("tick", &subject_from(&headers)).await?;

    let report = state.service.scheduler().tick(unix_now()).await?;
    Ok(Json(report.into()))
}
