//! Manual "run now" actions.

use std::sync::Arc;

use axum::extract::rejection::JsonRejection;
use axum::extract::State;
use axum::http::{HeaderMap, StatusCode};
use axum::Json;
use libcadence::types::unix_now;
use serde::{Deserialize, Serialize};

use crate::error::ApiError;
use crate::state::{subject_from, AppState};

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunRequest {
    pub campaign_id: String,
    /// Defaults to the campaign's primary platform
    pub platform: Option<String>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RunResponse {
    pub job_id: String,
}

/// Queue one action for a campaign, bypassing its cadence.
///
/// Admission runs before the body is looked at, so a rejected request never
/// reaches the scheduler.
pub async fn run(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    payload: Result<Json<RunRequest>, JsonRejection>,
) -> Result<(StatusCode, Json<RunResponse>), ApiError> {
    state.admit("run", &subject_from(&headers)).await?;

    let Json(request) = payload?;
    let campaign_id = request.campaign_id.trim();
    if campaign_id.is_empty() {
        return Err(ApiError::BadRequest("campaignId must not be empty".into()));
    }

    let job_id = state
        .service
        .scheduler()
        .run_now(campaign_id, request.platform.as_deref(), unix_now())
        .await?;

    Ok((StatusCode::ACCEPTED, Json(RunResponse { job_id })))
}
