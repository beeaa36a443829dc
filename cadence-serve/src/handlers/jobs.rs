//! Job inspection and cancellation.

use std::str::FromStr;
use std::sync::Arc;

use axum::extract::{Path, Query, State};
use axum::Json;
use libcadence::types::{unix_now, Job, JobState};
use serde::{Deserialize, Serialize};

use crate::error::ApiError;
use crate::state::AppState;

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct JobResponse {
    pub id: String,
    pub campaign_id: String,
    pub account_id: String,
    pub platform: String,
    pub state: JobState,
    pub attempts: u32,
    pub max_attempts: u32,
    pub estimated_cost: i64,
    pub next_run_at: i64,
    pub last_error: Option<String>,
    pub dead_reason: Option<String>,
    pub created_at: i64,
    pub updated_at: i64,
}

impl From<Job> for JobResponse {
    fn from(job: Job) -> Self {
        Self {
            id: job.id,
            campaign_id: job.campaign_id,
            account_id: job.account_id,
            platform: job.platform,
            state: job.state,
            attempts: job.attempts,
            max_attempts: job.max_attempts,
            estimated_cost: job.estimated_cost,
            next_run_at: job.next_run_at,
            last_error: job.last_error,
            dead_reason: job.dead_reason,
            created_at: job.created_at,
            updated_at: job.updated_at,
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct ListQuery {
    pub state: Option<String>,
    pub limit: Option<usize>,
}

#[derive(Debug, Serialize)]
pub struct JobListResponse {
    pub jobs: Vec<JobResponse>,
}

pub async fn list_jobs(
    State(state): State<Arc<AppState>>,
    Query(query): Query<ListQuery>,
) -> Result<Json<JobListResponse>, ApiError> {
    let filter = query
        .state
        .as_deref()
        .map(JobState::from_str)
        .transpose()
        .map_err(ApiError::BadRequest)?;
    let limit = query.limit.unwrap_or(50).clamp(1, 500);

    let jobs = state.service.queue().list(filter, limit).await?;
    Ok(Json(JobListResponse {
        jobs: jobs.into_iter().map(Into::into).collect(),
    }))
}

pub async fn get_job(
    State(state): State<Arc<AppState>>,
    Path(job_id): Path<String>,
) -> Result<Json<JobResponse>, ApiError> {
    let job = state
        .service
        .queue()
        .get(&job_id)
        .await?
        .ok_or_else(|| ApiError::NotFound(format!("job {job_id}")))?;
    Ok(Json(job.into()))
}

/// Cancel a pending job. 409 once a worker has it or it has finished.
pub async fn cancel_job(
    State(state): State<Arc<AppState>>,
    Path(job_id): Path<String>,
) -> Result<Json<JobResponse>, ApiError> {
    let queue = state.service.queue();

    if !queue.cancel(&job_id, unix_now()).await? {
        return match queue.get(&job_id).await? {
            Some(job) => Err(ApiError::Conflict(format!(
                "job {} is {}, only pending jobs can be cancelled",
                job.id, job.state
            ))),
            None => Err(ApiError::NotFound(format!("job {job_id}"))),
        };
    }

    tracing::info!(%job_id, "Job cancelled");
    let job = queue
        .get(&job_id)
        .await?
        .ok_or_else(|| ApiError::NotFound(format!("job {job_id}")))?;
    Ok(Json(job.into()))
}
