//! Router configuration.

use std::sync::Arc;
use std::time::Duration;

use axum::extract::DefaultBodyLimit;
use axum::routing::{get, post};
use axum::Router;
use tower_http::limit::RequestBodyLimitLayer;
use tower_http::timeout::TimeoutLayer;
use tower_http::trace::TraceLayer;

use crate::handlers::{actions, credits, health, jobs, schedule};
use crate::state::AppState;

/// Requests carry small JSON bodies only.
const MAX_BODY_BYTES: usize = 64 * 1024;

/// Create the service router with all routes and middleware.
///
/// # Routes
///
/// - `GET /health` - Health check
/// - `POST /schedule/tick` - Run one decision pass (rate limited)
/// - `POST /actions/run` - Queue one action now (rate limited)
/// - `GET /accounts/:id/credits` - Balance and transaction history
/// - `GET /jobs` - List jobs, optionally by `state`
/// - `GET /jobs/:id` - One job
/// - `POST /jobs/:id/cancel` - Cancel a pending job
pub fn create_router(state: AppState) -> Router {
    let request_timeout = Duration::from_secs(state.service.config().server.request_timeout_secs);
    let state = Arc::new(state);

    Router::new()
        .route("/health", get(health::health))
        .route("/schedule/tick", post(schedule::tick))
        .route("/actions/run", post(actions::run))
        .route("/accounts/:id/credits", get(credits::get_credits))
        .route("/jobs", get(jobs::list_jobs))
        .route("/jobs/:id", get(jobs::get_job))
        .route("/jobs/:id/cancel", post(jobs::cancel_job))
        // Middleware
        .layer(TraceLayer::new_for_http())
        .layer(DefaultBodyLimit::disable())
        .layer(RequestBodyLimitLayer::new(MAX_BODY_BYTES))
        .layer(TimeoutLayer::new(request_timeout))
        .with_state(state)
}
