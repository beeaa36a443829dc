//! Application state.

use axum::http::HeaderMap;
use libcadence::types::unix_now_millis;
use libcadence::CadenceService;

use crate::error::ApiError;

/// Header carrying the caller's account, preferred over the source address.
pub const ACCOUNT_HEADER: &str = "x-account-id";

/// Application state shared across handlers.
#[derive(Clone)]
pub struct AppState {
    pub service: CadenceService,
}

impl AppState {
    #[must_use]
    pub fn new(service: CadenceService) -> Self {
        Self { service }
    }

    /// Count one request against `subject` for the given endpoint scope
    ///
    /// Rejection has no side effects beyond the admission log itself.
    pub async fn admit(&self, scope: &str, subject: &str) -> Result<(), ApiError> {
        let key = format!("{scope}:{subject}");
        let limiter = self.service.admission();
        if limiter
            .allow(self.service.db(), &key, unix_now_millis())
            .await
        {
            Ok(())
        } else {
            tracing::info!(subject = %key, "Request rejected by admission limiter");
            Err(ApiError::RateLimited {
                retry_after_secs: limiter.window().as_secs(),
            })
        }
    }
}

/// Who a request is accounted to: account header, then first forwarded address
pub fn subject_from(headers: &HeaderMap) -> String {
    let header = |name: &str| {
        headers
            .get(name)
            .and_then(|v| v.to_str().ok())
            .map(str::trim)
            .filter(|v| !v.is_empty())
    };

    if let Some(account) = header(ACCOUNT_HEADER) {
        return account.to_string();
    }
    header("x-forwarded-for")
        .and_then(|list| list.split(',').next())
        .map(str::trim)
        .filter(|ip| !ip.is_empty())
        .unwrap_or("anonymous")
        .to_string()
}
