//! API error types and responses.

use axum::extract::rejection::JsonRejection;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use libcadence::error::{CadenceError, LedgerError, QueueError};
use serde::Serialize;

#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    /// Admission limit reached for this subject.
    #[error("rate limit exceeded, retry after {retry_after_secs}s")]
    RateLimited { retry_after_secs: u64 },

    #[error("insufficient credit: spendable={spendable}, required={required}")]
    InsufficientCredit { spendable: i64, required: i64 },

    #[error("campaign not found: {0}")]
    CampaignNotFound(String),

    /// Any other missing resource (job, account).
    #[error("not found: {0}")]
    NotFound(String),

    #[error("bad request: {0}")]
    BadRequest(String),

    /// Request is valid but the resource is in the wrong state.
    #[error("conflict: {0}")]
    Conflict(String),

    /// Detail is logged, never returned.
    #[error("internal error: {0}")]
    Internal(String),
}

/// JSON error response body.
#[derive(Debug, Serialize)]
struct ErrorResponse {
    error: ErrorBody,
}

#[derive(Debug, Serialize)]
struct ErrorBody {
    code: &'static str,
    message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    details: Option<serde_json::Value>,
}

impl ApiError {
    pub fn code(&self) -> &'static str {
        match self {
            Self::RateLimited { .. } => "rate_limited",
            Self::InsufficientCredit { .. } => "insufficient_credit",
            Self::CampaignNotFound(_) => "campaign_not_found",
            Self::NotFound(_) => "not_found",
            Self::BadRequest(_) => "bad_request",
            Self::Conflict(_) => "conflict",
            Self::Internal(_) => "internal_error",
        }
    }

    pub fn status(&self) -> StatusCode {
        match self {
            Self::RateLimited { .. } => StatusCode::TOO_MANY_REQUESTS,
            Self::InsufficientCredit { .. } => StatusCode::PAYMENT_REQUIRED,
            Self::CampaignNotFound(_) | Self::NotFound(_) => StatusCode::NOT_FOUND,
            Self::BadRequest(_) => StatusCode::BAD_REQUEST,
            Self::Conflict(_) => StatusCode::CONFLICT,
            Self::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (message, details) = match &self {
            Self::RateLimited { retry_after_secs } => (
                "Too many requests".to_string(),
                Some(serde_json::json!({ "retryAfterSecs": retry_after_secs })),
            ),
            Self::InsufficientCredit {
                spendable,
                required,
            } => (
                "Not enough credit for this action".to_string(),
                Some(serde_json::json!({
                    "spendable": spendable,
                    "required": required
                })),
            ),
            Self::Internal(msg) => {
                tracing::error!(error = %msg, "Internal server error");
                ("An internal error occurred".to_string(), None)
            }
            other => (other.to_string(), None),
        };

        let body = ErrorResponse {
            error: ErrorBody {
                code: self.code(),
                message,
                details,
            },
        };

        let mut response = (self.status(), Json(body)).into_response();
        if let Self::RateLimited { retry_after_secs } = self {
            response.headers_mut().insert(
                axum::http::header::RETRY_AFTER,
                axum::http::HeaderValue::from(retry_after_secs),
            );
        }
        response
    }
}

impl From<CadenceError> for ApiError {
    fn from(err: CadenceError) -> Self {
        match err {
            CadenceError::Ledger(LedgerError::InsufficientCredit {
                spendable,
                required,
            }) => Self::InsufficientCredit {
                spendable,
                required,
            },
            CadenceError::Ledger(LedgerError::AccountNotFound(id)) => {
                Self::NotFound(format!("credit account {id}"))
            }
            CadenceError::CampaignNotFound(id) => Self::CampaignNotFound(id),
            CadenceError::Queue(QueueError::JobNotFound(id)) => Self::NotFound(format!("job {id}")),
            CadenceError::CampaignInactive(id) => Self::Conflict(format!("campaign {id} is disabled")),
            CadenceError::PlatformUnavailable(platform) => {
                Self::Conflict(format!("platform {platform} is not available"))
            }
            CadenceError::InvalidInput(msg) => Self::BadRequest(msg),
            other => Self::Internal(other.to_string()),
        }
    }
}

impl From<LedgerError> for ApiError {
    fn from(err: LedgerError) -> Self {
        CadenceError::from(err).into()
    }
}

impl From<JsonRejection> for ApiError {
    fn from(rejection: JsonRejection) -> Self {
        Self::BadRequest(rejection.body_text())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_domain_errors_map_to_api_codes() {
        let cases: Vec<(CadenceError, &str, StatusCode)> = vec![
            (
                LedgerError::InsufficientCredit {
                    spendable: 5,
                    required: 20,
                }
                .into(),
                "insufficient_credit",
                StatusCode::PAYMENT_REQUIRED,
            ),
            (
                CadenceError::CampaignNotFound("c1".into()),
                "campaign_not_found",
                StatusCode::NOT_FOUND,
            ),
            (
                CadenceError::InvalidInput("nope".into()),
                "bad_request",
                StatusCode::BAD_REQUEST,
            ),
            (
                CadenceError::CampaignInactive("c1".into()),
                "conflict",
                StatusCode::CONFLICT,
            ),
            (
                LedgerError::Contention {
                    account_id: "a".into(),
                    attempts: 8,
                }
                .into(),
                "internal_error",
                StatusCode::INTERNAL_SERVER_ERROR,
            ),
        ];

        for (err, code, status) in cases {
            let api: ApiError = err.into();
            assert_eq!(api.code(), code);
            assert_eq!(api.status(), status);
        }
    }

    #[test]
    fn test_rate_limited_sets_retry_after() {
        let response = ApiError::RateLimited {
            retry_after_secs: 60,
        }
        .into_response();
        assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
        assert_eq!(
            response.headers().get(axum::http::header::RETRY_AFTER).unwrap(),
            "60"
        );
    }
}
