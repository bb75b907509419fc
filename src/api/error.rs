//! HTTP error mapping.

use std::time::Duration;

use axum::http::{header, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::json;
use thiserror::Error;

use crate::auth::AuthFailure;
use crate::scheduler::QueueError;
use crate::storage::DatabaseError;

/// Challenge sent with every 401.
pub const AUTH_CHALLENGE: &str = "Basic realm=\"System Authentication\"";

/// Errors returned by API handlers.
#[derive(Debug, Error)]
pub enum ApiError {
    #[error("Authentication failed: {0}")]
    Unauthorized(AuthFailure),

    #[error("Authentication unavailable: {0}")]
    AuthUnavailable(String),

    #[error("Invalid request: {0}")]
    BadRequest(String),

    #[error("Request body larger than {limit} bytes")]
    PayloadTooLarge { limit: usize },

    #[error("Queue is throttled, retry in {retry_after:?}")]
    Throttled { retry_after: Duration },

    #[error("Service unavailable: {0}")]
    Unavailable(String),

    #[error("Request timed out")]
    Timeout,
}

impl ApiError {
    pub fn status(&self) -> StatusCode {
        match self {
            ApiError::Unauthorized(_) => StatusCode::UNAUTHORIZED,
            ApiError::BadRequest(_) => StatusCode::BAD_REQUEST,
            ApiError::PayloadTooLarge { .. } => StatusCode::PAYLOAD_TOO_LARGE,
            ApiError::Timeout => StatusCode::REQUEST_TIMEOUT,
            ApiError::AuthUnavailable(_) | ApiError::Throttled { .. } | ApiError::Unavailable(_) => {
                StatusCode::SERVICE_UNAVAILABLE
            }
        }
    }

    /// Text sent to the client. Authentication details stay in the logs.
    fn public_message(&self) -> String {
        match self {
            ApiError::Unauthorized(_) => "authentication required".to_string(),
            ApiError::AuthUnavailable(_) => "authentication temporarily unavailable".to_string(),
            ApiError::Unavailable(_) => "service temporarily unavailable".to_string(),
            other => other.to_string(),
        }
    }
}

impl From<AuthFailure> for ApiError {
    fn from(failure: AuthFailure) -> Self {
        match failure {
            AuthFailure::Unavailable(reason) => ApiError::AuthUnavailable(reason),
            other => ApiError::Unauthorized(other),
        }
    }
}

impl From<QueueError> for ApiError {
    fn from(err: QueueError) -> Self {
        match err {
            QueueError::CircuitOpen { retry_after, .. } => ApiError::Throttled { retry_after },
            QueueError::Backpressure { .. } => ApiError::Throttled {
                retry_after: Duration::from_secs(BACKPRESSURE_RETRY_SECS),
            },
            other => ApiError::Unavailable(other.to_string()),
        }
    }
}

impl From<DatabaseError> for ApiError {
    fn from(err: DatabaseError) -> Self {
        ApiError::Unavailable(err.to_string())
    }
}

/// Retry hint for a queue over its backpressure limit.
const BACKPRESSURE_RETRY_SECS: u64 = 5;

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        let body = Json(json!({
            "code": status.as_u16(),
            "message": self.public_message(),
            "data": null,
        }));
        let mut response = (status, body).into_response();

        let headers = response.headers_mut();
        match &self {
            ApiError::Unauthorized(_) => {
                headers.insert(
                    header::WWW_AUTHENTICATE,
                    HeaderValue::from_static(AUTH_CHALLENGE),
                );
            }
            ApiError::Throttled { retry_after } => {
                let secs = retry_after.as_secs_f64().ceil().max(1.0) as u64;
                headers.insert(header::RETRY_AFTER, HeaderValue::from(secs));
            }
            _ => {}
        }
        response
    }
}
