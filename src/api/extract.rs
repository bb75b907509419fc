//! Request extractors.

use axum::extract::FromRequestParts;
use axum::http::header::AUTHORIZATION;
use axum::http::request::Parts;

use super::error::ApiError;
use super::AppState;
use crate::auth::{parse_basic_header, AuthFailure, AuthenticatedSystem};
use crate::metrics::MetricsCollector;

/// A system authenticated through its `Authorization: Basic` header.
#[derive(Debug, Clone)]
pub struct SystemAuth(pub AuthenticatedSystem);

impl FromRequestParts<AppState> for SystemAuth {
    type Rejection = ApiError;

    async fn from_request_parts(
        parts: &mut Parts,
        state: &AppState,
    ) -> Result<Self, Self::Rejection> {
        let credentials = parts
            .headers
            .get(AUTHORIZATION)
            .ok_or_else(|| AuthFailure::MalformedHeader("missing Authorization header".to_string()))
            .and_then(|value| {
                value.to_str().map_err(|_| {
                    AuthFailure::MalformedHeader("non-ASCII Authorization header".to_string())
                })
            })
            .and_then(parse_basic_header)
            .inspect_err(|failure| MetricsCollector::new().record_auth(failure.reason()))?;

        let system = state
            .validator
            .validate(&credentials.system_key, &credentials.system_secret)
            .await?;
        Ok(SystemAuth(system))
    }
}
