//! Response shaping for admission outcomes.

use axum::http::header::RETRY_AFTER;
use axum::http::{HeaderMap, HeaderName, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::time::Duration;
use tracing::error;

use crate::error::GatekeeperError;
use crate::ratelimit::{Ban, Quota};

pub const RATELIMIT_LIMIT: HeaderName = HeaderName::from_static("x-ratelimit-limit");
pub const RATELIMIT_REMAINING: HeaderName = HeaderName::from_static("x-ratelimit-remaining");
pub const RATELIMIT_RESET: HeaderName = HeaderName::from_static("x-ratelimit-reset");

/// The API's JSON envelope for errors.
#[derive(Debug, Serialize)]
pub struct ApiError {
    pub status: u16,
    pub error: bool,
    pub message: String,
}

/// A JSON error response with the given status.
pub fn json_error(status: StatusCode, message: impl Into<String>) -> Response {
    let body = ApiError {
        status: status.as_u16(),
        error: true,
        message: message.into(),
    };
    (status, Json(body)).into_response()
}

/// Whole seconds until something happens, rounded up, never zero.
fn retry_secs(wait: Duration) -> u64 {
    let secs = wait.as_secs() + u64::from(wait.subsec_nanos() > 0);
    secs.max(1)
}

/// Add `X-RateLimit-*` headers describing `quota`.
pub fn apply_quota_headers(headers: &mut HeaderMap, quota: &Quota, now: DateTime<Utc>) {
    let reset_at = now.timestamp().saturating_add(retry_secs(quota.resets_in) as i64);

    headers.insert(RATELIMIT_LIMIT, HeaderValue::from(quota.limit));
    headers.insert(RATELIMIT_REMAINING, HeaderValue::from(quota.remaining));
    headers.insert(RATELIMIT_RESET, HeaderValue::from(reset_at));
}

/// 429 for a request over the window limit.
pub fn over_limit(quota: &Quota, now: DateTime<Utc>) -> Response {
    let mut response = json_error(
        StatusCode::TOO_MANY_REQUESTS,
        "You are being ratelimited, slow down.",
    );
    let headers = response.headers_mut();
    apply_quota_headers(headers, quota, now);
    headers.insert(RETRY_AFTER, HeaderValue::from(retry_secs(quota.resets_in)));
    response
}

/// 429 for a temporary ban, 403 for a permanent one.
pub fn banned(ban: Ban, now: DateTime<Utc>) -> Response {
    match ban {
        Ban::Temporary { until } => {
            let wait = (until - now).to_std().unwrap_or(Duration::ZERO);
            let mut response = json_error(
                StatusCode::TOO_MANY_REQUESTS,
                "You have been temporarily banned for exceeding the ratelimit repeatedly.",
            );
            response
                .headers_mut()
                .insert(RETRY_AFTER, HeaderValue::from(retry_secs(wait)));
            response
        }
        Ban::Permanent => json_error(
            StatusCode::FORBIDDEN,
            "You have been permanently banned for exceeding the ratelimit repeatedly.",
        ),
    }
}

impl IntoResponse for GatekeeperError {
    fn into_response(self) -> Response {
        match self {
            GatekeeperError::InvalidIdentity(reason) => json_error(
                StatusCode::BAD_REQUEST,
                format!("Could not identify caller: {}", reason),
            ),
            other => {
                error!(error = %other, "Admission check failed");
                json_error(StatusCode::INTERNAL_SERVER_ERROR, "Internal Server Error")
            }
        }
    }
}
