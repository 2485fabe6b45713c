//! Error taxonomy for the chat service.
//!
//! Every fallible operation in the crate surfaces an [`AppError`]. The
//! variants map one-to-one onto the HTTP statuses callers observe; the
//! response bodies stay deliberately vague so internal detail never leaks
//! to an anonymous visitor.

use axum::Json;
use axum::http::{HeaderValue, StatusCode, header::HeaderName};
use axum::response::{IntoResponse, Response};
use chrono::{DateTime, Utc};
use serde_json::json;
use thiserror::Error;

pub const HEADER_RATELIMIT_LIMIT: HeaderName = HeaderName::from_static("x-ratelimit-limit");
pub const HEADER_RATELIMIT_REMAINING: HeaderName = HeaderName::from_static("x-ratelimit-remaining");
pub const HEADER_RATELIMIT_RESET: HeaderName = HeaderName::from_static("x-ratelimit-reset");

/// Unified error type for the chat pipeline and its HTTP surface.
#[derive(Debug, Error)]
pub enum AppError {
    /// A required request field is missing or malformed.
    #[error("validation error: {0}")]
    Validation(String),

    /// The caller exhausted its fixed-window request budget.
    #[error("rate limit exceeded, resets at {reset}")]
    RateLimited {
        limit: u32,
        remaining: u32,
        reset: DateTime<Utc>,
    },

    /// A referenced chat session does not exist.
    #[error("session {0} not found")]
    SessionNotFound(String),

    /// An embedding or generation backend failed.
    #[error("provider error: {0}")]
    Provider(String),

    /// The document store is unavailable or a write failed.
    #[error("persistence error: {0}")]
    Persistence(String),
}

impl AppError {
    /// Shorthand for a validation failure.
    pub fn validation(message: impl Into<String>) -> Self {
        Self::Validation(message.into())
    }

    /// Shorthand for a provider failure.
    pub fn provider(message: impl Into<String>) -> Self {
        Self::Provider(message.into())
    }

    /// HTTP status this error maps to at the service boundary.
    #[must_use]
    pub fn status(&self) -> StatusCode {
        match self {
            Self::Validation(_) => StatusCode::BAD_REQUEST,
            Self::RateLimited { .. } => StatusCode::TOO_MANY_REQUESTS,
            Self::SessionNotFound(_) => StatusCode::NOT_FOUND,
            Self::Provider(_) => StatusCode::BAD_GATEWAY,
            Self::Persistence(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// User-facing message. Internal detail is only kept for variants callers
    /// are expected to act on.
    #[must_use]
    pub fn public_message(&self) -> String {
        match self {
            Self::Validation(message) => message.clone(),
            Self::RateLimited { .. } => {
                "Rate limit exceeded. Please try again later.".to_string()
            }
            Self::SessionNotFound(id) => format!("Session {id} not found"),
            Self::Provider(_) | Self::Persistence(_) => "Internal server error".to_string(),
        }
    }
}

impl From<sqlx::Error> for AppError {
    fn from(err: sqlx::Error) -> Self {
        Self::Persistence(err.to_string())
    }
}

impl From<reqwest::Error> for AppError {
    fn from(err: reqwest::Error) -> Self {
        Self::Provider(err.to_string())
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let status = self.status();
        let body = Json(json!({ "error": self.public_message() }));
        let mut response = (status, body).into_response();

        if let Self::RateLimited {
            limit,
            remaining,
            reset,
        } = &self
        {
            let headers = response.headers_mut();
            if let Ok(value) = HeaderValue::from_str(&limit.to_string()) {
                headers.insert(HEADER_RATELIMIT_LIMIT, value);
            }
            if let Ok(value) = HeaderValue::from_str(&remaining.to_string()) {
                headers.insert(HEADER_RATELIMIT_REMAINING, value);
            }
            if let Ok(value) = HeaderValue::from_str(&reset.to_rfc3339()) {
                headers.insert(HEADER_RATELIMIT_RESET, value);
            }
        }

        response
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn statuses_match_taxonomy() {
        assert_eq!(
            AppError::validation("query is required").status(),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(
            AppError::RateLimited {
                limit: 10,
                remaining: 0,
                reset: Utc::now(),
            }
            .status(),
            StatusCode::TOO_MANY_REQUESTS
        );
        assert_eq!(
            AppError::SessionNotFound("abc".into()).status(),
            StatusCode::NOT_FOUND
        );
        assert_eq!(AppError::provider("boom").status(), StatusCode::BAD_GATEWAY);
        assert_eq!(
            AppError::Persistence("db down".into()).status(),
            StatusCode::INTERNAL_SERVER_ERROR
        );
    }

    #[test]
    fn internal_detail_does_not_leak() {
        let err = AppError::Persistence("connection refused at 10.0.0.3".into());
        assert_eq!(err.public_message(), "Internal server error");

        let err = AppError::provider("gemini returned 503");
        assert_eq!(err.public_message(), "Internal server error");
    }

    #[test]
    fn rate_limit_response_carries_reset_header() {
        let reset = Utc::now();
        let response = AppError::RateLimited {
            limit: 10,
            remaining: 0,
            reset,
        }
        .into_response();

        assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
        let header = response
            .headers()
            .get(HEADER_RATELIMIT_RESET)
            .expect("reset header");
        assert_eq!(header.to_str().unwrap(), reset.to_rfc3339());
    }
}
