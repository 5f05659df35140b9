//! Error types for chirp-cc
//!
//! One service error enum covering ingress admission failures and
//! internal faults. Ingress maps every variant to an HTTP response
//! deterministically; pipeline failures never travel this path, and
//! surface exclusively as capture status and `capture.failed` events.

use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::json;
use thiserror::Error;

/// Main error type for chirp-cc
#[derive(Error, Debug)]
pub enum Error {
    /// No credential on the request
    #[error("Authentication required")]
    AuthMissing,

    /// Credential present but not recognized
    #[error("Invalid credentials")]
    AuthInvalid,

    /// Authenticated user does not own the referenced device
    #[error("Device not owned by caller: {0}")]
    NotOwned(String),

    /// Malformed parameters, missing fields, bad cursor
    #[error("Bad request: {0}")]
    BadRequest(String),

    /// Upload exceeds the configured size ceiling
    #[error("Payload too large: limit is {limit} bytes")]
    PayloadTooLarge { limit: usize },

    /// Declared content type is not an accepted audio format
    #[error("Unsupported media type: {0}")]
    UnsupportedMedia(String),

    /// Device exceeded its upload bucket
    #[error("Rate limited")]
    RateLimited { retry_after_secs: u64 },

    /// Dispatcher queue full
    #[error("Coordinator busy")]
    Busy { retry_after_secs: u64 },

    /// Resource does not exist (or is not visible to the caller)
    #[error("Not found: {0}")]
    NotFound(String),

    /// Database connection or query errors
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    /// Blob store failure on the request path
    #[error("Storage error: {0}")]
    Storage(String),

    /// Other errors
    #[error("Internal error: {0}")]
    Internal(String),
}

/// Convenience Result type using chirp-cc Error
pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    fn status(&self) -> StatusCode {
        match self {
            Error::AuthMissing | Error::AuthInvalid => StatusCode::UNAUTHORIZED,
            Error::NotOwned(_) => StatusCode::FORBIDDEN,
            Error::BadRequest(_) => StatusCode::BAD_REQUEST,
            Error::PayloadTooLarge { .. } => StatusCode::PAYLOAD_TOO_LARGE,
            Error::UnsupportedMedia(_) => StatusCode::UNSUPPORTED_MEDIA_TYPE,
            Error::RateLimited { .. } => StatusCode::TOO_MANY_REQUESTS,
            Error::Busy { .. } => StatusCode::SERVICE_UNAVAILABLE,
            Error::NotFound(_) => StatusCode::NOT_FOUND,
            Error::Database(_) | Error::Storage(_) | Error::Internal(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        }
    }

    fn retry_after(&self) -> Option<u64> {
        match self {
            Error::RateLimited { retry_after_secs } | Error::Busy { retry_after_secs } => {
                Some(*retry_after_secs)
            }
            _ => None,
        }
    }

    /// Short machine-readable error code for response bodies
    fn code(&self) -> &'static str {
        match self {
            Error::AuthMissing => "auth_missing",
            Error::AuthInvalid => "auth_invalid",
            Error::NotOwned(_) => "not_owned",
            Error::BadRequest(_) => "bad_request",
            Error::PayloadTooLarge { .. } => "payload_too_large",
            Error::UnsupportedMedia(_) => "unsupported_media",
            Error::RateLimited { .. } => "rate_limited",
            Error::Busy { .. } => "busy",
            Error::NotFound(_) => "not_found",
            Error::Database(_) | Error::Storage(_) | Error::Internal(_) => "internal",
        }
    }
}

impl IntoResponse for Error {
    fn into_response(self) -> Response {
        let status = self.status();

        // Internal detail stays in the logs, not the response body.
        let message = if status == StatusCode::INTERNAL_SERVER_ERROR {
            tracing::error!(error = %self, "Request failed");
            "internal error".to_string()
        } else {
            self.to_string()
        };

        let body = Json(json!({
            "error": self.code(),
            "message": message,
        }));

        let mut response = (status, body).into_response();
        if let Some(secs) = self.retry_after() {
            if let Ok(value) = header::HeaderValue::from_str(&secs.to_string()) {
                response.headers_mut().insert(header::RETRY_AFTER, value);
            }
        }
        response
    }
}
