//! API error type and HTTP response mapping.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Serialize;

use labtasker_engine::error::Error as EngineError;

/// API result type.
pub type ApiResult<T> = Result<T, ApiError>;

/// Standard JSON error response body.
#[derive(Debug, Serialize)]
pub struct ApiErrorBody {
    /// Stable machine-readable error code.
    pub code: String,
    /// Human-readable message (safe for clients).
    pub message: String,
}

/// HTTP API error with a stable machine-readable code.
#[derive(Debug)]
pub struct ApiError {
    status: StatusCode,
    code: &'static str,
    message: String,
}

impl ApiError {
    /// Returns an error response for invalid input.
    pub fn bad_request(message: impl Into<String>) -> Self {
        Self::new(StatusCode::BAD_REQUEST, "INVALID_ARGUMENT", message)
    }

    /// Returns an error response for authentication failures.
    pub fn unauthorized(message: impl Into<String>) -> Self {
        Self::new(StatusCode::UNAUTHORIZED, "UNAUTHORIZED", message)
    }

    /// Returns an error response when the Authorization header is missing
    /// or malformed.
    #[must_use]
    pub fn missing_auth() -> Self {
        Self::new(
            StatusCode::UNAUTHORIZED,
            "UNAUTHORIZED",
            "Basic authentication with queue name and password required",
        )
    }

    /// Returns an error response for missing resources.
    pub fn not_found(message: impl Into<String>) -> Self {
        Self::new(StatusCode::NOT_FOUND, "NOT_FOUND", message)
    }

    /// Returns an internal error response.
    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(StatusCode::INTERNAL_SERVER_ERROR, "INTERNAL", message)
    }

    /// Returns the HTTP status code for this error.
    #[must_use]
    pub const fn status(&self) -> StatusCode {
        self.status
    }

    /// Returns the stable machine-readable error code.
    #[must_use]
    pub const fn code(&self) -> &'static str {
        self.code
    }

    fn new(status: StatusCode, code: &'static str, message: impl Into<String>) -> Self {
        Self {
            status,
            code,
            message: message.into(),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (
            self.status,
            Json(ApiErrorBody {
                code: self.code.to_string(),
                message: self.message,
            }),
        )
            .into_response()
    }
}

impl From<EngineError> for ApiError {
    fn from(value: EngineError) -> Self {
        let message = value.to_string();
        match value {
            EngineError::NotFound { .. } => Self::new(StatusCode::NOT_FOUND, "NOT_FOUND", message),
            EngineError::AlreadyExists { .. } => {
                Self::new(StatusCode::CONFLICT, "ALREADY_EXISTS", message)
            }
            EngineError::InvalidArgument(_) => {
                Self::new(StatusCode::BAD_REQUEST, "INVALID_ARGUMENT", message)
            }
            EngineError::Unauthorized(_) => {
                Self::new(StatusCode::UNAUTHORIZED, "UNAUTHORIZED", message)
            }
            EngineError::WorkerInactive { .. } => {
                Self::new(StatusCode::CONFLICT, "WORKER_INACTIVE", message)
            }
            EngineError::NotOwned { .. } => Self::new(StatusCode::CONFLICT, "NOT_OWNED", message),
            EngineError::Conflict { .. } => Self::new(StatusCode::CONFLICT, "CONFLICT", message),
            EngineError::Transient { .. } => {
                Self::new(StatusCode::SERVICE_UNAVAILABLE, "TRANSIENT", message)
            }
        }
    }
}

impl From<labtasker_core::Error> for ApiError {
    fn from(value: labtasker_core::Error) -> Self {
        match value {
            labtasker_core::Error::InvalidId { message }
            | labtasker_core::Error::InvalidInput(message) => Self::bad_request(message),
            labtasker_core::Error::Internal { message } => Self::internal(message),
        }
    }
}
