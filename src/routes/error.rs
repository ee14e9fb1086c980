use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Serialize;

use crate::services::submit::SubmitError;

/// Error returned by API handlers. Bodies carry a stable code and a short
/// message, never internal detail.
#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error("{0}")]
    InvalidUrl(String),

    #[error("job not found")]
    NotFound,

    #[error("service temporarily unavailable")]
    Unavailable,
}

#[derive(Serialize)]
struct ErrorBody {
    error: &'static str,
    message: String,
}

impl ApiError {
    fn status(&self) -> StatusCode {
        match self {
            ApiError::InvalidUrl(_) => StatusCode::BAD_REQUEST,
            ApiError::NotFound => StatusCode::NOT_FOUND,
            ApiError::Unavailable => StatusCode::SERVICE_UNAVAILABLE,
        }
    }

    fn code(&self) -> &'static str {
        match self {
            ApiError::InvalidUrl(_) => "invalid_url",
            ApiError::NotFound => "not_found",
            ApiError::Unavailable => "unavailable",
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let body = ErrorBody {
            error: self.code(),
            message: self.to_string(),
        };
        (self.status(), Json(body)).into_response()
    }
}

impl From<SubmitError> for ApiError {
    fn from(err: SubmitError) -> Self {
        match err {
            SubmitError::InvalidUrl(e) => ApiError::InvalidUrl(e.to_string()),
            SubmitError::Store(e) => {
                tracing::error!(error = %e, "Job store unavailable");
                ApiError::Unavailable
            }
            SubmitError::Queue(e) => {
                tracing::error!(error = %e, "Queue unavailable");
                ApiError::Unavailable
            }
        }
    }
}
