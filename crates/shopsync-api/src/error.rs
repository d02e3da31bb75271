use axum::http::{header, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Serialize;
use shopsync_core::external::ExternalErrorKind;
use thiserror::Error;

/// Seconds a client should wait after the external resource stayed unavailable
const RETRY_AFTER_SECS: u64 = 5;

#[derive(Debug, Error)]
pub enum AppError {
    #[error("Invalid request: {0}")]
    BadRequest(String),
    #[error("Unauthorized: {0}")]
    Unauthorized(String),
    #[error("Not found: {0}")]
    NotFound(String),
    #[error("Conflict: {0}")]
    Conflict(String),
    #[error("Unprocessable: {0}")]
    Unprocessable(String),
    #[error("Service unavailable: {message}")]
    ServiceUnavailable { message: String, retry_after: u64 },
    #[error("Internal server error: {0}")]
    Internal(String),
}

#[derive(Debug, Serialize)]
struct ErrorBody {
    error: String,
}

impl AppError {
    pub fn bad_request(message: impl Into<String>) -> Self {
        Self::BadRequest(message.into())
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal(message.into())
    }
}

impl From<shopsync_core::Error> for AppError {
    fn from(error: shopsync_core::Error) -> Self {
        use shopsync_core::Error;

        match error {
            Error::Validation(message) => Self::BadRequest(message),
            Error::NotFound(message) => Self::NotFound(message),
            Error::OperationInProgress(_) => Self::Conflict(error.to_string()),
            Error::IdempotencyMismatch(_) => Self::Unprocessable(error.to_string()),
            Error::Session(message) => Self::Unauthorized(message),
            Error::External(external) => match external.kind {
                ExternalErrorKind::Transient => Self::ServiceUnavailable {
                    message: external.to_string(),
                    retry_after: RETRY_AFTER_SECS,
                },
                ExternalErrorKind::Permanent if external.is_not_found() => {
                    Self::NotFound(external.message)
                }
                ExternalErrorKind::Permanent => Self::Unprocessable(external.to_string()),
            },
            other => {
                tracing::error!(error = %other, "Request failed");
                Self::Internal("internal error".to_string())
            }
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let status = match self {
            Self::BadRequest(_) => StatusCode::BAD_REQUEST,
            Self::Unauthorized(_) => StatusCode::UNAUTHORIZED,
            Self::NotFound(_) => StatusCode::NOT_FOUND,
            Self::Conflict(_) => StatusCode::CONFLICT,
            Self::Unprocessable(_) => StatusCode::UNPROCESSABLE_ENTITY,
            Self::ServiceUnavailable { .. } => StatusCode::SERVICE_UNAVAILABLE,
            Self::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };
        let retry_after = match &self {
            Self::ServiceUnavailable { retry_after, .. } => Some(*retry_after),
            _ => None,
        };
        let body = ErrorBody {
            error: self.to_string(),
        };

        let mut response = (status, Json(body)).into_response();
        if let Some(seconds) = retry_after {
            response
                .headers_mut()
                .insert(header::RETRY_AFTER, HeaderValue::from(seconds));
        }
        response
    }
}
