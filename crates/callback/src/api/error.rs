//! HTTP error mapping with structured responses.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Serialize;
use thiserror::Error;
use tracing::{debug, error};

use crate::connman::ConnmanError;

#[derive(Debug, Error)]
pub enum ApiError {
    #[error("resource not found: {0}")]
    NotFound(String),

    #[error("conflict: {0}")]
    Conflict(String),

    #[error("internal server error: {0}")]
    Internal(String),
}

impl ApiError {
    fn status_code(&self) -> StatusCode {
        match self {
            Self::NotFound(_) => StatusCode::NOT_FOUND,
            Self::Conflict(_) => StatusCode::CONFLICT,
            Self::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    fn error_code(&self) -> &'static str {
        match self {
            Self::NotFound(_) => "NOT_FOUND",
            Self::Conflict(_) => "CONFLICT",
            Self::Internal(_) => "INTERNAL_ERROR",
        }
    }
}

/// Structured error response body.
#[derive(Debug, Serialize)]
struct ErrorResponse {
    error: String,
    code: &'static str,
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        let code = self.error_code();
        let message = self.to_string();

        match &self {
            ApiError::Internal(msg) => {
                error!(error_code = code, message = %msg, "API error");
            }
            _ => {
                debug!(error_code = code, message = %message, "client error");
            }
        }

        let body = ErrorResponse {
            error: message,
            code,
        };
        (status, Json(body)).into_response()
    }
}

impl From<ConnmanError> for ApiError {
    fn from(err: ConnmanError) -> Self {
        match &err {
            ConnmanError::SessionUnknown(_) => ApiError::NotFound(err.to_string()),
            ConnmanError::SessionExists(_) | ConnmanError::SessionDisconnected(_) => {
                ApiError::Conflict(err.to_string())
            }
            _ => ApiError::Internal(err.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn connman_errors_map_to_statuses() {
        let unknown: ApiError = ConnmanError::SessionUnknown("alpha".into()).into();
        assert_eq!(unknown.status_code(), StatusCode::NOT_FOUND);

        let exists: ApiError = ConnmanError::SessionExists("alpha".into()).into();
        assert_eq!(exists.status_code(), StatusCode::CONFLICT);

        let draining: ApiError = ConnmanError::SessionDisconnected("alpha".into()).into();
        assert_eq!(draining.status_code(), StatusCode::CONFLICT);
    }
}
