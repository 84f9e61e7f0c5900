// =============================================================================
// API error taxonomy
// =============================================================================
//
// Boundary handlers translate every failure into one of these kinds; the
// response body is always `{"error": ...}` with the matching status code.
// =============================================================================

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::json;
use tracing::error;

use crate::funds::LedgerError;
use crate::repo::RepoError;

#[derive(Debug)]
pub enum ApiError {
    Invalid(String),
    Unauthorized(String),
    Forbidden(String),
    NotFound(String),
    StorageUnavailable,
    Internal(String),
}

impl ApiError {
    pub fn invalid(msg: impl Into<String>) -> Self {
        Self::Invalid(msg.into())
    }

    pub fn not_found(msg: impl Into<String>) -> Self {
        Self::NotFound(msg.into())
    }

    pub fn forbidden(msg: impl Into<String>) -> Self {
        Self::Forbidden(msg.into())
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, message) = match self {
            Self::Invalid(m) => (StatusCode::BAD_REQUEST, m),
            Self::Unauthorized(m) => (StatusCode::UNAUTHORIZED, m),
            Self::Forbidden(m) => (StatusCode::FORBIDDEN, m),
            Self::NotFound(m) => (StatusCode::NOT_FOUND, m),
            Self::StorageUnavailable => {
                (StatusCode::SERVICE_UNAVAILABLE, "db_unavailable".to_string())
            }
            Self::Internal(m) => {
                error!(message = %m, "internal error surfaced to API");
                (StatusCode::INTERNAL_SERVER_ERROR, "internal error".to_string())
            }
        };
        (status, Json(json!({"error": message}))).into_response()
    }
}

impl From<RepoError> for ApiError {
    fn from(e: RepoError) -> Self {
        match e {
            RepoError::Unavailable { .. } => Self::StorageUnavailable,
            RepoError::Logical(m) => Self::Internal(m),
        }
    }
}

impl From<LedgerError> for ApiError {
    fn from(e: LedgerError) -> Self {
        match e {
            LedgerError::Invalid(m) => Self::Invalid(m),
            LedgerError::NotFound(m) => Self::NotFound(m),
            LedgerError::Storage(e) => e.into(),
        }
    }
}

impl From<anyhow::Error> for ApiError {
    fn from(e: anyhow::Error) -> Self {
        Self::Internal(e.to_string())
    }
}

pub type ApiResult<T> = Result<T, ApiError>;
