//! Application error taxonomy and its HTTP mapping.

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::Serialize;
use thiserror::Error;

use crate::models::{JobState, Provider};
use crate::services::catalog::CatalogError;

pub type Result<T> = std::result::Result<T, AppError>;

/// Error body returned by every failing endpoint.
#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub error: String,
    pub message: String,
}

#[derive(Debug, Error)]
pub enum AppError {
    #[error("invalid request: {0}")]
    BadRequest(String),

    #[error("{0} not found")]
    NotFound(String),

    #[error("credentials for {0} are missing")]
    AuthMissing(Provider),

    #[error("job is {actual}, expected {expected}")]
    InvalidState { expected: JobState, actual: JobState },

    #[error(transparent)]
    Catalog(#[from] CatalogError),

    #[error("database error")]
    Database(#[from] sqlx::Error),

    #[error("internal error: {0}")]
    Internal(String),
}

impl AppError {
    pub fn status_code(&self) -> StatusCode {
        match self {
            AppError::BadRequest(_) | AppError::AuthMissing(_) => StatusCode::BAD_REQUEST,
            AppError::NotFound(_) => StatusCode::NOT_FOUND,
            AppError::InvalidState { .. } => StatusCode::CONFLICT,
            AppError::Catalog(inner) => match inner {
                CatalogError::AuthMissing(_) | CatalogError::InvalidPlaylistRef => {
                    StatusCode::BAD_REQUEST
                }
                CatalogError::AuthInvalid(_) => StatusCode::UNAUTHORIZED,
                CatalogError::NotFound => StatusCode::NOT_FOUND,
                CatalogError::Conflict { .. } => StatusCode::CONFLICT,
                CatalogError::Quota { .. } => StatusCode::TOO_MANY_REQUESTS,
                CatalogError::Transient { .. } | CatalogError::InvalidResponse { .. } => {
                    StatusCode::BAD_GATEWAY
                }
            },
            AppError::Database(_) | AppError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    pub fn error_code(&self) -> &'static str {
        match self {
            AppError::BadRequest(_) => "BAD_REQUEST",
            AppError::NotFound(_) => "NOT_FOUND",
            AppError::AuthMissing(_) => "AUTH_MISSING",
            AppError::InvalidState { .. } => "INVALID_STATE",
            AppError::Catalog(inner) => match inner {
                CatalogError::AuthMissing(_) => "AUTH_MISSING",
                CatalogError::AuthInvalid(_) => "AUTH_INVALID",
                CatalogError::NotFound => "SOURCE_NOT_FOUND",
                CatalogError::InvalidPlaylistRef => "BAD_REQUEST",
                CatalogError::Quota { .. } => "TARGET_QUOTA",
                CatalogError::Conflict { .. } => "TARGET_CONFLICT",
                CatalogError::Transient { .. } => "TARGET_TRANSIENT",
                CatalogError::InvalidResponse { .. } => "TARGET_TRANSIENT",
            },
            AppError::Database(_) => "DATABASE_ERROR",
            AppError::Internal(_) => "INTERNAL_ERROR",
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        if status.is_server_error() {
            tracing::error!(error = %self, "request failed");
        } else {
            tracing::debug!(error = %self, "request rejected");
        }
        let body = ErrorResponse {
            error: self.error_code().to_string(),
            message: self.to_string(),
        };
        (status, Json(body)).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_mapping() {
        assert_eq!(
            AppError::BadRequest("invalid playlist URL".into()).status_code(),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(
            AppError::NotFound("job".into()).status_code(),
            StatusCode::NOT_FOUND
        );
        assert_eq!(
            AppError::InvalidState {
                expected: JobState::Queued,
                actual: JobState::Done,
            }
            .status_code(),
            StatusCode::CONFLICT
        );
        assert_eq!(
            AppError::Catalog(CatalogError::NotFound).status_code(),
            StatusCode::NOT_FOUND
        );
        assert_eq!(
            AppError::Catalog(CatalogError::Transient {
                provider: Provider::Tidal,
                detail: "503".into(),
            })
            .status_code(),
            StatusCode::BAD_GATEWAY
        );
    }

    #[test]
    fn test_error_codes() {
        assert_eq!(
            AppError::Catalog(CatalogError::Conflict { detail: "409".into() }).error_code(),
            "TARGET_CONFLICT"
        );
        assert_eq!(
            AppError::AuthMissing(Provider::Qobuz).error_code(),
            "AUTH_MISSING"
        );
    }
}
