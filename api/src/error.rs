//! API error handling.
//!
//! Every error body is `{"detail": ..., "kind": ...}` where `kind` comes
//! from the system-wide taxonomy: `validation`, `auth`, `not_supported`,
//! `transient`, `risk`, `internal`.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Serialize;
use thiserror::Error;
use tracing::{debug, error, warn};

use funding_arb_database::DatabaseError;
use funding_engine::EngineError;

#[derive(Debug, Error)]
pub enum ApiError {
    #[error("{0}")]
    Validation(String),

    #[error("{0}")]
    Auth(String),

    #[error("{0}")]
    NotSupported(String),

    #[error("{0}")]
    Transient(String),

    #[error("{0}")]
    Risk(String),

    #[error("{0}")]
    Internal(String),

    #[error("{0}")]
    NotFound(String),

    #[error("{0}")]
    Conflict(String),
}

impl ApiError {
    pub fn validation<S: Into<String>>(message: S) -> Self {
        Self::Validation(message.into())
    }

    pub fn not_found<S: Into<String>>(message: S) -> Self {
        Self::NotFound(message.into())
    }

    pub fn internal<S: Into<String>>(message: S) -> Self {
        Self::Internal(message.into())
    }

    pub fn status_code(&self) -> StatusCode {
        match self {
            ApiError::Validation(_) => StatusCode::BAD_REQUEST,
            ApiError::Auth(_) => StatusCode::UNAUTHORIZED,
            ApiError::NotSupported(_) => StatusCode::BAD_REQUEST,
            ApiError::Transient(_) => StatusCode::BAD_GATEWAY,
            ApiError::Risk(_) => StatusCode::CONFLICT,
            ApiError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
            ApiError::NotFound(_) => StatusCode::NOT_FOUND,
            ApiError::Conflict(_) => StatusCode::CONFLICT,
        }
    }

    /// Taxonomy tag for the response body.
    pub fn kind(&self) -> &'static str {
        match self {
            ApiError::Validation(_) | ApiError::NotFound(_) | ApiError::Conflict(_) => {
                "validation"
            }
            ApiError::Auth(_) => "auth",
            ApiError::NotSupported(_) => "not_supported",
            ApiError::Transient(_) => "transient",
            ApiError::Risk(_) => "risk",
            ApiError::Internal(_) => "internal",
        }
    }
}

pub type ApiResult<T> = Result<T, ApiError>;

#[derive(Serialize)]
struct ErrorBody {
    detail: String,
    kind: &'static str,
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        match &self {
            ApiError::Internal(message) => error!("internal error: {message}"),
            ApiError::Transient(message) => warn!("transient failure surfaced: {message}"),
            other => debug!("client error: {other}"),
        }
        let body = ErrorBody {
            detail: self.to_string(),
            kind: self.kind(),
        };
        (status, Json(body)).into_response()
    }
}

impl From<EngineError> for ApiError {
    fn from(err: EngineError) -> Self {
        let message = err.to_string();
        match err.kind() {
            "validation" => ApiError::Validation(message),
            "auth" => ApiError::Auth(message),
            "not_supported" => ApiError::NotSupported(message),
            "transient" => ApiError::Transient(message),
            "risk" => ApiError::Risk(message),
            _ => ApiError::Internal(message),
        }
    }
}

impl From<DatabaseError> for ApiError {
    fn from(err: DatabaseError) -> Self {
        match err {
            DatabaseError::NotFound(message) => ApiError::NotFound(message),
            DatabaseError::Conflict(message) => ApiError::Conflict(message),
            DatabaseError::Configuration(message) => ApiError::Internal(message),
            DatabaseError::Crypto(message) => ApiError::Auth(message),
            other => ApiError::Internal(other.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_and_kind_mapping() {
        assert_eq!(
            ApiError::Validation("x".into()).status_code(),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(ApiError::Auth("x".into()).status_code(), StatusCode::UNAUTHORIZED);
        assert_eq!(
            ApiError::Transient("x".into()).status_code(),
            StatusCode::BAD_GATEWAY
        );
        assert_eq!(ApiError::NotFound("x".into()).status_code(), StatusCode::NOT_FOUND);
        assert_eq!(ApiError::NotFound("x".into()).kind(), "validation");
        assert_eq!(ApiError::Risk("x".into()).kind(), "risk");
    }

    #[test]
    fn test_engine_error_conversion() {
        let err: ApiError = EngineError::auth("missing credential").into();
        assert_eq!(err.kind(), "auth");
        let err: ApiError = EngineError::transient("timeout").into();
        assert_eq!(err.kind(), "transient");
    }

    #[test]
    fn test_database_error_conversion() {
        let err: ApiError = DatabaseError::Conflict("duplicate name".into()).into();
        assert_eq!(err.status_code(), StatusCode::CONFLICT);
        let err: ApiError = DatabaseError::Crypto("key rotated".into()).into();
        assert_eq!(err.kind(), "auth");
    }
}
