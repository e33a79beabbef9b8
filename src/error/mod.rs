//! Unified error handling for RBAC Core

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::Serialize;
use thiserror::Error;

/// Application-wide result type
pub type Result<T> = std::result::Result<T, AppError>;

/// Application error types
#[derive(Error, Debug)]
pub enum AppError {
    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Bad request: {0}")]
    BadRequest(String),

    #[error("Unauthorized: {0}")]
    Unauthorized(String),

    #[error("Forbidden: {0}")]
    Forbidden(String),

    #[error("Conflict: {0}")]
    Conflict(String),

    #[error("Not acceptable: {0}")]
    NotAcceptable(String),

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Redis error: {0}")]
    Redis(#[from] redis::RedisError),

    #[error("JWT error: {0}")]
    Jwt(#[from] jsonwebtoken::errors::Error),

    #[error("Policy engine error: {0}")]
    Engine(String),

    #[error("Store and engine diverged: {0}")]
    Divergence(String),

    #[error("Internal error: {0}")]
    Internal(#[from] anyhow::Error),
}

/// Coarse error taxonomy shared by repositories, the merger and the facade.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Unauthenticated,
    Forbidden,
    Conflict,
    Invalid,
    NotFound,
    Transient,
    Fatal,
}

impl AppError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            AppError::NotFound(_) => ErrorKind::NotFound,
            AppError::BadRequest(_) | AppError::Validation(_) | AppError::NotAcceptable(_) => {
                ErrorKind::Invalid
            }
            AppError::Unauthorized(_) | AppError::Jwt(_) => ErrorKind::Unauthenticated,
            AppError::Forbidden(_) => ErrorKind::Forbidden,
            AppError::Conflict(_) => ErrorKind::Conflict,
            AppError::Database(sqlx::Error::RowNotFound) => ErrorKind::NotFound,
            AppError::Database(_) | AppError::Redis(_) | AppError::Engine(_) => {
                ErrorKind::Transient
            }
            AppError::Divergence(_) | AppError::Internal(_) => ErrorKind::Fatal,
        }
    }

    /// Whether the caller may retry the same request unchanged.
    pub fn is_retryable(&self) -> bool {
        matches!(self.kind(), ErrorKind::Conflict | ErrorKind::Transient)
    }
}

/// Returns true when the database rejected an insert because of a unique key.
pub fn is_unique_violation(err: &sqlx::Error) -> bool {
    match err {
        sqlx::Error::Database(db_err) => {
            db_err.is_unique_violation() || db_err.code().as_deref() == Some("23000")
        }
        _ => false,
    }
}

/// Error body: `{ "error": { code, internalMessage, userMessage } }`
#[derive(Serialize)]
struct ErrorResponse {
    error: ErrorBody,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct ErrorBody {
    code: String,
    internal_message: String,
    user_message: String,
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let (status, code, internal, user) = match &self {
            AppError::NotFound(msg) => (StatusCode::NOT_FOUND, "not_found", msg.clone(), msg.clone()),
            AppError::BadRequest(msg) => {
                (StatusCode::BAD_REQUEST, "bad_request", msg.clone(), msg.clone())
            }
            AppError::Validation(msg) => {
                (StatusCode::BAD_REQUEST, "validation", msg.clone(), msg.clone())
            }
            AppError::Unauthorized(msg) => (
                StatusCode::UNAUTHORIZED,
                "unauthorized",
                msg.clone(),
                "Unauthorized User".to_string(),
            ),
            AppError::Forbidden(msg) => (
                StatusCode::FORBIDDEN,
                "forbidden",
                msg.clone(),
                "unauthorized".to_string(),
            ),
            AppError::Conflict(msg) => (StatusCode::CONFLICT, "conflict", msg.clone(), msg.clone()),
            AppError::NotAcceptable(msg) => (
                StatusCode::NOT_ACCEPTABLE,
                "not_acceptable",
                msg.clone(),
                msg.clone(),
            ),
            AppError::Database(e) => {
                tracing::error!("Database error: {:?}", e);
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "database_error",
                    "database operation failed".to_string(),
                    "A database error occurred".to_string(),
                )
            }
            AppError::Redis(e) => {
                tracing::error!("Redis error: {:?}", e);
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "cache_error",
                    "cache operation failed".to_string(),
                    "A cache error occurred".to_string(),
                )
            }
            AppError::Jwt(e) => {
                tracing::debug!("JWT error: {:?}", e);
                (
                    StatusCode::UNAUTHORIZED,
                    "jwt_error",
                    "token verification failed".to_string(),
                    "Invalid or expired token".to_string(),
                )
            }
            AppError::Engine(msg) => {
                tracing::error!("Policy engine error: {}", msg);
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "engine_error",
                    "policy engine unavailable".to_string(),
                    "Authorization service error".to_string(),
                )
            }
            AppError::Divergence(msg) => {
                tracing::error!("Store/engine divergence: {}", msg);
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "engine_divergence",
                    "policy engine out of sync".to_string(),
                    "Authorization service error".to_string(),
                )
            }
            AppError::Internal(e) => {
                tracing::error!("Internal error: {:?}", e);
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "internal_error",
                    "internal error".to_string(),
                    "An internal error occurred".to_string(),
                )
            }
        };

        let body = Json(ErrorResponse {
            error: ErrorBody {
                code: code.to_string(),
                internal_message: internal,
                user_message: user,
            },
        });

        (status, body).into_response()
    }
}

// Conversion from validation errors
impl From<validator::ValidationErrors> for AppError {
    fn from(errors: validator::ValidationErrors) -> Self {
        AppError::Validation(errors.to_string())
    }
}
