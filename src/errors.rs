use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::json;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum AppError {
    #[error("bad request: {0}")]
    BadRequest(String),

    #[error("missing bearer token")]
    MissingToken,

    #[error("invalid token")]
    InvalidToken,

    #[error("token expired")]
    TokenExpired,

    #[error("instance already exists: {0}")]
    AlreadyExists(String),

    #[error("not found")]
    NotFound,

    #[error("concurrent write conflict")]
    Conflict,

    #[error("backend unavailable: {0}")]
    BackendUnavailable(String),

    #[error("upstream error: {0}")]
    Upstream(String),

    #[error("internal error: {0}")]
    Internal(#[from] anyhow::Error),
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let (status, error_type, code, msg) = match &self {
            AppError::BadRequest(msg) => (
                StatusCode::BAD_REQUEST,
                "invalid_request_error",
                "bad_request",
                msg.clone(),
            ),
            AppError::MissingToken => (
                StatusCode::UNAUTHORIZED,
                "authentication_error",
                "missing_token",
                "missing bearer token in Authorization header".to_string(),
            ),
            AppError::InvalidToken => (
                StatusCode::UNAUTHORIZED,
                "authentication_error",
                "invalid_token",
                "invalid or unknown token".to_string(),
            ),
            AppError::TokenExpired => (
                StatusCode::UNAUTHORIZED,
                "authentication_error",
                "token_expired",
                "token has expired; request a renewal".to_string(),
            ),
            AppError::AlreadyExists(name) => (
                StatusCode::CONFLICT,
                "invalid_request_error",
                "already_exists",
                format!("an instance named '{}' already exists", name),
            ),
            AppError::NotFound => (
                StatusCode::NOT_FOUND,
                "invalid_request_error",
                "not_found",
                "no matching instance or token".to_string(),
            ),
            AppError::Conflict => (
                StatusCode::CONFLICT,
                "conflict_error",
                "write_conflict",
                "a concurrent writer changed the token state; retry".to_string(),
            ),
            AppError::BackendUnavailable(dep) => {
                tracing::error!("backend unavailable: {}", dep);
                (
                    StatusCode::SERVICE_UNAVAILABLE,
                    "dependency_error",
                    "backend_unavailable",
                    "a backing service is unavailable; retry shortly".to_string(),
                )
            }
            AppError::Upstream(e) => (
                StatusCode::BAD_GATEWAY,
                "upstream_error",
                "upstream_failed",
                e.clone(),
            ),
            AppError::Internal(e) => {
                tracing::error!("internal error: {}", e);
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "internal_error",
                    "internal_server_error",
                    "internal server error".to_string(),
                )
            }
        };

        let body = Json(json!({
            "error": {
                "message": msg,
                "type": error_type,
                "code": code,
            }
        }));

        let mut response = (status, body).into_response();

        // Retryable dependency failures advertise a backoff hint
        if matches!(self, AppError::BackendUnavailable(_)) {
            response
                .headers_mut()
                .insert("retry-after", axum::http::HeaderValue::from_static("1"));
        }

        response
    }
}
