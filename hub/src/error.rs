//! Error taxonomy, one variant per kind. Every service
//! operation (C3-C9) returns `Result<T, AppError>`; the REST layer converts
//! via `IntoResponse`, the WS layer via `to_ws_frame`.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Serialize;
use serde_json::json;

#[derive(Debug, thiserror::Error)]
pub enum AppError {
    #[error("authentication failed: {0}")]
    Auth(String),

    #[error("permission denied: {0}")]
    Permission(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("conflict: {0}")]
    Conflict(String),

    #[error("validation error: {0}")]
    Validation(String),

    #[error("insufficient funds: {0}")]
    InsufficientFunds(String),

    #[error("safeguard triggered: {0}")]
    Safeguard(String),

    #[error("rate limited, retry after {retry_after_secs}s")]
    RateLimited { retry_after_secs: u64 },

    #[error("internal error (ref {correlation_id})")]
    Internal {
        correlation_id: uuid::Uuid,
        #[source]
        source: Option<anyhow::Error>,
    },
}

impl AppError {
    /// Wraps any lower-level error (DB, cache, pool) as `Internal`, logging
    /// the real cause with a correlation id that's all the caller gets back.
    pub fn internal(err: impl Into<anyhow::Error>) -> Self {
        let correlation_id = uuid::Uuid::new_v4();
        let err = err.into();
        tracing::error!(correlation_id = %correlation_id, error = ?err, "internal error");
        AppError::Internal {
            correlation_id,
            source: Some(err),
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            AppError::Auth(_) => "auth_error",
            AppError::Permission(_) => "permission_error",
            AppError::NotFound(_) => "not_found",
            AppError::Conflict(_) => "conflict",
            AppError::Validation(_) => "validation_error",
            AppError::InsufficientFunds(_) => "insufficient_funds",
            AppError::Safeguard(_) => "safeguard",
            AppError::RateLimited { .. } => "rate_limited",
            AppError::Internal { .. } => "internal_error",
        }
    }

    pub fn status(&self) -> StatusCode {
        match self {
            AppError::Auth(_) => StatusCode::UNAUTHORIZED,
            AppError::Permission(_) => StatusCode::FORBIDDEN,
            AppError::NotFound(_) => StatusCode::NOT_FOUND,
            AppError::Conflict(_) => StatusCode::CONFLICT,
            AppError::Validation(_) => StatusCode::BAD_REQUEST,
            AppError::InsufficientFunds(_) => StatusCode::PAYMENT_REQUIRED,
            AppError::Safeguard(_) => StatusCode::CONFLICT,
            AppError::RateLimited { .. } => StatusCode::TOO_MANY_REQUESTS,
            AppError::Internal { .. } => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    fn detail(&self) -> String {
        match self {
            AppError::Internal { correlation_id, .. } => {
                format!("an internal error occurred (ref {correlation_id})")
            },
            other => other.to_string(),
        }
    }
}

impl From<diesel::result::Error> for AppError {
    fn from(err: diesel::result::Error) -> Self {
        if crate::db::is_lock_timeout(&err) {
            return AppError::Conflict("lock acquisition timed out".to_string());
        }
        if matches!(err, diesel::result::Error::NotFound) {
            return AppError::NotFound("record not found".to_string());
        }
        AppError::internal(err)
    }
}

impl From<redis::RedisError> for AppError {
    fn from(err: redis::RedisError) -> Self {
        AppError::internal(err)
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let status = self.status();
        let mut response = if let AppError::RateLimited { retry_after_secs } = &self {
            let body = Json(json!({ "error": self.kind(), "detail": self.detail() }));
            let mut resp = (status, body).into_response();
            resp.headers_mut().insert(
                axum::http::header::RETRY_AFTER,
                retry_after_secs.to_string().parse().unwrap(),
            );
            resp
        } else {
            let body = Json(json!({ "error": self.kind(), "detail": self.detail() }));
            (status, body).into_response()
        };
        response.extensions_mut().insert(ErrorKindExt(self.kind()));
        response
    }
}

#[derive(Clone, Copy)]
struct ErrorKindExt(&'static str);

/// The `{type: "error", code, detail, ref}` frame shape sent over the WS
/// connection in place of an HTTP response.
#[derive(Debug, Serialize)]
pub struct WsErrorFrame {
    #[serde(rename = "type")]
    pub frame_type: &'static str,
    pub code: &'static str,
    pub detail: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub r#ref: Option<String>,
}

impl AppError {
    pub fn to_ws_frame(&self, frame_ref: Option<String>) -> WsErrorFrame {
        WsErrorFrame {
            frame_type: "error",
            code: self.kind(),
            detail: self.detail(),
            r#ref: frame_ref,
        }
    }

    /// Auth errors close the connection; everything else stays open after
    /// emitting the error frame.
    pub fn should_close_connection(&self) -> bool {
        matches!(self, AppError::Auth(_))
    }
}

pub type AppResult<T> = Result<T, AppError>;

/// Marks a startup failure as originating from an unreachable database or
/// cache, so `main` can map it to a distinct exit code rather than the
/// generic failure code used for config errors and runtime panics.
#[derive(Debug, thiserror::Error)]
#[error("storage unreachable at startup: {0}")]
pub struct StorageUnreachable(pub String);

/// `true` if `err`'s chain contains a [`StorageUnreachable`] marker.
pub fn is_storage_unreachable(err: &anyhow::Error) -> bool {
    err.chain().any(|cause| cause.downcast_ref::<StorageUnreachable>().is_some())
}
