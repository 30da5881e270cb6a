use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use tracing::error;

use skiff_store::StoreError;

/// API error mapped onto HTTP status codes. Internal failures get a
/// correlation id that also lands in the log.
#[derive(Debug)]
pub enum ApiError {
    BadRequest(String),
    Unauthorized,
    NotFound(String),
    Conflict(String),
    Internal { correlation_id: String },
}

impl ApiError {
    pub fn internal(message: impl std::fmt::Display) -> Self {
        let correlation_id = uuid::Uuid::now_v7().simple().to_string();
        error!(correlation_id = %correlation_id, "internal error: {message}");
        Self::Internal { correlation_id }
    }
}

impl From<StoreError> for ApiError {
    fn from(e: StoreError) -> Self {
        match e {
            StoreError::NotFound(what) => Self::NotFound(what),
            StoreError::Conflict(what) => Self::Conflict(what),
            other => Self::internal(other),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, body) = match self {
            Self::BadRequest(message) => (
                StatusCode::BAD_REQUEST,
                serde_json::json!({"error": message}),
            ),
            Self::Unauthorized => (
                StatusCode::UNAUTHORIZED,
                serde_json::json!({"error": "unauthorized"}),
            ),
            Self::NotFound(what) => (
                StatusCode::NOT_FOUND,
                serde_json::json!({"error": format!("not found: {what}")}),
            ),
            Self::Conflict(what) => (
                StatusCode::CONFLICT,
                serde_json::json!({"error": what}),
            ),
            Self::Internal { correlation_id } => (
                StatusCode::INTERNAL_SERVER_ERROR,
                serde_json::json!({
                    "error": "internal error",
                    "correlation_id": correlation_id,
                }),
            ),
        };
        (status, Json(body)).into_response()
    }
}
