// Error taxonomy shared by the service and presentation layers
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::json;

/// Errors that reach the caller. Grouped-aggregation failures never appear
/// here: the series service recovers from them by switching to stride
/// sampling, so only a failing fallback surfaces (as `Internal`).
#[derive(Debug, thiserror::Error)]
pub enum CoreError {
    #[error("{0}")]
    Validation(String),

    #[error("{0}")]
    NotFound(String),

    #[error("query timeout after {elapsed_ms}ms")]
    Timeout { elapsed_ms: u64 },

    #[error("formula \"{step}\" failed: {reason}")]
    Formula { step: String, reason: String },

    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

pub type CoreResult<T> = Result<T, CoreError>;

impl IntoResponse for CoreError {
    fn into_response(self) -> Response {
        let (status, message) = match &self {
            CoreError::Validation(msg) => (StatusCode::BAD_REQUEST, msg.clone()),
            CoreError::NotFound(msg) => (StatusCode::NOT_FOUND, msg.clone()),
            CoreError::Timeout { .. } => (StatusCode::GATEWAY_TIMEOUT, self.to_string()),
            CoreError::Formula { .. } => (StatusCode::UNPROCESSABLE_ENTITY, self.to_string()),
            CoreError::Internal(err) => {
                tracing::error!(error = %err, "internal error");
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "Internal server error".to_string(),
                )
            }
        };

        (status, Json(json!({ "error": message }))).into_response()
    }
}
