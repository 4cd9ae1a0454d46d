use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use devenv_core::ErrorKind;
use devenv_orchestrator::OrchestratorError;
use serde_json::json;
use tracing::error;

pub type ApiResult<T> = Result<T, ApiError>;

#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error("{0}")]
    BadRequest(String),

    #[error(transparent)]
    Orchestrator(#[from] OrchestratorError),
}

/// HTTP status for an orchestrator error kind.
pub fn status_for(kind: ErrorKind) -> StatusCode {
    match kind {
        ErrorKind::NotFound => StatusCode::NOT_FOUND,
        ErrorKind::InvalidTransition
        | ErrorKind::ConcurrentModification
        | ErrorKind::RoutingConflict
        | ErrorKind::Cancelled => StatusCode::CONFLICT,
        ErrorKind::QuotaExceeded => StatusCode::TOO_MANY_REQUESTS,
        ErrorKind::CorruptSnapshot => StatusCode::UNPROCESSABLE_ENTITY,
        ErrorKind::TransientBackend => StatusCode::SERVICE_UNAVAILABLE,
        ErrorKind::Config | ErrorKind::Internal => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        match self {
            ApiError::BadRequest(message) => (
                StatusCode::BAD_REQUEST,
                Json(json!({ "error": { "kind": "invalid_request", "message": message } })),
            )
                .into_response(),
            ApiError::Orchestrator(err) => {
                let status = status_for(err.kind());
                if status.is_server_error() {
                    error!(error = %err, kind = %err.kind(), "request failed");
                }
                (status, Json(json!({ "error": err.summary() }))).into_response()
            }
        }
    }
}
