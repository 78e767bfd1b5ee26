//! HTTP error mapping
//!
//! Response codes follow the delivery contract: signature and validation
//! failures are terminal (4xx, the source must not redeliver a bad payload),
//! while storage failures are retryable (5xx, the source redelivers and the
//! idempotency ledger keeps the replay safe).

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use clientdeck_reconciler::ReconcileError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ApiError {
    #[error("webhook signature verification failed")]
    SignatureInvalid,

    #[error("{0}")]
    BadRequest(String),

    #[error("database error: {0}")]
    Database(String),

    #[error("internal error: {0}")]
    Internal(String),
}

impl From<ReconcileError> for ApiError {
    fn from(e: ReconcileError) -> Self {
        match e {
            ReconcileError::SignatureInvalid => ApiError::SignatureInvalid,
            ReconcileError::MalformedEnvelope(msg) => ApiError::BadRequest(msg),
            err @ ReconcileError::InvalidPayload { .. } => ApiError::BadRequest(err.to_string()),
            ReconcileError::Database(db) => ApiError::Database(db.to_string()),
            ReconcileError::Notification(msg) | ReconcileError::Internal(msg) => {
                ApiError::Internal(msg)
            }
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, message) = match &self {
            ApiError::SignatureInvalid => {
                (StatusCode::BAD_REQUEST, "Signature verification failed")
            }
            ApiError::BadRequest(_) => (StatusCode::BAD_REQUEST, "Invalid request"),
            // Internal detail stays out of the response body; the event
            // source only needs to know whether to redeliver.
            ApiError::Database(_) | ApiError::Internal(_) => {
                (StatusCode::INTERNAL_SERVER_ERROR, "Event processing failed")
            }
        };

        tracing::error!(error = %self, status = %status, "Request failed");

        (status, Json(serde_json::json!({ "error": message }))).into_response()
    }
}
