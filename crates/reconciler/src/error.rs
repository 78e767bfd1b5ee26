//! Error types for the reconciliation engine

use thiserror::Error;

/// Convenience alias used across the crate
pub type ReconcileResult<T> = Result<T, ReconcileError>;

/// Errors surfaced by the reconciliation engine.
///
/// `SignatureInvalid` and `MalformedEnvelope` reject the delivery before any
/// processing. `InvalidPayload` means a known event type carried a payload
/// that failed boundary validation. `Database` is retryable: the dispatcher
/// does not write the idempotency record on a database failure, so the
/// at-least-once delivery contract redelivers the event.
#[derive(Debug, Error)]
pub enum ReconcileError {
    #[error("webhook signature verification failed")]
    SignatureInvalid,

    #[error("malformed event envelope: {0}")]
    MalformedEnvelope(String),

    #[error("invalid payload for event type '{event_type}': {source}")]
    InvalidPayload {
        event_type: String,
        #[source]
        source: serde_json::Error,
    },

    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("notification error: {0}")]
    Notification(String),

    #[error("internal error: {0}")]
    Internal(String),
}

impl ReconcileError {
    /// Whether redelivering the same event could succeed.
    ///
    /// Used by the transport layer to pick a response code: retryable errors
    /// get a 5xx so the event source redelivers, the rest are terminal and
    /// acknowledged with a 4xx.
    pub fn is_retryable(&self) -> bool {
        matches!(self, ReconcileError::Database(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retryable_classification() {
        assert!(ReconcileError::Database(sqlx::Error::PoolClosed).is_retryable());
        assert!(!ReconcileError::SignatureInvalid.is_retryable());
        assert!(!ReconcileError::MalformedEnvelope("bad json".into()).is_retryable());
    }
}
