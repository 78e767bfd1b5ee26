//! HTTP routes
//!
//! The webhook endpoint is the engine's only inbound surface. The raw body is
//! kept as bytes until the signature verifies, since the HMAC covers the
//! exact payload on the wire.

use axum::body::Bytes;
use axum::extract::State;
use axum::http::HeaderMap;
use axum::routing::{get, post};
use axum::{Json, Router};
use clientdeck_reconciler::InvariantCheckSummary;
use tower_http::trace::TraceLayer;

use crate::error::ApiError;
use crate::state::AppState;

/// Header carrying the `t=..,v1=..` delivery signature.
const SIGNATURE_HEADER: &str = "x-webhook-signature";

pub fn create_router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/webhooks/billing", post(handle_billing_webhook))
        .route("/admin/invariants", get(run_invariants))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

async fn health() -> Json<serde_json::Value> {
    Json(serde_json::json!({ "status": "ok" }))
}

/// Inbound billing event deliveries.
///
/// Every acknowledged delivery returns 200 with the dispatch status so the
/// processor stops redelivering; only signature failures (400) and storage
/// failures (500) deviate.
async fn handle_billing_webhook(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Json<serde_json::Value>, ApiError> {
    let signature = headers
        .get(SIGNATURE_HEADER)
        .and_then(|v| v.to_str().ok())
        .ok_or_else(|| ApiError::BadRequest("Missing signature header".to_string()))?;

    let envelope = state.reconciliation.dispatcher.verify(&body, signature)?;

    tracing::info!(
        external_event_id = %envelope.external_event_id,
        event_type = %envelope.event_type,
        "Webhook delivery verified"
    );

    let outcome = state.reconciliation.dispatcher.dispatch(&envelope).await?;

    Ok(Json(serde_json::json!({
        "received": true,
        "event_id": envelope.external_event_id,
        "status": outcome.as_str(),
    })))
}

/// Read-only consistency diagnostics over the canonical billing data.
async fn run_invariants(
    State(state): State<AppState>,
) -> Result<Json<InvariantCheckSummary>, ApiError> {
    let summary = state.reconciliation.invariants.run_all_checks().await?;
    Ok(Json(summary))
}
