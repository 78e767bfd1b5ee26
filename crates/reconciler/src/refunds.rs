//! Refund reconciler
//!
//! Upserts one refund row per discrete refund object nested inside a
//! `charge.refunded` event. A single event fans out into several refund
//! upserts when the charge was refunded in parts; each row links to exactly
//! one canonical charge.

use sqlx::PgPool;
use uuid::Uuid;

use crate::error::ReconcileResult;
use crate::event::RefundPayload;

/// Data recorded for a single applied refund.
#[derive(Debug, Clone)]
pub struct RefundApplied {
    pub refund_id: Uuid,
}

/// Reconciles nested refund objects onto the canonical store.
pub struct RefundReconciler {
    pool: PgPool,
}

impl RefundReconciler {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Upsert one refund against its parent charge. The charge row is always
    /// reconciled first, so the parent link never dangles.
    pub async fn reconcile(
        &self,
        charge_id: Uuid,
        customer_id: Uuid,
        payload: &RefundPayload,
    ) -> ReconcileResult<RefundApplied> {
        let (refund_id,): (Uuid,) = sqlx::query_as(
            r#"
            INSERT INTO refunds (
                charge_id, customer_id, external_id,
                amount, currency, status, reason
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            ON CONFLICT (external_id) DO UPDATE SET
                charge_id = EXCLUDED.charge_id,
                customer_id = EXCLUDED.customer_id,
                amount = EXCLUDED.amount,
                currency = EXCLUDED.currency,
                status = EXCLUDED.status,
                reason = EXCLUDED.reason,
                updated_at = NOW()
            RETURNING id
            "#,
        )
        .bind(charge_id)
        .bind(customer_id)
        .bind(&payload.id)
        .bind(payload.amount)
        .bind(payload.currency.to_lowercase())
        .bind(&payload.status)
        .bind(&payload.reason)
        .fetch_one(&self.pool)
        .await?;

        tracing::info!(
            external_refund_id = %payload.id,
            charge_id = %charge_id,
            amount = payload.amount,
            "Refund reconciled"
        );

        Ok(RefundApplied { refund_id })
    }
}
