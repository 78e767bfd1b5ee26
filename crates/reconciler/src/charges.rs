//! Charge reconciler
//!
//! Upserts realized monetary movements keyed on the processor's charge
//! identifier. Fee and net amounts come from the embedded settlement
//! sub-object when the processor has cleared the funds, and stay NULL until
//! then. Refund fan-out for `charge.refunded` events is driven by the
//! dispatcher through the refund reconciler.

use sqlx::PgPool;
use uuid::Uuid;

use crate::error::ReconcileResult;
use crate::event::ChargePayload;
use crate::resolver::{EntityResolver, ResolvedCustomer};
use crate::ReconcileOutcome;

/// Data the dispatcher needs after a successful charge apply.
#[derive(Debug, Clone)]
pub struct ChargeApplied {
    pub charge_id: Uuid,
    pub customer: ResolvedCustomer,
    pub invoice_id: Option<Uuid>,
    pub invoice_external_id: Option<String>,
}

/// Reconciles charge events onto the canonical store.
pub struct ChargeReconciler {
    pool: PgPool,
    resolver: EntityResolver,
}

impl ChargeReconciler {
    pub fn new(pool: PgPool) -> Self {
        Self {
            resolver: EntityResolver::new(pool.clone()),
            pool,
        }
    }

    pub async fn reconcile(
        &self,
        payload: &ChargePayload,
    ) -> ReconcileResult<ReconcileOutcome<ChargeApplied>> {
        let Some(customer) = self.resolver.customer_by_external_id(&payload.customer).await? else {
            tracing::warn!(
                external_customer_id = %payload.customer,
                external_charge_id = %payload.id,
                "Charge event references unknown customer, skipping"
            );
            return Ok(ReconcileOutcome::skipped("customer", &payload.customer));
        };

        let invoice = match &payload.invoice {
            Some(external_id) => self.resolver.invoice_by_external_id(external_id).await?,
            None => None,
        };
        let payment_attempt = match &payload.payment_attempt {
            Some(external_id) => {
                self.resolver.payment_attempt_by_external_id(external_id).await?
            }
            None => None,
        };

        let (fee_amount, net_amount) = payload
            .settlement
            .as_ref()
            .map(|s| (s.fee, s.net))
            .unwrap_or((None, None));

        let (charge_id,): (Uuid,) = sqlx::query_as(
            r#"
            INSERT INTO charges (
                customer_id, invoice_id, payment_attempt_id, external_id,
                amount, amount_captured, amount_refunded, currency, status,
                paid, refunded, captured,
                payment_method_fingerprint, card_brand, card_last4,
                fee_amount, net_amount
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16, $17)
            ON CONFLICT (external_id) DO UPDATE SET
                customer_id = EXCLUDED.customer_id,
                invoice_id = EXCLUDED.invoice_id,
                payment_attempt_id = EXCLUDED.payment_attempt_id,
                amount = EXCLUDED.amount,
                amount_captured = EXCLUDED.amount_captured,
                amount_refunded = EXCLUDED.amount_refunded,
                currency = EXCLUDED.currency,
                status = EXCLUDED.status,
                paid = EXCLUDED.paid,
                refunded = EXCLUDED.refunded,
                captured = EXCLUDED.captured,
                payment_method_fingerprint = EXCLUDED.payment_method_fingerprint,
                card_brand = EXCLUDED.card_brand,
                card_last4 = EXCLUDED.card_last4,
                fee_amount = EXCLUDED.fee_amount,
                net_amount = EXCLUDED.net_amount,
                updated_at = NOW()
            RETURNING id
            "#,
        )
        .bind(customer.id)
        .bind(invoice.as_ref().map(|i| i.id))
        .bind(payment_attempt.as_ref().map(|p| p.id))
        .bind(&payload.id)
        .bind(payload.amount)
        .bind(payload.amount_captured)
        .bind(payload.amount_refunded)
        .bind(payload.currency.to_lowercase())
        .bind(&payload.status)
        .bind(payload.paid)
        .bind(payload.refunded)
        .bind(payload.captured)
        .bind(payload.payment_method.as_ref().and_then(|m| m.fingerprint.clone()))
        .bind(payload.payment_method.as_ref().and_then(|m| m.brand.clone()))
        .bind(payload.payment_method.as_ref().and_then(|m| m.last4.clone()))
        .bind(fee_amount)
        .bind(net_amount)
        .fetch_one(&self.pool)
        .await?;

        tracing::info!(
            external_charge_id = %payload.id,
            customer_id = %customer.id,
            amount = payload.amount,
            refunded = payload.refunded,
            "Charge reconciled"
        );

        Ok(ReconcileOutcome::Applied(ChargeApplied {
            charge_id,
            customer,
            invoice_id: invoice.as_ref().map(|i| i.id),
            invoice_external_id: invoice.map(|i| i.external_id),
        }))
    }
}
