//! Payment attempt reconciler
//!
//! Upserts payment attempts keyed on the processor's attempt identifier.
//! A failed attempt records the processor's error code and message; a
//! succeeded attempt explicitly nulls both, since an attempt that failed
//! earlier can succeed on retry and must not keep stale error detail.

use sqlx::PgPool;
use uuid::Uuid;

use crate::error::ReconcileResult;
use crate::event::PaymentAttemptPayload;
use crate::resolver::{EntityResolver, ResolvedCustomer};
use crate::ReconcileOutcome;

/// Which payment attempt event drove this reconciliation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PaymentEventKind {
    Succeeded,
    Failed,
}

/// Data the dispatcher needs after a successful payment attempt apply.
#[derive(Debug, Clone)]
pub struct PaymentApplied {
    pub payment_attempt_id: Uuid,
    pub customer: ResolvedCustomer,
    pub invoice_id: Option<Uuid>,
    pub invoice_external_id: Option<String>,
    pub subscription_id: Option<Uuid>,
    pub error_code: Option<String>,
    pub error_message: Option<String>,
}

impl PaymentApplied {
    /// A populated error marks the attempt as failed for alerting purposes.
    pub fn has_error(&self) -> bool {
        self.error_code.is_some() || self.error_message.is_some()
    }
}

/// Reconciles payment attempt events onto the canonical store.
pub struct PaymentAttemptReconciler {
    pool: PgPool,
    resolver: EntityResolver,
}

impl PaymentAttemptReconciler {
    pub fn new(pool: PgPool) -> Self {
        Self {
            resolver: EntityResolver::new(pool.clone()),
            pool,
        }
    }

    pub async fn reconcile(
        &self,
        kind: PaymentEventKind,
        payload: &PaymentAttemptPayload,
    ) -> ReconcileResult<ReconcileOutcome<PaymentApplied>> {
        let Some(customer) = self.resolver.customer_by_external_id(&payload.customer).await? else {
            tracing::warn!(
                external_customer_id = %payload.customer,
                external_payment_attempt_id = %payload.id,
                "Payment attempt event references unknown customer, skipping"
            );
            return Ok(ReconcileOutcome::skipped("customer", &payload.customer));
        };

        let invoice = match &payload.invoice {
            Some(external_id) => self.resolver.invoice_by_external_id(external_id).await?,
            None => None,
        };
        let subscription = match &payload.subscription {
            Some(external_id) => self.resolver.subscription_by_external_id(external_id).await?,
            None => None,
        };

        let (error_code, error_message) = match kind {
            // Cleared on success: a previously failed attempt may have
            // recovered, so both fields go back to NULL.
            PaymentEventKind::Succeeded => (None, None),
            PaymentEventKind::Failed => payload
                .last_error
                .as_ref()
                .map(|e| (e.code.clone(), e.message.clone()))
                .unwrap_or((None, None)),
        };

        let (payment_attempt_id,): (Uuid,) = sqlx::query_as(
            r#"
            INSERT INTO payment_attempts (
                customer_id, invoice_id, subscription_id, external_id,
                amount, currency, status,
                capture_method, confirmation_method,
                last_error_code, last_error_message
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)
            ON CONFLICT (external_id) DO UPDATE SET
                customer_id = EXCLUDED.customer_id,
                invoice_id = EXCLUDED.invoice_id,
                subscription_id = EXCLUDED.subscription_id,
                amount = EXCLUDED.amount,
                currency = EXCLUDED.currency,
                status = EXCLUDED.status,
                capture_method = EXCLUDED.capture_method,
                confirmation_method = EXCLUDED.confirmation_method,
                last_error_code = EXCLUDED.last_error_code,
                last_error_message = EXCLUDED.last_error_message,
                updated_at = NOW()
            RETURNING id
            "#,
        )
        .bind(customer.id)
        .bind(invoice.as_ref().map(|i| i.id))
        .bind(subscription.as_ref().map(|s| s.id))
        .bind(&payload.id)
        .bind(payload.amount)
        .bind(payload.currency.to_lowercase())
        .bind(&payload.status)
        .bind(&payload.capture_method)
        .bind(&payload.confirmation_method)
        .bind(&error_code)
        .bind(&error_message)
        .fetch_one(&self.pool)
        .await?;

        tracing::info!(
            external_payment_attempt_id = %payload.id,
            customer_id = %customer.id,
            status = %payload.status,
            has_error = error_code.is_some() || error_message.is_some(),
            "Payment attempt reconciled"
        );

        Ok(ReconcileOutcome::Applied(PaymentApplied {
            payment_attempt_id,
            customer,
            invoice_id: invoice.as_ref().map(|i| i.id),
            invoice_external_id: invoice.map(|i| i.external_id),
            subscription_id: subscription.map(|s| s.id),
            error_code,
            error_message,
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn applied(code: Option<&str>, message: Option<&str>) -> PaymentApplied {
        PaymentApplied {
            payment_attempt_id: Uuid::new_v4(),
            customer: ResolvedCustomer {
                id: Uuid::new_v4(),
                external_id: "cus_1".to_string(),
                email: None,
                display_name: None,
            },
            invoice_id: None,
            invoice_external_id: None,
            subscription_id: None,
            error_code: code.map(String::from),
            error_message: message.map(String::from),
        }
    }

    #[test]
    fn test_has_error() {
        assert!(!applied(None, None).has_error());
        assert!(applied(Some("card_declined"), None).has_error());
        assert!(applied(None, Some("Your card was declined.")).has_error());
    }
}
