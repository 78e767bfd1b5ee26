//! Invoice reconciler
//!
//! Upserts invoice documents keyed on the processor's invoice identifier.
//! `amount_remaining` is always derived as `amount_due - amount_paid`, and
//! discount totals are summed from the payload's itemized discount lines.
//! A paid event forces the settled shape (`status = paid`,
//! `amount_remaining = 0`) no matter what the payload's status field says.

use sqlx::PgPool;
use time::OffsetDateTime;
use uuid::Uuid;

use crate::error::ReconcileResult;
use crate::event::{InvoicePayload, InvoiceStatus};
use crate::resolver::{EntityResolver, ResolvedCustomer};
use crate::ReconcileOutcome;

/// Which invoice event drove this reconciliation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InvoiceEventKind {
    Created,
    Paid,
    PaymentFailed,
}

/// Data the dispatcher needs after a successful invoice apply.
#[derive(Debug, Clone)]
pub struct InvoiceApplied {
    pub invoice_id: Uuid,
    pub customer: ResolvedCustomer,
    pub subscription_id: Option<Uuid>,
    pub subscription_external_id: Option<String>,
}

/// Reconciles invoice events onto the canonical store.
pub struct InvoiceReconciler {
    pool: PgPool,
    resolver: EntityResolver,
}

impl InvoiceReconciler {
    pub fn new(pool: PgPool) -> Self {
        Self {
            resolver: EntityResolver::new(pool.clone()),
            pool,
        }
    }

    pub async fn reconcile(
        &self,
        kind: InvoiceEventKind,
        payload: &InvoicePayload,
    ) -> ReconcileResult<ReconcileOutcome<InvoiceApplied>> {
        let Some(customer) = self.resolver.customer_by_external_id(&payload.customer).await? else {
            tracing::warn!(
                external_customer_id = %payload.customer,
                external_invoice_id = %payload.id,
                "Invoice event references unknown customer, skipping"
            );
            return Ok(ReconcileOutcome::skipped("customer", &payload.customer));
        };

        // The subscription link is optional: a one-off invoice has none, and
        // an invoice arriving before its subscription simply links later.
        let subscription = match &payload.subscription {
            Some(external_id) => {
                let resolved = self.resolver.subscription_by_external_id(external_id).await?;
                if resolved.is_none() {
                    tracing::debug!(
                        external_subscription_id = %external_id,
                        external_invoice_id = %payload.id,
                        "Invoice references subscription not yet reconciled"
                    );
                }
                resolved
            }
            None => None,
        };

        let status = match kind {
            InvoiceEventKind::Paid => InvoiceStatus::Paid,
            InvoiceEventKind::Created => payload.status.unwrap_or(InvoiceStatus::Draft),
            InvoiceEventKind::PaymentFailed => payload.status.unwrap_or(InvoiceStatus::Open),
        };

        let amount_remaining = match kind {
            InvoiceEventKind::Paid => 0,
            _ => payload.amount_remaining(),
        };

        let mark_paid = kind == InvoiceEventKind::Paid;

        // paid_at is pinned by COALESCE on conflict so replaying a paid event
        // does not move the settlement timestamp.
        let (invoice_id,): (Uuid,) = sqlx::query_as(
            r#"
            INSERT INTO invoices (
                customer_id, subscription_id, external_id, number, status, currency,
                amount_due, amount_paid, amount_remaining,
                subtotal, total, tax, discount_total,
                period_start, period_end,
                attempt_count, next_payment_attempt,
                hosted_invoice_url, invoice_pdf_url,
                paid_at
            )
            VALUES (
                $1, $2, $3, $4, $5, $6, $7, $8, $9, $10,
                $11, $12, $13, $14, $15, $16, $17, $18, $19,
                CASE WHEN $20 THEN NOW() ELSE NULL END
            )
            ON CONFLICT (external_id) DO UPDATE SET
                customer_id = EXCLUDED.customer_id,
                subscription_id = EXCLUDED.subscription_id,
                number = EXCLUDED.number,
                status = EXCLUDED.status,
                currency = EXCLUDED.currency,
                amount_due = EXCLUDED.amount_due,
                amount_paid = EXCLUDED.amount_paid,
                amount_remaining = EXCLUDED.amount_remaining,
                subtotal = EXCLUDED.subtotal,
                total = EXCLUDED.total,
                tax = EXCLUDED.tax,
                discount_total = EXCLUDED.discount_total,
                period_start = EXCLUDED.period_start,
                period_end = EXCLUDED.period_end,
                attempt_count = EXCLUDED.attempt_count,
                next_payment_attempt = EXCLUDED.next_payment_attempt,
                hosted_invoice_url = EXCLUDED.hosted_invoice_url,
                invoice_pdf_url = EXCLUDED.invoice_pdf_url,
                paid_at = CASE WHEN $20 THEN COALESCE(invoices.paid_at, NOW()) ELSE invoices.paid_at END,
                updated_at = NOW()
            RETURNING id
            "#,
        )
        .bind(customer.id)
        .bind(subscription.as_ref().map(|s| s.id))
        .bind(&payload.id)
        .bind(&payload.number)
        .bind(status.as_str())
        .bind(payload.currency.to_lowercase())
        .bind(payload.amount_due)
        .bind(payload.amount_paid)
        .bind(amount_remaining)
        .bind(payload.subtotal)
        .bind(payload.total)
        .bind(payload.tax)
        .bind(payload.discount_total())
        .bind(unix_ts(payload.period_start))
        .bind(unix_ts(payload.period_end))
        .bind(payload.attempt_count)
        .bind(unix_ts(payload.next_payment_attempt))
        .bind(&payload.hosted_invoice_url)
        .bind(&payload.invoice_pdf_url)
        .bind(mark_paid)
        .fetch_one(&self.pool)
        .await?;

        tracing::info!(
            external_invoice_id = %payload.id,
            customer_id = %customer.id,
            status = %status.as_str(),
            amount_remaining = amount_remaining,
            "Invoice reconciled"
        );

        Ok(ReconcileOutcome::Applied(InvoiceApplied {
            invoice_id,
            customer,
            subscription_id: subscription.as_ref().map(|s| s.id),
            subscription_external_id: subscription.map(|s| s.external_id),
        }))
    }
}

fn unix_ts(secs: Option<i64>) -> Option<OffsetDateTime> {
    secs.and_then(|ts| OffsetDateTime::from_unix_timestamp(ts).ok())
}
