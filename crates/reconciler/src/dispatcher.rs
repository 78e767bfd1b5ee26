//! Event dispatcher
//!
//! The single entry point for inbound processor events. Sequencing per
//! delivery:
//!
//! 1. verify the envelope signature (reject before any processing)
//! 2. short-circuit on the idempotency ledger
//! 3. validate the payload into the closed event union
//! 4. route to the reconciler for the event type, retrying transient
//!    storage failures with exponential backoff
//! 5. run non-fatal post-steps: alert rules, invalidation signals,
//!    notification emails
//! 6. record the idempotency row as the last step
//!
//! A storage failure that survives the retries propagates without a ledger
//! write, so the at-least-once delivery contract redelivers the event. A
//! crash between step 4 and step 6 costs at most one extra replay, which the
//! upsert-based reconcilers absorb.

use sqlx::PgPool;
use tokio_retry::strategy::ExponentialBackoff;
use tokio_retry::RetryIf;

use crate::alerts::{self, AlertEngine, NewAlert};
use crate::charges::ChargeReconciler;
use crate::email::BillingEmailService;
use crate::envelope::{EventEnvelope, SignatureVerifier};
use crate::error::{ReconcileError, ReconcileResult};
use crate::event::{
    ChargePayload, EventPayload, InvoicePayload, PaymentAttemptPayload, SubscriptionPayload,
};
use crate::invalidation::{EntityClass, InvalidationSignaler};
use crate::invoices::{InvoiceApplied, InvoiceEventKind, InvoiceReconciler};
use crate::ledger::{IdempotencyLedger, ProcessingOutcome};
use crate::payments::{PaymentAttemptReconciler, PaymentEventKind};
use crate::refunds::RefundReconciler;
use crate::resolver::ResolvedCustomer;
use crate::subscriptions::{SubscriptionEventKind, SubscriptionReconciler};
use crate::ReconcileOutcome;

/// Reconcile retry schedule: 1s, 2s, 4s (matching the delivery source's own
/// redelivery expectations).
const RECONCILE_RETRIES: usize = 3;

/// How dispatch concluded, as reported back to the transport layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatchOutcome {
    /// Canonical state was created or updated.
    Applied,
    /// A required reference could not be resolved; acknowledged without
    /// mutation.
    SkippedMissingReference,
    /// Unknown event type; acknowledged without processing.
    Ignored,
    /// The idempotency ledger already had this event identifier.
    AlreadyProcessed,
}

impl DispatchOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            DispatchOutcome::Applied => "applied",
            DispatchOutcome::SkippedMissingReference => "skipped_missing_reference",
            DispatchOutcome::Ignored => "ignored",
            DispatchOutcome::AlreadyProcessed => "already_processed",
        }
    }
}

enum Processed {
    Applied,
    Skipped,
}

/// Routes verified events through the reconciliation pipeline.
pub struct Dispatcher {
    verifier: SignatureVerifier,
    ledger: IdempotencyLedger,
    subscriptions: SubscriptionReconciler,
    invoices: InvoiceReconciler,
    payments: PaymentAttemptReconciler,
    charges: ChargeReconciler,
    refunds: RefundReconciler,
    alerts: AlertEngine,
    signaler: InvalidationSignaler,
    email: BillingEmailService,
}

impl Dispatcher {
    pub fn new(
        pool: PgPool,
        webhook_secret: &str,
        signaler: InvalidationSignaler,
        email: BillingEmailService,
    ) -> Self {
        Self {
            verifier: SignatureVerifier::new(webhook_secret),
            ledger: IdempotencyLedger::new(pool.clone()),
            subscriptions: SubscriptionReconciler::new(pool.clone()),
            invoices: InvoiceReconciler::new(pool.clone()),
            payments: PaymentAttemptReconciler::new(pool.clone()),
            charges: ChargeReconciler::new(pool.clone()),
            refunds: RefundReconciler::new(pool.clone()),
            alerts: AlertEngine::new(pool),
            signaler,
            email,
        }
    }

    /// Verify a raw delivery and parse its envelope. The signature check is a
    /// precondition for everything else; nothing is persisted for a delivery
    /// that fails here.
    pub fn verify(&self, body: &[u8], signature: &str) -> ReconcileResult<EventEnvelope> {
        self.verifier.verify(body, signature)?;
        EventEnvelope::from_slice(body)
    }

    /// Process one verified envelope end to end.
    pub async fn dispatch(&self, envelope: &EventEnvelope) -> ReconcileResult<DispatchOutcome> {
        // Sole idempotency gate: an existing ledger row means the event's
        // side effects were already fully applied.
        if let Some(existing) = self.ledger.find(&envelope.external_event_id).await? {
            tracing::info!(
                external_event_id = %envelope.external_event_id,
                event_type = %envelope.event_type,
                recorded_outcome = %existing.outcome,
                "Duplicate delivery short-circuited by idempotency ledger"
            );
            return Ok(DispatchOutcome::AlreadyProcessed);
        }

        let payload = EventPayload::parse(&envelope.event_type, &envelope.payload)?;

        if matches!(payload, EventPayload::Unknown) {
            tracing::info!(
                external_event_id = %envelope.external_event_id,
                event_type = %envelope.event_type,
                "No reconciler registered for event type, acknowledging"
            );
            self.ledger
                .record(
                    &envelope.external_event_id,
                    &envelope.event_type,
                    ProcessingOutcome::Ignored,
                )
                .await?;
            return Ok(DispatchOutcome::Ignored);
        }

        let strategy = ExponentialBackoff::from_millis(2)
            .factor(500)
            .take(RECONCILE_RETRIES);

        let processed = RetryIf::spawn(
            strategy,
            || self.process(&payload),
            |e: &ReconcileError| e.is_retryable(),
        )
        .await?;

        let outcome = match processed {
            Processed::Applied => ProcessingOutcome::Applied,
            Processed::Skipped => ProcessingOutcome::Skipped,
        };

        // Ledger write is deliberately last: a crash before this point leaves
        // the event unrecorded and redelivery replays it safely.
        self.ledger
            .record(&envelope.external_event_id, &envelope.event_type, outcome)
            .await?;

        Ok(match outcome {
            ProcessingOutcome::Applied => DispatchOutcome::Applied,
            ProcessingOutcome::Skipped => DispatchOutcome::SkippedMissingReference,
            ProcessingOutcome::Ignored => DispatchOutcome::Ignored,
        })
    }

    async fn process(&self, payload: &EventPayload) -> ReconcileResult<Processed> {
        match payload {
            EventPayload::SubscriptionUpdated(p) => {
                self.process_subscription(SubscriptionEventKind::Updated, p).await
            }
            EventPayload::SubscriptionCanceled(p) => {
                self.process_subscription(SubscriptionEventKind::Canceled, p).await
            }
            EventPayload::InvoiceCreated(p) => {
                self.process_invoice(InvoiceEventKind::Created, p).await
            }
            EventPayload::InvoicePaid(p) => self.process_invoice(InvoiceEventKind::Paid, p).await,
            EventPayload::InvoicePaymentFailed(p) => {
                self.process_invoice(InvoiceEventKind::PaymentFailed, p).await
            }
            EventPayload::PaymentAttemptSucceeded(p) => {
                self.process_payment(PaymentEventKind::Succeeded, p).await
            }
            EventPayload::PaymentAttemptFailed(p) => {
                self.process_payment(PaymentEventKind::Failed, p).await
            }
            EventPayload::ChargeSucceeded(p) => self.process_charge(p, false).await,
            EventPayload::ChargeRefunded(p) => self.process_charge(p, true).await,
            EventPayload::Unknown => Ok(Processed::Skipped),
        }
    }

    async fn process_subscription(
        &self,
        kind: SubscriptionEventKind,
        payload: &SubscriptionPayload,
    ) -> ReconcileResult<Processed> {
        let applied = match self.subscriptions.reconcile(kind, payload).await? {
            ReconcileOutcome::Applied(applied) => applied,
            ReconcileOutcome::SkippedMissingReference { .. } => return Ok(Processed::Skipped),
        };

        self.signaler.signal_entity(
            EntityClass::Subscriptions,
            &applied.customer.external_id,
            None,
        );

        if applied.became_canceled {
            self.send_cancellation_email(&applied.customer, &applied.plan_code).await;
        }

        Ok(Processed::Applied)
    }

    async fn process_invoice(
        &self,
        kind: InvoiceEventKind,
        payload: &InvoicePayload,
    ) -> ReconcileResult<Processed> {
        let applied = match self.invoices.reconcile(kind, payload).await? {
            ReconcileOutcome::Applied(applied) => applied,
            ReconcileOutcome::SkippedMissingReference { .. } => return Ok(Processed::Skipped),
        };

        let parent = applied
            .subscription_external_id
            .as_deref()
            .map(|sub| ("subscription", sub));
        self.signaler
            .signal_entity(EntityClass::Invoices, &applied.customer.external_id, parent);

        if kind == InvoiceEventKind::PaymentFailed {
            let alert = alerts::evaluate_invoice_payment_failed(&applied, payload);
            self.record_alert(&alert, &applied.customer.external_id).await;
            self.send_payment_failed_email(&applied, payload).await;
        }

        Ok(Processed::Applied)
    }

    async fn process_payment(
        &self,
        kind: PaymentEventKind,
        payload: &PaymentAttemptPayload,
    ) -> ReconcileResult<Processed> {
        let applied = match self.payments.reconcile(kind, payload).await? {
            ReconcileOutcome::Applied(applied) => applied,
            ReconcileOutcome::SkippedMissingReference { .. } => return Ok(Processed::Skipped),
        };

        let parent = applied
            .invoice_external_id
            .as_deref()
            .map(|inv| ("invoice", inv));
        self.signaler.signal_entity(
            EntityClass::PaymentAttempts,
            &applied.customer.external_id,
            parent,
        );

        if let Some(alert) = alerts::evaluate_payment_attempt(&applied, payload) {
            self.record_alert(&alert, &applied.customer.external_id).await;
        }

        Ok(Processed::Applied)
    }

    async fn process_charge(
        &self,
        payload: &ChargePayload,
        refunded: bool,
    ) -> ReconcileResult<Processed> {
        let applied = match self.charges.reconcile(payload).await? {
            ReconcileOutcome::Applied(applied) => applied,
            ReconcileOutcome::SkippedMissingReference { .. } => return Ok(Processed::Skipped),
        };

        let parent = applied
            .invoice_external_id
            .as_deref()
            .map(|inv| ("invoice", inv));
        self.signaler
            .signal_entity(EntityClass::Charges, &applied.customer.external_id, parent);

        if refunded {
            // One charge.refunded event may carry several discrete refund
            // objects; each becomes its own canonical row.
            for refund in &payload.refunds {
                self.refunds
                    .reconcile(applied.charge_id, applied.customer.id, refund)
                    .await?;
            }
            if !payload.refunds.is_empty() {
                self.signaler.signal_entity(
                    EntityClass::Refunds,
                    &applied.customer.external_id,
                    Some(("charge", &payload.id)),
                );
            }

            let alert = alerts::evaluate_charge_refunded(&applied, payload);
            self.record_alert(&alert, &applied.customer.external_id).await;
        }

        Ok(Processed::Applied)
    }

    /// Alert creation failure never rolls back the reconciliation write.
    async fn record_alert(&self, alert: &NewAlert, customer_external_id: &str) {
        match self.alerts.record(alert).await {
            Ok(_) => {
                self.signaler.signal_entity(
                    EntityClass::BillingAlerts,
                    customer_external_id,
                    None,
                );
            }
            Err(e) => {
                tracing::error!(
                    alert_type = %alert.alert_type.as_str(),
                    customer_id = %alert.customer_id,
                    error = %e,
                    "Failed to create billing alert"
                );
            }
        }
    }

    async fn send_cancellation_email(&self, customer: &ResolvedCustomer, plan_code: &str) {
        let Some(email) = customer.email.as_deref() else {
            tracing::debug!(
                customer_id = %customer.id,
                "No email on file, skipping cancellation notification"
            );
            return;
        };
        let name = customer.display_name.as_deref().unwrap_or("there");

        if let Err(e) = self
            .email
            .send_subscription_canceled(email, name, plan_code)
            .await
        {
            tracing::error!(
                customer_id = %customer.id,
                error = %e,
                "Failed to send cancellation email"
            );
        }
    }

    async fn send_payment_failed_email(&self, applied: &InvoiceApplied, payload: &InvoicePayload) {
        let Some(email) = applied.customer.email.as_deref() else {
            return;
        };
        let name = applied.customer.display_name.as_deref().unwrap_or("there");

        if let Err(e) = self
            .email
            .send_payment_failed(email, name, payload.amount_due, &payload.currency)
            .await
        {
            tracing::error!(
                customer_id = %applied.customer.id,
                error = %e,
                "Failed to send payment failed email"
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_dispatch_outcome_strings() {
        assert_eq!(DispatchOutcome::Applied.as_str(), "applied");
        assert_eq!(
            DispatchOutcome::SkippedMissingReference.as_str(),
            "skipped_missing_reference"
        );
        assert_eq!(DispatchOutcome::Ignored.as_str(), "ignored");
        assert_eq!(DispatchOutcome::AlreadyProcessed.as_str(), "already_processed");
    }
}
