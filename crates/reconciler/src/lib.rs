// Test code patterns (expected in test files):
#![cfg_attr(test, allow(clippy::unwrap_used))]
#![cfg_attr(test, allow(clippy::expect_used))]

//! Clientdeck Billing Reconciliation Engine
//!
//! Keeps the platform's canonical billing data consistent with an external
//! payment processor that delivers events asynchronously, at least once, and
//! in no guaranteed order.
//!
//! ## Pipeline
//!
//! - **Dispatcher**: verifies event authenticity, gates on the idempotency
//!   ledger, routes payloads to reconcilers, sequences post-steps
//! - **Entity Reconcilers**: idempotent upserts keyed on the processor's
//!   external identifiers (subscriptions, invoices, payment attempts,
//!   charges, refunds)
//! - **History Recorder**: append-only audit trail of subscription changes
//!   with MRR/ARR deltas, atomic with the subscription write
//! - **Alert Rule Engine**: operator-facing alerts on failure conditions
//! - **Invalidation Signaler**: best-effort cache invalidation signals
//!
//! The processor is the source of truth: reconcilers mirror whatever state
//! an event reports rather than enforcing a local state machine.

pub mod alerts;
pub mod charges;
pub mod dispatcher;
pub mod email;
pub mod envelope;
pub mod error;
pub mod event;
pub mod history;
pub mod invalidation;
pub mod invariants;
pub mod invoices;
pub mod ledger;
pub mod payments;
pub mod refunds;
pub mod resolver;
pub mod subscriptions;

#[cfg(test)]
mod edge_case_tests;

// Alerts
pub use alerts::{AlertEngine, AlertSeverity, AlertType, NewAlert};

// Charges
pub use charges::{ChargeApplied, ChargeReconciler};

// Dispatcher
pub use dispatcher::{DispatchOutcome, Dispatcher};

// Email
pub use email::{BillingEmailService, EmailConfig};

// Envelope
pub use envelope::{EventEnvelope, SignatureVerifier};

// Error
pub use error::{ReconcileError, ReconcileResult};

// Events
pub use event::{
    BillingInterval, ChargePayload, EventPayload, InvoicePayload, InvoiceStatus,
    PaymentAttemptPayload, RefundPayload, SubscriptionPayload, SubscriptionStatus,
};

// History
pub use history::{HistoryEventType, NewHistoryEvent};

// Invalidation
pub use invalidation::{EntityClass, InvalidationSignaler};

// Invariants
pub use invariants::{
    InvariantCheckSummary, InvariantChecker, InvariantViolation, ViolationSeverity,
};

// Invoices
pub use invoices::{InvoiceApplied, InvoiceEventKind, InvoiceReconciler};

// Ledger
pub use ledger::{IdempotencyLedger, ProcessedEvent, ProcessingOutcome};

// Payments
pub use payments::{PaymentApplied, PaymentAttemptReconciler, PaymentEventKind};

// Refunds
pub use refunds::{RefundApplied, RefundReconciler};

// Resolver
pub use resolver::{EntityResolver, ResolvedCustomer, ResolvedPlan};

// Subscriptions
pub use subscriptions::{SubscriptionApplied, SubscriptionEventKind, SubscriptionReconciler};

use sqlx::PgPool;

/// Result of applying an event payload onto the canonical store.
///
/// Storage failures are not an outcome: they surface as
/// [`ReconcileError::Database`] so the dispatcher can retry and, if retries
/// run out, leave the event unledgered for redelivery.
#[derive(Debug, Clone)]
pub enum ReconcileOutcome<T> {
    /// The canonical record was created or updated.
    Applied(T),
    /// A required parent entity could not be resolved; the event is
    /// acknowledged without any mutation.
    SkippedMissingReference {
        entity: &'static str,
        external_ref: String,
    },
}

impl<T> ReconcileOutcome<T> {
    pub fn skipped(entity: &'static str, external_ref: &str) -> Self {
        ReconcileOutcome::SkippedMissingReference {
            entity,
            external_ref: external_ref.to_string(),
        }
    }

    pub fn is_applied(&self) -> bool {
        matches!(self, ReconcileOutcome::Applied(_))
    }
}

/// Main reconciliation service combining the dispatcher with diagnostics.
pub struct ReconciliationService {
    pub dispatcher: Dispatcher,
    pub invariants: InvariantChecker,
}

impl ReconciliationService {
    pub fn new(
        pool: PgPool,
        webhook_secret: &str,
        signaler: InvalidationSignaler,
        email: BillingEmailService,
    ) -> Self {
        Self {
            dispatcher: Dispatcher::new(pool.clone(), webhook_secret, signaler, email),
            invariants: InvariantChecker::new(pool),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_outcome_helpers() {
        let applied: ReconcileOutcome<()> = ReconcileOutcome::Applied(());
        assert!(applied.is_applied());

        let skipped: ReconcileOutcome<()> = ReconcileOutcome::skipped("customer", "cus_404");
        assert!(!skipped.is_applied());
        match skipped {
            ReconcileOutcome::SkippedMissingReference {
                entity,
                external_ref,
            } => {
                assert_eq!(entity, "customer");
                assert_eq!(external_ref, "cus_404");
            }
            ReconcileOutcome::Applied(_) => panic!("expected skip"),
        }
    }
}
