//! Billing invariants
//!
//! Runnable consistency checks over the canonical billing data. These can be
//! run after any reconciliation or event replay to confirm the store is in a
//! valid state.
//!
//! ## Design Principles
//!
//! 1. **Executable**: each invariant is a real SQL query
//! 2. **Explanatory**: violations carry enough context to debug
//! 3. **Non-destructive**: checks only read, never write

use serde::{Deserialize, Serialize};
use sqlx::PgPool;
use time::OffsetDateTime;
use uuid::Uuid;

use crate::error::ReconcileResult;

/// Result of running a single invariant check
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InvariantViolation {
    /// Which invariant was violated
    pub invariant: String,
    /// Customer(s) affected
    pub customer_ids: Vec<Uuid>,
    /// Human-readable description of the violation
    pub description: String,
    /// Additional context for debugging
    pub context: serde_json::Value,
    /// Severity level
    pub severity: ViolationSeverity,
}

/// Severity of an invariant violation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ViolationSeverity {
    /// Critical - revenue figures may be wrong
    Critical,
    /// High - data inconsistency that needs attention
    High,
    /// Medium - potential issue, should investigate
    Medium,
    /// Low - minor inconsistency, informational
    Low,
}

impl std::fmt::Display for ViolationSeverity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ViolationSeverity::Critical => write!(f, "CRITICAL"),
            ViolationSeverity::High => write!(f, "HIGH"),
            ViolationSeverity::Medium => write!(f, "MEDIUM"),
            ViolationSeverity::Low => write!(f, "LOW"),
        }
    }
}

/// Summary of all invariant checks
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InvariantCheckSummary {
    pub checked_at: OffsetDateTime,
    pub checks_run: usize,
    pub checks_passed: usize,
    pub checks_failed: usize,
    pub violations: Vec<InvariantViolation>,
    pub healthy: bool,
}

#[derive(Debug, sqlx::FromRow)]
struct MissingHistoryRow {
    sub_id: Uuid,
    customer_id: Uuid,
    external_id: String,
    status: String,
}

#[derive(Debug, sqlx::FromRow)]
struct CanceledNoTimestampRow {
    sub_id: Uuid,
    customer_id: Uuid,
    external_id: String,
}

#[derive(Debug, sqlx::FromRow)]
struct RemainingMismatchRow {
    invoice_id: Uuid,
    customer_id: Uuid,
    external_id: String,
    amount_due: i64,
    amount_paid: i64,
    amount_remaining: i64,
}

#[derive(Debug, sqlx::FromRow)]
struct RefundOverflowRow {
    charge_id: Uuid,
    customer_id: Uuid,
    external_id: String,
    amount_refunded: i64,
    refund_total: i64,
}

/// Service for running billing invariant checks
pub struct InvariantChecker {
    pool: PgPool,
}

impl InvariantChecker {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Run all invariant checks and return summary
    pub async fn run_all_checks(&self) -> ReconcileResult<InvariantCheckSummary> {
        let now = OffsetDateTime::now_utc();
        let mut violations = Vec::new();

        violations.extend(self.check_subscription_has_history().await?);
        violations.extend(self.check_canceled_has_timestamp().await?);
        violations.extend(self.check_invoice_amount_remaining().await?);
        violations.extend(self.check_refund_totals_within_charge().await?);

        let checks_run = 4;
        let checks_failed = violations
            .iter()
            .map(|v| &v.invariant)
            .collect::<std::collections::HashSet<_>>()
            .len();
        let checks_passed = checks_run - checks_failed;

        Ok(InvariantCheckSummary {
            checked_at: now,
            checks_run,
            checks_passed,
            checks_failed,
            healthy: violations.is_empty(),
            violations,
        })
    }

    /// Invariant 1: every subscription has at least one history row
    ///
    /// The subscription upsert and the history append commit as one unit, so
    /// a subscription with no audit trail means that unit was violated.
    async fn check_subscription_has_history(&self) -> ReconcileResult<Vec<InvariantViolation>> {
        let rows: Vec<MissingHistoryRow> = sqlx::query_as(
            r#"
            SELECT s.id as sub_id, s.customer_id, s.external_id, s.status
            FROM subscriptions s
            WHERE NOT EXISTS (
                SELECT 1 FROM subscription_history h
                WHERE h.subscription_id = s.id
            )
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|row| InvariantViolation {
                invariant: "subscription_has_history".to_string(),
                customer_ids: vec![row.customer_id],
                description: format!(
                    "Subscription {} has no audit history rows",
                    row.external_id
                ),
                context: serde_json::json!({
                    "subscription_id": row.sub_id,
                    "status": row.status,
                }),
                severity: ViolationSeverity::High,
            })
            .collect())
    }

    /// Invariant 2: canceled subscriptions carry a cancellation timestamp
    async fn check_canceled_has_timestamp(&self) -> ReconcileResult<Vec<InvariantViolation>> {
        let rows: Vec<CanceledNoTimestampRow> = sqlx::query_as(
            r#"
            SELECT s.id as sub_id, s.customer_id, s.external_id
            FROM subscriptions s
            WHERE s.status = 'canceled'
              AND s.canceled_at IS NULL
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|row| InvariantViolation {
                invariant: "canceled_has_timestamp".to_string(),
                customer_ids: vec![row.customer_id],
                description: format!(
                    "Canceled subscription {} has no canceled_at timestamp",
                    row.external_id
                ),
                context: serde_json::json!({
                    "subscription_id": row.sub_id,
                }),
                severity: ViolationSeverity::High,
            })
            .collect())
    }

    /// Invariant 3: invoice amount_remaining matches its derivation
    ///
    /// `amount_remaining` must always equal `amount_due - amount_paid`
    /// (clamped to 0 for paid invoices).
    async fn check_invoice_amount_remaining(&self) -> ReconcileResult<Vec<InvariantViolation>> {
        let rows: Vec<RemainingMismatchRow> = sqlx::query_as(
            r#"
            SELECT i.id as invoice_id, i.customer_id, i.external_id,
                   i.amount_due, i.amount_paid, i.amount_remaining
            FROM invoices i
            WHERE i.amount_remaining != (i.amount_due - i.amount_paid)
              AND NOT (i.status = 'paid' AND i.amount_remaining = 0)
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|row| InvariantViolation {
                invariant: "invoice_amount_remaining".to_string(),
                customer_ids: vec![row.customer_id],
                description: format!(
                    "Invoice {} has amount_remaining {} but amount_due {} - amount_paid {} = {}",
                    row.external_id,
                    row.amount_remaining,
                    row.amount_due,
                    row.amount_paid,
                    row.amount_due - row.amount_paid
                ),
                context: serde_json::json!({
                    "invoice_id": row.invoice_id,
                    "amount_due": row.amount_due,
                    "amount_paid": row.amount_paid,
                    "amount_remaining": row.amount_remaining,
                }),
                severity: ViolationSeverity::Critical,
            })
            .collect())
    }

    /// Invariant 4: per-charge refund rows never exceed the charge's refunded
    /// amount
    async fn check_refund_totals_within_charge(&self) -> ReconcileResult<Vec<InvariantViolation>> {
        let rows: Vec<RefundOverflowRow> = sqlx::query_as(
            r#"
            SELECT c.id as charge_id, c.customer_id, c.external_id,
                   c.amount_refunded, COALESCE(SUM(r.amount), 0)::BIGINT as refund_total
            FROM charges c
            JOIN refunds r ON r.charge_id = c.id
            GROUP BY c.id, c.customer_id, c.external_id, c.amount_refunded
            HAVING COALESCE(SUM(r.amount), 0) > c.amount_refunded
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|row| InvariantViolation {
                invariant: "refund_totals_within_charge".to_string(),
                customer_ids: vec![row.customer_id],
                description: format!(
                    "Charge {} has refund rows totaling {} but amount_refunded is {}",
                    row.external_id, row.refund_total, row.amount_refunded
                ),
                context: serde_json::json!({
                    "charge_id": row.charge_id,
                    "amount_refunded": row.amount_refunded,
                    "refund_total": row.refund_total,
                }),
                severity: ViolationSeverity::Medium,
            })
            .collect())
    }

    /// Run a single invariant check by name
    pub async fn run_check(&self, name: &str) -> ReconcileResult<Vec<InvariantViolation>> {
        match name {
            "subscription_has_history" => self.check_subscription_has_history().await,
            "canceled_has_timestamp" => self.check_canceled_has_timestamp().await,
            "invoice_amount_remaining" => self.check_invoice_amount_remaining().await,
            "refund_totals_within_charge" => self.check_refund_totals_within_charge().await,
            _ => Ok(vec![]),
        }
    }

    /// Get list of all available invariant checks
    pub fn available_checks() -> Vec<&'static str> {
        vec![
            "subscription_has_history",
            "canceled_has_timestamp",
            "invoice_amount_remaining",
            "refund_totals_within_charge",
        ]
    }
}
