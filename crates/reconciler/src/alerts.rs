//! Alert rule engine
//!
//! Evaluates reconciliation outcomes against a fixed rule set and creates at
//! most one operator-facing alert per outcome. Alerts are insert-only from
//! this engine; resolution is an operator action elsewhere in the platform.
//!
//! There is deliberately no deduplication window: repeated failures on the
//! same invoice each create a new alert. Collapsing repeats into one
//! escalating alert is an open design question recorded in DESIGN.md.

use serde::Serialize;
use sqlx::PgPool;
use uuid::Uuid;

use crate::charges::ChargeApplied;
use crate::error::ReconcileResult;
use crate::event::{ChargePayload, InvoicePayload, PaymentAttemptPayload};
use crate::invoices::InvoiceApplied;
use crate::payments::PaymentApplied;

/// Operator-facing alert categories.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AlertType {
    PaymentFailed,
    RefundProcessed,
}

impl AlertType {
    pub fn as_str(&self) -> &'static str {
        match self {
            AlertType::PaymentFailed => "payment_failed",
            AlertType::RefundProcessed => "refund_processed",
        }
    }
}

/// Alert severity, ordered from informational to page-someone.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AlertSeverity {
    Low,
    Medium,
    High,
    Critical,
}

impl AlertSeverity {
    pub fn as_str(&self) -> &'static str {
        match self {
            AlertSeverity::Low => "low",
            AlertSeverity::Medium => "medium",
            AlertSeverity::High => "high",
            AlertSeverity::Critical => "critical",
        }
    }
}

impl std::fmt::Display for AlertSeverity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// An alert awaiting insert.
#[derive(Debug, Clone)]
pub struct NewAlert {
    pub alert_type: AlertType,
    pub severity: AlertSeverity,
    pub title: String,
    pub message: String,
    pub metadata: serde_json::Value,
    pub customer_id: Uuid,
    pub subscription_id: Option<Uuid>,
    pub invoice_id: Option<Uuid>,
    pub payment_attempt_id: Option<Uuid>,
}

fn format_amount(cents: i64, currency: &str) -> String {
    format!("{:.2} {}", cents as f64 / 100.0, currency.to_uppercase())
}

/// Rule: a payment attempt reconciled with a populated error always raises a
/// high-severity `payment_failed` alert. A clean attempt raises nothing.
pub fn evaluate_payment_attempt(
    applied: &PaymentApplied,
    payload: &PaymentAttemptPayload,
) -> Option<NewAlert> {
    if !applied.has_error() {
        return None;
    }

    let message = match &applied.error_message {
        Some(detail) => format!("Payment failed: {}", detail),
        None => "Payment attempt failed. Please update your payment method.".to_string(),
    };

    Some(NewAlert {
        alert_type: AlertType::PaymentFailed,
        severity: AlertSeverity::High,
        title: "Payment Attempt Failed".to_string(),
        message,
        metadata: serde_json::json!({
            "payment_attempt_id": payload.id,
            "amount": payload.amount,
            "currency": payload.currency,
            "error_code": applied.error_code,
            "error_message": applied.error_message,
        }),
        customer_id: applied.customer.id,
        subscription_id: applied.subscription_id,
        invoice_id: applied.invoice_id,
        payment_attempt_id: Some(applied.payment_attempt_id),
    })
}

/// Rule: an `invoice.payment_failed` event raises a high-severity
/// `payment_failed` alert carrying the amount and attempt count.
pub fn evaluate_invoice_payment_failed(
    applied: &InvoiceApplied,
    payload: &InvoicePayload,
) -> NewAlert {
    let document = payload.number.as_deref().unwrap_or(&payload.id);

    NewAlert {
        alert_type: AlertType::PaymentFailed,
        severity: AlertSeverity::High,
        title: "Payment Failed".to_string(),
        message: format!(
            "Payment failed for invoice {}. Amount due: {}",
            document,
            format_amount(payload.amount_due, &payload.currency)
        ),
        metadata: serde_json::json!({
            "invoice_id": payload.id,
            "amount_due": payload.amount_due,
            "currency": payload.currency,
            "attempt_count": payload.attempt_count,
            "next_payment_attempt": payload.next_payment_attempt,
        }),
        customer_id: applied.customer.id,
        subscription_id: applied.subscription_id,
        invoice_id: Some(applied.invoice_id),
        payment_attempt_id: None,
    }
}

/// Rule: a refunded charge raises a medium-severity `refund_processed` alert.
pub fn evaluate_charge_refunded(applied: &ChargeApplied, payload: &ChargePayload) -> NewAlert {
    NewAlert {
        alert_type: AlertType::RefundProcessed,
        severity: AlertSeverity::Medium,
        title: "Refund Processed".to_string(),
        message: format!(
            "A refund of {} has been processed for charge {}",
            format_amount(payload.amount_refunded, &payload.currency),
            payload.id
        ),
        metadata: serde_json::json!({
            "charge_id": payload.id,
            "amount_refunded": payload.amount_refunded,
            "currency": payload.currency,
            "refund_count": payload.refunds.len(),
        }),
        customer_id: applied.customer.id,
        subscription_id: None,
        invoice_id: applied.invoice_id,
        payment_attempt_id: None,
    }
}

/// Writes evaluated alerts. Failure here never rolls back the reconciliation
/// that produced the alert; the dispatcher logs and moves on.
pub struct AlertEngine {
    pool: PgPool,
}

impl AlertEngine {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn record(&self, alert: &NewAlert) -> ReconcileResult<Uuid> {
        let (alert_id,): (Uuid,) = sqlx::query_as(
            r#"
            INSERT INTO billing_alerts (
                customer_id, subscription_id, invoice_id, payment_attempt_id,
                alert_type, severity, title, message, metadata, is_resolved
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, FALSE)
            RETURNING id
            "#,
        )
        .bind(alert.customer_id)
        .bind(alert.subscription_id)
        .bind(alert.invoice_id)
        .bind(alert.payment_attempt_id)
        .bind(alert.alert_type.as_str())
        .bind(alert.severity.as_str())
        .bind(&alert.title)
        .bind(&alert.message)
        .bind(&alert.metadata)
        .fetch_one(&self.pool)
        .await?;

        tracing::info!(
            alert_id = %alert_id,
            alert_type = %alert.alert_type.as_str(),
            severity = %alert.severity,
            customer_id = %alert.customer_id,
            "Billing alert created"
        );

        Ok(alert_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::resolver::ResolvedCustomer;
    use serde_json::json;

    fn customer() -> ResolvedCustomer {
        ResolvedCustomer {
            id: Uuid::new_v4(),
            external_id: "cus_1".to_string(),
            email: None,
            display_name: None,
        }
    }

    fn payment_applied(code: Option<&str>, message: Option<&str>) -> PaymentApplied {
        PaymentApplied {
            payment_attempt_id: Uuid::new_v4(),
            customer: customer(),
            invoice_id: None,
            invoice_external_id: None,
            subscription_id: None,
            error_code: code.map(String::from),
            error_message: message.map(String::from),
        }
    }

    fn payment_payload() -> PaymentAttemptPayload {
        serde_json::from_value(json!({
            "id": "pa_1",
            "customer": "cus_1",
            "amount": 2900,
            "currency": "usd",
            "status": "requires_payment_method"
        }))
        .unwrap()
    }

    #[test]
    fn test_clean_payment_attempt_raises_nothing() {
        let alert = evaluate_payment_attempt(&payment_applied(None, None), &payment_payload());
        assert!(alert.is_none());
    }

    #[test]
    fn test_failed_payment_attempt_raises_high_alert() {
        let applied = payment_applied(Some("card_declined"), Some("Your card was declined."));
        let alert = evaluate_payment_attempt(&applied, &payment_payload()).unwrap();

        assert_eq!(alert.alert_type, AlertType::PaymentFailed);
        assert_eq!(alert.severity, AlertSeverity::High);
        assert!(alert.message.contains("Your card was declined."));
        assert_eq!(alert.metadata["error_code"], "card_declined");
        assert_eq!(alert.payment_attempt_id, Some(applied.payment_attempt_id));
    }

    #[test]
    fn test_failed_attempt_without_message_uses_generic_text() {
        let applied = payment_applied(Some("processing_error"), None);
        let alert = evaluate_payment_attempt(&applied, &payment_payload()).unwrap();
        assert!(alert.message.contains("update your payment method"));
    }

    #[test]
    fn test_invoice_payment_failed_alert() {
        let applied = InvoiceApplied {
            invoice_id: Uuid::new_v4(),
            customer: customer(),
            subscription_id: None,
            subscription_external_id: None,
        };
        let payload: InvoicePayload = serde_json::from_value(json!({
            "id": "in_1",
            "customer": "cus_1",
            "amount_due": 5000,
            "currency": "usd",
            "attempt_count": 2
        }))
        .unwrap();

        let alert = evaluate_invoice_payment_failed(&applied, &payload);
        assert_eq!(alert.alert_type, AlertType::PaymentFailed);
        assert_eq!(alert.severity, AlertSeverity::High);
        assert!(alert.message.contains("in_1"));
        assert!(alert.message.contains("50.00 USD"));
        assert_eq!(alert.metadata["amount_due"], 5000);
        assert_eq!(alert.metadata["attempt_count"], 2);
        assert_eq!(alert.invoice_id, Some(applied.invoice_id));
    }

    #[test]
    fn test_charge_refunded_alert() {
        let applied = ChargeApplied {
            charge_id: Uuid::new_v4(),
            customer: customer(),
            invoice_id: None,
            invoice_external_id: None,
        };
        let payload: ChargePayload = serde_json::from_value(json!({
            "id": "ch_1",
            "customer": "cus_1",
            "amount": 5000,
            "amount_refunded": 3000,
            "currency": "eur",
            "status": "succeeded",
            "refunded": true,
            "refunds": [{"id": "re_1", "amount": 3000, "currency": "eur"}]
        }))
        .unwrap();

        let alert = evaluate_charge_refunded(&applied, &payload);
        assert_eq!(alert.alert_type, AlertType::RefundProcessed);
        assert_eq!(alert.severity, AlertSeverity::Medium);
        assert!(alert.message.contains("30.00 EUR"));
        assert_eq!(alert.metadata["refund_count"], 1);
    }

    #[test]
    fn test_severity_ordering() {
        assert!(AlertSeverity::Critical > AlertSeverity::High);
        assert!(AlertSeverity::High > AlertSeverity::Medium);
        assert!(AlertSeverity::Medium > AlertSeverity::Low);
    }
}
