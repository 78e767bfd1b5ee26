//! Inbound event payload model
//!
//! Every event type the engine handles has a concrete payload struct, and the
//! set of handled types is a closed union. Payloads are validated here, at
//! the dispatcher boundary; reconcilers never touch untyped JSON. An unknown
//! event type parses to [`EventPayload::Unknown`] and is acknowledged without
//! processing, while a known type with a malformed payload is a hard error.

use serde::{Deserialize, Serialize};

use crate::error::{ReconcileError, ReconcileResult};

/// Subscription lifecycle status as reported by the payment processor.
///
/// The local store mirrors the processor's state rather than gatekeeping it:
/// any observed transition is recorded, including ones a strict state machine
/// would reject, because the processor is the source of truth.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SubscriptionStatus {
    Trialing,
    Active,
    PastDue,
    Canceled,
}

impl SubscriptionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SubscriptionStatus::Trialing => "trialing",
            SubscriptionStatus::Active => "active",
            SubscriptionStatus::PastDue => "past_due",
            SubscriptionStatus::Canceled => "canceled",
        }
    }

    /// Parse a stored status string back into the enum.
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "trialing" => Some(SubscriptionStatus::Trialing),
            "active" => Some(SubscriptionStatus::Active),
            "past_due" => Some(SubscriptionStatus::PastDue),
            "canceled" => Some(SubscriptionStatus::Canceled),
            _ => None,
        }
    }
}

impl std::fmt::Display for SubscriptionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Billing interval of a subscription's plan.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BillingInterval {
    Month,
    Year,
}

impl BillingInterval {
    pub fn as_str(&self) -> &'static str {
        match self {
            BillingInterval::Month => "month",
            BillingInterval::Year => "year",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "month" => Some(BillingInterval::Month),
            "year" => Some(BillingInterval::Year),
            _ => None,
        }
    }
}

/// Invoice document status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InvoiceStatus {
    Draft,
    Open,
    Paid,
    Uncollectible,
    Void,
}

impl InvoiceStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            InvoiceStatus::Draft => "draft",
            InvoiceStatus::Open => "open",
            InvoiceStatus::Paid => "paid",
            InvoiceStatus::Uncollectible => "uncollectible",
            InvoiceStatus::Void => "void",
        }
    }
}

/// Subscription event payload (`subscription.updated`, `subscription.canceled`).
#[derive(Debug, Clone, Deserialize)]
pub struct SubscriptionPayload {
    /// External subscription identifier (upsert conflict key).
    pub id: String,
    /// External customer reference.
    pub customer: String,
    /// Plan code on the platform's plan catalog.
    pub plan: String,
    pub status: SubscriptionStatus,
    #[serde(default)]
    pub billing_interval: Option<BillingInterval>,
    /// Unix seconds.
    #[serde(default)]
    pub current_period_start: Option<i64>,
    #[serde(default)]
    pub current_period_end: Option<i64>,
    #[serde(default)]
    pub cancel_at_period_end: bool,
    #[serde(default)]
    pub canceled_at: Option<i64>,
}

/// An itemized discount on an invoice.
#[derive(Debug, Clone, Deserialize)]
pub struct DiscountLine {
    pub amount: i64,
}

/// Invoice event payload (`invoice.created`, `invoice.paid`,
/// `invoice.payment_failed`).
#[derive(Debug, Clone, Deserialize)]
pub struct InvoicePayload {
    pub id: String,
    pub customer: String,
    #[serde(default)]
    pub subscription: Option<String>,
    /// Cents.
    pub amount_due: i64,
    #[serde(default)]
    pub amount_paid: i64,
    pub currency: String,
    #[serde(default)]
    pub status: Option<InvoiceStatus>,
    #[serde(default)]
    pub number: Option<String>,
    #[serde(default)]
    pub hosted_invoice_url: Option<String>,
    #[serde(default)]
    pub invoice_pdf_url: Option<String>,
    #[serde(default)]
    pub period_start: Option<i64>,
    #[serde(default)]
    pub period_end: Option<i64>,
    #[serde(default)]
    pub subtotal: Option<i64>,
    #[serde(default)]
    pub total: Option<i64>,
    #[serde(default)]
    pub tax: Option<i64>,
    #[serde(default)]
    pub discounts: Vec<DiscountLine>,
    #[serde(default)]
    pub attempt_count: i32,
    #[serde(default)]
    pub next_payment_attempt: Option<i64>,
}

impl InvoicePayload {
    /// What the customer still owes on this document.
    pub fn amount_remaining(&self) -> i64 {
        self.amount_due - self.amount_paid
    }

    /// Sum of itemized discounts, `None` when the payload carried none.
    pub fn discount_total(&self) -> Option<i64> {
        if self.discounts.is_empty() {
            None
        } else {
            Some(self.discounts.iter().map(|d| d.amount).sum())
        }
    }
}

/// Error detail on a failed payment attempt.
#[derive(Debug, Clone, Deserialize)]
pub struct PaymentErrorDetail {
    #[serde(default)]
    pub code: Option<String>,
    #[serde(default)]
    pub message: Option<String>,
}

/// Payment attempt payload (`payment_attempt.succeeded`,
/// `payment_attempt.failed`).
#[derive(Debug, Clone, Deserialize)]
pub struct PaymentAttemptPayload {
    pub id: String,
    pub customer: String,
    #[serde(default)]
    pub invoice: Option<String>,
    #[serde(default)]
    pub subscription: Option<String>,
    pub amount: i64,
    pub currency: String,
    pub status: String,
    #[serde(default)]
    pub capture_method: Option<String>,
    #[serde(default)]
    pub confirmation_method: Option<String>,
    #[serde(default)]
    pub last_error: Option<PaymentErrorDetail>,
}

/// Payment-method summary embedded in a charge.
#[derive(Debug, Clone, Deserialize)]
pub struct PaymentMethodSummary {
    #[serde(default)]
    pub fingerprint: Option<String>,
    #[serde(default)]
    pub brand: Option<String>,
    #[serde(default)]
    pub last4: Option<String>,
}

/// Settlement breakdown embedded in a charge once funds clear.
#[derive(Debug, Clone, Deserialize)]
pub struct SettlementDetail {
    #[serde(default)]
    pub fee: Option<i64>,
    #[serde(default)]
    pub net: Option<i64>,
}

/// A discrete refund object nested inside a `charge.refunded` event. One
/// event may carry several of these (partial refunds), each becoming its own
/// canonical refund row.
#[derive(Debug, Clone, Deserialize)]
pub struct RefundPayload {
    pub id: String,
    pub amount: i64,
    pub currency: String,
    #[serde(default = "default_refund_status")]
    pub status: String,
    #[serde(default)]
    pub reason: Option<String>,
}

fn default_refund_status() -> String {
    "succeeded".to_string()
}

/// Charge payload (`charge.succeeded`, `charge.refunded`).
#[derive(Debug, Clone, Deserialize)]
pub struct ChargePayload {
    pub id: String,
    pub customer: String,
    #[serde(default)]
    pub invoice: Option<String>,
    #[serde(default)]
    pub payment_attempt: Option<String>,
    pub amount: i64,
    #[serde(default)]
    pub amount_captured: i64,
    #[serde(default)]
    pub amount_refunded: i64,
    pub currency: String,
    pub status: String,
    #[serde(default)]
    pub paid: bool,
    #[serde(default)]
    pub refunded: bool,
    #[serde(default)]
    pub captured: bool,
    #[serde(default)]
    pub payment_method: Option<PaymentMethodSummary>,
    #[serde(default)]
    pub settlement: Option<SettlementDetail>,
    #[serde(default)]
    pub refunds: Vec<RefundPayload>,
}

/// The closed union of event types the engine reconciles.
#[derive(Debug, Clone)]
pub enum EventPayload {
    SubscriptionUpdated(SubscriptionPayload),
    SubscriptionCanceled(SubscriptionPayload),
    InvoiceCreated(InvoicePayload),
    InvoicePaid(InvoicePayload),
    InvoicePaymentFailed(InvoicePayload),
    PaymentAttemptSucceeded(PaymentAttemptPayload),
    PaymentAttemptFailed(PaymentAttemptPayload),
    ChargeSucceeded(ChargePayload),
    ChargeRefunded(ChargePayload),
    /// Event type with no registered reconciler. Acknowledged, never
    /// processed.
    Unknown,
}

fn deserialize<T: serde::de::DeserializeOwned>(
    event_type: &str,
    payload: &serde_json::Value,
) -> ReconcileResult<T> {
    serde_json::from_value(payload.clone()).map_err(|e| ReconcileError::InvalidPayload {
        event_type: event_type.to_string(),
        source: e,
    })
}

impl EventPayload {
    /// Validate an untyped payload into the closed union.
    pub fn parse(event_type: &str, payload: &serde_json::Value) -> ReconcileResult<Self> {
        let parsed = match event_type {
            "subscription.updated" => {
                EventPayload::SubscriptionUpdated(deserialize(event_type, payload)?)
            }
            "subscription.canceled" => {
                EventPayload::SubscriptionCanceled(deserialize(event_type, payload)?)
            }
            "invoice.created" => EventPayload::InvoiceCreated(deserialize(event_type, payload)?),
            "invoice.paid" => EventPayload::InvoicePaid(deserialize(event_type, payload)?),
            "invoice.payment_failed" => {
                EventPayload::InvoicePaymentFailed(deserialize(event_type, payload)?)
            }
            "payment_attempt.succeeded" => {
                EventPayload::PaymentAttemptSucceeded(deserialize(event_type, payload)?)
            }
            "payment_attempt.failed" => {
                EventPayload::PaymentAttemptFailed(deserialize(event_type, payload)?)
            }
            "charge.succeeded" => EventPayload::ChargeSucceeded(deserialize(event_type, payload)?),
            "charge.refunded" => EventPayload::ChargeRefunded(deserialize(event_type, payload)?),
            _ => EventPayload::Unknown,
        };

        Ok(parsed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_parse_invoice_payment_failed() {
        let payload = json!({
            "id": "in_1",
            "customer": "cus_1",
            "amount_due": 5000,
            "currency": "usd",
            "attempt_count": 2
        });

        let parsed = EventPayload::parse("invoice.payment_failed", &payload).unwrap();
        match parsed {
            EventPayload::InvoicePaymentFailed(inv) => {
                assert_eq!(inv.customer, "cus_1");
                assert_eq!(inv.amount_due, 5000);
                assert_eq!(inv.amount_paid, 0);
                assert_eq!(inv.amount_remaining(), 5000);
                assert_eq!(inv.attempt_count, 2);
                assert!(inv.subscription.is_none());
            }
            other => panic!("unexpected variant: {:?}", other),
        }
    }

    #[test]
    fn test_parse_unknown_type() {
        let parsed = EventPayload::parse("price.updated", &json!({"anything": true})).unwrap();
        assert!(matches!(parsed, EventPayload::Unknown));
    }

    #[test]
    fn test_parse_known_type_malformed_payload() {
        // invoice.paid without required fields must fail validation, not fall
        // through to Unknown
        let result = EventPayload::parse("invoice.paid", &json!({"id": "in_1"}));
        assert!(matches!(
            result,
            Err(ReconcileError::InvalidPayload { ref event_type, .. }) if event_type == "invoice.paid"
        ));
    }

    #[test]
    fn test_parse_subscription_with_period_bounds() {
        let payload = json!({
            "id": "sub_1",
            "customer": "cus_1",
            "plan": "pro",
            "status": "past_due",
            "billing_interval": "year",
            "current_period_start": 1_700_000_000,
            "current_period_end": 1_731_536_000
        });

        let parsed = EventPayload::parse("subscription.updated", &payload).unwrap();
        match parsed {
            EventPayload::SubscriptionUpdated(sub) => {
                assert_eq!(sub.status, SubscriptionStatus::PastDue);
                assert_eq!(sub.billing_interval, Some(BillingInterval::Year));
                assert!(!sub.cancel_at_period_end);
                assert!(sub.canceled_at.is_none());
            }
            other => panic!("unexpected variant: {:?}", other),
        }
    }

    #[test]
    fn test_discount_total() {
        let payload = json!({
            "id": "in_2",
            "customer": "cus_1",
            "amount_due": 10000,
            "amount_paid": 2500,
            "currency": "usd",
            "discounts": [{"amount": 500}, {"amount": 250}]
        });

        let parsed = EventPayload::parse("invoice.created", &payload).unwrap();
        match parsed {
            EventPayload::InvoiceCreated(inv) => {
                assert_eq!(inv.discount_total(), Some(750));
                assert_eq!(inv.amount_remaining(), 7500);
            }
            other => panic!("unexpected variant: {:?}", other),
        }
    }

    #[test]
    fn test_charge_refunded_fan_out_payloads() {
        let payload = json!({
            "id": "ch_1",
            "customer": "cus_1",
            "amount": 5000,
            "amount_refunded": 5000,
            "currency": "usd",
            "status": "succeeded",
            "refunded": true,
            "refunds": [
                {"id": "re_1", "amount": 3000, "currency": "usd", "reason": "requested_by_customer"},
                {"id": "re_2", "amount": 2000, "currency": "usd"}
            ]
        });

        let parsed = EventPayload::parse("charge.refunded", &payload).unwrap();
        match parsed {
            EventPayload::ChargeRefunded(charge) => {
                assert_eq!(charge.refunds.len(), 2);
                assert_eq!(charge.refunds[0].reason.as_deref(), Some("requested_by_customer"));
                // Status defaults to succeeded when omitted
                assert_eq!(charge.refunds[1].status, "succeeded");
            }
            other => panic!("unexpected variant: {:?}", other),
        }
    }

    #[test]
    fn test_settlement_optional() {
        let payload = json!({
            "id": "ch_2",
            "customer": "cus_1",
            "amount": 900,
            "currency": "eur",
            "status": "succeeded",
            "settlement": {"fee": 57, "net": 843}
        });

        let parsed = EventPayload::parse("charge.succeeded", &payload).unwrap();
        match parsed {
            EventPayload::ChargeSucceeded(charge) => {
                let settlement = charge.settlement.unwrap();
                assert_eq!(settlement.fee, Some(57));
                assert_eq!(settlement.net, Some(843));
            }
            other => panic!("unexpected variant: {:?}", other),
        }
    }

    #[test]
    fn test_status_round_trip() {
        for (status, s) in [
            (SubscriptionStatus::Trialing, "trialing"),
            (SubscriptionStatus::Active, "active"),
            (SubscriptionStatus::PastDue, "past_due"),
            (SubscriptionStatus::Canceled, "canceled"),
        ] {
            assert_eq!(status.as_str(), s);
            let parsed: SubscriptionStatus =
                serde_json::from_value(serde_json::Value::String(s.to_string())).unwrap();
            assert_eq!(parsed, status);
        }
    }
}
