// Test file - these are expected patterns in test code
#![allow(clippy::unwrap_used)]
#![allow(clippy::expect_used)]

//! Edge Case Tests for the Reconciliation Engine
//!
//! Boundary conditions that cut across modules:
//! - envelope verification at the tolerance window edges
//! - payload validation with hostile or degenerate shapes
//! - MRR delta arithmetic across interval switches
//! - alert rule output details

#[cfg(test)]
mod envelope_edge_tests {
    use crate::envelope::{EventEnvelope, SignatureVerifier};

    fn unix_now() -> i64 {
        std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .unwrap()
            .as_secs() as i64
    }

    #[test]
    fn test_unknown_header_keys_ignored() {
        let verifier = SignatureVerifier::new("secret");
        let header = verifier.sign(b"body", unix_now()).unwrap();

        let with_extras = format!("v0=legacy,{},scheme=hmac", header);
        assert!(verifier.verify(b"body", &with_extras).is_ok());
    }

    #[test]
    fn test_garbage_timestamp_rejected() {
        let verifier = SignatureVerifier::new("secret");
        let header = verifier.sign(b"body", unix_now()).unwrap();
        let sig_value = header.split("v1=").nth(1).unwrap().to_string();

        let garbled = format!("t=notanumber,v1={}", sig_value);
        assert!(verifier.verify(b"body", &garbled).is_err());
    }

    #[test]
    fn test_envelope_tolerates_extra_fields() {
        let body = br#"{
            "type": "invoice.paid",
            "external_event_id": "evt_9",
            "payload": {},
            "api_version": "2024-06-20",
            "livemode": false
        }"#;

        let envelope = EventEnvelope::from_slice(body).unwrap();
        assert_eq!(envelope.external_event_id, "evt_9");
    }

    #[test]
    fn test_envelope_rejects_non_object() {
        assert!(EventEnvelope::from_slice(b"[1,2,3]").is_err());
        assert!(EventEnvelope::from_slice(b"not json at all").is_err());
    }
}

#[cfg(test)]
mod payload_edge_tests {
    use crate::event::EventPayload;
    use serde_json::json;

    #[test]
    fn test_zero_amount_invoice() {
        // Trial-period invoices legitimately bill zero.
        let payload = json!({
            "id": "in_trial",
            "customer": "cus_1",
            "amount_due": 0,
            "currency": "usd"
        });

        match EventPayload::parse("invoice.paid", &payload).unwrap() {
            EventPayload::InvoicePaid(inv) => {
                assert_eq!(inv.amount_remaining(), 0);
                assert_eq!(inv.discount_total(), None);
            }
            other => panic!("unexpected variant: {:?}", other),
        }
    }

    #[test]
    fn test_overpaid_invoice_negative_remaining() {
        // amount_paid above amount_due (credit applied) yields a negative
        // remaining balance; the derivation is preserved, not clamped.
        let payload = json!({
            "id": "in_credit",
            "customer": "cus_1",
            "amount_due": 1000,
            "amount_paid": 1500,
            "currency": "usd"
        });

        match EventPayload::parse("invoice.created", &payload).unwrap() {
            EventPayload::InvoiceCreated(inv) => assert_eq!(inv.amount_remaining(), -500),
            other => panic!("unexpected variant: {:?}", other),
        }
    }

    #[test]
    fn test_payload_extra_fields_ignored() {
        let payload = json!({
            "id": "pa_1",
            "customer": "cus_1",
            "amount": 2900,
            "currency": "usd",
            "status": "succeeded",
            "some_new_processor_field": {"nested": true}
        });

        assert!(EventPayload::parse("payment_attempt.succeeded", &payload).is_ok());
    }

    #[test]
    fn test_payment_error_with_partial_detail() {
        let payload = json!({
            "id": "pa_2",
            "customer": "cus_1",
            "amount": 2900,
            "currency": "usd",
            "status": "requires_payment_method",
            "last_error": {"code": "card_declined"}
        });

        match EventPayload::parse("payment_attempt.failed", &payload).unwrap() {
            EventPayload::PaymentAttemptFailed(p) => {
                let err = p.last_error.unwrap();
                assert_eq!(err.code.as_deref(), Some("card_declined"));
                assert!(err.message.is_none());
            }
            other => panic!("unexpected variant: {:?}", other),
        }
    }

    #[test]
    fn test_charge_refunded_with_empty_refund_list() {
        // The processor can emit charge.refunded with the refund list
        // filtered out; the charge still upserts, no refund rows fan out.
        let payload = json!({
            "id": "ch_1",
            "customer": "cus_1",
            "amount": 5000,
            "amount_refunded": 5000,
            "currency": "usd",
            "status": "succeeded",
            "refunded": true
        });

        match EventPayload::parse("charge.refunded", &payload).unwrap() {
            EventPayload::ChargeRefunded(c) => assert!(c.refunds.is_empty()),
            other => panic!("unexpected variant: {:?}", other),
        }
    }

    #[test]
    fn test_wrong_type_for_amount_is_invalid() {
        let payload = json!({
            "id": "in_1",
            "customer": "cus_1",
            "amount_due": "5000",
            "currency": "usd"
        });

        assert!(EventPayload::parse("invoice.created", &payload).is_err());
    }
}

#[cfg(test)]
mod mrr_edge_tests {
    use crate::event::{BillingInterval, SubscriptionStatus};
    use crate::history::{mrr_contribution, mrr_delta, monthly_rate};
    use crate::resolver::ResolvedPlan;
    use uuid::Uuid;

    fn plan(monthly: i64, annual: Option<i64>) -> ResolvedPlan {
        ResolvedPlan {
            id: Uuid::new_v4(),
            code: "test".to_string(),
            monthly_price_cents: monthly,
            annual_price_cents: annual,
        }
    }

    #[test]
    fn test_interval_switch_same_plan() {
        // Monthly 29.00 -> annual 290.00/yr: MRR drops from 2900 to 2416
        // (annual divides with truncation).
        let p = plan(2900, Some(29_000));
        let delta = mrr_delta(
            Some((
                SubscriptionStatus::Active,
                &p,
                Some(BillingInterval::Month),
            )),
            (SubscriptionStatus::Active, &p, Some(BillingInterval::Year)),
        );
        assert_eq!(delta, 2416 - 2900);
    }

    #[test]
    fn test_annual_truncates_not_rounds() {
        let p = plan(0, Some(100));
        assert_eq!(monthly_rate(&p, Some(BillingInterval::Year)), 8);
    }

    #[test]
    fn test_free_plan_contributes_zero() {
        let p = plan(0, None);
        assert_eq!(
            mrr_contribution(SubscriptionStatus::Active, &p, None),
            0
        );
    }

    #[test]
    fn test_canceled_to_canceled_zero_delta() {
        let p = plan(2900, None);
        let delta = mrr_delta(
            Some((SubscriptionStatus::Canceled, &p, None)),
            (SubscriptionStatus::Canceled, &p, None),
        );
        assert_eq!(delta, 0);
    }

    #[test]
    fn test_reactivation_restores_full_rate() {
        let p = plan(2900, None);
        let delta = mrr_delta(
            Some((SubscriptionStatus::Canceled, &p, None)),
            (SubscriptionStatus::Active, &p, None),
        );
        assert_eq!(delta, 2900);
    }
}

#[cfg(test)]
mod alert_edge_tests {
    use crate::alerts::{evaluate_invoice_payment_failed, AlertSeverity};
    use crate::invoices::InvoiceApplied;
    use crate::resolver::ResolvedCustomer;
    use serde_json::json;
    use uuid::Uuid;

    #[test]
    fn test_invoice_alert_prefers_document_number() {
        let applied = InvoiceApplied {
            invoice_id: Uuid::new_v4(),
            customer: ResolvedCustomer {
                id: Uuid::new_v4(),
                external_id: "cus_1".to_string(),
                email: None,
                display_name: None,
            },
            subscription_id: None,
            subscription_external_id: None,
        };
        let payload = serde_json::from_value(json!({
            "id": "in_1",
            "customer": "cus_1",
            "number": "CD-2026-0042",
            "amount_due": 129_900,
            "currency": "usd",
            "attempt_count": 4
        }))
        .unwrap();

        let alert = evaluate_invoice_payment_failed(&applied, &payload);
        assert!(alert.message.contains("CD-2026-0042"));
        assert!(alert.message.contains("1299.00 USD"));
        assert_eq!(alert.severity, AlertSeverity::High);
        // Repeated failures are not deduplicated; every evaluation yields a
        // fresh alert with the current attempt count.
        assert_eq!(alert.metadata["attempt_count"], 4);
    }
}
