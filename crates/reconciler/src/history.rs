//! Subscription history recorder
//!
//! Provides the append-only audit trail of subscription state changes.
//! Every observed status or plan change produces exactly one history row,
//! written in the same transaction as the subscription upsert, so a status
//! update can never persist without its audit record.
//!
//! The MRR/ARR delta is computed once from the plan catalog at record time
//! and stored immutably; later price changes do not rewrite history.

use serde::Serialize;
use sqlx::PgConnection;
use uuid::Uuid;

use crate::error::ReconcileResult;
use crate::event::{BillingInterval, SubscriptionStatus};
use crate::resolver::ResolvedPlan;

/// What kind of change a history row records.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum HistoryEventType {
    Created,
    StatusChange,
    PlanChange,
}

impl HistoryEventType {
    pub fn as_str(&self) -> &'static str {
        match self {
            HistoryEventType::Created => "created",
            HistoryEventType::StatusChange => "status_change",
            HistoryEventType::PlanChange => "plan_change",
        }
    }
}

impl std::fmt::Display for HistoryEventType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// A history row awaiting insert.
#[derive(Debug, Clone)]
pub struct NewHistoryEvent {
    pub subscription_id: Uuid,
    pub customer_id: Uuid,
    pub event_type: HistoryEventType,
    pub from_status: Option<SubscriptionStatus>,
    pub to_status: SubscriptionStatus,
    pub from_plan_id: Option<Uuid>,
    pub to_plan_id: Uuid,
    pub mrr_delta_cents: i64,
    pub reason: Option<String>,
    /// Who drove the change. Always "processor" for reconciled events.
    pub actor: &'static str,
}

/// Append a history row inside the caller's transaction.
///
/// ARR delta is derived from the MRR delta at insert time; both are stored
/// so rollups never need the plan catalog.
pub async fn append(conn: &mut PgConnection, event: &NewHistoryEvent) -> ReconcileResult<Uuid> {
    let row: (Uuid,) = sqlx::query_as(
        r#"
        INSERT INTO subscription_history (
            subscription_id,
            customer_id,
            event_type,
            from_status,
            to_status,
            from_plan_id,
            to_plan_id,
            mrr_delta_cents,
            arr_delta_cents,
            reason,
            actor
        )
        VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)
        RETURNING id
        "#,
    )
    .bind(event.subscription_id)
    .bind(event.customer_id)
    .bind(event.event_type.as_str())
    .bind(event.from_status.map(|s| s.as_str()))
    .bind(event.to_status.as_str())
    .bind(event.from_plan_id)
    .bind(event.to_plan_id)
    .bind(event.mrr_delta_cents)
    .bind(event.mrr_delta_cents * 12)
    .bind(&event.reason)
    .bind(event.actor)
    .fetch_one(conn)
    .await?;

    Ok(row.0)
}

/// Classify an observed subscription change against the prior row.
///
/// Returns `None` when nothing audit-worthy changed. When status and plan
/// change in the same event, the status change wins: each observed change
/// gets exactly one history row, and status transitions are the
/// revenue-relevant signal.
pub fn classify_change(
    prior: Option<(SubscriptionStatus, Uuid)>,
    new_status: SubscriptionStatus,
    new_plan_id: Uuid,
) -> Option<HistoryEventType> {
    match prior {
        None => Some(HistoryEventType::Created),
        Some((old_status, old_plan_id)) => {
            if old_status != new_status {
                Some(HistoryEventType::StatusChange)
            } else if old_plan_id != new_plan_id {
                Some(HistoryEventType::PlanChange)
            } else {
                None
            }
        }
    }
}

/// Monthly-equivalent rate for a plan at a billing interval.
///
/// Annual plans normalize to a monthly rate; a plan with no annual price
/// falls back to its monthly price even on an annual interval.
pub fn monthly_rate(plan: &ResolvedPlan, interval: Option<BillingInterval>) -> i64 {
    match interval {
        Some(BillingInterval::Year) => plan
            .annual_price_cents
            .map(|annual| annual / 12)
            .unwrap_or(plan.monthly_price_cents),
        _ => plan.monthly_price_cents,
    }
}

/// MRR a subscription contributes at a given status. Only `canceled`
/// contributes zero; `past_due` counts as retained revenue until the
/// processor reports cancellation.
pub fn mrr_contribution(
    status: SubscriptionStatus,
    plan: &ResolvedPlan,
    interval: Option<BillingInterval>,
) -> i64 {
    if status == SubscriptionStatus::Canceled {
        0
    } else {
        monthly_rate(plan, interval)
    }
}

/// MRR delta attributable to one observed change.
#[allow(clippy::type_complexity)]
pub fn mrr_delta(
    prior: Option<(SubscriptionStatus, &ResolvedPlan, Option<BillingInterval>)>,
    new: (SubscriptionStatus, &ResolvedPlan, Option<BillingInterval>),
) -> i64 {
    let old_mrr = prior
        .map(|(status, plan, interval)| mrr_contribution(status, plan, interval))
        .unwrap_or(0);
    let new_mrr = mrr_contribution(new.0, new.1, new.2);

    new_mrr - old_mrr
}

#[cfg(test)]
mod tests {
    use super::*;

    fn plan(monthly: i64, annual: Option<i64>) -> ResolvedPlan {
        ResolvedPlan {
            id: Uuid::new_v4(),
            code: "pro".to_string(),
            monthly_price_cents: monthly,
            annual_price_cents: annual,
        }
    }

    #[test]
    fn test_monthly_rate_normalizes_annual() {
        let p = plan(2900, Some(30_000));
        assert_eq!(monthly_rate(&p, Some(BillingInterval::Month)), 2900);
        assert_eq!(monthly_rate(&p, Some(BillingInterval::Year)), 2500);
        assert_eq!(monthly_rate(&p, None), 2900);
    }

    #[test]
    fn test_annual_without_annual_price_falls_back() {
        let p = plan(2900, None);
        assert_eq!(monthly_rate(&p, Some(BillingInterval::Year)), 2900);
    }

    #[test]
    fn test_cancellation_delta_is_negative_full_rate() {
        let p = plan(2900, None);
        let delta = mrr_delta(
            Some((SubscriptionStatus::Active, &p, None)),
            (SubscriptionStatus::Canceled, &p, None),
        );
        assert_eq!(delta, -2900);
    }

    #[test]
    fn test_new_subscription_delta_is_full_rate() {
        let p = plan(900, None);
        let delta = mrr_delta(None, (SubscriptionStatus::Active, &p, None));
        assert_eq!(delta, 900);
    }

    #[test]
    fn test_past_due_retains_mrr() {
        let p = plan(2900, None);
        let delta = mrr_delta(
            Some((SubscriptionStatus::Active, &p, None)),
            (SubscriptionStatus::PastDue, &p, None),
        );
        assert_eq!(delta, 0);
    }

    #[test]
    fn test_plan_upgrade_delta() {
        let starter = plan(900, None);
        let pro = plan(2900, None);
        let delta = mrr_delta(
            Some((SubscriptionStatus::Active, &starter, None)),
            (SubscriptionStatus::Active, &pro, None),
        );
        assert_eq!(delta, 2000);
    }

    #[test]
    fn test_classify_created() {
        let plan_id = Uuid::new_v4();
        assert_eq!(
            classify_change(None, SubscriptionStatus::Trialing, plan_id),
            Some(HistoryEventType::Created)
        );
    }

    #[test]
    fn test_classify_status_change_wins_over_plan_change() {
        let old_plan = Uuid::new_v4();
        let new_plan = Uuid::new_v4();
        assert_eq!(
            classify_change(
                Some((SubscriptionStatus::Active, old_plan)),
                SubscriptionStatus::Canceled,
                new_plan
            ),
            Some(HistoryEventType::StatusChange)
        );
    }

    #[test]
    fn test_classify_plan_change() {
        let old_plan = Uuid::new_v4();
        let new_plan = Uuid::new_v4();
        assert_eq!(
            classify_change(
                Some((SubscriptionStatus::Active, old_plan)),
                SubscriptionStatus::Active,
                new_plan
            ),
            Some(HistoryEventType::PlanChange)
        );
    }

    #[test]
    fn test_classify_no_change() {
        let plan_id = Uuid::new_v4();
        assert_eq!(
            classify_change(
                Some((SubscriptionStatus::Active, plan_id)),
                SubscriptionStatus::Active,
                plan_id
            ),
            None
        );
    }

    #[test]
    fn test_odd_transition_still_classified() {
        // canceled -> active is semantically odd but the processor is the
        // source of truth; the recorder does not gatekeep.
        let plan_id = Uuid::new_v4();
        assert_eq!(
            classify_change(
                Some((SubscriptionStatus::Canceled, plan_id)),
                SubscriptionStatus::Active,
                plan_id
            ),
            Some(HistoryEventType::StatusChange)
        );
    }
}
