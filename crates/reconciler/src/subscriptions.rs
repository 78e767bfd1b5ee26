//! Subscription reconciler
//!
//! Upserts the canonical subscription row from processor events and appends
//! the audit history entry in the same transaction. The local row is a
//! last-observed-state mirror: transitions are recorded as reported, never
//! validated against a local state machine, because the processor is
//! authoritative. Out-of-order delivery can therefore leave transient
//! incorrect local state until the next event lands.

use sqlx::PgPool;
use time::OffsetDateTime;
use uuid::Uuid;

use crate::error::{ReconcileError, ReconcileResult};
use crate::event::{BillingInterval, SubscriptionPayload, SubscriptionStatus};
use crate::history::{self, HistoryEventType, NewHistoryEvent};
use crate::resolver::{EntityResolver, ResolvedCustomer, ResolvedPlan};
use crate::ReconcileOutcome;

/// Which subscription event drove this reconciliation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubscriptionEventKind {
    Updated,
    Canceled,
}

/// Data the dispatcher needs after a successful subscription apply.
#[derive(Debug, Clone)]
pub struct SubscriptionApplied {
    pub subscription_id: Uuid,
    pub customer: ResolvedCustomer,
    pub plan_code: String,
    pub to_status: SubscriptionStatus,
    /// True when this event moved the subscription into `canceled` from some
    /// other status; drives the cancellation notification.
    pub became_canceled: bool,
    pub history_event: Option<HistoryEventType>,
}

#[derive(Debug, sqlx::FromRow)]
struct PriorSubscription {
    id: Uuid,
    status: String,
    plan_id: Uuid,
    billing_interval: Option<String>,
}

/// Reconciles subscription events onto the canonical store.
pub struct SubscriptionReconciler {
    pool: PgPool,
    resolver: EntityResolver,
}

impl SubscriptionReconciler {
    pub fn new(pool: PgPool) -> Self {
        Self {
            resolver: EntityResolver::new(pool.clone()),
            pool,
        }
    }

    /// Apply a subscription payload. The upsert and the history append commit
    /// as one unit or not at all.
    pub async fn reconcile(
        &self,
        kind: SubscriptionEventKind,
        payload: &SubscriptionPayload,
    ) -> ReconcileResult<ReconcileOutcome<SubscriptionApplied>> {
        let Some(customer) = self.resolver.customer_by_external_id(&payload.customer).await? else {
            tracing::warn!(
                external_customer_id = %payload.customer,
                external_subscription_id = %payload.id,
                "Subscription event references unknown customer, skipping"
            );
            return Ok(ReconcileOutcome::skipped("customer", &payload.customer));
        };

        let Some(plan) = self.resolver.plan_by_code(&payload.plan).await? else {
            tracing::warn!(
                plan_code = %payload.plan,
                external_subscription_id = %payload.id,
                "Subscription event references unknown plan, skipping"
            );
            return Ok(ReconcileOutcome::skipped("plan", &payload.plan));
        };

        // Cancellation events mirror a terminal status regardless of what the
        // payload's status field says.
        let new_status = match kind {
            SubscriptionEventKind::Canceled => SubscriptionStatus::Canceled,
            SubscriptionEventKind::Updated => payload.status,
        };
        let canceled_at = if new_status == SubscriptionStatus::Canceled {
            Some(
                payload
                    .canceled_at
                    .and_then(|ts| OffsetDateTime::from_unix_timestamp(ts).ok())
                    .unwrap_or_else(OffsetDateTime::now_utc),
            )
        } else {
            None
        };

        let mut tx = self.pool.begin().await?;

        // Lock the existing row so a concurrent event for the same
        // subscription serializes its history append against ours.
        let prior: Option<PriorSubscription> = sqlx::query_as(
            r#"
            SELECT id, status, plan_id, billing_interval
            FROM subscriptions
            WHERE external_id = $1
            FOR UPDATE
            "#,
        )
        .bind(&payload.id)
        .fetch_optional(&mut *tx)
        .await?;

        let (subscription_id,): (Uuid,) = sqlx::query_as(
            r#"
            INSERT INTO subscriptions (
                customer_id, plan_id, external_id, status, billing_interval,
                current_period_start, current_period_end,
                cancel_at_period_end, canceled_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
            ON CONFLICT (external_id) DO UPDATE SET
                customer_id = EXCLUDED.customer_id,
                plan_id = EXCLUDED.plan_id,
                status = EXCLUDED.status,
                billing_interval = EXCLUDED.billing_interval,
                current_period_start = EXCLUDED.current_period_start,
                current_period_end = EXCLUDED.current_period_end,
                cancel_at_period_end = EXCLUDED.cancel_at_period_end,
                canceled_at = EXCLUDED.canceled_at,
                updated_at = NOW()
            RETURNING id
            "#,
        )
        .bind(customer.id)
        .bind(plan.id)
        .bind(&payload.id)
        .bind(new_status.as_str())
        .bind(payload.billing_interval.map(|i| i.as_str()))
        .bind(unix_ts(payload.current_period_start))
        .bind(unix_ts(payload.current_period_end))
        .bind(payload.cancel_at_period_end)
        .bind(canceled_at)
        .fetch_one(&mut *tx)
        .await?;

        let prior_state = match &prior {
            Some(row) => {
                let status = SubscriptionStatus::parse(&row.status).ok_or_else(|| {
                    ReconcileError::Internal(format!(
                        "subscription {} has unrecognized stored status '{}'",
                        row.id, row.status
                    ))
                })?;
                Some((status, row.plan_id))
            }
            None => None,
        };

        let history_event = history::classify_change(prior_state, new_status, plan.id);

        if let Some(event_type) = history_event {
            let old_plan = self.prior_plan(&mut tx, prior.as_ref(), &plan).await?;
            let old_interval = prior
                .as_ref()
                .and_then(|p| p.billing_interval.as_deref())
                .and_then(BillingInterval::parse);

            let mrr_delta_cents = history::mrr_delta(
                prior_state.map(|(status, _)| (status, &old_plan, old_interval)),
                (new_status, &plan, payload.billing_interval),
            );

            history::append(
                &mut *tx,
                &NewHistoryEvent {
                    subscription_id,
                    customer_id: customer.id,
                    event_type,
                    from_status: prior_state.map(|(status, _)| status),
                    to_status: new_status,
                    from_plan_id: prior.as_ref().map(|p| p.plan_id),
                    to_plan_id: plan.id,
                    mrr_delta_cents,
                    reason: None,
                    actor: "processor",
                },
            )
            .await?;
        }

        tx.commit().await?;

        let became_canceled = new_status == SubscriptionStatus::Canceled
            && prior_state.map(|(status, _)| status) != Some(SubscriptionStatus::Canceled);

        tracing::info!(
            external_subscription_id = %payload.id,
            customer_id = %customer.id,
            status = %new_status,
            history_event = ?history_event,
            "Subscription reconciled"
        );

        Ok(ReconcileOutcome::Applied(SubscriptionApplied {
            subscription_id,
            customer,
            plan_code: plan.code,
            to_status: new_status,
            became_canceled,
            history_event,
        }))
    }

    /// Resolve the plan the subscription was on before this event, within the
    /// current transaction. Falls back to the new plan when the old one was
    /// removed from the catalog.
    async fn prior_plan(
        &self,
        tx: &mut sqlx::Transaction<'_, sqlx::Postgres>,
        prior: Option<&PriorSubscription>,
        new_plan: &ResolvedPlan,
    ) -> ReconcileResult<ResolvedPlan> {
        let Some(prior) = prior else {
            return Ok(new_plan.clone());
        };

        if prior.plan_id == new_plan.id {
            return Ok(new_plan.clone());
        }

        let old_plan: Option<ResolvedPlan> = sqlx::query_as(
            "SELECT id, code, monthly_price_cents, annual_price_cents FROM plans WHERE id = $1",
        )
        .bind(prior.plan_id)
        .fetch_optional(&mut **tx)
        .await?;

        Ok(old_plan.unwrap_or_else(|| {
            tracing::warn!(
                plan_id = %prior.plan_id,
                "Prior plan no longer in catalog, computing delta against new plan"
            );
            new_plan.clone()
        }))
    }
}

fn unix_ts(secs: Option<i64>) -> Option<OffsetDateTime> {
    secs.and_then(|ts| OffsetDateTime::from_unix_timestamp(ts).ok())
}
