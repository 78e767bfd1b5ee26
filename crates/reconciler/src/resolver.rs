//! Entity resolver
//!
//! Maps external reference identifiers embedded in event payloads onto
//! canonical rows. Absence is a routine, non-fatal outcome (`Ok(None)`): test
//! events, deleted customers, and out-of-order deliveries all legitimately
//! reference records we do not have. Callers log the external ids involved
//! and skip the event; only infrastructure failure is an `Err`.

use sqlx::PgPool;
use uuid::Uuid;

use crate::error::ReconcileResult;

/// Canonical customer located by external reference.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct ResolvedCustomer {
    pub id: Uuid,
    pub external_id: String,
    pub email: Option<String>,
    pub display_name: Option<String>,
}

/// Canonical subscription located by external reference.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct ResolvedSubscription {
    pub id: Uuid,
    pub external_id: String,
    pub customer_id: Uuid,
}

/// Canonical invoice located by external reference.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct ResolvedInvoice {
    pub id: Uuid,
    pub external_id: String,
    pub customer_id: Uuid,
}

/// Canonical payment attempt located by external reference.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct ResolvedPaymentAttempt {
    pub id: Uuid,
    pub external_id: String,
}

/// Canonical charge located by external reference.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct ResolvedCharge {
    pub id: Uuid,
    pub external_id: String,
    pub customer_id: Uuid,
}

/// Plan catalog entry, seeded by the platform and read-only to the engine.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct ResolvedPlan {
    pub id: Uuid,
    pub code: String,
    pub monthly_price_cents: i64,
    pub annual_price_cents: Option<i64>,
}

/// Resolves external references to canonical records.
pub struct EntityResolver {
    pool: PgPool,
}

impl EntityResolver {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn customer_by_external_id(
        &self,
        external_id: &str,
    ) -> ReconcileResult<Option<ResolvedCustomer>> {
        let row = sqlx::query_as::<_, ResolvedCustomer>(
            "SELECT id, external_id, email, display_name FROM customers WHERE external_id = $1",
        )
        .bind(external_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row)
    }

    pub async fn subscription_by_external_id(
        &self,
        external_id: &str,
    ) -> ReconcileResult<Option<ResolvedSubscription>> {
        let row = sqlx::query_as::<_, ResolvedSubscription>(
            "SELECT id, external_id, customer_id FROM subscriptions WHERE external_id = $1",
        )
        .bind(external_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row)
    }

    pub async fn invoice_by_external_id(
        &self,
        external_id: &str,
    ) -> ReconcileResult<Option<ResolvedInvoice>> {
        let row = sqlx::query_as::<_, ResolvedInvoice>(
            "SELECT id, external_id, customer_id FROM invoices WHERE external_id = $1",
        )
        .bind(external_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row)
    }

    pub async fn payment_attempt_by_external_id(
        &self,
        external_id: &str,
    ) -> ReconcileResult<Option<ResolvedPaymentAttempt>> {
        let row = sqlx::query_as::<_, ResolvedPaymentAttempt>(
            "SELECT id, external_id FROM payment_attempts WHERE external_id = $1",
        )
        .bind(external_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row)
    }

    pub async fn charge_by_external_id(
        &self,
        external_id: &str,
    ) -> ReconcileResult<Option<ResolvedCharge>> {
        let row = sqlx::query_as::<_, ResolvedCharge>(
            "SELECT id, external_id, customer_id FROM charges WHERE external_id = $1",
        )
        .bind(external_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row)
    }

    pub async fn plan_by_code(&self, code: &str) -> ReconcileResult<Option<ResolvedPlan>> {
        let row = sqlx::query_as::<_, ResolvedPlan>(
            "SELECT id, code, monthly_price_cents, annual_price_cents FROM plans WHERE code = $1",
        )
        .bind(code)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row)
    }
}
