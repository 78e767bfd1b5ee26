//! Idempotency ledger
//!
//! Records which inbound event identifiers have already been processed so
//! at-least-once redelivery never re-applies side effects. The ledger row is
//! written as the *last* step of dispatch: a crash between reconciler
//! completion and the ledger write costs at most one extra replay, which the
//! upsert-based reconcilers absorb.
//!
//! Concurrent duplicate deliveries racing each other resolve on the unique
//! constraint: `INSERT ... ON CONFLICT DO NOTHING RETURNING id` lets exactly
//! one invocation record the event, and the loser's prior reconciler work is
//! harmless.

use sqlx::PgPool;
use time::OffsetDateTime;
use uuid::Uuid;

use crate::error::ReconcileResult;

/// How dispatch concluded for a recorded event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessingOutcome {
    /// A reconciler created or updated canonical state.
    Applied,
    /// A required reference could not be resolved; no mutation happened.
    Skipped,
    /// Unknown event type; acknowledged without processing.
    Ignored,
}

impl ProcessingOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProcessingOutcome::Applied => "applied",
            ProcessingOutcome::Skipped => "skipped",
            ProcessingOutcome::Ignored => "ignored",
        }
    }
}

impl std::fmt::Display for ProcessingOutcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// A processed-event record. Insert-only; never updated.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct ProcessedEvent {
    pub id: Uuid,
    pub external_event_id: String,
    pub event_type: String,
    pub outcome: String,
    pub created_at: OffsetDateTime,
}

/// Ledger of processed external event identifiers.
pub struct IdempotencyLedger {
    pool: PgPool,
}

impl IdempotencyLedger {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Look up an event identifier. `Ok(Some(..))` means the event's side
    /// effects have already been fully applied and dispatch must
    /// short-circuit.
    pub async fn find(&self, external_event_id: &str) -> ReconcileResult<Option<ProcessedEvent>> {
        let record = sqlx::query_as::<_, ProcessedEvent>(
            r#"
            SELECT id, external_event_id, event_type, outcome, created_at
            FROM processed_events
            WHERE external_event_id = $1
            "#,
        )
        .bind(external_event_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(record)
    }

    /// Record an event as processed. Returns `false` when a concurrent
    /// duplicate delivery won the insert, which the caller treats as success.
    pub async fn record(
        &self,
        external_event_id: &str,
        event_type: &str,
        outcome: ProcessingOutcome,
    ) -> ReconcileResult<bool> {
        let inserted: Option<(Uuid,)> = sqlx::query_as(
            r#"
            INSERT INTO processed_events (external_event_id, event_type, outcome)
            VALUES ($1, $2, $3)
            ON CONFLICT (external_event_id) DO NOTHING
            RETURNING id
            "#,
        )
        .bind(external_event_id)
        .bind(event_type)
        .bind(outcome.as_str())
        .fetch_optional(&self.pool)
        .await?;

        if inserted.is_none() {
            tracing::info!(
                external_event_id = %external_event_id,
                event_type = %event_type,
                "Concurrent duplicate delivery already recorded this event"
            );
        }

        Ok(inserted.is_some())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_outcome_display() {
        assert_eq!(ProcessingOutcome::Applied.to_string(), "applied");
        assert_eq!(ProcessingOutcome::Skipped.to_string(), "skipped");
        assert_eq!(ProcessingOutcome::Ignored.to_string(), "ignored");
    }
}
