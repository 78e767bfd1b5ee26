//! Invalidation signaler
//!
//! After a successful reconciliation write, dependent read views (dashboard
//! widgets, portal pages, cached queries) are stale. This module emits scoped
//! invalidation signals over a Redis pub/sub channel so those views refresh.
//!
//! Signals are strictly best-effort: publishing happens on a detached task,
//! failures are logged and dropped, and a missing Redis connection disables
//! the channel entirely. Reconciliation never blocks on or fails because of
//! invalidation.

use std::sync::{Arc, Mutex};

use redis::aio::ConnectionManager;
use redis::AsyncCommands;

/// Default pub/sub channel the platform's cache layer subscribes to.
pub const INVALIDATION_CHANNEL: &str = "cache_invalidation";

/// Entity classes that carry invalidation scopes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntityClass {
    Subscriptions,
    Invoices,
    PaymentAttempts,
    Charges,
    Refunds,
    BillingAlerts,
}

impl EntityClass {
    pub fn as_str(&self) -> &'static str {
        match self {
            EntityClass::Subscriptions => "subscriptions",
            EntityClass::Invoices => "invoices",
            EntityClass::PaymentAttempts => "payment_attempts",
            EntityClass::Charges => "charges",
            EntityClass::Refunds => "refunds",
            EntityClass::BillingAlerts => "billing_alerts",
        }
    }
}

/// Scopes emitted for one reconciled entity: a global scope for the entity
/// class, an owner scope keyed by the customer's external reference, and a
/// parent scope when the entity hangs off another record. The parent is a
/// `(kind, external ref)` pair, e.g. `("subscription", "sub_9")`.
pub fn entity_scopes(
    class: EntityClass,
    owner_ref: &str,
    parent: Option<(&str, &str)>,
) -> Vec<String> {
    let mut scopes = vec![
        format!("{}:global", class.as_str()),
        format!("{}:{}", class.as_str(), owner_ref),
    ];

    if let Some((kind, external_ref)) = parent {
        scopes.push(format!("{}:{}:{}", class.as_str(), kind, external_ref));
    }

    scopes
}

enum Backend {
    Redis(ConnectionManager),
    /// Collects scopes instead of publishing; used in tests.
    Memory(Arc<Mutex<Vec<String>>>),
    Disabled,
}

/// Emits fire-and-forget invalidation signals.
pub struct InvalidationSignaler {
    backend: Backend,
    channel: String,
}

impl InvalidationSignaler {
    pub fn new_redis(conn: ConnectionManager) -> Self {
        Self {
            backend: Backend::Redis(conn),
            channel: INVALIDATION_CHANNEL.to_string(),
        }
    }

    pub fn new_in_memory() -> Self {
        Self {
            backend: Backend::Memory(Arc::new(Mutex::new(Vec::new()))),
            channel: INVALIDATION_CHANNEL.to_string(),
        }
    }

    /// No-op signaler for deployments without a cache layer.
    pub fn disabled() -> Self {
        Self {
            backend: Backend::Disabled,
            channel: INVALIDATION_CHANNEL.to_string(),
        }
    }

    /// Emit a single scope. Never blocks, never fails the caller.
    pub fn signal(&self, scope: &str) {
        match &self.backend {
            Backend::Redis(conn) => {
                let mut conn = conn.clone();
                let channel = self.channel.clone();
                let scope = scope.to_string();
                tokio::spawn(async move {
                    let result: redis::RedisResult<()> = conn.publish(&channel, &scope).await;
                    match result {
                        Ok(()) => {
                            tracing::debug!(scope = %scope, "Invalidation signal published");
                        }
                        Err(e) => {
                            tracing::warn!(
                                scope = %scope,
                                error = %e,
                                "Failed to publish invalidation signal"
                            );
                        }
                    }
                });
            }
            Backend::Memory(emitted) => {
                if let Ok(mut guard) = emitted.lock() {
                    guard.push(scope.to_string());
                }
            }
            Backend::Disabled => {}
        }
    }

    /// Emit the full scope set for one reconciled entity.
    pub fn signal_entity(
        &self,
        class: EntityClass,
        owner_ref: &str,
        parent: Option<(&str, &str)>,
    ) {
        for scope in entity_scopes(class, owner_ref, parent) {
            self.signal(&scope);
        }
    }

    /// Scopes collected by the in-memory backend; empty for other backends.
    pub fn emitted(&self) -> Vec<String> {
        match &self.backend {
            Backend::Memory(emitted) => emitted.lock().map(|g| g.clone()).unwrap_or_default(),
            _ => Vec::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_entity_scopes_without_parent() {
        let scopes = entity_scopes(EntityClass::Invoices, "cus_1", None);
        assert_eq!(scopes, vec!["invoices:global", "invoices:cus_1"]);
    }

    #[test]
    fn test_entity_scopes_with_parent() {
        let scopes = entity_scopes(EntityClass::Invoices, "cus_1", Some(("subscription", "sub_9")));
        assert_eq!(
            scopes,
            vec![
                "invoices:global",
                "invoices:cus_1",
                "invoices:subscription:sub_9"
            ]
        );
    }

    #[test]
    fn test_charge_parent_scope_is_invoice() {
        let scopes = entity_scopes(EntityClass::Charges, "cus_1", Some(("invoice", "in_7")));
        assert_eq!(scopes[2], "charges:invoice:in_7");
    }

    #[test]
    fn test_memory_backend_collects() {
        let signaler = InvalidationSignaler::new_in_memory();
        signaler.signal_entity(EntityClass::Subscriptions, "cus_2", None);

        assert_eq!(
            signaler.emitted(),
            vec!["subscriptions:global", "subscriptions:cus_2"]
        );
    }

    #[test]
    fn test_disabled_backend_is_silent() {
        let signaler = InvalidationSignaler::disabled();
        signaler.signal("invoices:global");
        assert!(signaler.emitted().is_empty());
    }
}
