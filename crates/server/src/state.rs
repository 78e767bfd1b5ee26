//! Shared application state

use std::sync::Arc;

use clientdeck_reconciler::ReconciliationService;

#[derive(Clone)]
pub struct AppState {
    pub reconciliation: Arc<ReconciliationService>,
}
