use std::sync::Arc;

use fleetguard_core::{AuditStore, Config, SanitizedConfig, TaskDispatcher};

/// Shared application state
pub struct AppState {
    config: Config,
    dispatcher: Arc<TaskDispatcher>,
    audit_store: Arc<dyn AuditStore>,
}

impl AppState {
    pub fn new(
        config: Config,
        dispatcher: Arc<TaskDispatcher>,
        audit_store: Arc<dyn AuditStore>,
    ) -> Self {
        Self {
            config,
            dispatcher,
            audit_store,
        }
    }

    pub fn sanitized_config(&self) -> SanitizedConfig {
        SanitizedConfig::from(&self.config)
    }

    pub fn dispatcher(&self) -> &TaskDispatcher {
        &self.dispatcher
    }

    pub fn audit_store(&self) -> &dyn AuditStore {
        self.audit_store.as_ref()
    }
}
