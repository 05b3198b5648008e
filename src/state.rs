//! Application state management
//!
//! Contains shared state accessible across all handlers.

use crate::backend::StoreBackend;
use crate::config::{IntakeConfig, Settings};
use crate::membership::{LifecycleManager, StageStore};
use std::sync::Arc;

/// Application state shared across all handlers
pub struct AppState {
    /// Stage store over the configured backend
    pub stages: Arc<StageStore<StoreBackend>>,

    /// Stage transitions, sharing the same stage store
    pub lifecycle: LifecycleManager<StoreBackend>,

    pub intake: IntakeConfig,

    /// Name of the active store backend
    pub backend_name: &'static str,
}

impl AppState {
    pub fn new(backend: StoreBackend, settings: &Settings) -> Self {
        let backend_name = backend.name();
        let stages = Arc::new(StageStore::new(
            Arc::new(backend),
            settings.lifecycle.archive_ttl(),
        ));

        Self {
            lifecycle: LifecycleManager::new(stages.clone()),
            stages,
            intake: settings.intake.clone(),
            backend_name,
        }
    }
}

/// Type alias for shared state
pub type SharedState = Arc<AppState>;
