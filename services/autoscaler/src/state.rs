//! Application state shared across request handlers.

use std::sync::Arc;

use crate::orchestrator::Orchestrator;
use crate::store::StateStore;

/// Shared application state.
///
/// This is passed to all request handlers via Axum's state extractor.
#[derive(Clone)]
pub struct AppState {
    inner: Arc<AppStateInner>,
}

struct AppStateInner {
    orchestrator: Arc<Orchestrator>,
    store: Arc<dyn StateStore>,
}

impl AppState {
    pub fn new(orchestrator: Arc<Orchestrator>, store: Arc<dyn StateStore>) -> Self {
        Self {
            inner: Arc::new(AppStateInner {
                orchestrator,
                store,
            }),
        }
    }

    pub fn orchestrator(&self) -> &Arc<Orchestrator> {
        &self.inner.orchestrator
    }

    pub fn store(&self) -> &Arc<dyn StateStore> {
        &self.inner.store
    }
}
