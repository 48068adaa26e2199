//! Application state management
//!
//! Contains shared state accessible across all handlers.

use crate::controller::Controller;
use crate::modules::ModuleCatalog;
use crate::store::RequestStore;
use std::sync::Arc;

/// Application state shared across all handlers
pub struct AppState {
    /// Data requests and their controller-owned state
    pub store: RequestStore,

    /// Reconciliation controller; handlers enqueue keys after every change
    pub controller: Arc<Controller>,

    /// Module capability catalog used by the compiler
    pub catalog: Arc<ModuleCatalog>,

    /// Name of the governance backend in use
    pub governance_backend: String,
}

impl AppState {
    pub fn new(
        store: RequestStore,
        controller: Arc<Controller>,
        catalog: Arc<ModuleCatalog>,
        governance_backend: impl Into<String>,
    ) -> Self {
        Self {
            store,
            controller,
            catalog,
            governance_backend: governance_backend.into(),
        }
    }
}

/// Type alias for shared application state
pub type SharedState = Arc<AppState>;
