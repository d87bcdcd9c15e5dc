//! Shared application state injected into every Axum handler.

use std::sync::Arc;

use kiln_core::{DiagnosticsEmitter, LaneRegistry, ModelCatalog, Router};

use crate::config::Config;
use crate::db::SqliteStore;

/// State shared across all HTTP handlers and background loops.
#[derive(Clone, Debug)]
pub struct AppState {
    /// Server configuration (env-derived).
    pub config: Arc<Config>,
    /// Durable task records.
    pub store: Arc<SqliteStore>,
    /// Read-only model catalog.
    pub catalog: Arc<ModelCatalog>,
    /// Execution lane registry.
    pub lanes: Arc<LaneRegistry>,
    /// The scheduling core.
    pub router: Arc<Router<SqliteStore>>,
    /// Fire-and-forget operational events.
    pub diagnostics: DiagnosticsEmitter,
}
