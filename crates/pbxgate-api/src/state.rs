//! Shared application state for the HTTP layer.

use std::sync::Arc;

use pbxgate_core::config::AppConfig;
use pbxgate_license::LicenseSyncEngine;
use pbxgate_session::AdmissionController;

/// State threaded through every handler via Axum's `State` extractor.
#[derive(Clone)]
pub struct AppState {
    /// Application configuration.
    pub config: Arc<AppConfig>,
    /// Session admission controller.
    pub controller: Arc<AdmissionController>,
    /// License sync engine.
    pub license_engine: Arc<LicenseSyncEngine>,
}
