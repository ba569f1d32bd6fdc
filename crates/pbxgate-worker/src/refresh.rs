//! Periodic license re-sync loop.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::time;
use tracing::{info, warn};

use pbxgate_license::LicenseSyncEngine;

/// Service that periodically re-syncs the license from the master.
#[derive(Debug)]
pub struct LicenseRefreshService {
    /// License sync engine.
    engine: Arc<LicenseSyncEngine>,
    /// Refresh interval.
    interval: Duration,
}

impl LicenseRefreshService {
    /// Create a new refresh service.
    pub fn new(engine: Arc<LicenseSyncEngine>, interval_minutes: u64) -> Self {
        Self {
            engine,
            interval: Duration::from_secs(interval_minutes * 60),
        }
    }

    /// Run the refresh loop until the cancellation channel fires.
    pub async fn run(&self, mut cancel: watch::Receiver<bool>) {
        info!(
            interval_minutes = self.interval.as_secs() / 60,
            "License refresh service started"
        );

        let mut interval = time::interval(self.interval);
        // The first tick fires immediately; skip it, startup already synced.
        interval.tick().await;

        loop {
            tokio::select! {
                _ = interval.tick() => {
                    match self.engine.sync_from_master().await {
                        Ok(record) => {
                            tracing::debug!(
                                master_license_id = %record.master_license_id,
                                sync_status = %record.sync_status,
                                "Periodic license refresh completed"
                            );
                        }
                        Err(e) => {
                            warn!(error = %e, "Periodic license refresh failed");
                        }
                    }
                }
                _ = cancel.changed() => {
                    if *cancel.borrow() {
                        info!("License refresh service shutting down");
                        break;
                    }
                }
            }
        }
    }
}
