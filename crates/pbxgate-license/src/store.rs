//! License store seam.
//!
//! The sync engine and the reconciler talk to the durable license store
//! through this trait so unit tests can inject an in-memory fake.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use pbxgate_core::result::AppResult;
use pbxgate_database::repositories::{FingerprintChangeRepository, LicenseRepository};
use pbxgate_entity::license::{LicenseRecord, SyncStatus, UpsertLicense};

/// Durable store for cached licenses and their fingerprint audit trail.
#[async_trait]
pub trait LicenseStore: Send + Sync + std::fmt::Debug {
    /// Find a license by local id.
    async fn find_by_id(&self, id: Uuid) -> AppResult<Option<LicenseRecord>>;

    /// Find the current license for a fingerprint.
    async fn find_current(&self, fingerprint: &str) -> AppResult<Option<LicenseRecord>>;

    /// Find the most recently synced usable row regardless of fingerprint.
    async fn find_latest(&self) -> AppResult<Option<LicenseRecord>>;

    /// Upsert keyed by master license id.
    async fn upsert(&self, up: &UpsertLicense) -> AppResult<LicenseRecord>;

    /// Set the sync status of a row.
    async fn set_sync_status(&self, id: Uuid, status: SyncStatus) -> AppResult<()>;

    /// Invalidate other rows bound to the fingerprint.
    async fn invalidate_others(&self, fingerprint: &str, keep_id: Uuid) -> AppResult<u64>;

    /// Mark stale rows failed once older than the cutoff.
    async fn mark_failed_stale_before(&self, cutoff: DateTime<Utc>) -> AppResult<u64>;

    /// Delete long-failed rows with no referencing sessions.
    async fn delete_failed_unreferenced(&self, cutoff: DateTime<Utc>) -> AppResult<u64>;

    /// Append a fingerprint-change audit row.
    async fn record_fingerprint_change(
        &self,
        old_fingerprint: &str,
        new_fingerprint: &str,
        reason: &str,
        license_id: Uuid,
        action_taken: &str,
    ) -> AppResult<()>;
}

/// PostgreSQL-backed license store.
#[derive(Debug, Clone)]
pub struct PgLicenseStore {
    licenses: LicenseRepository,
    fingerprints: FingerprintChangeRepository,
}

impl PgLicenseStore {
    /// Create a new store over the repositories.
    pub fn new(licenses: LicenseRepository, fingerprints: FingerprintChangeRepository) -> Self {
        Self {
            licenses,
            fingerprints,
        }
    }
}

#[async_trait]
impl LicenseStore for PgLicenseStore {
    async fn find_by_id(&self, id: Uuid) -> AppResult<Option<LicenseRecord>> {
        self.licenses.find_by_id(id).await
    }

    async fn find_current(&self, fingerprint: &str) -> AppResult<Option<LicenseRecord>> {
        self.licenses.find_current(fingerprint).await
    }

    async fn find_latest(&self) -> AppResult<Option<LicenseRecord>> {
        self.licenses.find_latest().await
    }

    async fn upsert(&self, up: &UpsertLicense) -> AppResult<LicenseRecord> {
        self.licenses.upsert(up).await
    }

    async fn set_sync_status(&self, id: Uuid, status: SyncStatus) -> AppResult<()> {
        self.licenses.set_sync_status(id, status).await
    }

    async fn invalidate_others(&self, fingerprint: &str, keep_id: Uuid) -> AppResult<u64> {
        self.licenses.invalidate_others(fingerprint, keep_id).await
    }

    async fn mark_failed_stale_before(&self, cutoff: DateTime<Utc>) -> AppResult<u64> {
        self.licenses.mark_failed_stale_before(cutoff).await
    }

    async fn delete_failed_unreferenced(&self, cutoff: DateTime<Utc>) -> AppResult<u64> {
        self.licenses.delete_failed_unreferenced(cutoff).await
    }

    async fn record_fingerprint_change(
        &self,
        old_fingerprint: &str,
        new_fingerprint: &str,
        reason: &str,
        license_id: Uuid,
        action_taken: &str,
    ) -> AppResult<()> {
        self.fingerprints
            .record(old_fingerprint, new_fingerprint, reason, license_id, action_taken)
            .await?;
        Ok(())
    }
}
