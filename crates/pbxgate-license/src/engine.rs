//! License sync engine.
//!
//! Keeps the locally cached license authoritative across master outages:
//! serve-stale-while-revalidate inside the TTL window, grace-period
//! fallback after it, and a synthesized offline development license when
//! nothing usable remains. Master unreachability is absorbed here and
//! never surfaces to admission callers.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration as StdDuration;

use chrono::{Duration, Utc};
use tracing::{error, info, warn};

use pbxgate_core::config::license::LicenseConfig;
use pbxgate_core::result::AppResult;
use pbxgate_entity::license::{
    Feature, FeatureSet, LicenseRecord, LicenseStatus, OFFLINE_MASTER_LICENSE_ID, SyncStatus,
    UpsertLicense,
};

use crate::fingerprint::FingerprintProvider;
use crate::master::{FetchError, LicensePayload, MasterApi};
use crate::store::LicenseStore;

/// The License Sync Engine.
#[derive(Debug)]
pub struct LicenseSyncEngine {
    /// Durable license store.
    store: Arc<dyn LicenseStore>,
    /// Master server client.
    master: Arc<dyn MasterApi>,
    /// Host fingerprint provider.
    fingerprint: Arc<dyn FingerprintProvider>,
    /// License configuration.
    config: LicenseConfig,
    /// Guard so only one background refresh runs at a time.
    refresh_in_flight: AtomicBool,
}

impl LicenseSyncEngine {
    /// Create a new sync engine.
    pub fn new(
        store: Arc<dyn LicenseStore>,
        master: Arc<dyn MasterApi>,
        fingerprint: Arc<dyn FingerprintProvider>,
        config: LicenseConfig,
    ) -> Self {
        Self {
            store,
            master,
            fingerprint,
            config,
            refresh_in_flight: AtomicBool::new(false),
        }
    }

    /// The durable license store this engine writes to.
    pub fn store(&self) -> &Arc<dyn LicenseStore> {
        &self.store
    }

    fn ttl(&self) -> Duration {
        Duration::minutes(self.config.ttl_minutes as i64)
    }

    fn grace(&self) -> Duration {
        Duration::hours(self.config.grace_period_hours as i64)
    }

    /// Return the license admission decisions run against.
    ///
    /// Staleness is checked on every read: a copy past its TTL is served
    /// as-is while a background refresh runs; a stale copy past the grace
    /// period forces a synchronous refresh.
    pub async fn get_current_license(self: &Arc<Self>) -> AppResult<LicenseRecord> {
        let fp = self.fingerprint.current()?;
        let now = Utc::now();

        if let Some(current) = self.store.find_current(&fp).await? {
            if !current.is_past_ttl(now, self.ttl()) {
                return Ok(current);
            }

            if !current.is_within_grace(now, self.grace()) {
                warn!(
                    master_license_id = %current.master_license_id,
                    "Cached license past grace period, forcing synchronous refresh"
                );
                return self.sync_from_master().await;
            }

            if current.sync_status == SyncStatus::Synced {
                if let Err(e) = self.store.set_sync_status(current.id, SyncStatus::Stale).await {
                    warn!(error = %e, "Failed to mark license stale");
                }
            }

            self.spawn_background_refresh();

            let mut stale = current;
            stale.sync_status = SyncStatus::Stale;
            return Ok(stale);
        }

        // No usable row for this fingerprint. If the latest usable row is
        // bound to a different fingerprint the host changed underneath us:
        // audit it, mark the old copy stale, and try a fresh fetch.
        if let Some(previous) = self.store.find_latest().await? {
            if previous.server_fingerprint != fp {
                warn!(
                    old_fingerprint = %previous.server_fingerprint,
                    new_fingerprint = %fp,
                    master_license_id = %previous.master_license_id,
                    "Host fingerprint no longer matches cached license"
                );

                if let Err(e) = self.store.set_sync_status(previous.id, SyncStatus::Stale).await {
                    warn!(error = %e, "Failed to mark mismatched license stale");
                }
                if let Err(e) = self
                    .store
                    .record_fingerprint_change(
                        &previous.server_fingerprint,
                        &fp,
                        "Host fingerprint changed since last sync",
                        previous.id,
                        "marked stale, refetching",
                    )
                    .await
                {
                    error!(error = %e, "Failed to record fingerprint change");
                }

                match self.fetch_and_store(&fp).await {
                    Ok(record) => return Ok(record),
                    Err(e) => {
                        warn!(error = %e, "Fetch after fingerprint change failed");
                        if previous.is_within_grace(now, self.grace()) {
                            let mut stale = previous;
                            stale.sync_status = SyncStatus::Stale;
                            return Ok(stale);
                        }
                    }
                }

                return self.offline_license(&fp).await;
            }
        }

        match self.fetch_and_store(&fp).await {
            Ok(record) => Ok(record),
            Err(e) => {
                warn!(error = %e, "Initial license fetch failed, falling back to offline license");
                self.offline_license(&fp).await
            }
        }
    }

    /// Force a sync against the master, falling back to the grace-period
    /// cache and finally the offline development license. Never fails on
    /// master unreachability alone.
    pub async fn sync_from_master(&self) -> AppResult<LicenseRecord> {
        let fp = self.fingerprint.current()?;

        match self.fetch_and_store(&fp).await {
            Ok(record) => Ok(record),
            Err(fetch_err) => {
                warn!(error = %fetch_err, "License sync failed");

                if let Some(cached) = self.store.find_current(&fp).await? {
                    if cached.is_within_grace(Utc::now(), self.grace()) {
                        if cached.sync_status == SyncStatus::Synced {
                            if let Err(e) =
                                self.store.set_sync_status(cached.id, SyncStatus::Stale).await
                            {
                                warn!(error = %e, "Failed to mark license stale");
                            }
                        }
                        info!(
                            master_license_id = %cached.master_license_id,
                            "Serving grace-period license after failed sync"
                        );
                        let mut stale = cached;
                        stale.sync_status = SyncStatus::Stale;
                        return Ok(stale);
                    }
                }

                self.offline_license(&fp).await
            }
        }
    }

    /// Fetch with retry and persist as one all-or-nothing upsert; other
    /// rows bound to the fingerprint are invalidated afterwards.
    async fn fetch_and_store(&self, fingerprint: &str) -> AppResult<LicenseRecord> {
        let payload = self.fetch_with_retry(fingerprint).await?;
        let record = self
            .store
            .upsert(&upsert_from_payload(&payload, fingerprint))
            .await?;

        if let Err(e) = self.store.invalidate_others(fingerprint, record.id).await {
            warn!(error = %e, "Failed to invalidate superseded licenses");
        }

        info!(
            master_license_id = %record.master_license_id,
            organization = %record.organization_name,
            max_users = record.max_users,
            "License synced from master"
        );
        Ok(record)
    }

    /// Retry transient master failures (5xx/429) with a fixed delay; other
    /// failures go straight to the caller's fallback.
    async fn fetch_with_retry(&self, fingerprint: &str) -> Result<LicensePayload, FetchError> {
        let mut attempt: u32 = 0;
        loop {
            match self.master.fetch_license(fingerprint).await {
                Ok(payload) => return Ok(payload),
                Err(e) if e.is_retryable() && attempt < self.config.fetch_retries => {
                    attempt += 1;
                    warn!(
                        attempt = attempt,
                        max_attempts = self.config.fetch_retries,
                        error = %e,
                        "Retryable license fetch failure"
                    );
                    tokio::time::sleep(StdDuration::from_millis(self.config.retry_delay_ms)).await;
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Synthesize the offline development license so the server stays
    /// operable standalone. Small fixed quota, telephony only.
    async fn offline_license(&self, fingerprint: &str) -> AppResult<LicenseRecord> {
        warn!(
            max_users = self.config.offline.max_users,
            "Operating on the offline development license"
        );

        let now = Utc::now();
        self.store
            .upsert(&UpsertLicense {
                master_license_id: OFFLINE_MASTER_LICENSE_ID.to_string(),
                server_fingerprint: fingerprint.to_string(),
                license_key: None,
                organization_name: "Offline Development".to_string(),
                status: LicenseStatus::Active,
                max_users: self.config.offline.max_users,
                max_feature_users: self.config.offline.max_feature_users,
                issued_at: now,
                expires_at: None,
                features: FeatureSet::of(&[Feature::Telephony]),
                license_type_name: "offline-development".to_string(),
                last_sync: now,
                sync_status: SyncStatus::Synced,
            })
            .await
    }

    /// Kick off a non-blocking refresh; at most one runs at a time.
    fn spawn_background_refresh(self: &Arc<Self>) {
        if self.refresh_in_flight.swap(true, Ordering::SeqCst) {
            return;
        }

        let engine = Arc::clone(self);
        tokio::spawn(async move {
            if let Err(e) = engine.sync_from_master().await {
                warn!(error = %e, "Background license refresh failed");
            }
            engine.refresh_in_flight.store(false, Ordering::SeqCst);
        });
    }
}

/// Map a master payload onto the upsert row, parsing the feature bag once.
fn upsert_from_payload(payload: &LicensePayload, fingerprint: &str) -> UpsertLicense {
    UpsertLicense {
        master_license_id: payload.license_id.clone(),
        server_fingerprint: fingerprint.to_string(),
        license_key: payload.license_key.clone(),
        organization_name: payload.organization_name.clone(),
        status: payload.status,
        max_users: payload.max_users,
        max_feature_users: payload.max_feature_users.min(payload.max_users),
        issued_at: payload.issued_at,
        expires_at: payload.expires_at,
        features: FeatureSet::from_wire(&payload.features),
        license_type_name: payload.license_type_name.clone(),
        last_sync: Utc::now(),
        sync_status: SyncStatus::Synced,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::collections::BTreeMap;
    use std::sync::Mutex;

    use async_trait::async_trait;
    use chrono::DateTime;
    use sqlx::types::Json;
    use uuid::Uuid;

    use crate::fingerprint::FixedFingerprint;
    use crate::master::SessionActivity;

    /// In-memory license store fake.
    #[derive(Debug, Default)]
    struct FakeLicenseStore {
        rows: Mutex<Vec<LicenseRecord>>,
        fingerprint_changes: Mutex<Vec<(String, String, Uuid)>>,
    }

    impl FakeLicenseStore {
        fn with_row(self, row: LicenseRecord) -> Self {
            self.rows.lock().unwrap().push(row);
            self
        }
    }

    #[async_trait]
    impl LicenseStore for FakeLicenseStore {
        async fn find_by_id(&self, id: Uuid) -> AppResult<Option<LicenseRecord>> {
            Ok(self.rows.lock().unwrap().iter().find(|r| r.id == id).cloned())
        }

        async fn find_current(&self, fingerprint: &str) -> AppResult<Option<LicenseRecord>> {
            let rows = self.rows.lock().unwrap();
            let mut usable: Vec<_> = rows
                .iter()
                .filter(|r| {
                    r.server_fingerprint == fingerprint
                        && matches!(r.sync_status, SyncStatus::Synced | SyncStatus::Stale)
                        && r.status != LicenseStatus::Expired
                })
                .cloned()
                .collect();
            usable.sort_by_key(|r| std::cmp::Reverse(r.last_sync));
            Ok(usable.into_iter().next())
        }

        async fn find_latest(&self) -> AppResult<Option<LicenseRecord>> {
            let rows = self.rows.lock().unwrap();
            let mut usable: Vec<_> = rows
                .iter()
                .filter(|r| {
                    matches!(r.sync_status, SyncStatus::Synced | SyncStatus::Stale)
                        && r.status != LicenseStatus::Expired
                })
                .cloned()
                .collect();
            usable.sort_by_key(|r| std::cmp::Reverse(r.last_sync));
            Ok(usable.into_iter().next())
        }

        async fn upsert(&self, up: &UpsertLicense) -> AppResult<LicenseRecord> {
            let mut rows = self.rows.lock().unwrap();
            let now = Utc::now();

            if let Some(existing) = rows
                .iter_mut()
                .find(|r| r.master_license_id == up.master_license_id)
            {
                existing.server_fingerprint = up.server_fingerprint.clone();
                existing.license_key = up.license_key.clone();
                existing.organization_name = up.organization_name.clone();
                existing.status = up.status;
                existing.max_users = up.max_users;
                existing.max_feature_users = up.max_feature_users;
                existing.issued_at = up.issued_at;
                existing.expires_at = up.expires_at;
                existing.features = Json(up.features.clone());
                existing.license_type_name = up.license_type_name.clone();
                existing.last_sync = up.last_sync;
                existing.sync_status = up.sync_status;
                existing.updated_at = now;
                return Ok(existing.clone());
            }

            let record = LicenseRecord {
                id: Uuid::new_v4(),
                master_license_id: up.master_license_id.clone(),
                server_fingerprint: up.server_fingerprint.clone(),
                license_key: up.license_key.clone(),
                organization_name: up.organization_name.clone(),
                status: up.status,
                max_users: up.max_users,
                max_feature_users: up.max_feature_users,
                issued_at: up.issued_at,
                expires_at: up.expires_at,
                features: Json(up.features.clone()),
                license_type_name: up.license_type_name.clone(),
                last_sync: up.last_sync,
                sync_status: up.sync_status,
                created_at: now,
                updated_at: now,
            };
            rows.push(record.clone());
            Ok(record)
        }

        async fn set_sync_status(&self, id: Uuid, status: SyncStatus) -> AppResult<()> {
            let mut rows = self.rows.lock().unwrap();
            if let Some(row) = rows.iter_mut().find(|r| r.id == id) {
                row.sync_status = status;
            }
            Ok(())
        }

        async fn invalidate_others(&self, fingerprint: &str, keep_id: Uuid) -> AppResult<u64> {
            let mut rows = self.rows.lock().unwrap();
            let mut count = 0;
            for row in rows.iter_mut() {
                if row.server_fingerprint == fingerprint && row.id != keep_id {
                    row.sync_status = SyncStatus::Failed;
                    row.status = LicenseStatus::Invalid;
                    count += 1;
                }
            }
            Ok(count)
        }

        async fn mark_failed_stale_before(&self, cutoff: DateTime<Utc>) -> AppResult<u64> {
            let mut rows = self.rows.lock().unwrap();
            let mut count = 0;
            for row in rows.iter_mut() {
                if row.sync_status == SyncStatus::Stale && row.last_sync < cutoff {
                    row.sync_status = SyncStatus::Failed;
                    count += 1;
                }
            }
            Ok(count)
        }

        async fn delete_failed_unreferenced(&self, cutoff: DateTime<Utc>) -> AppResult<u64> {
            let mut rows = self.rows.lock().unwrap();
            let before = rows.len();
            rows.retain(|r| !(r.sync_status == SyncStatus::Failed && r.updated_at < cutoff));
            Ok((before - rows.len()) as u64)
        }

        async fn record_fingerprint_change(
            &self,
            old_fingerprint: &str,
            new_fingerprint: &str,
            _reason: &str,
            license_id: Uuid,
            _action_taken: &str,
        ) -> AppResult<()> {
            self.fingerprint_changes.lock().unwrap().push((
                old_fingerprint.to_string(),
                new_fingerprint.to_string(),
                license_id,
            ));
            Ok(())
        }
    }

    /// Master fake driven by a queue of canned responses.
    #[derive(Debug, Default)]
    struct FakeMaster {
        responses: Mutex<Vec<Result<LicensePayload, FetchError>>>,
        fetch_count: Mutex<u32>,
    }

    impl FakeMaster {
        fn responding(responses: Vec<Result<LicensePayload, FetchError>>) -> Self {
            // Stored reversed so pop() yields them in order.
            let mut responses = responses;
            responses.reverse();
            Self {
                responses: Mutex::new(responses),
                fetch_count: Mutex::new(0),
            }
        }

        fn fetches(&self) -> u32 {
            *self.fetch_count.lock().unwrap()
        }
    }

    #[async_trait]
    impl MasterApi for FakeMaster {
        async fn fetch_license(&self, _fingerprint: &str) -> Result<LicensePayload, FetchError> {
            *self.fetch_count.lock().unwrap() += 1;
            self.responses
                .lock()
                .unwrap()
                .pop()
                .unwrap_or(Err(FetchError::Network("no canned response".to_string())))
        }

        async fn notify_session_activity(
            &self,
            _activity: &SessionActivity,
        ) -> Result<(), FetchError> {
            Ok(())
        }
    }

    fn payload(license_id: &str) -> LicensePayload {
        let mut features = BTreeMap::new();
        features.insert("telephony".to_string(), true);
        features.insert("recording".to_string(), true);
        features.insert("premium".to_string(), true);

        LicensePayload {
            license_id: license_id.to_string(),
            organization_name: "Acme Telecom".to_string(),
            license_key: Some("signed-blob".to_string()),
            status: LicenseStatus::Active,
            max_users: 25,
            max_feature_users: 5,
            issued_at: Utc::now() - Duration::days(30),
            expires_at: Some(Utc::now() + Duration::days(335)),
            features,
            license_type_name: "standard".to_string(),
        }
    }

    fn config() -> LicenseConfig {
        LicenseConfig {
            master_url: "http://master.test".to_string(),
            master_api_key: "key".to_string(),
            fetch_timeout_seconds: 5,
            fetch_retries: 2,
            retry_delay_ms: 1,
            ttl_minutes: 60,
            grace_period_hours: 72,
            resync_interval_minutes: 30,
            offline: Default::default(),
        }
    }

    fn engine(
        store: FakeLicenseStore,
        master: FakeMaster,
    ) -> (Arc<LicenseSyncEngine>, Arc<FakeLicenseStore>, Arc<FakeMaster>) {
        let store = Arc::new(store);
        let master = Arc::new(master);
        let engine = Arc::new(LicenseSyncEngine::new(
            Arc::clone(&store) as Arc<dyn LicenseStore>,
            Arc::clone(&master) as Arc<dyn MasterApi>,
            Arc::new(FixedFingerprint("fp-host".to_string())),
            config(),
        ));
        (engine, store, master)
    }

    #[tokio::test]
    async fn test_first_fetch_upserts_and_roundtrips() {
        let wire = payload("lic-200");
        let (engine, _store, _master) =
            engine(FakeLicenseStore::default(), FakeMaster::responding(vec![Ok(wire.clone())]));

        let record = engine.get_current_license().await.unwrap();
        assert_eq!(record.master_license_id, "lic-200");
        assert_eq!(record.max_users, wire.max_users);
        assert_eq!(record.expires_at, wire.expires_at);
        assert!(record.feature_enabled(Feature::Telephony));
        assert!(record.feature_enabled(Feature::Premium));
        assert!(!record.feature_enabled(Feature::Conference));

        // A second read serves the cached copy without another fetch.
        let again = engine.get_current_license().await.unwrap();
        assert_eq!(again.id, record.id);
        assert_eq!(again.features, record.features);
    }

    #[tokio::test]
    async fn test_retries_on_retryable_status_then_succeeds() {
        let (engine, _store, master) = engine(
            FakeLicenseStore::default(),
            FakeMaster::responding(vec![
                Err(FetchError::Status(503)),
                Err(FetchError::Status(429)),
                Ok(payload("lic-200")),
            ]),
        );

        let record = engine.get_current_license().await.unwrap();
        assert_eq!(record.master_license_id, "lic-200");
        assert_eq!(master.fetches(), 3);
    }

    #[tokio::test]
    async fn test_non_retryable_failure_with_no_cache_yields_offline_license() {
        let (engine, _store, master) = engine(
            FakeLicenseStore::default(),
            FakeMaster::responding(vec![Err(FetchError::Status(404))]),
        );

        let record = engine.get_current_license().await.unwrap();
        assert_eq!(record.master_license_id, OFFLINE_MASTER_LICENSE_ID);
        assert_eq!(record.max_users, 5);
        assert!(record.feature_enabled(Feature::Telephony));
        assert!(!record.feature_enabled(Feature::Premium));
        assert!(!record.feature_enabled(Feature::Recording));
        assert_eq!(master.fetches(), 1);
    }

    #[tokio::test]
    async fn test_fetch_failure_within_grace_serves_stale_cache() {
        let wire = payload("lic-200");
        let (engine, _store, _master) =
            engine(FakeLicenseStore::default(), FakeMaster::responding(vec![Ok(wire)]));

        let first = engine.get_current_license().await.unwrap();

        // Master now unreachable; forced sync must degrade to the cache.
        let record = engine.sync_from_master().await.unwrap();
        assert_eq!(record.id, first.id);
        assert_eq!(record.sync_status, SyncStatus::Stale);
    }

    #[tokio::test]
    async fn test_fingerprint_change_is_audited_and_refetched() {
        let mut old = LicenseRecord {
            id: Uuid::new_v4(),
            master_license_id: "lic-200".to_string(),
            server_fingerprint: "fp-old".to_string(),
            license_key: None,
            organization_name: "Acme Telecom".to_string(),
            status: LicenseStatus::Active,
            max_users: 25,
            max_feature_users: 5,
            issued_at: Utc::now(),
            expires_at: None,
            features: Json(FeatureSet::of(&[Feature::Telephony])),
            license_type_name: "standard".to_string(),
            last_sync: Utc::now(),
            sync_status: SyncStatus::Synced,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        };
        old.last_sync = Utc::now() - Duration::minutes(5);

        let store = FakeLicenseStore::default().with_row(old.clone());
        let (engine, store, _master) =
            engine(store, FakeMaster::responding(vec![Ok(payload("lic-200"))]));

        let record = engine.get_current_license().await.unwrap();
        assert_eq!(record.server_fingerprint, "fp-host");

        let changes = store.fingerprint_changes.lock().unwrap();
        assert_eq!(changes.len(), 1);
        assert_eq!(changes[0].0, "fp-old");
        assert_eq!(changes[0].1, "fp-host");
        assert_eq!(changes[0].2, old.id);
    }

    #[tokio::test]
    async fn test_expired_row_is_never_current() {
        let expired = LicenseRecord {
            id: Uuid::new_v4(),
            master_license_id: "lic-dead".to_string(),
            server_fingerprint: "fp-host".to_string(),
            license_key: None,
            organization_name: "Acme Telecom".to_string(),
            status: LicenseStatus::Expired,
            max_users: 25,
            max_feature_users: 5,
            issued_at: Utc::now(),
            expires_at: Some(Utc::now() - Duration::days(1)),
            features: Json(FeatureSet::of(&[Feature::Telephony])),
            license_type_name: "standard".to_string(),
            last_sync: Utc::now(),
            sync_status: SyncStatus::Synced,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        };

        let store = FakeLicenseStore::default().with_row(expired);
        let (engine, _store, _master) = engine(
            store,
            FakeMaster::responding(vec![Err(FetchError::Network("down".to_string()))]),
        );

        // The expired row must not be served; with the master down the
        // engine falls through to the offline license.
        let record = engine.get_current_license().await.unwrap();
        assert_eq!(record.master_license_id, OFFLINE_MASTER_LICENSE_ID);
    }

    #[tokio::test]
    async fn test_feature_quota_is_capped_by_max_users() {
        let mut wire = payload("lic-200");
        wire.max_users = 3;
        wire.max_feature_users = 10;

        let (engine, _store, _master) =
            engine(FakeLicenseStore::default(), FakeMaster::responding(vec![Ok(wire)]));

        let record = engine.get_current_license().await.unwrap();
        assert_eq!(record.max_feature_users, 3);
    }
}
