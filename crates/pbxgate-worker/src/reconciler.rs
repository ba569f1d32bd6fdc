//! Cache reconciliation service.
//!
//! Periodic background convergence of the atomic cache and the durable
//! stores: orphaned session rows, dead-but-active sessions, cache
//! entries without a durable counterpart, and licenses past their grace
//! period. Every step logs and continues past failures; a reconciliation
//! pass never raises.

use std::sync::Arc;
use std::time::Duration as StdDuration;

use chrono::{Duration, Utc};
use tokio::sync::watch;
use tokio::time;
use tracing::{error, info, warn};

use pbxgate_cache::SessionCache;
use pbxgate_core::config::license::LicenseConfig;
use pbxgate_core::config::session::SessionConfig;
use pbxgate_core::config::worker::WorkerConfig;
use pbxgate_license::LicenseStore;
use pbxgate_session::SessionStore;

/// Counters from one reconciliation pass.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct PassSummary {
    /// Session rows deleted because their license vanished.
    pub orphan_rows_deleted: u64,
    /// Active rows expired by ceiling/heartbeat/startup-grace checks.
    pub sessions_expired: u64,
    /// Cache entries released for lack of an active durable row.
    pub cache_entries_released: u64,
    /// Stale licenses marked failed.
    pub licenses_failed: u64,
    /// Failed licenses physically deleted.
    pub licenses_deleted: u64,
}

/// Reconciles the atomic session cache with the durable stores.
pub struct ReconciliationService {
    /// Durable session store.
    sessions: Arc<dyn SessionStore>,
    /// Durable license store.
    licenses: Arc<dyn LicenseStore>,
    /// Atomic session cache.
    cache: Arc<dyn SessionCache>,
    /// Session timing windows.
    session_config: SessionConfig,
    /// License grace period.
    license_config: LicenseConfig,
    /// Worker intervals and retention.
    worker_config: WorkerConfig,
}

impl std::fmt::Debug for ReconciliationService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReconciliationService").finish()
    }
}

impl ReconciliationService {
    /// Create a new reconciliation service.
    pub fn new(
        sessions: Arc<dyn SessionStore>,
        licenses: Arc<dyn LicenseStore>,
        cache: Arc<dyn SessionCache>,
        session_config: SessionConfig,
        license_config: LicenseConfig,
        worker_config: WorkerConfig,
    ) -> Self {
        Self {
            sessions,
            licenses,
            cache,
            session_config,
            license_config,
            worker_config,
        }
    }

    /// Run the reconciliation loop until the cancellation channel fires.
    pub async fn run(&self, mut cancel: watch::Receiver<bool>) {
        let interval_duration =
            StdDuration::from_secs(self.worker_config.reconcile_interval_minutes * 60);
        info!(
            interval_minutes = self.worker_config.reconcile_interval_minutes,
            "Reconciliation service started"
        );

        let mut interval = time::interval(interval_duration);
        interval.tick().await;

        loop {
            tokio::select! {
                _ = interval.tick() => {
                    let summary = self.run_pass().await;
                    info!(
                        orphan_rows = summary.orphan_rows_deleted,
                        expired = summary.sessions_expired,
                        cache_released = summary.cache_entries_released,
                        licenses_failed = summary.licenses_failed,
                        licenses_deleted = summary.licenses_deleted,
                        "Reconciliation pass completed"
                    );
                }
                _ = cancel.changed() => {
                    if *cancel.borrow() {
                        info!("Reconciliation service shutting down");
                        break;
                    }
                }
            }
        }
    }

    /// Run one pass at startup to recover from crashes before serving.
    pub async fn startup_recovery(&self) {
        info!("Running startup reconciliation");
        let summary = self.run_pass().await;
        if summary != PassSummary::default() {
            info!(?summary, "Startup reconciliation corrected drift");
        } else {
            info!("Startup reconciliation: stores are consistent");
        }
    }

    /// One reconciliation pass. Steps run in order; a failing step logs
    /// and the pass continues with the next one.
    pub async fn run_pass(&self) -> PassSummary {
        let mut summary = PassSummary::default();
        let now = Utc::now();

        // Step 1: session rows whose license vanished.
        match self.sessions.delete_orphaned_license_refs().await {
            Ok(count) => {
                summary.orphan_rows_deleted = count;
                if count > 0 {
                    warn!(count = count, "Deleted session rows with missing licenses");
                }
            }
            Err(e) => error!(error = %e, "Orphaned session cleanup failed"),
        }

        // Step 2: active rows that are dead by any timing window.
        let ceiling_cutoff =
            now - Duration::hours(self.session_config.absolute_ceiling_hours as i64);
        let heartbeat_cutoff =
            now - Duration::minutes(self.session_config.heartbeat_timeout_minutes as i64);
        let startup_cutoff =
            now - Duration::minutes(self.session_config.startup_grace_minutes as i64);

        match self
            .sessions
            .expire_overdue(ceiling_cutoff, heartbeat_cutoff, startup_cutoff)
            .await
        {
            Ok(expired) => {
                summary.sessions_expired = expired.len() as u64;
                for row in &expired {
                    info!(
                        session_id = %row.id,
                        user_id = %row.user_id,
                        feature = %row.feature,
                        "Expired dead session"
                    );
                }
            }
            Err(e) => error!(error = %e, "Session expiry sweep failed"),
        }

        // Step 3: cache entries without an active durable row. Covers the
        // rows just expired in step 2, so each dead session's counter is
        // decremented exactly once, here.
        match self.cache.scan_entries().await {
            Ok(entries) => {
                for entry in entries {
                    let active = match self.sessions.exists_active(entry.session_id).await {
                        Ok(active) => active,
                        Err(e) => {
                            error!(
                                session_id = %entry.session_id,
                                error = %e,
                                "Failed to check durable row, skipping entry"
                            );
                            continue;
                        }
                    };
                    if active {
                        continue;
                    }

                    match self
                        .cache
                        .release(entry.session_id, entry.user_id, entry.feature, entry.license_id)
                        .await
                    {
                        Ok(outcome) => {
                            if outcome.removed {
                                summary.cache_entries_released += 1;
                                warn!(
                                    session_id = %entry.session_id,
                                    "Released orphaned cache entry"
                                );
                            }
                        }
                        Err(e) => {
                            error!(
                                session_id = %entry.session_id,
                                error = %e,
                                "Failed to release orphaned cache entry"
                            );
                        }
                    }
                }
            }
            Err(e) => error!(error = %e, "Cache scan failed"),
        }

        // Step 4: licenses past grace, then long-failed unreferenced rows.
        let grace_cutoff = now - Duration::hours(self.license_config.grace_period_hours as i64);
        match self.licenses.mark_failed_stale_before(grace_cutoff).await {
            Ok(count) => {
                summary.licenses_failed = count;
                if count > 0 {
                    warn!(count = count, "Marked stale licenses failed past grace period");
                }
            }
            Err(e) => error!(error = %e, "License failure sweep failed"),
        }

        let retention_cutoff =
            now - Duration::hours(self.worker_config.failed_license_retention_hours as i64);
        match self.licenses.delete_failed_unreferenced(retention_cutoff).await {
            Ok(count) => {
                summary.licenses_deleted = count;
                if count > 0 {
                    info!(count = count, "Deleted long-failed licenses");
                }
            }
            Err(e) => error!(error = %e, "License purge failed"),
        }

        summary
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::collections::HashSet;
    use std::sync::Mutex;

    use async_trait::async_trait;
    use chrono::DateTime;
    use sqlx::types::Json;
    use uuid::Uuid;

    use pbxgate_cache::session::memory::MemorySessionCache;
    use pbxgate_cache::SessionEntry;
    use pbxgate_core::result::AppResult;
    use pbxgate_entity::license::{
        Feature, FeatureSet, LicenseRecord, LicenseStatus, SyncStatus, UpsertLicense,
    };
    use pbxgate_entity::session::{principal_id, CreateSession, SessionRecord, SessionStatus};

    #[derive(Debug, Default)]
    struct FakeSessionStore {
        rows: Mutex<Vec<SessionRecord>>,
        valid_licenses: Mutex<HashSet<Uuid>>,
    }

    impl FakeSessionStore {
        fn insert(&self, row: SessionRecord) {
            self.rows.lock().unwrap().push(row);
        }

        fn allow_license(&self, id: Uuid) {
            self.valid_licenses.lock().unwrap().insert(id);
        }

        fn row(&self, id: Uuid) -> Option<SessionRecord> {
            self.rows.lock().unwrap().iter().find(|r| r.id == id).cloned()
        }
    }

    #[async_trait]
    impl SessionStore for FakeSessionStore {
        async fn create(&self, data: &CreateSession) -> AppResult<SessionRecord> {
            let now = Utc::now();
            let row = SessionRecord {
                id: data.id,
                session_token: data.session_token.clone(),
                user_id: data.user_id,
                username: data.username.clone(),
                feature: data.feature,
                license_id: data.license_id,
                master_license_id: data.master_license_id.clone(),
                client_fingerprint: data.client_fingerprint.clone(),
                ip_address: None,
                user_agent: None,
                status: SessionStatus::Active,
                last_heartbeat: Some(now),
                expires_at: data.expires_at,
                created_at: now,
                ended_at: None,
            };
            self.insert(row.clone());
            Ok(row)
        }

        async fn find_by_id(&self, id: Uuid) -> AppResult<Option<SessionRecord>> {
            Ok(self.row(id))
        }

        async fn find_active_by_user_feature(
            &self,
            user_id: Uuid,
            feature: Feature,
        ) -> AppResult<Option<SessionRecord>> {
            Ok(self
                .rows
                .lock()
                .unwrap()
                .iter()
                .find(|r| r.user_id == user_id && r.feature == feature && r.is_active())
                .cloned())
        }

        async fn find_active_by_user(&self, user_id: Uuid) -> AppResult<Vec<SessionRecord>> {
            Ok(self
                .rows
                .lock()
                .unwrap()
                .iter()
                .filter(|r| r.user_id == user_id && r.is_active())
                .cloned()
                .collect())
        }

        async fn count_active_by_license_feature(
            &self,
            license_id: Uuid,
            feature: Feature,
        ) -> AppResult<i64> {
            Ok(self
                .rows
                .lock()
                .unwrap()
                .iter()
                .filter(|r| r.license_id == license_id && r.feature == feature && r.is_active())
                .count() as i64)
        }

        async fn exists_active(&self, id: Uuid) -> AppResult<bool> {
            Ok(self
                .rows
                .lock()
                .unwrap()
                .iter()
                .any(|r| r.id == id && r.is_active()))
        }

        async fn touch_heartbeat(&self, id: Uuid, expires_at: DateTime<Utc>) -> AppResult<bool> {
            let mut rows = self.rows.lock().unwrap();
            match rows.iter_mut().find(|r| r.id == id && r.status == SessionStatus::Active) {
                Some(row) => {
                    row.last_heartbeat = Some(Utc::now());
                    row.expires_at = expires_at;
                    Ok(true)
                }
                None => Ok(false),
            }
        }

        async fn mark_ended(&self, id: Uuid, status: SessionStatus) -> AppResult<bool> {
            let mut rows = self.rows.lock().unwrap();
            match rows.iter_mut().find(|r| r.id == id && r.status == SessionStatus::Active) {
                Some(row) => {
                    row.status = status;
                    row.ended_at = Some(Utc::now());
                    Ok(true)
                }
                None => Ok(false),
            }
        }

        async fn end_all_for_user(&self, _user_id: Uuid) -> AppResult<Vec<SessionRecord>> {
            Ok(Vec::new())
        }

        async fn delete_orphaned_license_refs(&self) -> AppResult<u64> {
            let valid = self.valid_licenses.lock().unwrap().clone();
            let mut rows = self.rows.lock().unwrap();
            let before = rows.len();
            rows.retain(|r| valid.contains(&r.license_id));
            Ok((before - rows.len()) as u64)
        }

        async fn expire_overdue(
            &self,
            ceiling_cutoff: DateTime<Utc>,
            heartbeat_cutoff: DateTime<Utc>,
            startup_cutoff: DateTime<Utc>,
        ) -> AppResult<Vec<SessionRecord>> {
            let mut rows = self.rows.lock().unwrap();
            let mut expired = Vec::new();
            for row in rows.iter_mut() {
                if row.status != SessionStatus::Active {
                    continue;
                }
                let dead = row.created_at < ceiling_cutoff
                    || row.last_heartbeat.is_some_and(|hb| hb < heartbeat_cutoff)
                    || (row.last_heartbeat.is_none() && row.created_at < startup_cutoff);
                if dead {
                    row.status = SessionStatus::Expired;
                    row.ended_at = Some(Utc::now());
                    expired.push(row.clone());
                }
            }
            Ok(expired)
        }
    }

    #[derive(Debug, Default)]
    struct FakeLicenseStore {
        rows: Mutex<Vec<LicenseRecord>>,
    }

    impl FakeLicenseStore {
        fn insert(&self, row: LicenseRecord) {
            self.rows.lock().unwrap().push(row);
        }

        fn row(&self, id: Uuid) -> Option<LicenseRecord> {
            self.rows.lock().unwrap().iter().find(|r| r.id == id).cloned()
        }

        fn len(&self) -> usize {
            self.rows.lock().unwrap().len()
        }
    }

    #[async_trait]
    impl LicenseStore for FakeLicenseStore {
        async fn find_by_id(&self, id: Uuid) -> AppResult<Option<LicenseRecord>> {
            Ok(self.row(id))
        }

        async fn find_current(&self, _fingerprint: &str) -> AppResult<Option<LicenseRecord>> {
            Ok(None)
        }

        async fn find_latest(&self) -> AppResult<Option<LicenseRecord>> {
            Ok(None)
        }

        async fn upsert(&self, _up: &UpsertLicense) -> AppResult<LicenseRecord> {
            unreachable!("reconciler never upserts licenses")
        }

        async fn set_sync_status(&self, id: Uuid, status: SyncStatus) -> AppResult<()> {
            let mut rows = self.rows.lock().unwrap();
            if let Some(row) = rows.iter_mut().find(|r| r.id == id) {
                row.sync_status = status;
            }
            Ok(())
        }

        async fn invalidate_others(&self, _fingerprint: &str, _keep_id: Uuid) -> AppResult<u64> {
            Ok(0)
        }

        async fn mark_failed_stale_before(&self, cutoff: DateTime<Utc>) -> AppResult<u64> {
            let mut rows = self.rows.lock().unwrap();
            let mut count = 0;
            for row in rows.iter_mut() {
                if row.sync_status == SyncStatus::Stale && row.last_sync < cutoff {
                    row.sync_status = SyncStatus::Failed;
                    row.updated_at = Utc::now();
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
            _old_fingerprint: &str,
            _new_fingerprint: &str,
            _reason: &str,
            _license_id: Uuid,
            _action_taken: &str,
        ) -> AppResult<()> {
            Ok(())
        }
    }

    fn license_row(sync_status: SyncStatus, last_sync: DateTime<Utc>) -> LicenseRecord {
        LicenseRecord {
            id: Uuid::new_v4(),
            master_license_id: Uuid::new_v4().to_string(),
            server_fingerprint: "fp-host".to_string(),
            license_key: None,
            organization_name: "Acme Telecom".to_string(),
            status: LicenseStatus::Active,
            max_users: 10,
            max_feature_users: 2,
            issued_at: last_sync,
            expires_at: None,
            features: Json(FeatureSet::of(&[Feature::Telephony])),
            license_type_name: "standard".to_string(),
            last_sync,
            sync_status,
            created_at: last_sync,
            updated_at: last_sync,
        }
    }

    fn session_row(
        license_id: Uuid,
        username: &str,
        created_at: DateTime<Utc>,
        last_heartbeat: Option<DateTime<Utc>>,
    ) -> SessionRecord {
        SessionRecord {
            id: Uuid::new_v4(),
            session_token: Uuid::new_v4().to_string(),
            user_id: principal_id(username),
            username: username.to_string(),
            feature: Feature::Telephony,
            license_id,
            master_license_id: "lic-200".to_string(),
            client_fingerprint: format!("fp-{username}"),
            ip_address: None,
            user_agent: None,
            status: SessionStatus::Active,
            last_heartbeat,
            expires_at: Utc::now() + Duration::hours(1),
            created_at,
            ended_at: None,
        }
    }

    fn service(
        sessions: Arc<FakeSessionStore>,
        licenses: Arc<FakeLicenseStore>,
        cache: Arc<MemorySessionCache>,
    ) -> ReconciliationService {
        ReconciliationService::new(
            sessions,
            licenses,
            cache,
            SessionConfig {
                ttl_minutes: 60,
                heartbeat_timeout_minutes: 45,
                absolute_ceiling_hours: 24,
                startup_grace_minutes: 10,
            },
            LicenseConfig {
                master_url: "http://master.test".to_string(),
                master_api_key: String::new(),
                fetch_timeout_seconds: 5,
                fetch_retries: 0,
                retry_delay_ms: 1,
                ttl_minutes: 60,
                grace_period_hours: 72,
                resync_interval_minutes: 30,
                offline: Default::default(),
            },
            WorkerConfig {
                enabled: true,
                reconcile_interval_minutes: 15,
                failed_license_retention_hours: 24,
            },
        )
    }

    #[tokio::test]
    async fn test_stale_heartbeat_session_is_expired_and_released_once() {
        let sessions = Arc::new(FakeSessionStore::default());
        let licenses = Arc::new(FakeLicenseStore::default());
        let cache = Arc::new(MemorySessionCache::new());

        let license_id = Uuid::new_v4();
        sessions.allow_license(license_id);

        // Active row with a heartbeat 90 minutes in the past, with its
        // cache entry still present.
        let row = session_row(
            license_id,
            "alice",
            Utc::now() - Duration::hours(2),
            Some(Utc::now() - Duration::minutes(90)),
        );
        sessions.insert(row.clone());

        let entry = SessionEntry {
            session_id: row.id,
            user_id: row.user_id,
            username: row.username.clone(),
            feature: row.feature,
            license_id,
            client_fingerprint: row.client_fingerprint.clone(),
            ip_address: None,
            user_agent: None,
            created_at: row.created_at,
            last_heartbeat: Utc::now(),
        };
        cache
            .admit(&entry, 10, StdDuration::from_secs(3600))
            .await
            .unwrap();
        assert_eq!(
            cache.feature_count(license_id, Feature::Telephony).await.unwrap(),
            1
        );

        let svc = service(Arc::clone(&sessions), licenses, Arc::clone(&cache));
        let summary = svc.run_pass().await;

        assert_eq!(summary.sessions_expired, 1);
        assert_eq!(summary.cache_entries_released, 1);
        assert_eq!(sessions.row(row.id).unwrap().status, SessionStatus::Expired);
        assert!(cache.entry(row.id).await.unwrap().is_none());
        assert_eq!(
            cache.feature_count(license_id, Feature::Telephony).await.unwrap(),
            0
        );

        // A second pass finds nothing left to repair.
        let again = svc.run_pass().await;
        assert_eq!(again, PassSummary::default());
    }

    #[tokio::test]
    async fn test_healthy_session_is_untouched() {
        let sessions = Arc::new(FakeSessionStore::default());
        let licenses = Arc::new(FakeLicenseStore::default());
        let cache = Arc::new(MemorySessionCache::new());

        let license_id = Uuid::new_v4();
        sessions.allow_license(license_id);

        let row = session_row(license_id, "alice", Utc::now(), Some(Utc::now()));
        sessions.insert(row.clone());

        let entry = SessionEntry {
            session_id: row.id,
            user_id: row.user_id,
            username: row.username.clone(),
            feature: row.feature,
            license_id,
            client_fingerprint: row.client_fingerprint.clone(),
            ip_address: None,
            user_agent: None,
            created_at: row.created_at,
            last_heartbeat: Utc::now(),
        };
        cache
            .admit(&entry, 10, StdDuration::from_secs(3600))
            .await
            .unwrap();

        let svc = service(Arc::clone(&sessions), licenses, Arc::clone(&cache));
        let summary = svc.run_pass().await;

        assert_eq!(summary, PassSummary::default());
        assert_eq!(sessions.row(row.id).unwrap().status, SessionStatus::Active);
        assert!(cache.entry(row.id).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_orphaned_cache_entry_is_released() {
        let sessions = Arc::new(FakeSessionStore::default());
        let licenses = Arc::new(FakeLicenseStore::default());
        let cache = Arc::new(MemorySessionCache::new());

        let license_id = Uuid::new_v4();
        let entry = SessionEntry {
            session_id: Uuid::new_v4(),
            user_id: principal_id("ghost"),
            username: "ghost".to_string(),
            feature: Feature::Telephony,
            license_id,
            client_fingerprint: "fp-ghost".to_string(),
            ip_address: None,
            user_agent: None,
            created_at: Utc::now(),
            last_heartbeat: Utc::now(),
        };
        cache
            .admit(&entry, 10, StdDuration::from_secs(3600))
            .await
            .unwrap();

        let svc = service(sessions, licenses, Arc::clone(&cache));
        let summary = svc.run_pass().await;

        assert_eq!(summary.cache_entries_released, 1);
        assert!(cache.entry(entry.session_id).await.unwrap().is_none());
        assert_eq!(
            cache.feature_count(license_id, Feature::Telephony).await.unwrap(),
            0
        );
    }

    #[tokio::test]
    async fn test_orphaned_session_rows_are_deleted() {
        let sessions = Arc::new(FakeSessionStore::default());
        let licenses = Arc::new(FakeLicenseStore::default());
        let cache = Arc::new(MemorySessionCache::new());

        let kept_license = Uuid::new_v4();
        sessions.allow_license(kept_license);

        sessions.insert(session_row(kept_license, "alice", Utc::now(), Some(Utc::now())));
        let orphan = session_row(Uuid::new_v4(), "bob", Utc::now(), Some(Utc::now()));
        sessions.insert(orphan.clone());

        let svc = service(Arc::clone(&sessions), licenses, cache);
        let summary = svc.run_pass().await;

        assert_eq!(summary.orphan_rows_deleted, 1);
        assert!(sessions.row(orphan.id).is_none());
    }

    #[tokio::test]
    async fn test_license_grace_and_retention_sweep() {
        let sessions = Arc::new(FakeSessionStore::default());
        let licenses = Arc::new(FakeLicenseStore::default());
        let cache = Arc::new(MemorySessionCache::new());

        // Stale past the 72h grace period: must flip to failed.
        let stale = license_row(SyncStatus::Stale, Utc::now() - Duration::hours(100));
        licenses.insert(stale.clone());

        // Failed and older than the 24h retention: must be deleted.
        let mut dead = license_row(SyncStatus::Failed, Utc::now() - Duration::days(10));
        dead.updated_at = Utc::now() - Duration::days(9);
        licenses.insert(dead.clone());

        // Freshly stale: untouched.
        let fresh = license_row(SyncStatus::Stale, Utc::now() - Duration::hours(1));
        licenses.insert(fresh.clone());

        let svc = service(sessions, Arc::clone(&licenses), cache);
        let summary = svc.run_pass().await;

        assert_eq!(summary.licenses_failed, 1);
        assert_eq!(summary.licenses_deleted, 1);
        assert_eq!(licenses.row(stale.id).unwrap().sync_status, SyncStatus::Failed);
        assert!(licenses.row(dead.id).is_none());
        assert_eq!(licenses.row(fresh.id).unwrap().sync_status, SyncStatus::Stale);
        assert_eq!(licenses.len(), 2);
    }
}
