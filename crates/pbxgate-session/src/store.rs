//! Session store seam.
//!
//! The admission controller and the reconciler talk to the durable
//! session store through this trait so unit tests can inject an
//! in-memory fake.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use pbxgate_core::result::AppResult;
use pbxgate_database::repositories::SessionRepository;
use pbxgate_entity::license::Feature;
use pbxgate_entity::session::{CreateSession, SessionRecord, SessionStatus};

/// Durable store for session rows.
#[async_trait]
pub trait SessionStore: Send + Sync + std::fmt::Debug {
    /// Persist a new session row.
    async fn create(&self, data: &CreateSession) -> AppResult<SessionRecord>;

    /// Find a session by id.
    async fn find_by_id(&self, id: Uuid) -> AppResult<Option<SessionRecord>>;

    /// Find the active session for a principal/feature pair.
    async fn find_active_by_user_feature(
        &self,
        user_id: Uuid,
        feature: Feature,
    ) -> AppResult<Option<SessionRecord>>;

    /// List all active sessions for a principal.
    async fn find_active_by_user(&self, user_id: Uuid) -> AppResult<Vec<SessionRecord>>;

    /// Count active sessions for a license/feature pair.
    async fn count_active_by_license_feature(
        &self,
        license_id: Uuid,
        feature: Feature,
    ) -> AppResult<i64>;

    /// Whether the session row is still active.
    async fn exists_active(&self, id: Uuid) -> AppResult<bool>;

    /// Refresh heartbeat and expiry. Returns whether an active row matched.
    async fn touch_heartbeat(&self, id: Uuid, expires_at: DateTime<Utc>) -> AppResult<bool>;

    /// Move an active row to a terminal status; no-op when already ended.
    async fn mark_ended(&self, id: Uuid, status: SessionStatus) -> AppResult<bool>;

    /// End every active session for a principal, returning the ended rows.
    async fn end_all_for_user(&self, user_id: Uuid) -> AppResult<Vec<SessionRecord>>;

    /// Delete rows whose license no longer exists.
    async fn delete_orphaned_license_refs(&self) -> AppResult<u64>;

    /// Expire overdue active rows, returning them.
    async fn expire_overdue(
        &self,
        ceiling_cutoff: DateTime<Utc>,
        heartbeat_cutoff: DateTime<Utc>,
        startup_cutoff: DateTime<Utc>,
    ) -> AppResult<Vec<SessionRecord>>;
}

/// PostgreSQL-backed session store.
#[derive(Debug, Clone)]
pub struct PgSessionStore {
    repo: SessionRepository,
}

impl PgSessionStore {
    /// Create a new store over the repository.
    pub fn new(repo: SessionRepository) -> Self {
        Self { repo }
    }
}

#[async_trait]
impl SessionStore for PgSessionStore {
    async fn create(&self, data: &CreateSession) -> AppResult<SessionRecord> {
        self.repo.create(data).await
    }

    async fn find_by_id(&self, id: Uuid) -> AppResult<Option<SessionRecord>> {
        self.repo.find_by_id(id).await
    }

    async fn find_active_by_user_feature(
        &self,
        user_id: Uuid,
        feature: Feature,
    ) -> AppResult<Option<SessionRecord>> {
        self.repo.find_active_by_user_feature(user_id, feature).await
    }

    async fn find_active_by_user(&self, user_id: Uuid) -> AppResult<Vec<SessionRecord>> {
        self.repo.find_active_by_user(user_id).await
    }

    async fn count_active_by_license_feature(
        &self,
        license_id: Uuid,
        feature: Feature,
    ) -> AppResult<i64> {
        self.repo
            .count_active_by_license_feature(license_id, feature)
            .await
    }

    async fn exists_active(&self, id: Uuid) -> AppResult<bool> {
        self.repo.exists_active(id).await
    }

    async fn touch_heartbeat(&self, id: Uuid, expires_at: DateTime<Utc>) -> AppResult<bool> {
        self.repo.touch_heartbeat(id, expires_at).await
    }

    async fn mark_ended(&self, id: Uuid, status: SessionStatus) -> AppResult<bool> {
        self.repo.mark_ended(id, status).await
    }

    async fn end_all_for_user(&self, user_id: Uuid) -> AppResult<Vec<SessionRecord>> {
        self.repo.end_all_for_user(user_id).await
    }

    async fn delete_orphaned_license_refs(&self) -> AppResult<u64> {
        self.repo.delete_orphaned_license_refs().await
    }

    async fn expire_overdue(
        &self,
        ceiling_cutoff: DateTime<Utc>,
        heartbeat_cutoff: DateTime<Utc>,
        startup_cutoff: DateTime<Utc>,
    ) -> AppResult<Vec<SessionRecord>> {
        self.repo
            .expire_overdue(ceiling_cutoff, heartbeat_cutoff, startup_cutoff)
            .await
    }
}
