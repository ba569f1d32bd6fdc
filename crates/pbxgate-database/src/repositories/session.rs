//! Session repository implementation.

use chrono::{DateTime, Utc};
use sqlx::PgPool;
use uuid::Uuid;

use pbxgate_core::error::{AppError, ErrorKind};
use pbxgate_core::result::AppResult;
use pbxgate_entity::license::Feature;
use pbxgate_entity::session::{CreateSession, SessionRecord, SessionStatus};

/// Repository for durable session rows.
#[derive(Debug, Clone)]
pub struct SessionRepository {
    pool: PgPool,
}

impl SessionRepository {
    /// Create a new session repository.
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Find a session by id.
    pub async fn find_by_id(&self, id: Uuid) -> AppResult<Option<SessionRecord>> {
        sqlx::query_as::<_, SessionRecord>("SELECT * FROM sessions WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| AppError::with_source(ErrorKind::Database, "Failed to find session", e))
    }

    /// Find the active session for a principal/feature pair, if any.
    pub async fn find_active_by_user_feature(
        &self,
        user_id: Uuid,
        feature: Feature,
    ) -> AppResult<Option<SessionRecord>> {
        sqlx::query_as::<_, SessionRecord>(
            "SELECT * FROM sessions \
             WHERE user_id = $1 AND feature = $2 AND status = 'active' AND expires_at > NOW() \
             ORDER BY created_at DESC LIMIT 1",
        )
        .bind(user_id)
        .bind(feature)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| AppError::with_source(ErrorKind::Database, "Failed to find active session", e))
    }

    /// List all active sessions for a principal.
    pub async fn find_active_by_user(&self, user_id: Uuid) -> AppResult<Vec<SessionRecord>> {
        sqlx::query_as::<_, SessionRecord>(
            "SELECT * FROM sessions \
             WHERE user_id = $1 AND status = 'active' AND expires_at > NOW() \
             ORDER BY created_at DESC",
        )
        .bind(user_id)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| {
            AppError::with_source(ErrorKind::Database, "Failed to list active sessions", e)
        })
    }

    /// Count active sessions for a license/feature pair. Used when the
    /// atomic cache is unavailable and admission runs in degraded mode.
    pub async fn count_active_by_license_feature(
        &self,
        license_id: Uuid,
        feature: Feature,
    ) -> AppResult<i64> {
        let count: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM sessions \
             WHERE license_id = $1 AND feature = $2 AND status = 'active' AND expires_at > NOW()",
        )
        .bind(license_id)
        .bind(feature)
        .fetch_one(&self.pool)
        .await
        .map_err(|e| {
            AppError::with_source(ErrorKind::Database, "Failed to count active sessions", e)
        })?;
        Ok(count)
    }

    /// Whether the session row is still active.
    pub async fn exists_active(&self, id: Uuid) -> AppResult<bool> {
        let exists: bool = sqlx::query_scalar(
            "SELECT EXISTS (SELECT 1 FROM sessions \
             WHERE id = $1 AND status = 'active' AND expires_at > NOW())",
        )
        .bind(id)
        .fetch_one(&self.pool)
        .await
        .map_err(|e| AppError::with_source(ErrorKind::Database, "Failed to check session", e))?;
        Ok(exists)
    }

    /// Persist a new session row.
    pub async fn create(&self, data: &CreateSession) -> AppResult<SessionRecord> {
        sqlx::query_as::<_, SessionRecord>(
            "INSERT INTO sessions (id, session_token, user_id, username, feature, license_id, \
             master_license_id, client_fingerprint, ip_address, user_agent, last_heartbeat, \
             expires_at) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, NOW(), $11) RETURNING *",
        )
        .bind(data.id)
        .bind(&data.session_token)
        .bind(data.user_id)
        .bind(&data.username)
        .bind(data.feature)
        .bind(data.license_id)
        .bind(&data.master_license_id)
        .bind(&data.client_fingerprint)
        .bind(&data.ip_address)
        .bind(&data.user_agent)
        .bind(data.expires_at)
        .fetch_one(&self.pool)
        .await
        .map_err(|e| AppError::with_source(ErrorKind::Database, "Failed to create session", e))
    }

    /// Refresh the heartbeat and push the expiry forward. Returns whether
    /// an active row was touched.
    pub async fn touch_heartbeat(&self, id: Uuid, expires_at: DateTime<Utc>) -> AppResult<bool> {
        let result = sqlx::query(
            "UPDATE sessions SET last_heartbeat = NOW(), expires_at = $2 \
             WHERE id = $1 AND status = 'active'",
        )
        .bind(id)
        .bind(expires_at)
        .execute(&self.pool)
        .await
        .map_err(|e| AppError::with_source(ErrorKind::Database, "Failed to touch heartbeat", e))?;
        Ok(result.rows_affected() > 0)
    }

    /// Move an active row to a terminal status. Ending an already-ended
    /// session is a no-op.
    pub async fn mark_ended(&self, id: Uuid, status: SessionStatus) -> AppResult<bool> {
        let result = sqlx::query(
            "UPDATE sessions SET status = $2, ended_at = NOW() \
             WHERE id = $1 AND status = 'active'",
        )
        .bind(id)
        .bind(status)
        .execute(&self.pool)
        .await
        .map_err(|e| AppError::with_source(ErrorKind::Database, "Failed to end session", e))?;
        Ok(result.rows_affected() > 0)
    }

    /// End every active session for a principal, returning the ended rows
    /// so their cache entries can be released.
    pub async fn end_all_for_user(&self, user_id: Uuid) -> AppResult<Vec<SessionRecord>> {
        sqlx::query_as::<_, SessionRecord>(
            "UPDATE sessions SET status = 'disconnected', ended_at = NOW() \
             WHERE user_id = $1 AND status = 'active' RETURNING *",
        )
        .bind(user_id)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| {
            AppError::with_source(ErrorKind::Database, "Failed to end user sessions", e)
        })
    }

    /// Delete rows whose license no longer exists.
    pub async fn delete_orphaned_license_refs(&self) -> AppResult<u64> {
        let result = sqlx::query(
            "DELETE FROM sessions s \
             WHERE NOT EXISTS (SELECT 1 FROM licenses l WHERE l.id = s.license_id)",
        )
        .execute(&self.pool)
        .await
        .map_err(|e| {
            AppError::with_source(ErrorKind::Database, "Failed to delete orphaned sessions", e)
        })?;
        Ok(result.rows_affected())
    }

    /// Expire active rows that outlived the absolute ceiling, stopped
    /// heartbeating, or never heartbeat past the startup grace. Returns
    /// the expired rows so cache contributions can be released.
    pub async fn expire_overdue(
        &self,
        ceiling_cutoff: DateTime<Utc>,
        heartbeat_cutoff: DateTime<Utc>,
        startup_cutoff: DateTime<Utc>,
    ) -> AppResult<Vec<SessionRecord>> {
        sqlx::query_as::<_, SessionRecord>(
            "UPDATE sessions SET status = 'expired', ended_at = NOW() \
             WHERE status = 'active' AND (\
                 created_at < $1 \
                 OR last_heartbeat < $2 \
                 OR (last_heartbeat IS NULL AND created_at < $3)\
             ) RETURNING *",
        )
        .bind(ceiling_cutoff)
        .bind(heartbeat_cutoff)
        .bind(startup_cutoff)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| {
            AppError::with_source(ErrorKind::Database, "Failed to expire overdue sessions", e)
        })
    }
}
