//! License repository implementation.

use chrono::{DateTime, Utc};
use sqlx::PgPool;
use sqlx::types::Json;
use uuid::Uuid;

use pbxgate_core::error::{AppError, ErrorKind};
use pbxgate_core::result::AppResult;
use pbxgate_entity::license::{LicenseRecord, SyncStatus, UpsertLicense};

/// Repository for cached license rows.
#[derive(Debug, Clone)]
pub struct LicenseRepository {
    pool: PgPool,
}

impl LicenseRepository {
    /// Create a new license repository.
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Find a license by its local id.
    pub async fn find_by_id(&self, id: Uuid) -> AppResult<Option<LicenseRecord>> {
        sqlx::query_as::<_, LicenseRecord>("SELECT * FROM licenses WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| AppError::with_source(ErrorKind::Database, "Failed to find license", e))
    }

    /// Find the current license for a fingerprint: the most recently synced
    /// usable row bound to that fingerprint. Expired rows are never current.
    pub async fn find_current(&self, fingerprint: &str) -> AppResult<Option<LicenseRecord>> {
        sqlx::query_as::<_, LicenseRecord>(
            "SELECT * FROM licenses \
             WHERE server_fingerprint = $1 AND sync_status IN ('synced', 'stale') \
             AND status <> 'expired' \
             ORDER BY last_sync DESC LIMIT 1",
        )
        .bind(fingerprint)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| AppError::with_source(ErrorKind::Database, "Failed to find current license", e))
    }

    /// Find the most recently synced usable row regardless of fingerprint.
    /// Used to detect host fingerprint changes.
    pub async fn find_latest(&self) -> AppResult<Option<LicenseRecord>> {
        sqlx::query_as::<_, LicenseRecord>(
            "SELECT * FROM licenses \
             WHERE sync_status IN ('synced', 'stale') AND status <> 'expired' \
             ORDER BY last_sync DESC LIMIT 1",
        )
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| AppError::with_source(ErrorKind::Database, "Failed to find latest license", e))
    }

    /// Upsert a license keyed by `master_license_id`: update in place,
    /// never duplicate. The write is a single statement so a cancelled
    /// fetch leaves no partial row behind.
    pub async fn upsert(&self, up: &UpsertLicense) -> AppResult<LicenseRecord> {
        sqlx::query_as::<_, LicenseRecord>(
            "INSERT INTO licenses (master_license_id, server_fingerprint, license_key, \
             organization_name, status, max_users, max_feature_users, issued_at, expires_at, \
             features, license_type_name, last_sync, sync_status) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13) \
             ON CONFLICT (master_license_id) DO UPDATE SET \
             server_fingerprint = EXCLUDED.server_fingerprint, \
             license_key = EXCLUDED.license_key, \
             organization_name = EXCLUDED.organization_name, \
             status = EXCLUDED.status, \
             max_users = EXCLUDED.max_users, \
             max_feature_users = EXCLUDED.max_feature_users, \
             issued_at = EXCLUDED.issued_at, \
             expires_at = EXCLUDED.expires_at, \
             features = EXCLUDED.features, \
             license_type_name = EXCLUDED.license_type_name, \
             last_sync = EXCLUDED.last_sync, \
             sync_status = EXCLUDED.sync_status, \
             updated_at = NOW() \
             RETURNING *",
        )
        .bind(&up.master_license_id)
        .bind(&up.server_fingerprint)
        .bind(&up.license_key)
        .bind(&up.organization_name)
        .bind(up.status)
        .bind(up.max_users)
        .bind(up.max_feature_users)
        .bind(up.issued_at)
        .bind(up.expires_at)
        .bind(Json(&up.features))
        .bind(&up.license_type_name)
        .bind(up.last_sync)
        .bind(up.sync_status)
        .fetch_one(&self.pool)
        .await
        .map_err(|e| AppError::with_source(ErrorKind::Database, "Failed to upsert license", e))
    }

    /// Set the sync status of a row.
    pub async fn set_sync_status(&self, id: Uuid, status: SyncStatus) -> AppResult<()> {
        sqlx::query("UPDATE licenses SET sync_status = $2, updated_at = NOW() WHERE id = $1")
            .bind(id)
            .bind(status)
            .execute(&self.pool)
            .await
            .map_err(|e| {
                AppError::with_source(ErrorKind::Database, "Failed to update sync status", e)
            })?;
        Ok(())
    }

    /// Invalidate every other row bound to the same fingerprint after a
    /// fresh fetch established a new current license.
    pub async fn invalidate_others(&self, fingerprint: &str, keep_id: Uuid) -> AppResult<u64> {
        let result = sqlx::query(
            "UPDATE licenses SET sync_status = 'failed', status = 'invalid', updated_at = NOW() \
             WHERE server_fingerprint = $1 AND id <> $2 AND sync_status <> 'failed'",
        )
        .bind(fingerprint)
        .bind(keep_id)
        .execute(&self.pool)
        .await
        .map_err(|e| {
            AppError::with_source(ErrorKind::Database, "Failed to invalidate licenses", e)
        })?;
        Ok(result.rows_affected())
    }

    /// Mark stale rows failed once their last sync is older than the cutoff.
    pub async fn mark_failed_stale_before(&self, cutoff: DateTime<Utc>) -> AppResult<u64> {
        let result = sqlx::query(
            "UPDATE licenses SET sync_status = 'failed', updated_at = NOW() \
             WHERE sync_status = 'stale' AND last_sync < $1",
        )
        .bind(cutoff)
        .execute(&self.pool)
        .await
        .map_err(|e| {
            AppError::with_source(ErrorKind::Database, "Failed to mark stale licenses", e)
        })?;
        Ok(result.rows_affected())
    }

    /// Physically delete rows that have been failed since before the cutoff
    /// and have no referencing sessions. Fingerprint audit rows cascade.
    pub async fn delete_failed_unreferenced(&self, cutoff: DateTime<Utc>) -> AppResult<u64> {
        let result = sqlx::query(
            "DELETE FROM licenses l \
             WHERE l.sync_status = 'failed' AND l.updated_at < $1 \
             AND NOT EXISTS (SELECT 1 FROM sessions s WHERE s.license_id = l.id)",
        )
        .bind(cutoff)
        .execute(&self.pool)
        .await
        .map_err(|e| {
            AppError::with_source(ErrorKind::Database, "Failed to delete failed licenses", e)
        })?;
        Ok(result.rows_affected())
    }
}
