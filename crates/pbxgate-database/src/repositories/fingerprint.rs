//! Fingerprint-change audit repository.

use sqlx::PgPool;
use uuid::Uuid;

use pbxgate_core::error::{AppError, ErrorKind};
use pbxgate_core::result::AppResult;
use pbxgate_entity::license::FingerprintChange;

/// Repository for the append-only fingerprint audit trail.
#[derive(Debug, Clone)]
pub struct FingerprintChangeRepository {
    pool: PgPool,
}

impl FingerprintChangeRepository {
    /// Create a new fingerprint-change repository.
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Record a detected fingerprint change.
    pub async fn record(
        &self,
        old_fingerprint: &str,
        new_fingerprint: &str,
        reason: &str,
        license_id: Uuid,
        action_taken: &str,
    ) -> AppResult<FingerprintChange> {
        sqlx::query_as::<_, FingerprintChange>(
            "INSERT INTO fingerprint_changes \
             (old_fingerprint, new_fingerprint, reason, license_id, action_taken) \
             VALUES ($1, $2, $3, $4, $5) RETURNING *",
        )
        .bind(old_fingerprint)
        .bind(new_fingerprint)
        .bind(reason)
        .bind(license_id)
        .bind(action_taken)
        .fetch_one(&self.pool)
        .await
        .map_err(|e| {
            AppError::with_source(ErrorKind::Database, "Failed to record fingerprint change", e)
        })
    }
}
