//! Cached license entity model.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use sqlx::types::Json;
use uuid::Uuid;

use super::feature::{Feature, FeatureSet};

/// Reserved master license id for the synthesized offline development
/// license.
pub const OFFLINE_MASTER_LICENSE_ID: &str = "0";

/// Business status of a license as issued by the master server.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "license_status", rename_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum LicenseStatus {
    /// License is valid and admits sessions.
    Active,
    /// License was suspended by the master (e.g. billing hold).
    Suspended,
    /// License passed its expiry date.
    Expired,
    /// License was superseded or revoked locally.
    Invalid,
}

impl LicenseStatus {
    /// Return the status as a lowercase string.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Active => "active",
            Self::Suspended => "suspended",
            Self::Expired => "expired",
            Self::Invalid => "invalid",
        }
    }
}

impl std::fmt::Display for LicenseStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Freshness of the locally cached copy relative to the master server.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "sync_status", rename_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum SyncStatus {
    /// Fetched within the TTL.
    Synced,
    /// Past the TTL but still inside the grace period.
    Stale,
    /// Past the grace period; no longer usable for admission.
    Failed,
}

impl SyncStatus {
    /// Return the status as a lowercase string.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Synced => "synced",
            Self::Stale => "stale",
            Self::Failed => "failed",
        }
    }
}

impl std::fmt::Display for SyncStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// A locally cached copy of a master-issued license, bound to the host
/// fingerprint it was fetched for.
///
/// At most one row per `master_license_id`; syncs update in place. The
/// "current" license is the most recently synced row whose sync status is
/// synced or stale and whose business status is not expired.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct LicenseRecord {
    /// Local primary key.
    pub id: Uuid,
    /// Opaque id assigned by the master server. `"0"` is reserved for the
    /// offline development license.
    pub master_license_id: String,
    /// Fingerprint of the host this copy was fetched for.
    pub server_fingerprint: String,
    /// Opaque signed license blob; never exposed through the API.
    pub license_key: Option<String>,
    /// Organization the license was issued to.
    pub organization_name: String,
    /// Business status.
    pub status: LicenseStatus,
    /// Maximum concurrent users per feature.
    pub max_users: i32,
    /// Sub-quota for the premium feature; at most `max_users`.
    pub max_feature_users: i32,
    /// When the master issued the license.
    pub issued_at: DateTime<Utc>,
    /// When the license expires (None = perpetual).
    pub expires_at: Option<DateTime<Utc>>,
    /// Typed feature grants, parsed once at sync time.
    pub features: Json<FeatureSet>,
    /// Human-readable license tier name.
    pub license_type_name: String,
    /// Timestamp of the last successful fetch from the master.
    pub last_sync: DateTime<Utc>,
    /// Freshness of this cached copy.
    pub sync_status: SyncStatus,
    /// Row creation time.
    pub created_at: DateTime<Utc>,
    /// Row update time.
    pub updated_at: DateTime<Utc>,
}

impl LicenseRecord {
    /// Whether this is the synthesized offline development license.
    pub fn is_offline(&self) -> bool {
        self.master_license_id == OFFLINE_MASTER_LICENSE_ID
    }

    /// Whether the license admits new sessions at all.
    pub fn is_active(&self) -> bool {
        self.status == LicenseStatus::Active
            && self.expires_at.is_none_or(|exp| exp > Utc::now())
    }

    /// Whether the feature is enabled on this license.
    pub fn feature_enabled(&self, feature: Feature) -> bool {
        self.features.is_enabled(feature)
    }

    /// Concurrent-user quota for the feature: the premium sub-quota for
    /// [`Feature::Premium`], the overall user quota otherwise.
    pub fn quota_for(&self, feature: Feature) -> i32 {
        match feature {
            Feature::Premium => self.max_feature_users,
            _ => self.max_users,
        }
    }

    /// Age of the cached copy since the last successful sync.
    pub fn sync_age(&self, now: DateTime<Utc>) -> Duration {
        now - self.last_sync
    }

    /// Whether the copy is older than the refresh TTL.
    pub fn is_past_ttl(&self, now: DateTime<Utc>, ttl: Duration) -> bool {
        self.sync_age(now) > ttl
    }

    /// Whether the copy is still inside the staleness grace period.
    pub fn is_within_grace(&self, now: DateTime<Utc>, grace: Duration) -> bool {
        self.sync_age(now) <= grace
    }
}

/// Field set written on every successful sync. Upserts are keyed by
/// `master_license_id`: one cached row per master license, updated in
/// place, never duplicated.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UpsertLicense {
    /// Master-assigned license id.
    pub master_license_id: String,
    /// Fingerprint the fetch was made for.
    pub server_fingerprint: String,
    /// Opaque signed license blob.
    pub license_key: Option<String>,
    /// Organization name.
    pub organization_name: String,
    /// Business status.
    pub status: LicenseStatus,
    /// User quota.
    pub max_users: i32,
    /// Premium sub-quota.
    pub max_feature_users: i32,
    /// Issue timestamp.
    pub issued_at: DateTime<Utc>,
    /// Expiry timestamp.
    pub expires_at: Option<DateTime<Utc>>,
    /// Typed feature grants.
    pub features: FeatureSet,
    /// License tier name.
    pub license_type_name: String,
    /// Sync timestamp for this write.
    pub last_sync: DateTime<Utc>,
    /// Freshness to record.
    pub sync_status: SyncStatus,
}

/// Append-only audit row recording a detected host fingerprint change.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct FingerprintChange {
    /// Primary key.
    pub id: Uuid,
    /// Fingerprint the license was bound to.
    pub old_fingerprint: String,
    /// Fingerprint observed on the host.
    pub new_fingerprint: String,
    /// Why the change was recorded.
    pub reason: String,
    /// License the change was detected against.
    pub license_id: Uuid,
    /// What the sync engine did about it.
    pub action_taken: String,
    /// When the change was detected.
    pub changed_at: DateTime<Utc>,
}
