//! Response DTOs.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use pbxgate_cache::SessionEntry;
use pbxgate_entity::license::{Feature, LicenseRecord, LicenseStatus, SyncStatus};

/// Standard success response wrapper.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiResponse<T: Serialize> {
    /// Whether the request was successful.
    pub success: bool,
    /// Response data.
    pub data: T,
}

impl<T: Serialize> ApiResponse<T> {
    /// Creates a successful response.
    pub fn ok(data: T) -> Self {
        Self {
            success: true,
            data,
        }
    }
}

/// Summary of a live session, safe to echo to the caller.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionSummary {
    /// Session id.
    pub session_id: Uuid,
    /// Username.
    pub username: String,
    /// Admitted feature.
    pub feature: Feature,
    /// Admission time.
    pub created_at: DateTime<Utc>,
    /// Last heartbeat.
    pub last_heartbeat: DateTime<Utc>,
}

impl From<&SessionEntry> for SessionSummary {
    fn from(entry: &SessionEntry) -> Self {
        Self {
            session_id: entry.session_id,
            username: entry.username.clone(),
            feature: entry.feature,
            created_at: entry.created_at,
            last_heartbeat: entry.last_heartbeat,
        }
    }
}

/// Body of `POST /sessions/validate`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionValidationResponse {
    /// Whether the caller's device holds a valid session or may create one.
    pub success: bool,
    /// Whether the caller should proceed to create a session.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub can_create_session: Option<bool>,
    /// The live session, when the caller's device already holds it.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub session: Option<SessionSummary>,
}

/// Body of a successful `POST /sessions`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionCreatedResponse {
    /// Signed session token.
    pub session_token: String,
    /// Session id.
    pub session_id: Uuid,
    /// Quota the session was admitted against.
    pub max_users: i32,
    /// Concurrent sessions after admission.
    pub current_users: i64,
}

/// Body of `POST /sessions/atomic-setup`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AtomicSetupResponse {
    /// Whether a new session was created (false = existing session kept).
    pub created: bool,
    /// Session id.
    pub session_id: Uuid,
    /// Signed token for a newly created session.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub session_token: Option<String>,
    /// Quota, for newly created sessions.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_users: Option<i32>,
    /// Concurrent sessions, for newly created sessions.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub current_users: Option<i64>,
}

/// Body of `POST /sessions/end`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionsEndedResponse {
    /// How many sessions were ended.
    pub ended: u32,
}

/// Projection of the current license. Never carries the raw license key.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LicenseResponse {
    /// Master-assigned license id.
    pub master_license_id: String,
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
    /// Enabled features.
    pub features: Vec<Feature>,
    /// License tier name.
    pub license_type_name: String,
    /// Last successful sync.
    pub last_sync: DateTime<Utc>,
    /// Freshness of the cached copy.
    pub sync_status: SyncStatus,
}

impl From<&LicenseRecord> for LicenseResponse {
    fn from(record: &LicenseRecord) -> Self {
        Self {
            master_license_id: record.master_license_id.clone(),
            organization_name: record.organization_name.clone(),
            status: record.status,
            max_users: record.max_users,
            max_feature_users: record.max_feature_users,
            issued_at: record.issued_at,
            expires_at: record.expires_at,
            features: record.features.enabled(),
            license_type_name: record.license_type_name.clone(),
            last_sync: record.last_sync,
            sync_status: record.sync_status,
        }
    }
}

/// Simple message response.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MessageResponse {
    /// Message.
    pub message: String,
}
