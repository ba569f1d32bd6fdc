//! Durable session entity model.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use uuid::Uuid;

use crate::license::Feature;

/// Namespace for deriving principal ids from usernames. User management
/// lives outside this service, so the id must be derivable on any node
/// without a directory lookup.
const PRINCIPAL_NAMESPACE: Uuid = Uuid::from_u128(0x8f2d_55aa_91c4_4b0e_a1f3_7c06_93de_4412);

/// Derive the stable principal id for a username.
pub fn principal_id(username: &str) -> Uuid {
    Uuid::new_v5(&PRINCIPAL_NAMESPACE, username.to_lowercase().as_bytes())
}

/// Lifecycle status of a durable session row.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "session_status", rename_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum SessionStatus {
    /// Session counts against the license quota.
    Active,
    /// Session was ended by the client or an administrator.
    Disconnected,
    /// Session was expired by timeout or reconciliation.
    Expired,
}

impl SessionStatus {
    /// Return the status as a lowercase string.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Active => "active",
            Self::Disconnected => "disconnected",
            Self::Expired => "expired",
        }
    }
}

impl std::fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Durable backup record of an admitted session.
///
/// The atomic cache is authoritative for admission; these rows survive
/// restarts and feed reconciliation.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct SessionRecord {
    /// Unique session identifier.
    pub id: Uuid,
    /// Signed session token issued at admission.
    pub session_token: String,
    /// Principal that owns the session.
    pub user_id: Uuid,
    /// Username the principal registered with.
    pub username: String,
    /// Feature the session was admitted for.
    pub feature: Feature,
    /// Owning cached license row.
    pub license_id: Uuid,
    /// Master license id, denormalized for reporting after license churn.
    pub master_license_id: String,
    /// Fingerprint of the client device.
    pub client_fingerprint: String,
    /// Client IP address, if known.
    pub ip_address: Option<String>,
    /// Client User-Agent header, if known.
    pub user_agent: Option<String>,
    /// Lifecycle status.
    pub status: SessionStatus,
    /// Last heartbeat received from the client.
    pub last_heartbeat: Option<DateTime<Utc>>,
    /// When the session expires absent heartbeats.
    pub expires_at: DateTime<Utc>,
    /// When the session was admitted.
    pub created_at: DateTime<Utc>,
    /// When the session was ended (None = still active).
    pub ended_at: Option<DateTime<Utc>>,
}

impl SessionRecord {
    /// Whether the row currently counts against the admission invariant.
    pub fn is_active(&self) -> bool {
        self.status == SessionStatus::Active && self.expires_at > Utc::now()
    }
}

/// Data required to persist a new session row.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreateSession {
    /// Pre-generated session id (shared with the cache entry).
    pub id: Uuid,
    /// Signed session token.
    pub session_token: String,
    /// Principal id.
    pub user_id: Uuid,
    /// Username.
    pub username: String,
    /// Admitted feature.
    pub feature: Feature,
    /// Owning license row.
    pub license_id: Uuid,
    /// Denormalized master license id.
    pub master_license_id: String,
    /// Client device fingerprint.
    pub client_fingerprint: String,
    /// Client IP address.
    pub ip_address: Option<String>,
    /// Client User-Agent.
    pub user_agent: Option<String>,
    /// Expiry timestamp.
    pub expires_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_principal_id_is_stable_and_case_insensitive() {
        assert_eq!(principal_id("alice"), principal_id("alice"));
        assert_eq!(principal_id("Alice"), principal_id("alice"));
        assert_ne!(principal_id("alice"), principal_id("bob"));
    }

    #[test]
    fn test_is_active_requires_future_expiry() {
        let mut session = SessionRecord {
            id: Uuid::new_v4(),
            session_token: "tok".to_string(),
            user_id: principal_id("alice"),
            username: "alice".to_string(),
            feature: Feature::Telephony,
            license_id: Uuid::new_v4(),
            master_license_id: "lic-100".to_string(),
            client_fingerprint: "fp-1".to_string(),
            ip_address: None,
            user_agent: None,
            status: SessionStatus::Active,
            last_heartbeat: None,
            expires_at: Utc::now() + chrono::Duration::hours(1),
            created_at: Utc::now(),
            ended_at: None,
        };
        assert!(session.is_active());

        session.expires_at = Utc::now() - chrono::Duration::minutes(1);
        assert!(!session.is_active());

        session.expires_at = Utc::now() + chrono::Duration::hours(1);
        session.status = SessionStatus::Expired;
        assert!(!session.is_active());
    }
}
