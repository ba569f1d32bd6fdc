//! Session cache trait and shared types.

pub mod memory;
pub mod redis;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tracing::info;
use uuid::Uuid;

use pbxgate_core::config::cache::CacheConfig;
use pbxgate_core::error::AppError;
use pbxgate_core::result::AppResult;
use pbxgate_entity::license::Feature;

use self::memory::MemorySessionCache;
use self::redis::RedisSessionCache;
use crate::client::RedisClient;

/// A cached session: the per-session hash of the atomic store.
///
/// Every entry has a matching member in its principal's live set and a
/// contribution of one in its license/feature counter; the three are
/// written and removed together.
#[derive(Debug, Clone, PartialEq)]
pub struct SessionEntry {
    /// Session id, shared with the durable row.
    pub session_id: Uuid,
    /// Principal id.
    pub user_id: Uuid,
    /// Username.
    pub username: String,
    /// Admitted feature.
    pub feature: Feature,
    /// Owning cached license row.
    pub license_id: Uuid,
    /// Client device fingerprint.
    pub client_fingerprint: String,
    /// Client IP address.
    pub ip_address: Option<String>,
    /// Client User-Agent.
    pub user_agent: Option<String>,
    /// Admission time.
    pub created_at: DateTime<Utc>,
    /// Last heartbeat.
    pub last_heartbeat: DateTime<Utc>,
}

impl SessionEntry {
    /// Flatten into hash field/value pairs for storage.
    pub fn to_fields(&self) -> Vec<(String, String)> {
        let mut fields = vec![
            ("session_id".to_string(), self.session_id.to_string()),
            ("user_id".to_string(), self.user_id.to_string()),
            ("username".to_string(), self.username.clone()),
            ("feature".to_string(), self.feature.to_string()),
            ("license_id".to_string(), self.license_id.to_string()),
            (
                "client_fingerprint".to_string(),
                self.client_fingerprint.clone(),
            ),
            ("created_at".to_string(), self.created_at.to_rfc3339()),
            (
                "last_heartbeat".to_string(),
                self.last_heartbeat.to_rfc3339(),
            ),
        ];
        if let Some(ip) = &self.ip_address {
            fields.push(("ip_address".to_string(), ip.clone()));
        }
        if let Some(ua) = &self.user_agent {
            fields.push(("user_agent".to_string(), ua.clone()));
        }
        fields
    }

    /// Rebuild from stored hash fields. Returns `None` when mandatory
    /// fields are missing or unparsable (the caller deletes such entries
    /// defensively).
    pub fn from_fields(fields: &HashMap<String, String>) -> Option<Self> {
        let parse_time = |key: &str| {
            fields
                .get(key)
                .and_then(|v| DateTime::parse_from_rfc3339(v).ok())
                .map(|t| t.with_timezone(&Utc))
        };

        Some(Self {
            session_id: fields.get("session_id")?.parse().ok()?,
            user_id: fields.get("user_id")?.parse().ok()?,
            username: fields.get("username")?.clone(),
            feature: fields.get("feature")?.parse().ok()?,
            license_id: fields.get("license_id")?.parse().ok()?,
            client_fingerprint: fields.get("client_fingerprint")?.clone(),
            ip_address: fields.get("ip_address").cloned(),
            user_agent: fields.get("user_agent").cloned(),
            created_at: parse_time("created_at")?,
            last_heartbeat: parse_time("last_heartbeat")?,
        })
    }
}

/// Result of an atomic admission attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AdmitOutcome {
    /// Admitted; `current` is the counter value after the increment.
    Admitted {
        /// Concurrent sessions for the license/feature after admission.
        current: i64,
    },
    /// The quota was exhausted; the increment was compensated.
    LimitExceeded {
        /// Concurrent sessions at the time of rejection.
        current: i64,
        /// The quota that was enforced.
        quota: i64,
    },
    /// The principal already holds a live session for this feature.
    AlreadyActive,
}

/// Result of an atomic release.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReleaseOutcome {
    /// Whether a live session was actually removed.
    pub removed: bool,
    /// Whether the counter underflowed and was clamped to zero.
    pub clamped: bool,
}

/// The Atomic Session Cache: authoritative store for admission decisions.
///
/// Implementations must apply `admit` and `release` atomically: the
/// entry hash, the live set, and the counter change together or not at
/// all. Admission is an atomic increment-and-compare, not a read followed
/// by a write.
#[async_trait]
pub trait SessionCache: Send + Sync + std::fmt::Debug {
    /// Atomically admit a session against the quota.
    async fn admit(
        &self,
        entry: &SessionEntry,
        quota: i64,
        ttl: Duration,
    ) -> AppResult<AdmitOutcome>;

    /// Atomically remove a session and its set/counter contributions.
    /// Idempotent; the counter never goes below zero.
    async fn release(
        &self,
        session_id: Uuid,
        user_id: Uuid,
        feature: Feature,
        license_id: Uuid,
    ) -> AppResult<ReleaseOutcome>;

    /// Refresh the heartbeat and push the shared expiry horizon forward.
    /// Returns `false` when the entry no longer exists (not an error).
    async fn heartbeat(&self, session_id: Uuid, ttl: Duration) -> AppResult<bool>;

    /// Look up the live session entry for a principal/feature pair.
    async fn live_entry(&self, user_id: Uuid, feature: Feature)
    -> AppResult<Option<SessionEntry>>;

    /// Look up a session entry by id.
    async fn entry(&self, session_id: Uuid) -> AppResult<Option<SessionEntry>>;

    /// Enumerate every session entry. Entries of unexpected shape are
    /// deleted defensively and not returned.
    async fn scan_entries(&self) -> AppResult<Vec<SessionEntry>>;

    /// Current counter value for a license/feature pair.
    async fn feature_count(&self, license_id: Uuid, feature: Feature) -> AppResult<i64>;

    /// Check that the backend is reachable.
    async fn health_check(&self) -> AppResult<bool>;
}

/// Build the session cache selected by configuration.
pub async fn connect(config: &CacheConfig) -> AppResult<Arc<dyn SessionCache>> {
    match config.provider.as_str() {
        "redis" => {
            info!("Initializing Redis session cache");
            let client = RedisClient::connect(&config.redis).await?;
            Ok(Arc::new(RedisSessionCache::new(client)))
        }
        "memory" => {
            info!("Initializing in-memory session cache");
            Ok(Arc::new(MemorySessionCache::new()))
        }
        other => Err(AppError::configuration(format!(
            "Unknown cache provider: '{other}'. Supported: redis, memory"
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry() -> SessionEntry {
        SessionEntry {
            session_id: Uuid::new_v4(),
            user_id: Uuid::new_v4(),
            username: "alice".to_string(),
            feature: Feature::Telephony,
            license_id: Uuid::new_v4(),
            client_fingerprint: "fp-1".to_string(),
            ip_address: Some("10.0.0.7".to_string()),
            user_agent: None,
            created_at: Utc::now(),
            last_heartbeat: Utc::now(),
        }
    }

    #[test]
    fn test_fields_roundtrip() {
        let original = entry();
        let map: HashMap<String, String> = original.to_fields().into_iter().collect();
        let parsed = SessionEntry::from_fields(&map).expect("parsable entry");

        assert_eq!(parsed.session_id, original.session_id);
        assert_eq!(parsed.feature, original.feature);
        assert_eq!(parsed.ip_address, original.ip_address);
        assert_eq!(parsed.user_agent, None);
    }

    #[test]
    fn test_from_fields_rejects_corrupt_entry() {
        let mut map: HashMap<String, String> = entry().to_fields().into_iter().collect();
        map.insert("user_id".to_string(), "not-a-uuid".to_string());
        assert!(SessionEntry::from_fields(&map).is_none());

        let mut map: HashMap<String, String> = entry().to_fields().into_iter().collect();
        map.remove("feature");
        assert!(SessionEntry::from_fields(&map).is_none());
    }
}
