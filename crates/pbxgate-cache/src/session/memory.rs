//! In-memory session cache using a Tokio mutex for single-node
//! deployments and deterministic tests.
//!
//! One lock guards the entry map, live sets, and counters, so every
//! mutation is atomic across all three, matching the guarantee the
//! Redis backend gets from Lua scripts.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::Mutex;
use tracing::warn;
use uuid::Uuid;

use pbxgate_core::result::AppResult;
use pbxgate_entity::license::Feature;

use super::{AdmitOutcome, ReleaseOutcome, SessionCache, SessionEntry};

/// Internal state for the memory-based session cache.
#[derive(Debug, Default)]
struct InnerState {
    /// Session entries with their expiry horizon.
    entries: HashMap<Uuid, (SessionEntry, DateTime<Utc>)>,
    /// Live session ids per (user, feature).
    live: HashMap<(Uuid, Feature), HashSet<Uuid>>,
    /// Concurrent session counters per (license, feature).
    counters: HashMap<(Uuid, Feature), i64>,
}

impl InnerState {
    /// Drop expired entries together with their set/counter contributions.
    fn purge_expired(&mut self, now: DateTime<Utc>) {
        let expired: Vec<Uuid> = self
            .entries
            .iter()
            .filter(|(_, (_, horizon))| *horizon <= now)
            .map(|(id, _)| *id)
            .collect();

        for session_id in expired {
            self.remove(session_id);
        }
    }

    /// Remove one session and decrement its counter exactly once.
    /// Returns the release outcome.
    fn remove(&mut self, session_id: Uuid) -> ReleaseOutcome {
        let Some((entry, _)) = self.entries.remove(&session_id) else {
            return ReleaseOutcome {
                removed: false,
                clamped: false,
            };
        };

        let live_key = (entry.user_id, entry.feature);
        if let Some(set) = self.live.get_mut(&live_key) {
            set.remove(&session_id);
            if set.is_empty() {
                self.live.remove(&live_key);
            }
        }

        let counter_key = (entry.license_id, entry.feature);
        let counter = self.counters.entry(counter_key).or_insert(0);
        *counter -= 1;
        let clamped = *counter < 0;
        if *counter <= 0 {
            self.counters.remove(&counter_key);
        }

        ReleaseOutcome {
            removed: true,
            clamped,
        }
    }
}

/// In-memory session cache.
#[derive(Debug, Clone, Default)]
pub struct MemorySessionCache {
    /// Protected inner state.
    state: Arc<Mutex<InnerState>>,
}

impl MemorySessionCache {
    /// Create a new empty memory session cache.
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl SessionCache for MemorySessionCache {
    async fn admit(
        &self,
        entry: &SessionEntry,
        quota: i64,
        ttl: Duration,
    ) -> AppResult<AdmitOutcome> {
        let now = Utc::now();
        let mut state = self.state.lock().await;
        state.purge_expired(now);

        let live_key = (entry.user_id, entry.feature);
        if state.live.get(&live_key).is_some_and(|set| !set.is_empty()) {
            return Ok(AdmitOutcome::AlreadyActive);
        }

        let counter_key = (entry.license_id, entry.feature);
        let counter = state.counters.entry(counter_key).or_insert(0);
        *counter += 1;
        let count = *counter;
        if count > quota {
            *counter -= 1;
            if *counter <= 0 {
                state.counters.remove(&counter_key);
            }
            return Ok(AdmitOutcome::LimitExceeded {
                current: count - 1,
                quota,
            });
        }

        let horizon = now + chrono::Duration::from_std(ttl).unwrap_or(chrono::Duration::hours(1));
        state
            .entries
            .insert(entry.session_id, (entry.clone(), horizon));
        state
            .live
            .entry(live_key)
            .or_default()
            .insert(entry.session_id);

        Ok(AdmitOutcome::Admitted { current: count })
    }

    async fn release(
        &self,
        session_id: Uuid,
        _user_id: Uuid,
        feature: Feature,
        license_id: Uuid,
    ) -> AppResult<ReleaseOutcome> {
        let mut state = self.state.lock().await;
        let outcome = state.remove(session_id);

        if outcome.clamped {
            warn!(
                session_id = %session_id,
                license_id = %license_id,
                feature = %feature,
                "Session counter underflowed, clamped to zero"
            );
        }

        Ok(outcome)
    }

    async fn heartbeat(&self, session_id: Uuid, ttl: Duration) -> AppResult<bool> {
        let now = Utc::now();
        let mut state = self.state.lock().await;
        state.purge_expired(now);

        match state.entries.get_mut(&session_id) {
            Some((entry, horizon)) => {
                entry.last_heartbeat = now;
                *horizon =
                    now + chrono::Duration::from_std(ttl).unwrap_or(chrono::Duration::hours(1));
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn live_entry(
        &self,
        user_id: Uuid,
        feature: Feature,
    ) -> AppResult<Option<SessionEntry>> {
        let now = Utc::now();
        let mut state = self.state.lock().await;
        state.purge_expired(now);

        let Some(set) = state.live.get(&(user_id, feature)) else {
            return Ok(None);
        };
        let Some(session_id) = set.iter().next().copied() else {
            return Ok(None);
        };
        Ok(state.entries.get(&session_id).map(|(entry, _)| entry.clone()))
    }

    async fn entry(&self, session_id: Uuid) -> AppResult<Option<SessionEntry>> {
        let now = Utc::now();
        let mut state = self.state.lock().await;
        state.purge_expired(now);
        Ok(state.entries.get(&session_id).map(|(entry, _)| entry.clone()))
    }

    async fn scan_entries(&self) -> AppResult<Vec<SessionEntry>> {
        let now = Utc::now();
        let mut state = self.state.lock().await;
        state.purge_expired(now);
        Ok(state
            .entries
            .values()
            .map(|(entry, _)| entry.clone())
            .collect())
    }

    async fn feature_count(&self, license_id: Uuid, feature: Feature) -> AppResult<i64> {
        let now = Utc::now();
        let mut state = self.state.lock().await;
        state.purge_expired(now);
        Ok(state
            .counters
            .get(&(license_id, feature))
            .copied()
            .unwrap_or(0))
    }

    async fn health_check(&self) -> AppResult<bool> {
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const TTL: Duration = Duration::from_secs(3600);

    fn entry_for(username: &str, feature: Feature, license_id: Uuid) -> SessionEntry {
        SessionEntry {
            session_id: Uuid::new_v4(),
            user_id: pbxgate_entity::session::principal_id(username),
            username: username.to_string(),
            feature,
            license_id,
            client_fingerprint: format!("fp-{username}"),
            ip_address: None,
            user_agent: None,
            created_at: Utc::now(),
            last_heartbeat: Utc::now(),
        }
    }

    #[tokio::test]
    async fn test_admit_counts_up_to_quota() {
        let cache = MemorySessionCache::new();
        let license_id = Uuid::new_v4();

        let a = entry_for("alice", Feature::Telephony, license_id);
        let b = entry_for("bob", Feature::Telephony, license_id);
        let c = entry_for("carol", Feature::Telephony, license_id);

        assert_eq!(
            cache.admit(&a, 2, TTL).await.unwrap(),
            AdmitOutcome::Admitted { current: 1 }
        );
        assert_eq!(
            cache.admit(&b, 2, TTL).await.unwrap(),
            AdmitOutcome::Admitted { current: 2 }
        );
        assert_eq!(
            cache.admit(&c, 2, TTL).await.unwrap(),
            AdmitOutcome::LimitExceeded {
                current: 2,
                quota: 2
            }
        );
        assert_eq!(
            cache.feature_count(license_id, Feature::Telephony).await.unwrap(),
            2
        );
    }

    #[tokio::test]
    async fn test_rejected_admission_leaves_counter_unchanged() {
        let cache = MemorySessionCache::new();
        let license_id = Uuid::new_v4();

        let a = entry_for("alice", Feature::Premium, license_id);
        cache.admit(&a, 1, TTL).await.unwrap();

        let b = entry_for("bob", Feature::Premium, license_id);
        for _ in 0..3 {
            let outcome = cache.admit(&b, 1, TTL).await.unwrap();
            assert!(matches!(outcome, AdmitOutcome::LimitExceeded { .. }));
        }

        assert_eq!(
            cache.feature_count(license_id, Feature::Premium).await.unwrap(),
            1
        );
    }

    #[tokio::test]
    async fn test_same_user_same_feature_is_conflict() {
        let cache = MemorySessionCache::new();
        let license_id = Uuid::new_v4();

        let first = entry_for("alice", Feature::Telephony, license_id);
        cache.admit(&first, 10, TTL).await.unwrap();

        let second = entry_for("alice", Feature::Telephony, license_id);
        assert_eq!(
            cache.admit(&second, 10, TTL).await.unwrap(),
            AdmitOutcome::AlreadyActive
        );

        // A different feature admits independently.
        let other = entry_for("alice", Feature::Premium, license_id);
        assert!(matches!(
            cache.admit(&other, 10, TTL).await.unwrap(),
            AdmitOutcome::Admitted { .. }
        ));
    }

    #[tokio::test]
    async fn test_release_is_idempotent_and_never_negative() {
        let cache = MemorySessionCache::new();
        let license_id = Uuid::new_v4();

        let entry = entry_for("alice", Feature::Telephony, license_id);
        cache.admit(&entry, 5, TTL).await.unwrap();

        let first = cache
            .release(entry.session_id, entry.user_id, entry.feature, license_id)
            .await
            .unwrap();
        assert!(first.removed);

        let second = cache
            .release(entry.session_id, entry.user_id, entry.feature, license_id)
            .await
            .unwrap();
        assert!(!second.removed);

        assert_eq!(
            cache.feature_count(license_id, Feature::Telephony).await.unwrap(),
            0
        );
    }

    #[tokio::test]
    async fn test_release_frees_a_seat() {
        let cache = MemorySessionCache::new();
        let license_id = Uuid::new_v4();

        let a = entry_for("alice", Feature::Telephony, license_id);
        let b = entry_for("bob", Feature::Telephony, license_id);
        cache.admit(&a, 1, TTL).await.unwrap();

        assert!(matches!(
            cache.admit(&b, 1, TTL).await.unwrap(),
            AdmitOutcome::LimitExceeded { .. }
        ));

        cache
            .release(a.session_id, a.user_id, a.feature, license_id)
            .await
            .unwrap();

        assert_eq!(
            cache.admit(&b, 1, TTL).await.unwrap(),
            AdmitOutcome::Admitted { current: 1 }
        );
    }

    #[tokio::test]
    async fn test_heartbeat_on_missing_entry_is_noop() {
        let cache = MemorySessionCache::new();
        assert!(!cache.heartbeat(Uuid::new_v4(), TTL).await.unwrap());
    }

    #[tokio::test]
    async fn test_expired_entries_release_their_contributions() {
        let cache = MemorySessionCache::new();
        let license_id = Uuid::new_v4();

        let entry = entry_for("alice", Feature::Telephony, license_id);
        cache
            .admit(&entry, 5, Duration::from_secs(0))
            .await
            .unwrap();

        // Horizon of zero: the next purge drops the entry and its counter.
        assert!(cache.entry(entry.session_id).await.unwrap().is_none());
        assert_eq!(
            cache.feature_count(license_id, Feature::Telephony).await.unwrap(),
            0
        );
        assert!(
            cache
                .live_entry(entry.user_id, Feature::Telephony)
                .await
                .unwrap()
                .is_none()
        );
    }

    #[tokio::test]
    async fn test_live_entry_returns_admitted_session() {
        let cache = MemorySessionCache::new();
        let license_id = Uuid::new_v4();

        let entry = entry_for("alice", Feature::Telephony, license_id);
        cache.admit(&entry, 5, TTL).await.unwrap();

        let live = cache
            .live_entry(entry.user_id, Feature::Telephony)
            .await
            .unwrap()
            .expect("live entry present");
        assert_eq!(live.session_id, entry.session_id);
        assert_eq!(live.client_fingerprint, entry.client_fingerprint);
    }
}
