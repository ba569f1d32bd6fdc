//! Cache key builders for the atomic session cache.
//!
//! Centralising key construction prevents typos and makes it easy to
//! find every key the application uses. Keys are logical; the
//! deployment prefix is applied by [`crate::RedisClient`].

use uuid::Uuid;

use pbxgate_entity::license::Feature;

/// Key of the per-session entry hash.
pub fn session_entry(session_id: Uuid) -> String {
    format!("session:entry:{session_id}")
}

/// Key of the live-session-id set for a principal/feature pair.
pub fn live_set(user_id: Uuid, feature: Feature) -> String {
    format!("session:live:{user_id}:{feature}")
}

/// Key of the concurrent-session counter for a license/feature pair.
pub fn feature_counter(license_id: Uuid, feature: Feature) -> String {
    format!("license:count:{license_id}:{feature}")
}

/// Match pattern covering every session entry hash (and nothing else).
pub fn session_entry_pattern() -> String {
    "session:entry:*".to_string()
}
