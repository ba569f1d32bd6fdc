//! Session admission configuration.

use serde::{Deserialize, Serialize};

/// Session admission configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionConfig {
    /// Durable session lifetime in minutes; refreshed on heartbeat.
    #[serde(default = "default_session_ttl")]
    pub ttl_minutes: u64,
    /// A session whose last heartbeat is older than this is considered dead.
    #[serde(default = "default_heartbeat_timeout")]
    pub heartbeat_timeout_minutes: u64,
    /// Absolute ceiling on session age regardless of heartbeats, in hours.
    #[serde(default = "default_absolute_ceiling")]
    pub absolute_ceiling_hours: u64,
    /// Sessions that never heartbeat are kept this long after creation.
    #[serde(default = "default_startup_grace")]
    pub startup_grace_minutes: u64,
}

fn default_session_ttl() -> u64 {
    60
}

fn default_heartbeat_timeout() -> u64 {
    45
}

fn default_absolute_ceiling() -> u64 {
    24
}

fn default_startup_grace() -> u64 {
    10
}
