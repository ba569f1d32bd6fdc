//! License sync configuration.

use serde::{Deserialize, Serialize};

/// License sync engine configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LicenseConfig {
    /// Base URL of the master licensing server.
    #[serde(default = "default_master_url")]
    pub master_url: String,
    /// Internal API key sent to the master server.
    #[serde(default)]
    pub master_api_key: String,
    /// Absolute timeout for a single license fetch, in seconds.
    /// Deliberately short so admission paths never wait on the network.
    #[serde(default = "default_fetch_timeout")]
    pub fetch_timeout_seconds: u64,
    /// Number of retries on retryable fetch failures (5xx/429).
    #[serde(default = "default_fetch_retries")]
    pub fetch_retries: u32,
    /// Fixed delay between fetch retries, in milliseconds.
    #[serde(default = "default_retry_delay")]
    pub retry_delay_ms: u64,
    /// Cache TTL: a license older than this is served stale while a
    /// background refresh runs.
    #[serde(default = "default_ttl_minutes")]
    pub ttl_minutes: u64,
    /// Grace period: a stale license remains usable this long past its
    /// last successful sync before it is marked failed.
    #[serde(default = "default_grace_hours")]
    pub grace_period_hours: u64,
    /// Interval between periodic background re-syncs, in minutes.
    #[serde(default = "default_resync_interval")]
    pub resync_interval_minutes: u64,
    /// Offline development license quotas.
    #[serde(default)]
    pub offline: OfflineLicenseConfig,
}

/// Quotas for the synthesized offline development license.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OfflineLicenseConfig {
    /// Maximum concurrent users.
    #[serde(default = "default_offline_users")]
    pub max_users: i32,
    /// Maximum concurrent premium-feature users.
    #[serde(default = "default_offline_feature_users")]
    pub max_feature_users: i32,
}

impl Default for OfflineLicenseConfig {
    fn default() -> Self {
        Self {
            max_users: default_offline_users(),
            max_feature_users: default_offline_feature_users(),
        }
    }
}

fn default_master_url() -> String {
    "http://localhost:9090".to_string()
}

fn default_fetch_timeout() -> u64 {
    5
}

fn default_fetch_retries() -> u32 {
    3
}

fn default_retry_delay() -> u64 {
    500
}

fn default_ttl_minutes() -> u64 {
    60
}

fn default_grace_hours() -> u64 {
    72
}

fn default_resync_interval() -> u64 {
    30
}

fn default_offline_users() -> i32 {
    5
}

fn default_offline_feature_users() -> i32 {
    2
}
