//! Background worker configuration.

use serde::{Deserialize, Serialize};

/// Background worker configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerConfig {
    /// Whether background jobs run in this process.
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Interval between reconciliation passes, in minutes.
    #[serde(default = "default_reconcile_interval")]
    pub reconcile_interval_minutes: u64,
    /// How long a failed license row is retained before physical deletion,
    /// in hours.
    #[serde(default = "default_failed_retention")]
    pub failed_license_retention_hours: u64,
}

fn default_true() -> bool {
    true
}

fn default_reconcile_interval() -> u64 {
    15
}

fn default_failed_retention() -> u64 {
    24
}
