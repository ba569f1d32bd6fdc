//! Host fingerprint provider.
//!
//! The fingerprint binds a cached license to the machine it was fetched
//! for. Generation is intentionally opaque to the rest of the system:
//! everything downstream treats it as a stable string.

use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};

use pbxgate_core::result::AppResult;

/// Produces a stable identifier for the current host.
pub trait FingerprintProvider: Send + Sync + std::fmt::Debug {
    /// The fingerprint of the machine this process runs on.
    fn current(&self) -> AppResult<String>;
}

/// Default provider deriving the fingerprint from machine-id and hostname.
#[derive(Debug, Clone, Default)]
pub struct HostFingerprint;

impl HostFingerprint {
    /// Create a new host fingerprint provider.
    pub fn new() -> Self {
        Self
    }
}

impl FingerprintProvider for HostFingerprint {
    fn current(&self) -> AppResult<String> {
        let machine_id = std::fs::read_to_string("/etc/machine-id")
            .or_else(|_| std::fs::read_to_string("/var/lib/dbus/machine-id"))
            .unwrap_or_default();
        let hostname = std::fs::read_to_string("/etc/hostname")
            .ok()
            .or_else(|| std::env::var("HOSTNAME").ok())
            .unwrap_or_else(|| "unknown-host".to_string());

        Ok(hex_digest(&format!(
            "{}|{}",
            machine_id.trim(),
            hostname.trim()
        )))
    }
}

/// Hash the input into a 32-character hex digest.
fn hex_digest(input: &str) -> String {
    let mut hasher = DefaultHasher::new();
    input.hash(&mut hasher);
    let high = hasher.finish();
    // Second round over the first digest widens the output to 128 bits.
    high.hash(&mut hasher);
    let low = hasher.finish();
    format!("{high:016x}{low:016x}")
}

/// Fixed fingerprint for tests and containerized deployments that pin the
/// identity through configuration.
#[derive(Debug, Clone)]
pub struct FixedFingerprint(pub String);

impl FingerprintProvider for FixedFingerprint {
    fn current(&self) -> AppResult<String> {
        Ok(self.0.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_digest_is_stable() {
        assert_eq!(hex_digest("abc"), hex_digest("abc"));
        assert_ne!(hex_digest("abc"), hex_digest("abd"));
        assert_eq!(hex_digest("abc").len(), 32);
    }

    #[test]
    fn test_host_fingerprint_is_stable() {
        let provider = HostFingerprint::new();
        assert_eq!(provider.current().unwrap(), provider.current().unwrap());
    }
}
