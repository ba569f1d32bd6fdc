//! HTTP client for the master licensing server.

use std::collections::BTreeMap;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;
use uuid::Uuid;

use pbxgate_core::config::license::LicenseConfig;
use pbxgate_core::error::AppError;
use pbxgate_entity::license::{Feature, LicenseStatus};

/// Header carrying the internal API key on outbound master calls.
const API_KEY_HEADER: &str = "X-Internal-Api-Key";

/// License document as served by the master's fingerprint endpoint.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LicensePayload {
    /// Master-assigned license id.
    pub license_id: String,
    /// Organization name.
    pub organization_name: String,
    /// Opaque signed license blob.
    pub license_key: Option<String>,
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
    /// Raw feature bag; parsed into a typed set at sync time.
    #[serde(default)]
    pub features: BTreeMap<String, bool>,
    /// License tier name.
    #[serde(default)]
    pub license_type_name: String,
}

/// Session lifecycle event reported to the master, best-effort.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ActivityEvent {
    /// A session was admitted.
    Created,
    /// A session ended.
    Ended,
}

/// Best-effort session activity notification body.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionActivity {
    /// Master license id the session was admitted under.
    pub master_license_id: String,
    /// Principal id.
    pub user_id: Uuid,
    /// Username.
    pub username: String,
    /// Feature the session used.
    pub feature: Feature,
    /// What happened.
    pub event: ActivityEvent,
    /// When it happened.
    pub occurred_at: DateTime<Utc>,
}

/// Failure of an outbound master call.
#[derive(Debug, Error)]
pub enum FetchError {
    /// The master answered with a non-success status.
    #[error("master returned HTTP {0}")]
    Status(u16),
    /// The request hit the absolute deadline.
    #[error("master request timed out")]
    Timeout,
    /// Transport-level failure.
    #[error("master unreachable: {0}")]
    Network(String),
}

impl FetchError {
    /// Whether a retry with fixed delay is worthwhile. Only transient
    /// server-side statuses qualify; network failures and timeouts go
    /// straight to the stale/offline fallback.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Status(code) if *code >= 500 || *code == 429)
    }
}

impl From<FetchError> for AppError {
    fn from(err: FetchError) -> Self {
        AppError::sync_unavailable(format!("License fetch failed: {err}"))
    }
}

/// Outbound interface to the master licensing server.
#[async_trait]
pub trait MasterApi: Send + Sync + std::fmt::Debug {
    /// Fetch the license bound to a fingerprint.
    async fn fetch_license(&self, fingerprint: &str) -> Result<LicensePayload, FetchError>;

    /// Report a session lifecycle event. Callers treat failures as
    /// ignorable; the local decision already stands.
    async fn notify_session_activity(&self, activity: &SessionActivity) -> Result<(), FetchError>;
}

/// reqwest-based master client with a short absolute timeout, distinct
/// from the inbound HTTP request timeout.
#[derive(Debug, Clone)]
pub struct MasterHttpClient {
    http: reqwest::Client,
    base_url: String,
    api_key: String,
}

impl MasterHttpClient {
    /// Create a new master client from configuration.
    pub fn new(config: &LicenseConfig) -> Result<Self, AppError> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.fetch_timeout_seconds))
            .build()
            .map_err(|e| {
                AppError::with_source(
                    pbxgate_core::error::ErrorKind::Configuration,
                    "Failed to build master HTTP client",
                    e,
                )
            })?;

        Ok(Self {
            http,
            base_url: config.master_url.trim_end_matches('/').to_string(),
            api_key: config.master_api_key.clone(),
        })
    }

    fn map_err(e: reqwest::Error) -> FetchError {
        if e.is_timeout() {
            FetchError::Timeout
        } else {
            FetchError::Network(e.to_string())
        }
    }
}

#[async_trait]
impl MasterApi for MasterHttpClient {
    async fn fetch_license(&self, fingerprint: &str) -> Result<LicensePayload, FetchError> {
        let url = format!("{}/licenses/fingerprint/{fingerprint}", self.base_url);
        debug!(url = %url, "Fetching license from master");

        let response = self
            .http
            .get(&url)
            .header(API_KEY_HEADER, &self.api_key)
            .send()
            .await
            .map_err(Self::map_err)?;

        let status = response.status();
        if !status.is_success() {
            return Err(FetchError::Status(status.as_u16()));
        }

        response
            .json::<LicensePayload>()
            .await
            .map_err(|e| FetchError::Network(format!("invalid license payload: {e}")))
    }

    async fn notify_session_activity(&self, activity: &SessionActivity) -> Result<(), FetchError> {
        let url = format!("{}/licenses/session-activity", self.base_url);

        let response = self
            .http
            .post(&url)
            .header(API_KEY_HEADER, &self.api_key)
            .json(activity)
            .send()
            .await
            .map_err(Self::map_err)?;

        let status = response.status();
        if !status.is_success() {
            return Err(FetchError::Status(status.as_u16()));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retryable_statuses() {
        assert!(FetchError::Status(500).is_retryable());
        assert!(FetchError::Status(503).is_retryable());
        assert!(FetchError::Status(429).is_retryable());
        assert!(!FetchError::Status(404).is_retryable());
        assert!(!FetchError::Status(401).is_retryable());
        assert!(!FetchError::Timeout.is_retryable());
        assert!(!FetchError::Network("refused".to_string()).is_retryable());
    }

    #[test]
    fn test_payload_parses_camel_case() {
        let raw = serde_json::json!({
            "licenseId": "lic-200",
            "organizationName": "Acme Telecom",
            "licenseKey": "signed-blob",
            "status": "active",
            "maxUsers": 25,
            "maxFeatureUsers": 5,
            "issuedAt": "2026-01-01T00:00:00Z",
            "expiresAt": null,
            "features": {"telephony": true, "premium": false},
            "licenseTypeName": "standard"
        });

        let payload: LicensePayload = serde_json::from_value(raw).unwrap();
        assert_eq!(payload.license_id, "lic-200");
        assert_eq!(payload.max_users, 25);
        assert_eq!(payload.status, LicenseStatus::Active);
        assert_eq!(payload.features.get("telephony"), Some(&true));
    }
}
