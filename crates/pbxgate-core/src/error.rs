//! Unified application error types for PBXGate.
//!
//! All crates map their internal errors into [`AppError`] for consistent
//! propagation through the ? operator. Admission-blocking conditions
//! (quota reached, feature disabled, license inactive) are ordinary
//! `ErrorKind` variants so handlers can turn them into explicit
//! rejection codes instead of generic 500s.

use std::fmt;
use thiserror::Error;

/// Top-level error kind categorization used across the entire application.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
pub enum ErrorKind {
    /// The requested resource was not found.
    NotFound,
    /// The caller is not authenticated.
    Unauthorized,
    /// Input validation failed.
    Validation,
    /// A conflict occurred (duplicate entry, concurrent modification, etc.).
    Conflict,
    /// No usable license exists, not even the offline default.
    NoLicense,
    /// The current license is suspended, expired, or invalid.
    LicenseInactive,
    /// The requested feature is not enabled on the current license.
    FeatureDisabled,
    /// The concurrent-user quota for the feature is exhausted.
    LimitExceeded,
    /// The user already holds an active session from a different device.
    SessionConflict,
    /// The master server is unreachable (recovered via stale/offline fallback).
    SyncUnavailable,
    /// The atomic session cache is unavailable (degraded durable-only mode).
    StoreUnavailable,
    /// A database error occurred.
    Database,
    /// A cache error occurred.
    Cache,
    /// A configuration error occurred.
    Configuration,
    /// A serialization/deserialization error occurred.
    Serialization,
    /// An external service error occurred.
    ExternalService,
    /// An internal server error occurred.
    Internal,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NotFound => write!(f, "NOT_FOUND"),
            Self::Unauthorized => write!(f, "UNAUTHORIZED"),
            Self::Validation => write!(f, "VALIDATION"),
            Self::Conflict => write!(f, "CONFLICT"),
            Self::NoLicense => write!(f, "NO_LICENSE"),
            Self::LicenseInactive => write!(f, "LICENSE_INACTIVE"),
            Self::FeatureDisabled => write!(f, "FEATURE_DISABLED"),
            Self::LimitExceeded => write!(f, "LIMIT_EXCEEDED"),
            Self::SessionConflict => write!(f, "SESSION_CONFLICT"),
            Self::SyncUnavailable => write!(f, "SYNC_UNAVAILABLE"),
            Self::StoreUnavailable => write!(f, "STORE_UNAVAILABLE"),
            Self::Database => write!(f, "DATABASE"),
            Self::Cache => write!(f, "CACHE"),
            Self::Configuration => write!(f, "CONFIGURATION"),
            Self::Serialization => write!(f, "SERIALIZATION"),
            Self::ExternalService => write!(f, "EXTERNAL_SERVICE"),
            Self::Internal => write!(f, "INTERNAL"),
        }
    }
}

/// The unified application error used throughout PBXGate.
///
/// All crate-specific errors are mapped into `AppError` using `From` impls
/// or explicit `.map_err()` calls. Rejections that a client can act on
/// carry structured `details` (e.g. current/max user counts).
#[derive(Debug, Error)]
#[error("{kind}: {message}")]
pub struct AppError {
    /// The category of error.
    pub kind: ErrorKind,
    /// A human-readable error message.
    pub message: String,
    /// Structured machine-readable details for rejection responses.
    pub details: Option<serde_json::Value>,
    /// Optional underlying cause.
    #[source]
    pub source: Option<Box<dyn std::error::Error + Send + Sync>>,
}

impl AppError {
    /// Create a new application error.
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            details: None,
            source: None,
        }
    }

    /// Create a new application error with an underlying cause.
    pub fn with_source(
        kind: ErrorKind,
        message: impl Into<String>,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        Self {
            kind,
            message: message.into(),
            details: None,
            source: Some(Box::new(source)),
        }
    }

    /// Attach structured details to the error.
    pub fn with_details(mut self, details: serde_json::Value) -> Self {
        self.details = Some(details);
        self
    }

    /// Create a not-found error.
    pub fn not_found(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::NotFound, message)
    }

    /// Create an unauthorized error.
    pub fn unauthorized(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Unauthorized, message)
    }

    /// Create a validation error.
    pub fn validation(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Validation, message)
    }

    /// Create a conflict error.
    pub fn conflict(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Conflict, message)
    }

    /// Create a no-license error.
    pub fn no_license(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::NoLicense, message)
    }

    /// Create a license-inactive error.
    pub fn license_inactive(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::LicenseInactive, message)
    }

    /// Create a feature-disabled error.
    pub fn feature_disabled(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::FeatureDisabled, message)
    }

    /// Create a limit-exceeded error carrying the current/max counts.
    pub fn limit_exceeded(message: impl Into<String>, current: i64, max: i64) -> Self {
        Self::new(ErrorKind::LimitExceeded, message).with_details(serde_json::json!({
            "current_users": current,
            "max_users": max,
        }))
    }

    /// Create a session-conflict error.
    pub fn session_conflict(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::SessionConflict, message)
    }

    /// Create a sync-unavailable error.
    pub fn sync_unavailable(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::SyncUnavailable, message)
    }

    /// Create a store-unavailable error.
    pub fn store_unavailable(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::StoreUnavailable, message)
    }

    /// Create a database error.
    pub fn database(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Database, message)
    }

    /// Create a cache error.
    pub fn cache(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Cache, message)
    }

    /// Create a configuration error.
    pub fn configuration(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Configuration, message)
    }

    /// Create an external-service error.
    pub fn external_service(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::ExternalService, message)
    }

    /// Create an internal error.
    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Internal, message)
    }
}

impl Clone for AppError {
    fn clone(&self) -> Self {
        Self {
            kind: self.kind,
            message: self.message.clone(),
            details: self.details.clone(),
            source: None,
        }
    }
}

impl From<serde_json::Error> for AppError {
    fn from(err: serde_json::Error) -> Self {
        Self::with_source(
            ErrorKind::Serialization,
            format!("JSON serialization error: {err}"),
            err,
        )
    }
}

impl From<config::ConfigError> for AppError {
    fn from(err: config::ConfigError) -> Self {
        Self::with_source(
            ErrorKind::Configuration,
            format!("Configuration error: {err}"),
            err,
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_limit_exceeded_details() {
        let err = AppError::limit_exceeded("Quota reached", 10, 10);
        assert_eq!(err.kind, ErrorKind::LimitExceeded);
        let details = err.details.expect("details present");
        assert_eq!(details["current_users"], 10);
        assert_eq!(details["max_users"], 10);
    }

    #[test]
    fn test_display_includes_kind_code() {
        let err = AppError::feature_disabled("Recording is not licensed");
        assert_eq!(err.to_string(), "FEATURE_DISABLED: Recording is not licensed");
    }
}
