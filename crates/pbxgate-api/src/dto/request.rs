//! Request DTOs.

use serde::{Deserialize, Serialize};
use validator::Validate;

use pbxgate_entity::license::Feature;

/// Body of `POST /sessions/validate`.
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
#[serde(rename_all = "camelCase")]
pub struct ValidateSessionRequest {
    /// SIP username of the principal.
    #[validate(length(min = 1, max = 64))]
    pub username: String,
    /// Fingerprint of the client device.
    #[validate(length(min = 1, max = 128))]
    pub client_fingerprint: String,
    /// Feature to admit against.
    pub feature: Feature,
}

/// Body of `POST /sessions` and `POST /sessions/atomic-setup`.
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
#[serde(rename_all = "camelCase")]
pub struct CreateSessionRequest {
    /// SIP username of the principal.
    #[validate(length(min = 1, max = 64))]
    pub username: String,
    /// Fingerprint of the client device.
    #[validate(length(min = 1, max = 128))]
    pub client_fingerprint: String,
    /// Feature to admit against.
    pub feature: Feature,
}

/// Body of `POST /sessions/end`.
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
#[serde(rename_all = "camelCase")]
pub struct EndSessionsRequest {
    /// SIP username of the principal whose sessions end.
    #[validate(length(min = 1, max = 64))]
    pub username: String,
}

/// Body of `POST /sessions/validate-token`.
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
#[serde(rename_all = "camelCase")]
pub struct ValidateTokenRequest {
    /// Session token presented at device registration.
    #[validate(length(min = 1))]
    pub session_token: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_create_request_parses_camel_case() {
        let raw = serde_json::json!({
            "username": "alice",
            "clientFingerprint": "fp-1",
            "feature": "premium"
        });
        let req: CreateSessionRequest = serde_json::from_value(raw).unwrap();
        assert_eq!(req.feature, Feature::Premium);
        assert!(req.validate().is_ok());
    }

    #[test]
    fn test_empty_username_fails_validation() {
        let req = ValidateSessionRequest {
            username: String::new(),
            client_fingerprint: "fp".to_string(),
            feature: Feature::Telephony,
        };
        assert!(req.validate().is_err());
    }
}
