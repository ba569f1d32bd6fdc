//! Signed session tokens.
//!
//! A token binds the admitted session to its license row, principal,
//! device fingerprint, and SIP username, so the telephony layer can
//! validate registrations without a store lookup on the hot path.

use chrono::{DateTime, Duration, Utc};
use jsonwebtoken::{Algorithm, DecodingKey, EncodingKey, Header, Validation};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use pbxgate_core::config::auth::AuthConfig;
use pbxgate_core::error::AppError;
use pbxgate_core::result::AppResult;

/// Claims embedded in every session token.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionTokenClaims {
    /// License row the session was admitted under.
    pub lic: Uuid,
    /// Subject claim: the principal id.
    pub sub: Uuid,
    /// Client device fingerprint.
    pub fp: String,
    /// SIP username the device registers with.
    pub sip: String,
    /// Issued-at timestamp (seconds since epoch).
    pub iat: i64,
    /// Expiration timestamp (seconds since epoch).
    pub exp: i64,
    /// Token id: the session id.
    pub jti: Uuid,
}

impl SessionTokenClaims {
    /// The session this token belongs to.
    pub fn session_id(&self) -> Uuid {
        self.jti
    }

    /// The expiration as a `DateTime<Utc>`.
    pub fn expires_at(&self) -> DateTime<Utc> {
        DateTime::from_timestamp(self.exp, 0).unwrap_or_else(Utc::now)
    }
}

/// HS256 encoder/decoder for session tokens.
pub struct SessionTokens {
    encoding: EncodingKey,
    decoding: DecodingKey,
    validation: Validation,
    ttl: Duration,
}

impl std::fmt::Debug for SessionTokens {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionTokens").finish()
    }
}

impl SessionTokens {
    /// Create a token codec from configuration.
    pub fn new(config: &AuthConfig) -> Self {
        Self {
            encoding: EncodingKey::from_secret(config.token_secret.as_bytes()),
            decoding: DecodingKey::from_secret(config.token_secret.as_bytes()),
            validation: Validation::new(Algorithm::HS256),
            ttl: Duration::minutes(config.token_ttl_minutes as i64),
        }
    }

    /// Issue a token for an admitted session.
    pub fn issue(
        &self,
        session_id: Uuid,
        license_id: Uuid,
        user_id: Uuid,
        client_fingerprint: &str,
        sip_user: &str,
    ) -> AppResult<String> {
        let now = Utc::now();
        let claims = SessionTokenClaims {
            lic: license_id,
            sub: user_id,
            fp: client_fingerprint.to_string(),
            sip: sip_user.to_string(),
            iat: now.timestamp(),
            exp: (now + self.ttl).timestamp(),
            jti: session_id,
        };

        jsonwebtoken::encode(&Header::default(), &claims, &self.encoding)
            .map_err(|e| AppError::internal(format!("Failed to sign session token: {e}")))
    }

    /// Verify a token's signature and expiry, returning its claims.
    pub fn verify(&self, token: &str) -> AppResult<SessionTokenClaims> {
        jsonwebtoken::decode::<SessionTokenClaims>(token, &self.decoding, &self.validation)
            .map(|data| data.claims)
            .map_err(|e| AppError::unauthorized(format!("Invalid session token: {e}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn codec() -> SessionTokens {
        SessionTokens::new(&AuthConfig {
            api_key: "internal".to_string(),
            token_secret: "a-reasonably-long-test-secret".to_string(),
            token_ttl_minutes: 60,
        })
    }

    #[test]
    fn test_issue_and_verify_roundtrip() {
        let codec = codec();
        let session_id = Uuid::new_v4();
        let license_id = Uuid::new_v4();
        let user_id = Uuid::new_v4();

        let token = codec
            .issue(session_id, license_id, user_id, "fp-1", "alice")
            .unwrap();
        let claims = codec.verify(&token).unwrap();

        assert_eq!(claims.session_id(), session_id);
        assert_eq!(claims.lic, license_id);
        assert_eq!(claims.sub, user_id);
        assert_eq!(claims.fp, "fp-1");
        assert_eq!(claims.sip, "alice");
        assert!(claims.expires_at() > Utc::now());
    }

    #[test]
    fn test_verify_rejects_tampered_token() {
        let codec = codec();
        let token = codec
            .issue(Uuid::new_v4(), Uuid::new_v4(), Uuid::new_v4(), "fp", "bob")
            .unwrap();

        let mut tampered = token.clone();
        tampered.push('x');
        assert!(codec.verify(&tampered).is_err());

        let other = SessionTokens::new(&AuthConfig {
            api_key: "internal".to_string(),
            token_secret: "a-different-secret-entirely!!".to_string(),
            token_ttl_minutes: 60,
        });
        assert!(other.verify(&token).is_err());
    }
}
