//! Caller authentication and session token configuration.

use serde::{Deserialize, Serialize};

/// Authentication configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuthConfig {
    /// Internal API key expected in the `X-Internal-Api-Key` header.
    pub api_key: String,
    /// HMAC secret used to sign session tokens.
    pub token_secret: String,
    /// Session token lifetime in minutes.
    #[serde(default = "default_token_ttl")]
    pub token_ttl_minutes: u64,
}

fn default_token_ttl() -> u64 {
    720
}
