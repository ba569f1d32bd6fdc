//! Internal API-key caller authentication.

use axum::extract::FromRequestParts;
use axum::http::request::Parts;

use pbxgate_core::error::AppError;

use crate::error::ApiError;
use crate::state::AppState;

/// Header carrying the internal API key.
const API_KEY_HEADER: &str = "X-Internal-Api-Key";

/// Extractor proving the caller presented the internal API key.
///
/// Every admission and license endpoint requires an authenticated caller
/// identity; this service trusts the backend that fronts it, identified
/// by a shared key.
#[derive(Debug, Clone, Copy)]
pub struct ApiCaller;

impl FromRequestParts<AppState> for ApiCaller {
    type Rejection = ApiError;

    async fn from_request_parts(
        parts: &mut Parts,
        state: &AppState,
    ) -> Result<Self, Self::Rejection> {
        let presented = parts
            .headers
            .get(API_KEY_HEADER)
            .and_then(|value| value.to_str().ok())
            .ok_or_else(|| ApiError(AppError::unauthorized("Missing internal API key")))?;

        if presented != state.config.auth.api_key {
            return Err(ApiError(AppError::unauthorized("Invalid internal API key")));
        }

        Ok(ApiCaller)
    }
}
