//! License handlers: current license projection and forced sync.

use axum::Json;
use axum::extract::State;

use crate::dto::response::{ApiResponse, LicenseResponse};
use crate::error::ApiError;
use crate::extractors::ApiCaller;
use crate::state::AppState;

/// GET /api/license
pub async fn get_license(
    State(state): State<AppState>,
    _caller: ApiCaller,
) -> Result<Json<ApiResponse<LicenseResponse>>, ApiError> {
    let record = state.license_engine.get_current_license().await?;
    Ok(Json(ApiResponse::ok(LicenseResponse::from(&record))))
}

/// POST /api/license/sync
pub async fn sync_license(
    State(state): State<AppState>,
    _caller: ApiCaller,
) -> Result<Json<ApiResponse<LicenseResponse>>, ApiError> {
    let record = state.license_engine.sync_from_master().await?;
    Ok(Json(ApiResponse::ok(LicenseResponse::from(&record))))
}
