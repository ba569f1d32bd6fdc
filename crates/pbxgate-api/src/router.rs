//! Route definitions for the PBXGate HTTP API.
//!
//! All routes are organized by domain and mounted under `/api`. The
//! router receives `AppState` and passes it to all handlers via Axum's
//! `State` extractor.

use axum::{
    Router,
    routing::{delete, get, post},
};
use axum::http::HeaderValue;
use tower_http::cors::{Any, AllowOrigin, CorsLayer};
use tower_http::trace::TraceLayer;

use crate::handlers;
use crate::state::AppState;

/// Build the complete Axum router with all routes and middleware.
pub fn build_router(state: AppState) -> Router {
    let api_routes = Router::new()
        .merge(session_routes())
        .merge(license_routes())
        .merge(health_routes());

    let cors = build_cors_layer(&state);

    Router::new()
        .nest("/api", api_routes)
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .with_state(state)
}

/// Session admission endpoints.
fn session_routes() -> Router<AppState> {
    Router::new()
        .route("/sessions/validate", post(handlers::session::validate))
        .route("/sessions", post(handlers::session::create))
        .route(
            "/sessions/atomic-setup",
            post(handlers::session::atomic_setup),
        )
        .route(
            "/sessions/{session_id}/heartbeat",
            post(handlers::session::heartbeat),
        )
        .route("/sessions/end", post(handlers::session::end_sessions))
        .route(
            "/sessions/{user_id}/{feature}",
            delete(handlers::session::force_cleanup),
        )
        .route(
            "/sessions/validate-token",
            post(handlers::session::validate_token),
        )
}

/// License endpoints.
fn license_routes() -> Router<AppState> {
    Router::new()
        .route("/license", get(handlers::license::get_license))
        .route("/license/sync", post(handlers::license::sync_license))
}

/// Health endpoints (unauthenticated).
fn health_routes() -> Router<AppState> {
    Router::new().route("/health", get(handlers::health::health))
}

/// CORS layer from configuration; `["*"]` allows any origin.
fn build_cors_layer(state: &AppState) -> CorsLayer {
    let origins = &state.config.server.cors.allowed_origins;

    if origins.iter().any(|o| o == "*") {
        CorsLayer::new()
            .allow_origin(Any)
            .allow_methods(Any)
            .allow_headers(Any)
    } else {
        let parsed: Vec<HeaderValue> = origins
            .iter()
            .filter_map(|origin| origin.parse().ok())
            .collect();
        CorsLayer::new().allow_origin(AllowOrigin::list(parsed))
    }
}
