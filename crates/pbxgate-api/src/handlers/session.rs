//! Session handlers: validate, create, atomic setup, heartbeat, end,
//! forced cleanup, and registration-token checks.

use std::net::SocketAddr;

use axum::Json;
use axum::extract::{ConnectInfo, Path, State};
use axum::http::{HeaderMap, StatusCode, header};
use uuid::Uuid;
use validator::Validate;

use pbxgate_core::error::AppError;
use pbxgate_entity::license::Feature;
use pbxgate_entity::session::principal_id;
use pbxgate_session::{ClientMeta, RegistrationValidation, SetupOutcome, ValidationOutcome};

use crate::dto::request::{
    CreateSessionRequest, EndSessionsRequest, ValidateSessionRequest, ValidateTokenRequest,
};
use crate::dto::response::{
    ApiResponse, AtomicSetupResponse, MessageResponse, SessionCreatedResponse, SessionSummary,
    SessionValidationResponse, SessionsEndedResponse,
};
use crate::error::ApiError;
use crate::extractors::ApiCaller;
use crate::state::AppState;

/// Pull client metadata out of the request.
fn client_meta(headers: &HeaderMap, addr: SocketAddr) -> ClientMeta {
    ClientMeta {
        ip_address: Some(addr.ip().to_string()),
        user_agent: headers
            .get(header::USER_AGENT)
            .and_then(|v| v.to_str().ok())
            .map(String::from),
    }
}

fn check(req: &impl Validate) -> Result<(), AppError> {
    req.validate()
        .map_err(|e| AppError::validation(e.to_string()))
}

/// POST /api/sessions/validate
pub async fn validate(
    State(state): State<AppState>,
    _caller: ApiCaller,
    Json(req): Json<ValidateSessionRequest>,
) -> Result<Json<SessionValidationResponse>, ApiError> {
    check(&req)?;

    let user_id = principal_id(&req.username);
    let outcome = state
        .controller
        .validate(user_id, req.feature, &req.client_fingerprint)
        .await?;

    let response = match outcome {
        ValidationOutcome::Valid { session } => SessionValidationResponse {
            success: true,
            can_create_session: Some(false),
            session: Some(SessionSummary::from(&session)),
        },
        ValidationOutcome::ReadyToCreate => SessionValidationResponse {
            success: true,
            can_create_session: Some(true),
            session: None,
        },
        ValidationOutcome::Conflict => SessionValidationResponse {
            success: false,
            can_create_session: Some(false),
            session: None,
        },
    };
    Ok(Json(response))
}

/// POST /api/sessions
pub async fn create(
    State(state): State<AppState>,
    _caller: ApiCaller,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
    Json(req): Json<CreateSessionRequest>,
) -> Result<(StatusCode, Json<SessionCreatedResponse>), ApiError> {
    check(&req)?;

    let meta = client_meta(&headers, addr);
    let created = state
        .controller
        .create(
            principal_id(&req.username),
            &req.username,
            req.feature,
            &req.client_fingerprint,
            &meta,
        )
        .await?;

    Ok((
        StatusCode::CREATED,
        Json(SessionCreatedResponse {
            session_token: created.session_token,
            session_id: created.session_id,
            max_users: created.max_users,
            current_users: created.current_users,
        }),
    ))
}

/// POST /api/sessions/atomic-setup: combined validate+create.
pub async fn atomic_setup(
    State(state): State<AppState>,
    _caller: ApiCaller,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
    Json(req): Json<CreateSessionRequest>,
) -> Result<(StatusCode, Json<AtomicSetupResponse>), ApiError> {
    check(&req)?;

    let meta = client_meta(&headers, addr);
    let outcome = state
        .controller
        .setup(
            principal_id(&req.username),
            &req.username,
            req.feature,
            &req.client_fingerprint,
            &meta,
        )
        .await?;

    let (status, response) = match outcome {
        SetupOutcome::Existing(session) => (
            StatusCode::OK,
            AtomicSetupResponse {
                created: false,
                session_id: session.session_id,
                session_token: None,
                max_users: None,
                current_users: None,
            },
        ),
        SetupOutcome::Created(created) => (
            StatusCode::CREATED,
            AtomicSetupResponse {
                created: true,
                session_id: created.session_id,
                session_token: Some(created.session_token),
                max_users: Some(created.max_users),
                current_users: Some(created.current_users),
            },
        ),
    };
    Ok((status, Json(response)))
}

/// POST /api/sessions/{session_id}/heartbeat
pub async fn heartbeat(
    State(state): State<AppState>,
    _caller: ApiCaller,
    Path(session_id): Path<Uuid>,
) -> Result<Json<ApiResponse<MessageResponse>>, ApiError> {
    state.controller.heartbeat(session_id).await?;
    Ok(Json(ApiResponse::ok(MessageResponse {
        message: "heartbeat accepted".to_string(),
    })))
}

/// POST /api/sessions/end: ends all sessions for the principal.
pub async fn end_sessions(
    State(state): State<AppState>,
    _caller: ApiCaller,
    Json(req): Json<EndSessionsRequest>,
) -> Result<Json<ApiResponse<SessionsEndedResponse>>, ApiError> {
    check(&req)?;

    let ended = state
        .controller
        .end_all_for_user(principal_id(&req.username))
        .await?;
    Ok(Json(ApiResponse::ok(SessionsEndedResponse { ended })))
}

/// DELETE /api/sessions/{user_id}/{feature}: administrative forced
/// cleanup. Idempotent, always 200.
pub async fn force_cleanup(
    State(state): State<AppState>,
    _caller: ApiCaller,
    Path((user_id, feature)): Path<(Uuid, Feature)>,
) -> Result<Json<ApiResponse<MessageResponse>>, ApiError> {
    state.controller.force_cleanup(user_id, feature).await?;
    Ok(Json(ApiResponse::ok(MessageResponse {
        message: "session cleanup completed".to_string(),
    })))
}

/// POST /api/sessions/validate-token: registration-time token check
/// made by the telephony layer.
pub async fn validate_token(
    State(state): State<AppState>,
    _caller: ApiCaller,
    Json(req): Json<ValidateTokenRequest>,
) -> Result<Json<ApiResponse<RegistrationValidation>>, ApiError> {
    check(&req)?;

    let validation = state
        .controller
        .validate_registration(&req.session_token)
        .await?;
    Ok(Json(ApiResponse::ok(validation)))
}
