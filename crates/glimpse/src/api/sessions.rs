//! Session management API endpoints.
//!
//! All routes here require the shared API secret in the `X-Api-Key` header.
//! Handlers validate and sanitize inputs before anything reaches the
//! session manager.

use axum::Json;
use axum::extract::{Path, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use log::{error, info, warn};

use crate::security::{constant_time_compare, sanitize_git_ref, sanitize_repo_identifier};
use crate::session::{
    CreateSessionRequest, CreateSessionResponse, ErrorBody, SessionError, SessionListResponse,
    SessionStatus,
};

use super::state::AppState;

fn error_body(error: &str, message: &str) -> Json<ErrorBody> {
    Json(ErrorBody {
        error: error.to_string(),
        message: message.to_string(),
    })
}

/// Check the shared API secret. Constant-time; an unconfigured secret
/// rejects everything rather than opening the API.
fn verify_api_key(state: &AppState, headers: &HeaderMap) -> Result<(), Response> {
    let provided = headers
        .get("x-api-key")
        .and_then(|value| value.to_str().ok())
        .unwrap_or("");
    let expected = state.settings.shared_api_secret.as_str();

    if provided.is_empty() || expected.is_empty() || !constant_time_compare(provided, expected) {
        warn!("Invalid or missing API key");
        return Err((
            StatusCode::UNAUTHORIZED,
            error_body("unauthorized", "Invalid or missing API key"),
        )
            .into_response());
    }
    Ok(())
}

/// POST /api/sessions: create a session or reuse an active one.
pub async fn create_session(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(request): Json<CreateSessionRequest>,
) -> Response {
    if let Err(response) = verify_api_key(&state, &headers) {
        return response;
    }

    let Some((owner, name)) = sanitize_repo_identifier(&request.repo_owner, &request.repo_name)
    else {
        return (
            StatusCode::BAD_REQUEST,
            error_body("invalid_repository", "Invalid repository owner or name"),
        )
            .into_response();
    };

    let Some(repo_ref) = sanitize_git_ref(&request.repo_ref) else {
        return (
            StatusCode::BAD_REQUEST,
            error_body("invalid_ref", "Invalid git reference"),
        )
            .into_response();
    };

    let action = if request.force_new {
        "Creating"
    } else {
        "Finding or creating"
    };
    info!("{} session for {}/{}@{}", action, owner, name, repo_ref);

    match state
        .sessions
        .create_session(
            &owner,
            &name,
            &repo_ref,
            request.github_token,
            request.force_new,
        )
        .await
    {
        Ok(outcome) => {
            let message = if !outcome.reused {
                "Session created. Setup in progress."
            } else if outcome.view.status == SessionStatus::Ready {
                "Existing session reused."
            } else {
                "Existing session found. Setup in progress."
            };
            let status = if outcome.reused {
                StatusCode::OK
            } else {
                StatusCode::ACCEPTED
            };
            (
                status,
                Json(CreateSessionResponse {
                    session: outcome.view,
                    message: message.to_string(),
                }),
            )
                .into_response()
        }
        Err(SessionError::Capacity) => (
            StatusCode::SERVICE_UNAVAILABLE,
            error_body(
                "capacity_exhausted",
                "Too many active sessions on this instance. Please try again later.",
            ),
        )
            .into_response(),
        Err(SessionError::Internal(e)) => {
            error!("Failed to create session: {:?}", e);
            (
                StatusCode::SERVICE_UNAVAILABLE,
                error_body(
                    "session_creation_failed",
                    "Failed to create session. Please try again.",
                ),
            )
                .into_response()
        }
    }
}

/// GET /api/sessions/{id}: session status, with preview_url once ready.
pub async fn get_session(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(session_id): Path<String>,
) -> Response {
    if let Err(response) = verify_api_key(&state, &headers) {
        return response;
    }

    match state.sessions.get_session(&session_id).await {
        Ok(Some(view)) => Json(view).into_response(),
        Ok(None) => (
            StatusCode::NOT_FOUND,
            error_body("session_not_found", "Session not found"),
        )
            .into_response(),
        Err(e) => {
            error!("Failed to fetch session {}: {:?}", session_id, e);
            StatusCode::INTERNAL_SERVER_ERROR.into_response()
        }
    }
}

/// DELETE /api/sessions/{id}: stop the session and release its resources.
pub async fn delete_session(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(session_id): Path<String>,
) -> Response {
    if let Err(response) = verify_api_key(&state, &headers) {
        return response;
    }

    match state.sessions.stop_session(&session_id).await {
        Ok(true) => StatusCode::NO_CONTENT.into_response(),
        Ok(false) => (
            StatusCode::NOT_FOUND,
            error_body("session_not_found", "Session not found"),
        )
            .into_response(),
        Err(e) => {
            error!("Failed to stop session {}: {:?}", session_id, e);
            StatusCode::INTERNAL_SERVER_ERROR.into_response()
        }
    }
}

/// GET /api/sessions: active sessions owned by this instance.
pub async fn list_sessions(State(state): State<AppState>, headers: HeaderMap) -> Response {
    if let Err(response) = verify_api_key(&state, &headers) {
        return response;
    }

    match state.sessions.list_sessions().await {
        Ok(sessions) => {
            let count = sessions.len();
            Json(SessionListResponse { sessions, count }).into_response()
        }
        Err(e) => {
            error!("Failed to list sessions: {:?}", e);
            StatusCode::INTERNAL_SERVER_ERROR.into_response()
        }
    }
}
