//! Preview traffic entry points.
//!
//! One handler pair serves both routing modes: in subdomain mode the
//! rewrite middleware has already turned `{id}.{domain}/{path}` into
//! `/preview/{id}/{path}` before routing. Requests authenticate with the
//! session token from the query string or from a per-session cookie set on
//! the first hit.

pub mod http;
pub mod pages;
pub mod rewrite;
pub mod websocket;

use axum::Json;
use axum::body::Body;
use axum::extract::ws::WebSocket;
use axum::extract::{FromRequestParts, Path, State, WebSocketUpgrade};
use axum::http::header::{self, HeaderMap, HeaderValue};
use axum::http::{Request, StatusCode};
use axum::response::{Html, IntoResponse, Response};
use log::{error, info, warn};

use crate::security::validate_access_token;
use crate::session::{ErrorBody, SessionStatus};

use super::state::AppState;
use pages::{error_page, loading_page};

/// Cookie names are per session so parallel previews do not evict each
/// other's credentials.
const SESSION_COOKIE_PREFIX: &str = "glimpse_preview_";

/// Cookie lifetime in seconds.
const COOKIE_MAX_AGE: u32 = 3600;

/// Preview handler for the session root (`/preview/{id}` and
/// `/preview/{id}/`).
pub async fn preview_root(
    State(state): State<AppState>,
    Path(session_id): Path<String>,
    req: Request<Body>,
) -> Response {
    handle_preview(state, session_id, String::new(), req).await
}

/// Preview handler for everything below the session root.
pub async fn preview_path(
    State(state): State<AppState>,
    Path((session_id, path)): Path<(String, String)>,
    req: Request<Body>,
) -> Response {
    handle_preview(state, session_id, path, req).await
}

async fn handle_preview(
    state: AppState,
    session_id: String,
    path: String,
    req: Request<Body>,
) -> Response {
    let (mut parts, body) = req.into_parts();
    let ws = WebSocketUpgrade::from_request_parts(&mut parts, &state)
        .await
        .ok();
    let req = Request::from_parts(parts, body);
    let query = req.uri().query().map(ToString::to_string);
    let query_token = query_param(query.as_deref(), "token");
    let cookie_name = session_cookie_name(&session_id);
    let cookie_token = cookie_value(req.headers(), &cookie_name);

    let token_from_cookie = query_token.is_none() && cookie_token.is_some();
    let Some(effective_token) = query_token.or(cookie_token) else {
        warn!("Missing access token for session {}", session_id);
        return auth_error(StatusCode::UNAUTHORIZED, "Invalid or missing access token");
    };

    if !validate_access_token(&effective_token) {
        warn!("Malformed access token for session {}", session_id);
        return auth_error(StatusCode::UNAUTHORIZED, "Invalid or missing access token");
    }

    let (mut valid, record, mut port) = match state
        .sessions
        .validate_access(&session_id, &effective_token)
        .await
    {
        Ok(result) => result,
        Err(e) => {
            error!("Access validation failed for {}: {:?}", session_id, e);
            return StatusCode::INTERNAL_SERVER_ERROR.into_response();
        }
    };

    // An unknown id and a wrong token are indistinguishable on purpose.
    let Some(record) = record else {
        return auth_error(StatusCode::NOT_FOUND, "Session not found");
    };

    match record.status {
        SessionStatus::Failed => {
            return (StatusCode::BAD_GATEWAY, Html(error_page())).into_response();
        }
        SessionStatus::Stopped => {
            return (StatusCode::GONE, Html(error_page())).into_response();
        }
        SessionStatus::Ready => {}
        status => {
            return loading_response(status);
        }
    }

    if !valid || port.is_none() {
        let owned_here =
            record.container_instance.as_deref() == Some(state.settings.instance_id.as_str());
        if !owned_here {
            info!(
                "Session {} owned by {:?}, attempting recovery",
                session_id, record.container_instance
            );
            match state.sessions.recover_session(&session_id).await {
                Ok(Some(new_port)) => {
                    info!("Session {} recovered on port {}", session_id, new_port);
                    port = Some(new_port);
                    valid = true;
                }
                Ok(None) => {
                    return loading_response(SessionStatus::Starting);
                }
                Err(e) => {
                    error!("Recovery error for session {}: {:?}", session_id, e);
                    return loading_response(SessionStatus::Starting);
                }
            }
        }

        if !valid || port.is_none() {
            return (
                StatusCode::SERVICE_UNAVAILABLE,
                Json(ErrorBody {
                    error: "session_unavailable".to_string(),
                    message: "Session process not available".to_string(),
                }),
            )
                .into_response();
        }
    }

    let port = port.unwrap_or_default();

    if let Err(e) = state.sessions.update_activity(&session_id).await {
        warn!("Failed to bump activity for session {}: {:?}", session_id, e);
    }

    if let Some(ws) = ws {
        return serve_websocket(ws, port, path, query, session_id);
    }

    let mut response = http::forward_request(
        &state.http_client,
        req,
        port,
        &path,
        &session_id,
        &state.settings,
    )
    .await;

    // First hit came with a query token; hand the browser a cookie so asset
    // and websocket requests authenticate without one.
    if !token_from_cookie {
        let cookie = build_session_cookie(&state, &session_id, &cookie_name, &effective_token);
        if let Ok(value) = HeaderValue::from_str(&cookie) {
            response.headers_mut().append(header::SET_COOKIE, value);
        }
    }

    response
}

fn serve_websocket(
    ws: WebSocketUpgrade,
    port: u16,
    path: String,
    query: Option<String>,
    session_id: String,
) -> Response {
    ws.on_upgrade(move |socket: WebSocket| async move {
        if let Err(e) =
            websocket::relay_websocket(socket, port, &path, query.as_deref(), &session_id).await
        {
            warn!("WebSocket proxy error for session {}: {:#}", session_id, e);
        }
    })
}

fn loading_response(status: SessionStatus) -> Response {
    (
        StatusCode::ACCEPTED,
        [(
            header::HeaderName::from_static("refresh"),
            HeaderValue::from_static("3"),
        )],
        Html(loading_page(status)),
    )
        .into_response()
}

fn auth_error(status: StatusCode, message: &str) -> Response {
    let error = if status == StatusCode::UNAUTHORIZED {
        "unauthorized"
    } else {
        "session_not_found"
    };
    (
        status,
        Json(ErrorBody {
            error: error.to_string(),
            message: message.to_string(),
        }),
    )
        .into_response()
}

/// Cookie scope depends on the routing mode: subdomain cookies live at the
/// root (the browser scopes them to the subdomain), path-mode cookies are
/// confined to the session's prefix.
fn build_session_cookie(
    state: &AppState,
    session_id: &str,
    cookie_name: &str,
    token: &str,
) -> String {
    let path = if state.settings.use_subdomain_routing {
        "/".to_string()
    } else {
        format!("{}/{}", state.settings.preview_path_prefix, session_id)
    };
    format!(
        "{}={}; Path={}; Max-Age={}; HttpOnly; Secure; SameSite=None",
        cookie_name, token, path, COOKIE_MAX_AGE
    )
}

fn session_cookie_name(session_id: &str) -> String {
    let short = &session_id[..session_id.len().min(8)];
    format!("{}{}", SESSION_COOKIE_PREFIX, short)
}

/// Pull one value out of a query string.
fn query_param(query: Option<&str>, name: &str) -> Option<String> {
    let query = query?;
    for pair in query.split('&') {
        let mut parts = pair.splitn(2, '=');
        if parts.next() == Some(name) {
            let raw = parts.next().unwrap_or("");
            return match urlencoding::decode(raw) {
                Ok(decoded) => Some(decoded.into_owned()),
                Err(_) => Some(raw.to_string()),
            };
        }
    }
    None
}

/// Pull one cookie out of the Cookie header(s).
fn cookie_value(headers: &HeaderMap, name: &str) -> Option<String> {
    for value in headers.get_all(header::COOKIE) {
        let Ok(raw) = value.to_str() else { continue };
        for piece in raw.split(';') {
            let mut parts = piece.trim().splitn(2, '=');
            if parts.next() == Some(name) {
                return parts.next().map(ToString::to_string);
            }
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn query_param_extraction() {
        assert_eq!(
            query_param(Some("token=glp_abc&x=1"), "token").as_deref(),
            Some("glp_abc")
        );
        assert_eq!(
            query_param(Some("x=1&token=glp_abc"), "token").as_deref(),
            Some("glp_abc")
        );
        assert_eq!(query_param(Some("x=1"), "token"), None);
        assert_eq!(query_param(None, "token"), None);
        // Percent-encoded values decode.
        assert_eq!(
            query_param(Some("token=glp%5Fabc"), "token").as_deref(),
            Some("glp_abc")
        );
    }

    #[test]
    fn cookie_extraction() {
        let mut headers = HeaderMap::new();
        headers.insert(
            header::COOKIE,
            HeaderValue::from_static("a=1; glimpse_preview_abc12345=glp_tok; b=2"),
        );
        assert_eq!(
            cookie_value(&headers, "glimpse_preview_abc12345").as_deref(),
            Some("glp_tok")
        );
        assert_eq!(cookie_value(&headers, "missing"), None);
    }

    #[test]
    fn cookie_names_are_per_session() {
        assert_eq!(
            session_cookie_name("abcdef1234567890"),
            "glimpse_preview_abcdef12"
        );
        assert_eq!(session_cookie_name("ab"), "glimpse_preview_ab");
    }
}
