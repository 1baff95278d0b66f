//! API and preview-surface integration tests.

use axum::body::Body;
use axum::http::{Method, Request, StatusCode, header};
use serde_json::{Value, json};
use tower::ServiceExt;

use glimpse::session::SessionStatus;

mod common;
use common::{TEST_API_KEY, seed_session, test_app, test_app_subdomain};

async fn body_json(response: axum::response::Response) -> Value {
    let bytes = axum::body::to_bytes(response.into_body(), 1024 * 1024)
        .await
        .unwrap();
    serde_json::from_slice(&bytes).unwrap()
}

async fn body_string(response: axum::response::Response) -> String {
    let bytes = axum::body::to_bytes(response.into_body(), 1024 * 1024)
        .await
        .unwrap();
    String::from_utf8_lossy(&bytes).to_string()
}

fn get(uri: &str) -> Request<Body> {
    Request::builder()
        .uri(uri)
        .method(Method::GET)
        .body(Body::empty())
        .unwrap()
}

fn api_get(uri: &str) -> Request<Body> {
    Request::builder()
        .uri(uri)
        .method(Method::GET)
        .header("x-api-key", TEST_API_KEY)
        .body(Body::empty())
        .unwrap()
}

fn api_post(uri: &str, body: Value) -> Request<Body> {
    Request::builder()
        .uri(uri)
        .method(Method::POST)
        .header("x-api-key", TEST_API_KEY)
        .header(header::CONTENT_TYPE, "application/json")
        .body(Body::from(serde_json::to_string(&body).unwrap()))
        .unwrap()
}

fn api_delete(uri: &str) -> Request<Body> {
    Request::builder()
        .uri(uri)
        .method(Method::DELETE)
        .header("x-api-key", TEST_API_KEY)
        .body(Body::empty())
        .unwrap()
}

/// Health endpoint works without authentication.
#[tokio::test]
async fn health_endpoint() {
    let (app, _state) = test_app().await;

    let response = app.clone().oneshot(get("/health")).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let json = body_json(response).await;
    assert_eq!(json["status"], "ok");
    assert!(json["version"].is_string());
}

/// Readiness flips with the service lifecycle.
#[tokio::test]
async fn ready_endpoint_tracks_lifecycle() {
    let (app, state) = test_app().await;

    let response = app.clone().oneshot(get("/ready")).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    state.set_ready(false);
    let response = app.clone().oneshot(get("/ready")).await.unwrap();
    assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
}

/// Session endpoints require the shared API secret.
#[tokio::test]
async fn sessions_require_api_key() {
    let (app, _state) = test_app().await;

    let response = app.clone().oneshot(get("/api/sessions")).await.unwrap();
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);

    let wrong_key = Request::builder()
        .uri("/api/sessions")
        .method(Method::GET)
        .header("x-api-key", "not-the-secret")
        .body(Body::empty())
        .unwrap();
    let response = app.clone().oneshot(wrong_key).await.unwrap();
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
}

/// Invalid repository identifiers are rejected before any setup starts.
#[tokio::test]
async fn create_session_validates_input() {
    let (app, _state) = test_app().await;

    let response = app
        .clone()
        .oneshot(api_post(
            "/api/sessions",
            json!({"repo_owner": "bad owner!", "repo_name": "app", "repo_ref": "main"}),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    assert_eq!(body_json(response).await["error"], "invalid_repository");

    let response = app
        .clone()
        .oneshot(api_post(
            "/api/sessions",
            json!({"repo_owner": "alice", "repo_name": "app", "repo_ref": "bad ref"}),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    assert_eq!(body_json(response).await["error"], "invalid_ref");
}

/// An active session for the same triple is reused instead of rebuilt.
#[tokio::test]
async fn create_session_reuses_active_session() {
    let (app, state) = test_app().await;
    seed_session(&state, "seeded1", SessionStatus::Cloning, "inst-test").await;

    let response = app
        .clone()
        .oneshot(api_post(
            "/api/sessions",
            json!({"repo_owner": "alice", "repo_name": "vite-app", "repo_ref": "main"}),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let json = body_json(response).await;
    assert_eq!(json["session"]["id"], "seeded1");
    assert_eq!(json["message"], "Existing session found. Setup in progress.");
}

/// Reusing a ready session reports it as reused.
#[tokio::test]
async fn create_session_reports_ready_reuse() {
    let (app, state) = test_app().await;
    seed_session(&state, "seeded2", SessionStatus::Ready, "inst-test").await;

    let response = app
        .clone()
        .oneshot(api_post(
            "/api/sessions",
            json!({"repo_owner": "alice", "repo_name": "vite-app", "repo_ref": "main"}),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let json = body_json(response).await;
    assert_eq!(json["session"]["id"], "seeded2");
    assert_eq!(json["message"], "Existing session reused.");
    assert!(json["session"]["preview_url"].as_str().unwrap().contains("seeded2"));
}

/// The per-instance concurrency cap rejects synchronously with 503.
#[tokio::test]
async fn create_session_hits_capacity_cap() {
    let (app, state) = test_app().await;
    for i in 0..state.settings.max_concurrent_sessions {
        seed_session(&state, &format!("cap{}", i), SessionStatus::Ready, "inst-test").await;
    }

    let response = app
        .clone()
        .oneshot(api_post(
            "/api/sessions",
            json!({
                "repo_owner": "bob",
                "repo_name": "other-app",
                "repo_ref": "main",
                "force_new": true
            }),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
    assert_eq!(body_json(response).await["error"], "capacity_exhausted");
}

/// Session views never leak internal fields.
#[tokio::test]
async fn get_session_view_is_external_only() {
    let (app, state) = test_app().await;
    let record = seed_session(&state, "view1", SessionStatus::Ready, "inst-test").await;

    let response = app
        .clone()
        .oneshot(api_get("/api/sessions/view1"))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let json = body_json(response).await;
    assert_eq!(json["id"], "view1");
    assert_eq!(json["status"], "ready");
    let obj = json.as_object().unwrap();
    assert!(!obj.contains_key("access_token"));
    assert!(!obj.contains_key("internal_port"));
    assert!(!obj.contains_key("container_instance"));
    // The preview URL carries the token, which is how clients obtain it.
    assert!(
        json["preview_url"]
            .as_str()
            .unwrap()
            .contains(&record.access_token)
    );
}

#[tokio::test]
async fn get_unknown_session_is_404() {
    let (app, _state) = test_app().await;
    let response = app
        .clone()
        .oneshot(api_get("/api/sessions/nope"))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
}

/// DELETE stops a session; a second DELETE finds nothing.
#[tokio::test]
async fn delete_session_then_404() {
    let (app, state) = test_app().await;
    seed_session(&state, "del1", SessionStatus::Ready, "inst-test").await;

    let response = app
        .clone()
        .oneshot(api_delete("/api/sessions/del1"))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::NO_CONTENT);

    let response = app
        .clone()
        .oneshot(api_delete("/api/sessions/del1"))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::NOT_FOUND);

    let response = app
        .clone()
        .oneshot(api_get("/api/sessions/del1"))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
}

/// List shows only this instance's active sessions.
#[tokio::test]
async fn list_sessions_scopes_to_instance() {
    let (app, state) = test_app().await;
    seed_session(&state, "mine", SessionStatus::Ready, "inst-test").await;
    seed_session(&state, "theirs", SessionStatus::Ready, "inst-other").await;

    let response = app.clone().oneshot(api_get("/api/sessions")).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let json = body_json(response).await;
    assert_eq!(json["count"], 1);
    assert_eq!(json["sessions"][0]["id"], "mine");
}

/// Preview requests without a token are rejected.
#[tokio::test]
async fn preview_requires_token() {
    let (app, state) = test_app().await;
    seed_session(&state, "prev1", SessionStatus::Ready, "inst-test").await;

    let response = app.clone().oneshot(get("/preview/prev1/")).await.unwrap();
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);

    let response = app
        .clone()
        .oneshot(get("/preview/prev1/?token=malformed"))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
}

/// A wrong (but well-formed) token is indistinguishable from an unknown
/// session.
#[tokio::test]
async fn preview_wrong_token_is_404() {
    let (app, state) = test_app().await;
    seed_session(&state, "prev2", SessionStatus::Ready, "inst-test").await;

    let response = app
        .clone()
        .oneshot(get(
            "/preview/prev2/?token=glp_0123456789abcdefghijklmnopqrstuvwxyzABCDEF",
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
}

/// Sessions still setting up answer 202 with a self-refreshing page.
#[tokio::test]
async fn preview_during_setup_is_loading_page() {
    let (app, state) = test_app().await;
    let record = seed_session(&state, "prev3", SessionStatus::Installing, "inst-test").await;

    let response = app
        .clone()
        .oneshot(get(&format!(
            "/preview/prev3/?token={}",
            record.access_token
        )))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::ACCEPTED);
    assert_eq!(response.headers().get("refresh").unwrap(), "3");

    let body = body_string(response).await;
    assert!(body.contains("Installing dependencies..."));
}

/// Failed sessions answer 502 with a static error page.
#[tokio::test]
async fn preview_of_failed_session_is_502() {
    let (app, state) = test_app().await;
    let record = seed_session(&state, "prev4", SessionStatus::Failed, "inst-test").await;

    let response = app
        .clone()
        .oneshot(get(&format!(
            "/preview/prev4/?token={}",
            record.access_token
        )))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::BAD_GATEWAY);
    assert!(body_string(response).await.contains("Preview Unavailable"));
}

/// Stopped sessions answer 410.
#[tokio::test]
async fn preview_of_stopped_session_is_410() {
    let (app, state) = test_app().await;
    let record = seed_session(&state, "prev5", SessionStatus::Stopped, "inst-test").await;

    let response = app
        .clone()
        .oneshot(get(&format!(
            "/preview/prev5/?token={}",
            record.access_token
        )))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::GONE);
}

/// A ready session owned here with no live process answers 503.
#[tokio::test]
async fn preview_without_process_is_503() {
    let (app, state) = test_app().await;
    let record = seed_session(&state, "prev6", SessionStatus::Ready, "inst-test").await;

    let response = app
        .clone()
        .oneshot(get(&format!(
            "/preview/prev6/?token={}",
            record.access_token
        )))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
}

/// Subdomain requests are rewritten to the internal preview path and reach
/// the same handlers; HTML is not rewritten in this mode.
#[tokio::test]
async fn subdomain_routing_reaches_preview_handlers() {
    let (app, state) = test_app_subdomain().await;
    let record = seed_session(&state, "abc", SessionStatus::Cloning, "inst-test").await;

    let request = Request::builder()
        .uri(format!("/?token={}", record.access_token))
        .method(Method::GET)
        .header(header::HOST, "abc.preview.example")
        .body(Body::empty())
        .unwrap();

    let response = app.clone().oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::ACCEPTED);
    assert!(body_string(response).await.contains("Cloning repository..."));
}

/// Hosts outside the preview domain are untouched by the rewrite.
#[tokio::test]
async fn subdomain_mode_leaves_api_requests_alone() {
    let (app, _state) = test_app_subdomain().await;

    let request = Request::builder()
        .uri("/health")
        .method(Method::GET)
        .header(header::HOST, "orchestrator.example.com")
        .body(Body::empty())
        .unwrap();

    let response = app.clone().oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
}
