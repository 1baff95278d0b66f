//! Test utilities and common setup.

use std::sync::Arc;

use chrono::Utc;
use glimpse::api::{self, App, AppState};
use glimpse::config::Settings;
use glimpse::security::generate_access_token;
use glimpse::session::{SessionManager, SessionRecord, SessionStatus, SessionStore};
use uuid::Uuid;

/// Shared API secret used by the test apps.
pub const TEST_API_KEY: &str = "test-shared-secret";

fn base_settings() -> Settings {
    let workspace_base = std::env::temp_dir()
        .join("glimpse-tests")
        .join(Uuid::new_v4().simple().to_string());
    std::fs::create_dir_all(&workspace_base).expect("create test workspace base");

    Settings {
        instance_id: "inst-test".to_string(),
        shared_api_secret: TEST_API_KEY.to_string(),
        workspace_base_dir: workspace_base.display().to_string(),
        port_range_start: 43000,
        port_range_end: 43100,
        ..Settings::default()
    }
}

async fn build_app(settings: Settings) -> (App, AppState) {
    let settings = Arc::new(settings);
    let store = SessionStore::in_memory().await.expect("in-memory store");
    let sessions = SessionManager::new(settings.clone(), store);
    let state = AppState::new(settings, sessions);
    state.set_ready(true);
    (api::create_app(state.clone()), state)
}

/// App in path-routing mode.
pub async fn test_app() -> (App, AppState) {
    build_app(base_settings()).await
}

/// App with subdomain routing on `preview.example`.
pub async fn test_app_subdomain() -> (App, AppState) {
    let settings = Settings {
        use_subdomain_routing: true,
        preview_domain: Some("preview.example".to_string()),
        ..base_settings()
    };
    build_app(settings).await
}

/// Insert a session record directly through the store gateway.
pub async fn seed_session(
    state: &AppState,
    id: &str,
    status: SessionStatus,
    instance: &str,
) -> SessionRecord {
    let now = Utc::now();
    let stamp = |t: chrono::DateTime<Utc>| t.to_rfc3339_opts(chrono::SecondsFormat::Micros, true);
    let record = SessionRecord {
        id: id.to_string(),
        repo_owner: "alice".to_string(),
        repo_name: "vite-app".to_string(),
        repo_ref: "main".to_string(),
        status,
        error_message: None,
        internal_port: None,
        container_instance: Some(instance.to_string()),
        access_token: generate_access_token(),
        created_at: stamp(now),
        updated_at: stamp(now),
        last_activity_at: stamp(now),
        expires_at: stamp(now + chrono::Duration::hours(1)),
        deleted_at: None,
    };
    state
        .sessions
        .store()
        .create(&record)
        .await
        .expect("seed session record");
    record
}
