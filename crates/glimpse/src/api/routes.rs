//! Router assembly.

use std::convert::Infallible;

use axum::Router;
use axum::body::Body;
use axum::http::{HeaderValue, Method, Request, header};
use axum::response::Response;
use axum::routing::{any, get, post};
use tower::Layer;
use tower::util::{BoxCloneService, MapRequestLayer};
use tower_http::cors::{AllowOrigin, CorsLayer};
use tower_http::trace::TraceLayer;

use super::state::AppState;
use super::{health, proxy, sessions, subdomain};

/// The composed application service, with the subdomain rewrite applied
/// around the router.
pub type App = BoxCloneService<Request<Body>, Response, Infallible>;

/// Build the router: session API, preview surface, probes.
pub fn create_router(state: AppState) -> Router {
    let mut router = Router::new()
        .route("/health", get(health::health))
        .route("/ready", get(health::ready))
        .route(
            "/api/sessions",
            post(sessions::create_session).get(sessions::list_sessions),
        )
        .route(
            "/api/sessions/{session_id}",
            get(sessions::get_session).delete(sessions::delete_session),
        )
        .route("/preview/{session_id}", any(proxy::preview_root))
        .route("/preview/{session_id}/", any(proxy::preview_root))
        .route("/preview/{session_id}/{*path}", any(proxy::preview_path))
        .layer(TraceLayer::new_for_http());

    if !state.settings.allowed_origins.is_empty() {
        let origins: Vec<HeaderValue> = state
            .settings
            .allowed_origins
            .iter()
            .filter_map(|origin| origin.parse().ok())
            .collect();
        router = router.layer(
            CorsLayer::new()
                .allow_origin(AllowOrigin::list(origins))
                .allow_methods([
                    Method::GET,
                    Method::POST,
                    Method::PUT,
                    Method::DELETE,
                    Method::PATCH,
                    Method::OPTIONS,
                ])
                .allow_headers([
                    header::CONTENT_TYPE,
                    header::AUTHORIZATION,
                    header::HeaderName::from_static("x-api-key"),
                ])
                .allow_credentials(true),
        );
    }

    router.with_state(state)
}

/// Wrap the router with the subdomain rewrite.
///
/// The rewrite must sit outside the router: middleware added with
/// `Router::layer` runs after path matching, too late to change where a
/// request routes.
pub fn create_app(state: AppState) -> App {
    let settings = state.settings.clone();
    let router = create_router(state);
    let rewrite =
        MapRequestLayer::new(move |req: Request<Body>| subdomain::rewrite_request(&settings, req));
    BoxCloneService::new(rewrite.layer(router))
}
