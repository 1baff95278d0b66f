//! Application state shared across handlers.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use axum::body::Body;
use hyper_util::client::legacy::Client;
use hyper_util::rt::TokioExecutor;

use crate::config::Settings;
use crate::session::SessionManager;

use super::proxy::http::ProxyClient;

/// Shared state for the API and the preview proxy.
#[derive(Clone)]
pub struct AppState {
    pub settings: Arc<Settings>,
    pub sessions: SessionManager,
    /// Reused upstream client for proxy forwards.
    pub http_client: ProxyClient,
    ready: Arc<AtomicBool>,
}

impl AppState {
    pub fn new(settings: Arc<Settings>, sessions: SessionManager) -> Self {
        let http_client: ProxyClient =
            Client::builder(TokioExecutor::new()).build_http::<Body>();
        Self {
            settings,
            sessions,
            http_client,
            ready: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Flip the readiness flag reported by `/ready`.
    pub fn set_ready(&self, ready: bool) {
        self.ready.store(ready, Ordering::SeqCst);
    }

    pub fn is_ready(&self) -> bool {
        self.ready.load(Ordering::SeqCst)
    }
}
