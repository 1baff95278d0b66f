//! HTTP surface: session API, preview proxy, probes, and routing.

pub mod health;
pub mod proxy;
pub mod routes;
pub mod sessions;
pub mod state;
pub mod subdomain;

pub use routes::{App, create_app, create_router};
pub use state::AppState;
