//! Session lifecycle: models, the record store gateway, and the manager.

pub mod manager;
pub mod models;
pub mod store;

pub use manager::{CreateOutcome, SessionError, SessionManager};
pub use models::{
    CreateSessionRequest, CreateSessionResponse, ErrorBody, SessionListResponse, SessionRecord,
    SessionStatus, SessionView,
};
pub use store::{SessionPatch, SessionStore};
