//! Session data models.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;

/// Session lifecycle status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionStatus {
    /// Record created, setup not yet started.
    Pending,
    /// Cloning the repository.
    Cloning,
    /// Installing dependencies.
    Installing,
    /// Starting the dev server.
    Starting,
    /// Dev server is reachable.
    Ready,
    /// Setup failed, see error_message.
    Failed,
    /// Stopped by request or by a sweeper.
    Stopped,
}

impl std::fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SessionStatus::Pending => write!(f, "pending"),
            SessionStatus::Cloning => write!(f, "cloning"),
            SessionStatus::Installing => write!(f, "installing"),
            SessionStatus::Starting => write!(f, "starting"),
            SessionStatus::Ready => write!(f, "ready"),
            SessionStatus::Failed => write!(f, "failed"),
            SessionStatus::Stopped => write!(f, "stopped"),
        }
    }
}

impl std::str::FromStr for SessionStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "pending" => Ok(SessionStatus::Pending),
            "cloning" => Ok(SessionStatus::Cloning),
            "installing" => Ok(SessionStatus::Installing),
            "starting" => Ok(SessionStatus::Starting),
            "ready" => Ok(SessionStatus::Ready),
            "failed" => Ok(SessionStatus::Failed),
            "stopped" => Ok(SessionStatus::Stopped),
            _ => Err(format!("unknown session status: {}", s)),
        }
    }
}

// Conversion from TEXT columns for sqlx.
impl TryFrom<String> for SessionStatus {
    type Error = String;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

/// A preview session record as persisted in the shared store.
///
/// `internal_port` and `container_instance` are only meaningful on the
/// instance that owns the session; views never expose them.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct SessionRecord {
    /// Unique session ID (hex UUID).
    pub id: String,
    /// Repository owner.
    pub repo_owner: String,
    /// Repository name.
    pub repo_name: String,
    /// Git reference (branch, tag, or commit).
    pub repo_ref: String,
    /// Current lifecycle status.
    #[sqlx(try_from = "String")]
    pub status: SessionStatus,
    /// Error message, populated when status reached failed.
    pub error_message: Option<String>,
    /// TCP port of the dev server on the owning instance.
    pub internal_port: Option<i64>,
    /// Instance currently claiming the session.
    pub container_instance: Option<String>,
    /// Bearer token gating preview access. Never rendered in views.
    #[serde(skip_serializing)]
    pub access_token: String,
    /// Creation time (RFC 3339, UTC).
    pub created_at: String,
    /// Last write time (RFC 3339, UTC).
    pub updated_at: String,
    /// Last preview traffic time (RFC 3339, UTC).
    pub last_activity_at: String,
    /// Hard expiry time (RFC 3339, UTC).
    pub expires_at: String,
    /// Soft-delete time; set implies the record is a tombstone.
    pub deleted_at: Option<String>,
}

impl SessionRecord {
    /// `owner/name` for logging.
    pub fn repo_full_name(&self) -> String {
        format!("{}/{}", self.repo_owner, self.repo_name)
    }

    /// Active means live from the lifecycle's point of view: not deleted,
    /// not failed, not stopped.
    pub fn is_active(&self) -> bool {
        self.deleted_at.is_none()
            && matches!(
                self.status,
                SessionStatus::Pending
                    | SessionStatus::Cloning
                    | SessionStatus::Installing
                    | SessionStatus::Starting
                    | SessionStatus::Ready
            )
    }

    /// Terminal states never transition again.
    pub fn is_terminal(&self) -> bool {
        matches!(self.status, SessionStatus::Failed | SessionStatus::Stopped)
    }

    /// Whether the session has exceeded its maximum lifetime.
    pub fn is_expired(&self) -> bool {
        match DateTime::parse_from_rfc3339(&self.expires_at) {
            Ok(expires) => expires.with_timezone(&Utc) < Utc::now(),
            Err(_) => false,
        }
    }
}

/// Session view for API clients. Only externally safe fields.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionView {
    pub id: String,
    pub status: SessionStatus,
    pub repo_owner: String,
    pub repo_name: String,
    pub repo_ref: String,
    pub created_at: String,
    pub expires_at: String,
    pub error_message: Option<String>,
    /// Set only when the session is ready.
    pub preview_url: Option<String>,
}

impl SessionView {
    /// Build a view from a record. `preview_url` is dropped unless the
    /// session is ready.
    pub fn from_record(record: &SessionRecord, preview_url: Option<String>) -> Self {
        let preview_url = if record.status == SessionStatus::Ready {
            preview_url
        } else {
            None
        };
        Self {
            id: record.id.clone(),
            status: record.status,
            repo_owner: record.repo_owner.clone(),
            repo_name: record.repo_name.clone(),
            repo_ref: record.repo_ref.clone(),
            created_at: record.created_at.clone(),
            expires_at: record.expires_at.clone(),
            error_message: record.error_message.clone(),
            preview_url,
        }
    }
}

fn default_ref() -> String {
    "main".to_string()
}

/// API request to create a preview session.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreateSessionRequest {
    pub repo_owner: String,
    pub repo_name: String,
    #[serde(default = "default_ref")]
    pub repo_ref: String,
    /// Access token for private repositories. Held in memory only.
    #[serde(default)]
    pub github_token: Option<String>,
    /// Skip session reuse and always build a fresh environment.
    #[serde(default)]
    pub force_new: bool,
}

/// Response for session creation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreateSessionResponse {
    pub session: SessionView,
    pub message: String,
}

/// Response for listing sessions.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionListResponse {
    pub sessions: Vec<SessionView>,
    pub count: usize,
}

/// Standard error body.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorBody {
    pub error: String,
    pub message: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(status: SessionStatus) -> SessionRecord {
        let now = Utc::now();
        SessionRecord {
            id: "abc123".to_string(),
            repo_owner: "alice".to_string(),
            repo_name: "vite-app".to_string(),
            repo_ref: "main".to_string(),
            status,
            error_message: None,
            internal_port: Some(3000),
            container_instance: Some("inst-1".to_string()),
            access_token: "glp_secret".to_string(),
            created_at: now.to_rfc3339(),
            updated_at: now.to_rfc3339(),
            last_activity_at: now.to_rfc3339(),
            expires_at: (now + chrono::Duration::hours(1)).to_rfc3339(),
            deleted_at: None,
        }
    }

    #[test]
    fn active_and_terminal_states() {
        assert!(record(SessionStatus::Pending).is_active());
        assert!(record(SessionStatus::Ready).is_active());
        assert!(!record(SessionStatus::Failed).is_active());
        assert!(!record(SessionStatus::Stopped).is_active());
        assert!(record(SessionStatus::Failed).is_terminal());
        assert!(!record(SessionStatus::Starting).is_terminal());

        let mut deleted = record(SessionStatus::Ready);
        deleted.deleted_at = Some(Utc::now().to_rfc3339());
        assert!(!deleted.is_active());
    }

    #[test]
    fn expiry_uses_expires_at() {
        let mut fresh = record(SessionStatus::Ready);
        assert!(!fresh.is_expired());
        fresh.expires_at = (Utc::now() - chrono::Duration::seconds(5)).to_rfc3339();
        assert!(fresh.is_expired());
    }

    #[test]
    fn view_hides_preview_url_unless_ready() {
        let ready = record(SessionStatus::Ready);
        let view = SessionView::from_record(&ready, Some("https://p".to_string()));
        assert_eq!(view.preview_url.as_deref(), Some("https://p"));

        let pending = record(SessionStatus::Pending);
        let view = SessionView::from_record(&pending, Some("https://p".to_string()));
        assert!(view.preview_url.is_none());
    }

    #[test]
    fn view_serialization_excludes_internal_fields() {
        let view = SessionView::from_record(&record(SessionStatus::Ready), None);
        let json = serde_json::to_value(&view).unwrap();
        let obj = json.as_object().unwrap();
        assert!(!obj.contains_key("access_token"));
        assert!(!obj.contains_key("internal_port"));
        assert!(!obj.contains_key("container_instance"));
    }

    #[test]
    fn status_round_trips_through_strings() {
        for status in [
            SessionStatus::Pending,
            SessionStatus::Cloning,
            SessionStatus::Installing,
            SessionStatus::Starting,
            SessionStatus::Ready,
            SessionStatus::Failed,
            SessionStatus::Stopped,
        ] {
            let parsed: SessionStatus = status.to_string().parse().unwrap();
            assert_eq!(parsed, status);
        }
        assert!("bogus".parse::<SessionStatus>().is_err());
    }
}
