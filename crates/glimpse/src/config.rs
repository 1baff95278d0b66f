//! Application settings.
//!
//! Settings are assembled from defaults, an optional TOML file, and
//! `GLIMPSE_`-prefixed environment variables (highest precedence). The same
//! struct also owns the preview-URL construction and subdomain parsing so
//! routing decisions live next to the options that control them.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result, bail};
use base64::Engine as _;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use rand::RngCore;
use serde::Deserialize;

fn default_host() -> String {
    "0.0.0.0".to_string()
}

fn default_port() -> u16 {
    8080
}

fn default_workspace_base_dir() -> String {
    "/tmp/glimpse-workspaces".to_string()
}

fn default_record_store_url() -> String {
    "sqlite:///tmp/glimpse/sessions.db".to_string()
}

fn default_idle_timeout() -> u64 {
    600
}

fn default_max_lifetime() -> u64 {
    3600
}

fn default_startup_timeout() -> u64 {
    180
}

fn default_clone_timeout() -> u64 {
    120
}

fn default_install_timeout() -> u64 {
    300
}

fn default_port_range_start() -> u16 {
    3000
}

fn default_port_range_end() -> u16 {
    4000
}

fn default_max_concurrent_sessions() -> usize {
    5
}

fn default_preview_path_prefix() -> String {
    "/preview".to_string()
}

fn default_instance_id() -> String {
    let mut bytes = [0u8; 8];
    rand::rng().fill_bytes(&mut bytes);
    URL_SAFE_NO_PAD.encode(bytes)
}

/// Application settings.
#[derive(Debug, Clone, Deserialize)]
pub struct Settings {
    /// Host address the orchestrator binds to.
    #[serde(default = "default_host")]
    pub host: String,
    /// Listening port of the orchestrator.
    #[serde(default = "default_port")]
    pub port: u16,

    /// Identifier of this instance in the shared record store.
    /// Generated per process unless pinned by configuration.
    #[serde(default = "default_instance_id")]
    pub instance_id: String,

    /// Shared secret required (as `X-Api-Key`) on the session API.
    #[serde(default)]
    pub shared_api_secret: String,

    /// sqlx database URL for the session record store.
    #[serde(default = "default_record_store_url")]
    pub record_store_url: String,
    /// Secret for HTTP-backed record stores. Unused by SQL backends but
    /// accepted so deployments can switch backends without config churn.
    #[serde(default)]
    pub record_store_secret: Option<String>,

    /// Parent directory for per-session workspaces.
    #[serde(default = "default_workspace_base_dir")]
    pub workspace_base_dir: String,

    /// Seconds of no preview traffic before a ready session is stopped.
    #[serde(default = "default_idle_timeout")]
    pub session_idle_timeout: u64,
    /// Hard cap, in seconds, from creation to expiry.
    #[serde(default = "default_max_lifetime")]
    pub session_max_lifetime: u64,
    /// Seconds allowed for a dev server to become reachable.
    #[serde(default = "default_startup_timeout")]
    pub session_startup_timeout: u64,
    /// Seconds allowed for a repository clone.
    #[serde(default = "default_clone_timeout")]
    pub clone_timeout: u64,
    /// Seconds allowed for dependency installation.
    #[serde(default = "default_install_timeout")]
    pub install_timeout: u64,

    /// Start of the dev-server port range (inclusive).
    #[serde(default = "default_port_range_start")]
    pub port_range_start: u16,
    /// End of the dev-server port range (exclusive).
    #[serde(default = "default_port_range_end")]
    pub port_range_end: u16,

    /// Soft cap on concurrently active sessions per instance.
    #[serde(default = "default_max_concurrent_sessions")]
    pub max_concurrent_sessions: usize,

    /// External origin for path-mode preview URLs.
    #[serde(default)]
    pub base_url: Option<String>,
    /// Path prefix for path-mode preview routes.
    #[serde(default = "default_preview_path_prefix")]
    pub preview_path_prefix: String,

    /// Domain for subdomain-mode previews, e.g. `preview.example.com`.
    #[serde(default)]
    pub preview_domain: Option<String>,
    /// Route previews by subdomain instead of path prefix.
    #[serde(default)]
    pub use_subdomain_routing: bool,

    /// Origins allowed to call the API with credentials. Empty disables CORS.
    #[serde(default)]
    pub allowed_origins: Vec<String>,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            instance_id: default_instance_id(),
            shared_api_secret: String::new(),
            record_store_url: default_record_store_url(),
            record_store_secret: None,
            workspace_base_dir: default_workspace_base_dir(),
            session_idle_timeout: default_idle_timeout(),
            session_max_lifetime: default_max_lifetime(),
            session_startup_timeout: default_startup_timeout(),
            clone_timeout: default_clone_timeout(),
            install_timeout: default_install_timeout(),
            port_range_start: default_port_range_start(),
            port_range_end: default_port_range_end(),
            max_concurrent_sessions: default_max_concurrent_sessions(),
            base_url: None,
            preview_path_prefix: default_preview_path_prefix(),
            preview_domain: None,
            use_subdomain_routing: false,
            allowed_origins: Vec::new(),
        }
    }
}

impl Settings {
    /// Load settings from an optional TOML file plus the environment.
    pub fn load(config_file: Option<&Path>) -> Result<Self> {
        let mut builder = config::Config::builder();

        if let Some(path) = config_file {
            builder = builder.add_source(
                config::File::from(path)
                    .format(config::FileFormat::Toml)
                    .required(true),
            );
        }

        let raw = builder
            .add_source(config::Environment::with_prefix("GLIMPSE").separator("__"))
            .build()
            .context("assembling configuration sources")?;

        let settings: Settings = raw
            .try_deserialize()
            .context("deserializing configuration")?;
        settings.validate()?;
        Ok(settings)
    }

    /// Check cross-field constraints.
    pub fn validate(&self) -> Result<()> {
        if self.port_range_end <= self.port_range_start {
            bail!(
                "port_range_end ({}) must exceed port_range_start ({})",
                self.port_range_end,
                self.port_range_start
            );
        }
        if self.use_subdomain_routing && self.preview_domain.is_none() {
            bail!("use_subdomain_routing requires preview_domain");
        }
        if self.session_max_lifetime == 0 || self.session_startup_timeout == 0 {
            bail!("session lifetimes must be non-zero");
        }
        Ok(())
    }

    /// Base directory for workspaces as a path.
    pub fn workspace_base(&self) -> PathBuf {
        PathBuf::from(&self.workspace_base_dir)
    }

    /// Public URL at which a ready session can be previewed.
    ///
    /// Subdomain mode: `https://{id}.{preview_domain}/?token={t}`.
    /// Path mode: `{base_url}{prefix}/{id}/?token={t}`.
    pub fn preview_url(&self, session_id: &str, access_token: &str) -> String {
        if self.use_subdomain_routing {
            if let Some(domain) = &self.preview_domain {
                return format!("https://{session_id}.{domain}/?token={access_token}");
            }
        }
        let base = self
            .base_url
            .clone()
            .unwrap_or_else(|| format!("http://{}:{}", self.host, self.port));
        format!(
            "{}{}/{}/?token={}",
            base, self.preview_path_prefix, session_id, access_token
        )
    }

    /// Extract the session id from a Host header in subdomain mode.
    ///
    /// Returns `Some(id)` iff subdomain routing is enabled and `host` is
    /// `{id}.{preview_domain}` (an optional `:port` is ignored) where `id`
    /// is a non-empty label without dots.
    pub fn extract_session_from_host(&self, host: &str) -> Option<String> {
        if !self.use_subdomain_routing {
            return None;
        }
        let domain = self.preview_domain.as_deref()?;

        let host = host.split(':').next().unwrap_or("").to_ascii_lowercase();
        let suffix = format!(".{}", domain.to_ascii_lowercase());
        let label = host.strip_suffix(&suffix)?;

        if label.is_empty() || label.contains('.') {
            return None;
        }
        Some(label.to_string())
    }
}
