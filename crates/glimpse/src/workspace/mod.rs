//! Per-session workspace directories.
//!
//! A workspace is an isolated directory under the configured base dir,
//! derived from the session id, holding the cloned tree and its installed
//! dependencies. Workspaces are cache: losing them on instance death is
//! expected.

pub mod detect;

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use log::{error, info, warn};
use tokio::process::Command;

use crate::config::Settings;
use crate::security::is_safe_session_id;

pub use detect::{PackageInfo, PackageManager, detect_framework, detect_package_manager, start_command};

/// Everything setup needs to know about a prepared workspace.
#[derive(Debug, Clone)]
pub struct WorkspaceInfo {
    pub session_id: String,
    pub path: PathBuf,
    pub package_info: Option<PackageInfo>,
    pub detected_framework: Option<String>,
    pub start_command: Option<Vec<String>>,
}

/// Manages workspace directories for preview sessions.
#[derive(Debug)]
pub struct WorkspaceManager {
    settings: Arc<Settings>,
    base_dir: PathBuf,
}

impl WorkspaceManager {
    pub fn new(settings: Arc<Settings>) -> Self {
        let base_dir = settings.workspace_base();
        Self { settings, base_dir }
    }

    /// Map a session id to its workspace path.
    ///
    /// The id is validated so the mapping is injective and can never escape
    /// the base directory.
    pub fn workspace_path(&self, session_id: &str) -> Result<PathBuf> {
        if !is_safe_session_id(session_id) {
            bail!("invalid session ID: {}", session_id);
        }
        Ok(self.base_dir.join(session_id))
    }

    /// Create an isolated workspace directory with owner-only permissions.
    ///
    /// Errors if the directory already exists: a duplicate means two setups
    /// racing for the same session.
    pub async fn create_workspace(&self, session_id: &str) -> Result<PathBuf> {
        let path = self.workspace_path(session_id)?;

        std::fs::create_dir_all(&self.base_dir)
            .with_context(|| format!("creating workspace base {}", self.base_dir.display()))?;

        let mut builder = std::fs::DirBuilder::new();
        #[cfg(unix)]
        {
            use std::os::unix::fs::DirBuilderExt;
            builder.mode(0o700);
        }
        builder
            .create(&path)
            .with_context(|| format!("creating workspace {}", path.display()))?;

        info!("Created workspace for session {} at {}", session_id, path.display());
        Ok(path)
    }

    /// Recursively remove a workspace. Returns false when it did not exist.
    pub async fn cleanup_workspace(&self, session_id: &str) -> bool {
        let Ok(path) = self.workspace_path(session_id) else {
            return false;
        };
        if !path.exists() {
            return false;
        }

        match std::fs::remove_dir_all(&path) {
            Ok(()) => {
                info!("Cleaned up workspace for session {}", session_id);
                true
            }
            Err(e) => {
                error!("Failed to clean up workspace for {}: {:?}", session_id, e);
                false
            }
        }
    }

    /// Remove every workspace under the base directory. Shutdown path.
    pub async fn cleanup_all_workspaces(&self) -> usize {
        let Ok(entries) = std::fs::read_dir(&self.base_dir) else {
            return 0;
        };

        let mut count = 0;
        for entry in entries.flatten() {
            let path = entry.path();
            if path.is_dir() {
                match std::fs::remove_dir_all(&path) {
                    Ok(()) => count += 1,
                    Err(e) => error!("Failed to clean up workspace {}: {:?}", path.display(), e),
                }
            }
        }

        info!("Cleaned up {} workspace(s)", count);
        count
    }

    /// Install dependencies with the detected package manager.
    ///
    /// Runs in CI mode with a bounded heap and a hard timeout; dev-server
    /// installs are memory-hungry and occasionally wedge.
    pub async fn install_dependencies(
        &self,
        workspace_path: &Path,
        package_info: &PackageInfo,
        session_id: &str,
    ) -> Result<()> {
        let argv = package_info.manager.install_command();
        info!(
            "Installing dependencies for session {} with {}",
            session_id, package_info.manager
        );

        let mut cmd = Command::new(&argv[0]);
        cmd.args(&argv[1..])
            .current_dir(workspace_path)
            .envs(node_env(workspace_path))
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let timeout = Duration::from_secs(self.settings.install_timeout);
        let output = match tokio::time::timeout(timeout, cmd.output()).await {
            Ok(result) => result.context("running dependency install")?,
            Err(_) => {
                error!("Dependency install timed out for session {}", session_id);
                bail!(
                    "Installation timeout exceeded ({} seconds)",
                    self.settings.install_timeout
                );
            }
        };

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            let stdout = String::from_utf8_lossy(&output.stdout);
            let detail = if stderr.trim().is_empty() {
                stdout
            } else {
                stderr
            };
            let detail: String = detail.trim().chars().take(500).collect();
            error!(
                "Dependency install failed for session {}: {}",
                session_id, detail
            );
            bail!("Failed to install dependencies: {}", detail);
        }

        info!("Dependencies installed for session {}", session_id);
        Ok(())
    }

    /// Prepare a freshly cloned workspace: detect, install, and pick the
    /// start command.
    pub async fn prepare_workspace(
        &self,
        workspace_path: &Path,
        session_id: &str,
    ) -> Result<WorkspaceInfo> {
        let Some(package_info) = detect_package_manager(workspace_path)? else {
            warn!(
                "No usable package.json in workspace for session {}",
                session_id
            );
            return Ok(WorkspaceInfo {
                session_id: session_id.to_string(),
                path: workspace_path.to_path_buf(),
                package_info: None,
                detected_framework: None,
                start_command: None,
            });
        };

        let framework = detect_framework(&package_info);
        info!(
            "Detected manager={} framework={:?} for session {}",
            package_info.manager, framework, session_id
        );

        self.install_dependencies(workspace_path, &package_info, session_id)
            .await?;

        let command = start_command(&package_info, framework.as_deref());
        info!(
            "Start command for session {}: {}",
            session_id,
            command.join(" ")
        );

        Ok(WorkspaceInfo {
            session_id: session_id.to_string(),
            path: workspace_path.to_path_buf(),
            package_info: Some(package_info),
            detected_framework: framework,
            start_command: Some(command),
        })
    }
}

/// Environment for package-manager child processes.
fn node_env(workspace_path: &Path) -> HashMap<String, String> {
    let mut env = HashMap::new();

    let node_bin = workspace_path.join("node_modules").join(".bin");
    let path = match std::env::var("PATH") {
        Ok(existing) => format!("{}:{}", node_bin.display(), existing),
        Err(_) => node_bin.display().to_string(),
    };
    env.insert("PATH".to_string(), path);

    env.insert("CI".to_string(), "true".to_string());
    env.insert("NO_UPDATE_NOTIFIER".to_string(), "1".to_string());
    env.insert(
        "NPM_CONFIG_UPDATE_NOTIFIER".to_string(),
        "false".to_string(),
    );
    // Keep node below the container memory ceiling during install.
    env.insert(
        "NODE_OPTIONS".to_string(),
        "--max-old-space-size=3072".to_string(),
    );

    env
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn manager_with_base(base: &Path) -> WorkspaceManager {
        let settings = Settings {
            workspace_base_dir: base.display().to_string(),
            ..Settings::default()
        };
        WorkspaceManager::new(Arc::new(settings))
    }

    #[tokio::test]
    async fn create_and_cleanup_round_trip() {
        let base = TempDir::new().unwrap();
        let manager = manager_with_base(base.path());

        let path = manager.create_workspace("session1").await.unwrap();
        assert!(path.exists());
        assert!(path.starts_with(base.path()));

        assert!(manager.cleanup_workspace("session1").await);
        assert!(!path.exists());
        // Second cleanup is a no-op returning false.
        assert!(!manager.cleanup_workspace("session1").await);
    }

    #[tokio::test]
    async fn duplicate_workspace_creation_fails() {
        let base = TempDir::new().unwrap();
        let manager = manager_with_base(base.path());

        manager.create_workspace("session1").await.unwrap();
        assert!(manager.create_workspace("session1").await.is_err());
    }

    #[tokio::test]
    async fn traversal_hostile_ids_are_rejected() {
        let base = TempDir::new().unwrap();
        let manager = manager_with_base(base.path());

        assert!(manager.create_workspace("../escape").await.is_err());
        assert!(manager.create_workspace("a/b").await.is_err());
        assert!(manager.create_workspace("").await.is_err());
        assert!(!manager.cleanup_workspace("../escape").await);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn workspace_is_owner_only() {
        use std::os::unix::fs::PermissionsExt;

        let base = TempDir::new().unwrap();
        let manager = manager_with_base(base.path());
        let path = manager.create_workspace("session1").await.unwrap();

        let mode = std::fs::metadata(&path).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o700);
    }

    #[tokio::test]
    async fn cleanup_all_removes_every_workspace() {
        let base = TempDir::new().unwrap();
        let manager = manager_with_base(base.path());

        manager.create_workspace("a").await.unwrap();
        manager.create_workspace("b").await.unwrap();

        assert_eq!(manager.cleanup_all_workspaces().await, 2);
        assert!(!manager.cleanup_workspace("a").await);
    }

    #[tokio::test]
    async fn prepare_without_manifest_yields_no_start_command() {
        let base = TempDir::new().unwrap();
        let manager = manager_with_base(base.path());
        let path = manager.create_workspace("session1").await.unwrap();

        let info = manager.prepare_workspace(&path, "session1").await.unwrap();
        assert!(info.package_info.is_none());
        assert!(info.start_command.is_none());
    }

    #[test]
    fn node_env_sets_ci_and_heap_ceiling() {
        let env = node_env(Path::new("/tmp/ws"));
        assert_eq!(env.get("CI").unwrap(), "true");
        assert!(env.get("NODE_OPTIONS").unwrap().contains("3072"));
        assert!(env.get("PATH").unwrap().contains("node_modules/.bin"));
    }
}
