//! Repository fetching.
//!
//! Shallow, single-branch clones via the git CLI with optional token auth.
//! The child git process can never prompt for credentials, and any supplied
//! token is scrubbed from error output before it propagates.

use std::collections::HashMap;
use std::path::Path;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use log::{error, info, warn};
use serde::Deserialize;
use tokio::process::Command;

use crate::config::Settings;
use crate::security::{redact_secret, sanitize_git_ref, sanitize_repo_identifier};

/// Branch names tried when the requested ref does not exist.
const FALLBACK_REFS: &[&str] = &["main", "master"];

/// Outcome of a successful clone.
#[derive(Debug, Clone)]
pub struct CloneOutcome {
    /// Resolved commit hash, when `git rev-parse` succeeded.
    pub commit_sha: Option<String>,
}

/// Repository visibility as reported by the hosting API.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RepoVisibility {
    Public,
    Private,
}

#[derive(Debug, Deserialize)]
struct RepoApiResponse {
    #[serde(default)]
    private: bool,
}

/// Clones repositories into session workspaces.
#[derive(Debug)]
pub struct RepoFetcher {
    settings: Arc<Settings>,
    http: reqwest::Client,
}

impl RepoFetcher {
    pub fn new(settings: Arc<Settings>) -> Self {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .user_agent("glimpse")
            .build()
            .unwrap_or_default();
        Self { settings, http }
    }

    /// Check whether a repository exists and whether it is public.
    ///
    /// Best-effort: clone failures stay the authoritative error path.
    pub async fn check_repo_access(
        &self,
        owner: &str,
        name: &str,
        token: Option<&str>,
    ) -> Result<Option<RepoVisibility>> {
        let Some((owner, name)) = sanitize_repo_identifier(owner, name) else {
            bail!("invalid repository owner or name");
        };

        let url = format!("https://api.github.com/repos/{}/{}", owner, name);
        let mut request = self.http.get(&url);
        if let Some(token) = token {
            request = request.bearer_auth(token);
        }

        let response = request.send().await.context("querying repository API")?;
        match response.status().as_u16() {
            200 => {
                let body: RepoApiResponse =
                    response.json().await.context("parsing repository API response")?;
                Ok(Some(if body.private {
                    RepoVisibility::Private
                } else {
                    RepoVisibility::Public
                }))
            }
            404 => Ok(None),
            401 => bail!("repository API authentication failed"),
            403 => bail!("repository API access forbidden"),
            other => bail!("repository API error: {}", other),
        }
    }

    /// Clone `owner/name` at `ref` into `target_dir`.
    pub async fn clone_repository(
        &self,
        owner: &str,
        name: &str,
        repo_ref: &str,
        target_dir: &Path,
        token: Option<&str>,
    ) -> Result<CloneOutcome> {
        let Some((owner, name)) = sanitize_repo_identifier(owner, name) else {
            bail!("invalid repository identifier");
        };
        let Some(repo_ref) = sanitize_git_ref(repo_ref) else {
            bail!("invalid git reference");
        };

        std::fs::create_dir_all(target_dir)
            .with_context(|| format!("creating clone target {}", target_dir.display()))?;

        let url = clone_url(&owner, &name, token);
        info!("Cloning {}/{} at {}", owner, name, repo_ref);

        let mut cmd = Command::new("git");
        cmd.arg("clone")
            .arg("--depth")
            .arg("1")
            .arg("--single-branch")
            .arg("--branch")
            .arg(&repo_ref)
            .arg(&url)
            .arg(target_dir)
            .envs(git_env())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let timeout = Duration::from_secs(self.settings.clone_timeout);
        let output = match tokio::time::timeout(timeout, cmd.output()).await {
            Ok(result) => result.context("running git clone")?,
            Err(_) => {
                error!("Clone of {}/{} timed out", owner, name);
                remove_tree(target_dir);
                bail!(
                    "Clone timeout exceeded ({} seconds)",
                    self.settings.clone_timeout
                );
            }
        };

        if !output.status.success() {
            let mut stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
            if let Some(token) = token {
                stderr = redact_secret(&stderr, token);
            }
            error!("Clone failed: {}", stderr);
            bail!("Clone failed: {}", stderr);
        }

        let commit_sha = resolve_head(target_dir).await;
        info!(
            "Clone of {}/{} complete, commit: {}",
            owner,
            name,
            commit_sha.as_deref().unwrap_or("unknown")
        );
        Ok(CloneOutcome { commit_sha })
    }

    /// Clone the requested ref, falling back to the well-known default
    /// branches when it fails. Partial clones are removed between attempts.
    pub async fn clone_with_fallback(
        &self,
        owner: &str,
        name: &str,
        repo_ref: &str,
        target_dir: &Path,
        token: Option<&str>,
    ) -> Result<CloneOutcome> {
        match self
            .clone_repository(owner, name, repo_ref, target_dir, token)
            .await
        {
            Ok(outcome) => return Ok(outcome),
            Err(e) => warn!("Clone of ref {} failed: {:#}", repo_ref, e),
        }

        for fallback in fallback_refs(repo_ref) {
            reset_target(target_dir)?;
            info!("Trying fallback branch: {}", fallback);
            match self
                .clone_repository(owner, name, &fallback, target_dir, token)
                .await
            {
                Ok(outcome) => return Ok(outcome),
                Err(e) => warn!("Clone of fallback {} failed: {:#}", fallback, e),
            }
        }

        bail!(
            "Failed to clone repository with ref '{}' or fallback branches",
            repo_ref
        )
    }
}

/// Clone URL, embedding the token for private repositories.
fn clone_url(owner: &str, name: &str, token: Option<&str>) -> String {
    match token {
        Some(token) => format!("https://{}@github.com/{}/{}.git", token, owner, name),
        None => format!("https://github.com/{}/{}.git", owner, name),
    }
}

/// Fallback branches to try, excluding the ref that already failed.
fn fallback_refs(failed_ref: &str) -> Vec<String> {
    FALLBACK_REFS
        .iter()
        .filter(|r| **r != failed_ref)
        .map(|r| r.to_string())
        .collect()
}

/// Environment for git child processes: no credential prompts, no user or
/// system config surprises.
fn git_env() -> HashMap<String, String> {
    let mut env = HashMap::new();
    env.insert("GIT_TERMINAL_PROMPT".to_string(), "0".to_string());
    env.insert(
        "GIT_SSH_COMMAND".to_string(),
        "ssh -o BatchMode=yes".to_string(),
    );
    env.insert("GIT_CONFIG_NOSYSTEM".to_string(), "1".to_string());
    env
}

/// Resolve HEAD in a cloned tree.
async fn resolve_head(repo_dir: &Path) -> Option<String> {
    let output = Command::new("git")
        .arg("rev-parse")
        .arg("HEAD")
        .current_dir(repo_dir)
        .stdout(Stdio::piped())
        .stderr(Stdio::null())
        .output()
        .await
        .ok()?;

    if !output.status.success() {
        return None;
    }
    let sha = String::from_utf8_lossy(&output.stdout).trim().to_string();
    if sha.is_empty() { None } else { Some(sha) }
}

fn remove_tree(path: &Path) {
    if path.exists() {
        let _ = std::fs::remove_dir_all(path);
    }
}

/// Remove a partial clone and recreate an empty, owner-only target.
fn reset_target(path: &Path) -> Result<()> {
    remove_tree(path);

    let mut builder = std::fs::DirBuilder::new();
    builder.recursive(true);
    #[cfg(unix)]
    {
        use std::os::unix::fs::DirBuilderExt;
        builder.mode(0o700);
    }
    builder
        .create(path)
        .with_context(|| format!("recreating clone target {}", path.display()))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn fetcher() -> RepoFetcher {
        RepoFetcher::new(Arc::new(Settings::default()))
    }

    #[test]
    fn clone_url_embeds_token() {
        assert_eq!(
            clone_url("alice", "app", None),
            "https://github.com/alice/app.git"
        );
        assert_eq!(
            clone_url("alice", "app", Some("tok123")),
            "https://tok123@github.com/alice/app.git"
        );
    }

    #[test]
    fn fallback_refs_exclude_the_failed_one() {
        assert_eq!(fallback_refs("feature/x"), vec!["main", "master"]);
        assert_eq!(fallback_refs("main"), vec!["master"]);
        assert_eq!(fallback_refs("master"), vec!["main"]);
    }

    #[test]
    fn git_env_disables_prompts() {
        let env = git_env();
        assert_eq!(env.get("GIT_TERMINAL_PROMPT").unwrap(), "0");
        assert!(env.get("GIT_SSH_COMMAND").unwrap().contains("BatchMode=yes"));
        assert_eq!(env.get("GIT_CONFIG_NOSYSTEM").unwrap(), "1");
    }

    #[tokio::test]
    async fn visibility_check_rejects_invalid_identifiers() {
        let fetcher = fetcher();
        let err = fetcher
            .check_repo_access("bad owner", "app", None)
            .await
            .unwrap_err();
        assert!(err.to_string().contains("invalid repository"));
    }

    #[tokio::test]
    async fn invalid_identifiers_fail_before_spawning_git() {
        let dir = TempDir::new().unwrap();
        let fetcher = fetcher();

        let err = fetcher
            .clone_repository("bad owner", "app", "main", dir.path(), None)
            .await
            .unwrap_err();
        assert!(err.to_string().contains("invalid repository identifier"));

        let err = fetcher
            .clone_repository("alice", "app", "bad ref", dir.path(), None)
            .await
            .unwrap_err();
        assert!(err.to_string().contains("invalid git reference"));
    }

    #[tokio::test]
    async fn clone_failure_redacts_token() {
        let dir = TempDir::new().unwrap();
        // Point at a repository that cannot exist; the token in the URL must
        // not leak into the error chain.
        let settings = Settings {
            clone_timeout: 30,
            ..Settings::default()
        };
        let fetcher = RepoFetcher::new(Arc::new(settings));

        let result = fetcher
            .clone_repository(
                "glimpse-no-such-owner-1",
                "no-such-repo",
                "main",
                dir.path(),
                Some("supersecrettoken"),
            )
            .await;

        if let Err(e) = result {
            let rendered = format!("{:#}", e);
            assert!(!rendered.contains("supersecrettoken"));
        }
    }

    #[test]
    fn reset_target_clears_partial_clones() {
        let dir = TempDir::new().unwrap();
        let target = dir.path().join("ws");
        std::fs::create_dir_all(target.join("partial")).unwrap();
        std::fs::write(target.join("partial/file"), "x").unwrap();

        reset_target(&target).unwrap();
        assert!(target.exists());
        assert!(!target.join("partial").exists());
    }
}
