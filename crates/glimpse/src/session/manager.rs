//! Session lifecycle orchestration.
//!
//! Ties together the record store, the repo fetcher, the workspace manager,
//! and the process manager. Each new session runs one background setup task
//! driving pending → cloning → installing → starting → ready, with failed as
//! the off-ramp at every step.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Result, anyhow};
use chrono::Utc;
use dashmap::DashMap;
use log::{error, info, warn};
use thiserror::Error;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use uuid::Uuid;

use crate::config::Settings;
use crate::fetch::RepoFetcher;
use crate::process::ProcessManager;
use crate::security::{constant_time_compare, generate_access_token};
use crate::workspace::WorkspaceManager;

use super::models::{SessionRecord, SessionStatus, SessionView};
use super::store::{SessionPatch, SessionStore, to_store_timestamp};

/// How long a record may go unwritten before startup recovery declares its
/// owner dead.
const ORPHAN_STALENESS: Duration = Duration::from_secs(5 * 60);

/// Tombstones older than this are hard-deleted by the purge job.
const PURGE_AFTER: Duration = Duration::from_secs(24 * 60 * 60);

/// Graceful period before a dev server is force-killed.
const STOP_GRACE: Duration = Duration::from_secs(10);

/// Errors surfaced by session creation.
#[derive(Debug, Error)]
pub enum SessionError {
    /// Per-instance concurrency cap reached.
    #[error("session capacity exhausted on this instance")]
    Capacity,
    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

/// Result of a session lookup-or-create.
#[derive(Debug, Clone)]
pub struct CreateOutcome {
    pub view: SessionView,
    /// An existing session was returned instead of a new one.
    pub reused: bool,
}

/// Orchestrates the complete session lifecycle.
#[derive(Clone)]
pub struct SessionManager {
    settings: Arc<Settings>,
    store: SessionStore,
    fetcher: Arc<RepoFetcher>,
    workspaces: Arc<WorkspaceManager>,
    processes: Arc<ProcessManager>,
    /// Active setup tasks by session id.
    setup_tasks: Arc<Mutex<HashMap<String, JoinHandle<()>>>>,
    /// Clone tokens held in memory only, dropped when setup finishes.
    tokens: Arc<DashMap<String, String>>,
}

impl SessionManager {
    pub fn new(settings: Arc<Settings>, store: SessionStore) -> Self {
        let fetcher = Arc::new(RepoFetcher::new(settings.clone()));
        let workspaces = Arc::new(WorkspaceManager::new(settings.clone()));
        let processes = Arc::new(ProcessManager::new(settings.clone()));
        Self {
            settings,
            store,
            fetcher,
            workspaces,
            processes,
            setup_tasks: Arc::new(Mutex::new(HashMap::new())),
            tokens: Arc::new(DashMap::new()),
        }
    }

    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    pub fn store(&self) -> &SessionStore {
        &self.store
    }

    /// Create a preview session, or reuse an active one for the same
    /// repo/ref unless `force_new` is set.
    pub async fn create_session(
        &self,
        repo_owner: &str,
        repo_name: &str,
        repo_ref: &str,
        github_token: Option<String>,
        force_new: bool,
    ) -> Result<CreateOutcome, SessionError> {
        if !force_new {
            if let Some(view) = self
                .find_existing_session(repo_owner, repo_name, repo_ref)
                .await?
            {
                return Ok(CreateOutcome { view, reused: true });
            }
        }

        let owned = self
            .store
            .list_active(Some(&self.settings.instance_id), 1000)
            .await?;
        if owned.len() >= self.settings.max_concurrent_sessions {
            warn!(
                "Refusing new session: {} active sessions at cap {}",
                owned.len(),
                self.settings.max_concurrent_sessions
            );
            return Err(SessionError::Capacity);
        }

        let now = Utc::now();
        let record = SessionRecord {
            id: Uuid::new_v4().simple().to_string(),
            repo_owner: repo_owner.to_string(),
            repo_name: repo_name.to_string(),
            repo_ref: repo_ref.to_string(),
            status: SessionStatus::Pending,
            error_message: None,
            internal_port: None,
            container_instance: Some(self.settings.instance_id.clone()),
            access_token: generate_access_token(),
            created_at: to_store_timestamp(now),
            updated_at: to_store_timestamp(now),
            last_activity_at: to_store_timestamp(now),
            expires_at: to_store_timestamp(
                now + chrono::Duration::seconds(self.settings.session_max_lifetime as i64),
            ),
            deleted_at: None,
        };
        self.store.create(&record).await?;

        info!(
            "Created session {} for {}",
            record.id,
            record.repo_full_name()
        );

        if let Some(token) = github_token {
            self.tokens.insert(record.id.clone(), token);
        }

        let manager = self.clone();
        let session_id = record.id.clone();
        let task = tokio::spawn(async move {
            manager.run_setup(&session_id).await;
        });

        let mut tasks = self.setup_tasks.lock().await;
        tasks.insert(record.id.clone(), task);

        Ok(CreateOutcome {
            view: SessionView::from_record(&record, None),
            reused: false,
        })
    }

    /// Find an active, non-expired session for the repo triple.
    ///
    /// Sessions owned by this instance win; a ready session owned elsewhere
    /// is returned as-is and the proxy path performs recovery on first hit.
    async fn find_existing_session(
        &self,
        repo_owner: &str,
        repo_name: &str,
        repo_ref: &str,
    ) -> Result<Option<SessionView>> {
        let own = self
            .store
            .find_active_for_repo(
                repo_owner,
                repo_name,
                repo_ref,
                Some(&self.settings.instance_id),
            )
            .await?;

        if let Some(record) = own {
            info!(
                "Reusing session {} (this instance, {})",
                record.id, record.status
            );
            self.store.update_activity(&record.id).await?;
            return Ok(Some(self.view_of(&record)));
        }

        let any = self
            .store
            .find_active_for_repo(repo_owner, repo_name, repo_ref, None)
            .await?;

        if let Some(record) = any {
            info!(
                "Reusing session {} (instance {:?}, {})",
                record.id, record.container_instance, record.status
            );
            self.store.update_activity(&record.id).await?;
            return Ok(Some(self.view_of(&record)));
        }

        Ok(None)
    }

    /// Snapshot a session as an external view.
    pub async fn get_session(&self, session_id: &str) -> Result<Option<SessionView>> {
        let record = self.store.get(session_id).await?;
        Ok(record.map(|r| self.view_of(&r)))
    }

    /// Full record, internal use only.
    pub async fn get_session_record(&self, session_id: &str) -> Result<Option<SessionRecord>> {
        self.store.get(session_id).await
    }

    /// Active sessions owned by this instance.
    pub async fn list_sessions(&self) -> Result<Vec<SessionView>> {
        let records = self
            .store
            .list_active(Some(&self.settings.instance_id), 50)
            .await?;
        Ok(records.iter().map(|r| self.view_of(r)).collect())
    }

    /// Stop a session: cancel setup, terminate the process, remove the
    /// workspace, soft-delete the record. Idempotent in effect; returns
    /// false when the session is unknown.
    pub async fn stop_session(&self, session_id: &str) -> Result<bool> {
        if self.store.get(session_id).await?.is_none() {
            return Ok(false);
        }

        self.cancel_setup_task(session_id).await;
        self.tokens.remove(session_id);

        info!("Stopping session {}", session_id);
        self.processes.stop_process(session_id, STOP_GRACE).await;
        self.workspaces.cleanup_workspace(session_id).await;
        self.store.soft_delete(session_id).await?;

        info!("Session {} stopped and cleaned up", session_id);
        Ok(true)
    }

    /// Bump the activity timestamp. Called on every proxy hit.
    pub async fn update_activity(&self, session_id: &str) -> Result<()> {
        self.store.update_activity(session_id).await
    }

    /// Validate preview access for a session.
    ///
    /// Valid only when the token matches (constant-time), the session is
    /// ready, this instance owns it, and a process port is registered. The
    /// record is still returned on most rejections so the proxy can map the
    /// state to a response.
    pub async fn validate_access(
        &self,
        session_id: &str,
        access_token: &str,
    ) -> Result<(bool, Option<SessionRecord>, Option<u16>)> {
        let Some(record) = self.store.get(session_id).await? else {
            return Ok((false, None, None));
        };

        if !constant_time_compare(&record.access_token, access_token) {
            return Ok((false, None, None));
        }

        if record.status != SessionStatus::Ready {
            return Ok((false, Some(record), None));
        }

        if record.container_instance.as_deref() != Some(self.settings.instance_id.as_str()) {
            return Ok((false, Some(record), None));
        }

        let Some(port) = self.processes.get_port(session_id).await else {
            return Ok((false, Some(record), None));
        };

        Ok((true, Some(record), Some(port)))
    }

    /// Take over a ready session owned by another instance.
    ///
    /// Re-runs clone → install → start on this instance. Tokens are never
    /// persisted, so recovery clones without credentials and only works for
    /// public repositories.
    pub async fn recover_session(&self, session_id: &str) -> Result<Option<u16>> {
        let Some(record) = self.store.get(session_id).await? else {
            warn!("Session {} not found for recovery", session_id);
            return Ok(None);
        };

        if record.status != SessionStatus::Ready {
            warn!(
                "Session {} not in ready state for recovery: {}",
                session_id, record.status
            );
            return Ok(None);
        }

        {
            let tasks = self.setup_tasks.lock().await;
            if tasks.contains_key(session_id) {
                info!("Recovery of session {} already in progress", session_id);
                return Ok(None);
            }
        }

        info!(
            "Recovering session {} from instance {:?}",
            session_id, record.container_instance
        );

        let result = self.run_recovery(&record).await;
        match result {
            Ok(port) => {
                info!("Session {} recovered on port {}", session_id, port);
                Ok(Some(port))
            }
            Err(e) => {
                error!("Recovery of session {} failed: {:#}", session_id, e);
                let _ = self
                    .store
                    .update_status(
                        session_id,
                        SessionStatus::Failed,
                        Some(&format!("Recovery failed: {}", e)),
                    )
                    .await;
                self.cleanup_partial(session_id).await;
                Ok(None)
            }
        }
    }

    async fn run_recovery(&self, record: &SessionRecord) -> Result<u16> {
        let session_id = &record.id;

        self.store
            .update_status(session_id, SessionStatus::Starting, None)
            .await?;
        self.store
            .update(
                session_id,
                SessionPatch {
                    container_instance: Some(self.settings.instance_id.clone()),
                    ..SessionPatch::default()
                },
            )
            .await?;

        let workspace_path = self.workspaces.create_workspace(session_id).await?;

        info!("Re-cloning repository for recovery (public repos only)");
        self.fetcher
            .clone_with_fallback(
                &record.repo_owner,
                &record.repo_name,
                &record.repo_ref,
                &workspace_path,
                None,
            )
            .await?;

        let info = self
            .workspaces
            .prepare_workspace(&workspace_path, session_id)
            .await?;
        let command = info
            .start_command
            .ok_or_else(|| anyhow!("Could not determine start command"))?;

        let port = self
            .processes
            .start_process(
                session_id,
                &workspace_path,
                &command,
                info.detected_framework.as_deref(),
            )
            .await?;

        self.store
            .update(
                session_id,
                SessionPatch {
                    internal_port: Some(port as i64),
                    ..SessionPatch::default()
                },
            )
            .await?;

        let ready = self
            .processes
            .wait_for_ready(
                session_id,
                Duration::from_secs(self.settings.session_startup_timeout),
            )
            .await;
        if !ready {
            return Err(anyhow!("Server failed to start during recovery"));
        }

        self.store
            .update_status(session_id, SessionStatus::Ready, None)
            .await?;
        Ok(port)
    }

    /// The per-session background setup task.
    async fn run_setup(&self, session_id: &str) {
        let record = match self.store.get(session_id).await {
            Ok(Some(record)) => record,
            Ok(None) => return,
            Err(e) => {
                error!("Setup for {} could not load record: {:?}", session_id, e);
                return;
            }
        };

        let github_token = self.tokens.get(session_id).map(|t| t.value().clone());

        let result = self.run_setup_inner(&record, github_token.as_deref()).await;

        if let Err(e) = result {
            let message = e.to_string();
            error!("Session {} setup failed: {:#}", session_id, e);
            if let Err(status_err) = self
                .store
                .update_status(session_id, SessionStatus::Failed, Some(&message))
                .await
            {
                error!(
                    "Failed to record failure for session {}: {:?}",
                    session_id, status_err
                );
            }
            self.cleanup_partial(session_id).await;
        }

        let mut tasks = self.setup_tasks.lock().await;
        tasks.remove(session_id);
        self.tokens.remove(session_id);
    }

    async fn run_setup_inner(
        &self,
        record: &SessionRecord,
        github_token: Option<&str>,
    ) -> Result<()> {
        let session_id = &record.id;

        // Step 1: clone.
        self.store
            .update_status(session_id, SessionStatus::Cloning, None)
            .await?;
        info!("Cloning repository for session {}", session_id);

        let workspace_path = self.workspaces.create_workspace(session_id).await?;
        self.fetcher
            .clone_with_fallback(
                &record.repo_owner,
                &record.repo_name,
                &record.repo_ref,
                &workspace_path,
                github_token,
            )
            .await?;

        // Step 2: install dependencies.
        self.store
            .update_status(session_id, SessionStatus::Installing, None)
            .await?;
        info!("Installing dependencies for session {}", session_id);

        let info = self
            .workspaces
            .prepare_workspace(&workspace_path, session_id)
            .await?;
        let command = info
            .start_command
            .ok_or_else(|| anyhow!("Could not determine start command"))?;

        // Step 3: start the dev server.
        self.store
            .update_status(session_id, SessionStatus::Starting, None)
            .await?;
        info!("Starting dev server for session {}", session_id);

        let port = self
            .processes
            .start_process(
                session_id,
                &workspace_path,
                &command,
                info.detected_framework.as_deref(),
            )
            .await?;

        self.store
            .update(
                session_id,
                SessionPatch {
                    internal_port: Some(port as i64),
                    ..SessionPatch::default()
                },
            )
            .await?;

        // Step 4: wait for the server to answer.
        info!(
            "Waiting for dev server on port {} for session {}",
            port, session_id
        );
        let ready = self
            .processes
            .wait_for_ready(
                session_id,
                Duration::from_secs(self.settings.session_startup_timeout),
            )
            .await;

        if !ready {
            return Err(anyhow!("Server failed to start within timeout"));
        }

        self.store
            .update_status(session_id, SessionStatus::Ready, None)
            .await?;
        info!("Session {} is ready", session_id);
        Ok(())
    }

    /// Release the process, port, and workspace of a failed or cancelled
    /// setup. Status is left to the caller.
    async fn cleanup_partial(&self, session_id: &str) {
        self.processes.stop_process(session_id, STOP_GRACE).await;
        self.workspaces.cleanup_workspace(session_id).await;
    }

    async fn cancel_setup_task(&self, session_id: &str) {
        let task = {
            let mut tasks = self.setup_tasks.lock().await;
            tasks.remove(session_id)
        };
        if let Some(task) = task {
            if !task.is_finished() {
                task.abort();
            }
            let _ = task.await;
        }
    }

    /// Sweep sessions past their hard lifetime.
    pub async fn cleanup_expired_sessions(&self) -> Result<usize> {
        let expired = self.store.find_expired(50).await?;
        let mut count = 0;

        for record in expired {
            if record.container_instance.as_deref() == Some(self.settings.instance_id.as_str()) {
                self.stop_session(&record.id).await?;
            } else {
                // The owning instance is elsewhere (or gone); tombstone the
                // record and let that instance collect its own resources.
                self.store.soft_delete(&record.id).await?;
            }
            count += 1;
        }

        if count > 0 {
            info!("Cleaned up {} expired session(s)", count);
        }
        Ok(count)
    }

    /// Sweep ready sessions with no recent preview traffic.
    pub async fn cleanup_idle_sessions(&self) -> Result<usize> {
        let cutoff = to_store_timestamp(
            Utc::now() - chrono::Duration::seconds(self.settings.session_idle_timeout as i64),
        );
        let idle = self.store.find_idle(&cutoff, 50).await?;
        let mut count = 0;

        for record in idle {
            if record.container_instance.as_deref() == Some(self.settings.instance_id.as_str()) {
                info!("Stopping idle session {}", record.id);
                self.stop_session(&record.id).await?;
                count += 1;
            }
        }

        if count > 0 {
            info!("Cleaned up {} idle session(s)", count);
        }
        Ok(count)
    }

    /// Hard-delete old tombstones.
    pub async fn purge_deleted_sessions(&self) -> Result<u64> {
        let cutoff = to_store_timestamp(
            Utc::now() - chrono::Duration::from_std(PURGE_AFTER).unwrap_or_default(),
        );
        self.store.purge_deleted(&cutoff, 100).await
    }

    /// Startup recovery: fail stale records left behind by dead instances.
    /// Their workspaces are lost with the prior host and are not adopted.
    pub async fn recover_on_startup(&self) -> Result<()> {
        let cutoff = to_store_timestamp(
            Utc::now() - chrono::Duration::from_std(ORPHAN_STALENESS).unwrap_or_default(),
        );
        let orphaned = self
            .store
            .claim_orphans(&self.settings.instance_id, &cutoff)
            .await?;
        if !orphaned.is_empty() {
            info!("Marked {} orphaned session(s) as failed", orphaned.len());
        }
        Ok(())
    }

    /// Graceful shutdown: cancel setups, stop owned sessions, then sweep
    /// processes and workspaces.
    pub async fn shutdown(&self) -> Result<()> {
        info!("Shutting down session manager");

        let tasks: Vec<(String, JoinHandle<()>)> = {
            let mut map = self.setup_tasks.lock().await;
            map.drain().collect()
        };
        for (_, task) in &tasks {
            task.abort();
        }
        futures::future::join_all(tasks.into_iter().map(|(_, task)| task)).await;

        let sessions = self
            .store
            .list_for_instance(&self.settings.instance_id)
            .await?;
        for record in sessions {
            if record.is_active() {
                self.stop_session(&record.id).await?;
            }
        }

        self.processes.stop_all().await;
        self.workspaces.cleanup_all_workspaces().await;

        info!("Session manager shutdown complete");
        Ok(())
    }

    fn view_of(&self, record: &SessionRecord) -> SessionView {
        let preview_url = if record.status == SessionStatus::Ready {
            Some(
                self.settings
                    .preview_url(&record.id, &record.access_token),
            )
        } else {
            None
        };
        SessionView::from_record(record, preview_url)
    }
}
