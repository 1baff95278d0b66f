//! Session record store gateway.
//!
//! Typed operations over the shared session store. The store is the only
//! cross-instance shared resource; every write stamps `updated_at` and every
//! read filters out soft-deleted tombstones.

use anyhow::{Context, Result};
use chrono::{DateTime, SecondsFormat, Utc};
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions};
use std::str::FromStr;

use super::models::{SessionRecord, SessionStatus};

/// Schema for the session store.
const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS sessions (
    id TEXT PRIMARY KEY,
    repo_owner TEXT NOT NULL,
    repo_name TEXT NOT NULL,
    repo_ref TEXT NOT NULL,
    status TEXT NOT NULL,
    error_message TEXT,
    internal_port INTEGER,
    container_instance TEXT,
    access_token TEXT NOT NULL,
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL,
    last_activity_at TEXT NOT NULL,
    expires_at TEXT NOT NULL,
    deleted_at TEXT
);

CREATE INDEX IF NOT EXISTS idx_sessions_repo ON sessions(repo_owner, repo_name, repo_ref);
CREATE INDEX IF NOT EXISTS idx_sessions_status ON sessions(status);
CREATE INDEX IF NOT EXISTS idx_sessions_expires ON sessions(expires_at);
CREATE INDEX IF NOT EXISTS idx_sessions_token ON sessions(access_token);
"#;

/// All session columns for SELECT queries.
const SESSION_COLUMNS: &str = r#"
    id, repo_owner, repo_name, repo_ref, status, error_message,
    internal_port, container_instance, access_token,
    created_at, updated_at, last_activity_at, expires_at, deleted_at
"#;

/// Statuses that count as active for reuse, sweeping, and orphan claims.
const ACTIVE_STATUSES: &str = "('pending', 'cloning', 'installing', 'starting', 'ready')";

/// Current time in the store's canonical timestamp format.
///
/// Fixed-width RFC 3339 with microseconds and a `Z` suffix, so lexicographic
/// comparison in SQL matches chronological order.
pub fn now_rfc3339() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Micros, true)
}

/// Format an explicit instant in the store's timestamp format.
pub fn to_store_timestamp(t: DateTime<Utc>) -> String {
    t.to_rfc3339_opts(SecondsFormat::Micros, true)
}

/// Partial update of mutable session fields.
///
/// Immutable fields (id, repo identifiers, access token, created_at) are not
/// representable here on purpose.
#[derive(Debug, Clone, Default)]
pub struct SessionPatch {
    pub status: Option<SessionStatus>,
    pub error_message: Option<String>,
    pub internal_port: Option<i64>,
    pub container_instance: Option<String>,
    pub last_activity_at: Option<String>,
}

/// Gateway over the shared session record store.
#[derive(Debug, Clone)]
pub struct SessionStore {
    pool: SqlitePool,
}

impl SessionStore {
    /// Connect to the store at a sqlx database URL and initialize the schema.
    pub async fn connect(url: &str) -> Result<Self> {
        let options = SqliteConnectOptions::from_str(url)
            .with_context(|| format!("parsing record store URL: {}", url))?
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .busy_timeout(std::time::Duration::from_secs(30));

        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(options)
            .await
            .context("connecting to record store")?;

        let store = Self { pool };
        store.initialize_schema().await?;
        Ok(store)
    }

    /// In-memory store for tests.
    pub async fn in_memory() -> Result<Self> {
        let options = SqliteConnectOptions::from_str("sqlite::memory:")
            .context("parsing in-memory store URL")?;

        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(options)
            .await
            .context("connecting to in-memory record store")?;

        let store = Self { pool };
        store.initialize_schema().await?;
        Ok(store)
    }

    async fn initialize_schema(&self) -> Result<()> {
        sqlx::raw_sql(SCHEMA)
            .execute(&self.pool)
            .await
            .context("initializing session store schema")?;
        Ok(())
    }

    /// Insert a new session record.
    pub async fn create(&self, record: &SessionRecord) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO sessions (
                id, repo_owner, repo_name, repo_ref, status, error_message,
                internal_port, container_instance, access_token,
                created_at, updated_at, last_activity_at, expires_at, deleted_at
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&record.id)
        .bind(&record.repo_owner)
        .bind(&record.repo_name)
        .bind(&record.repo_ref)
        .bind(record.status.to_string())
        .bind(&record.error_message)
        .bind(record.internal_port)
        .bind(&record.container_instance)
        .bind(&record.access_token)
        .bind(&record.created_at)
        .bind(&record.updated_at)
        .bind(&record.last_activity_at)
        .bind(&record.expires_at)
        .bind(&record.deleted_at)
        .execute(&self.pool)
        .await
        .context("creating session record")?;

        Ok(())
    }

    /// Get a session by ID. Soft-deleted records are excluded.
    pub async fn get(&self, id: &str) -> Result<Option<SessionRecord>> {
        let query = format!(
            "SELECT {} FROM sessions WHERE id = ? AND deleted_at IS NULL",
            SESSION_COLUMNS
        );
        let record = sqlx::query_as::<_, SessionRecord>(&query)
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .context("fetching session")?;

        Ok(record)
    }

    /// Get a session by access token. Soft-deleted records are excluded.
    pub async fn get_by_token(&self, access_token: &str) -> Result<Option<SessionRecord>> {
        let query = format!(
            "SELECT {} FROM sessions WHERE access_token = ? AND deleted_at IS NULL",
            SESSION_COLUMNS
        );
        let record = sqlx::query_as::<_, SessionRecord>(&query)
            .bind(access_token)
            .fetch_optional(&self.pool)
            .await
            .context("fetching session by token")?;

        Ok(record)
    }

    /// Apply a partial update and return the updated record.
    pub async fn update(&self, id: &str, patch: SessionPatch) -> Result<Option<SessionRecord>> {
        let mut sets: Vec<String> = vec!["updated_at = ?".to_string()];
        if patch.status.is_some() {
            sets.push("status = ?".to_string());
        }
        if patch.error_message.is_some() {
            sets.push("error_message = ?".to_string());
        }
        if patch.internal_port.is_some() {
            sets.push("internal_port = ?".to_string());
        }
        if patch.container_instance.is_some() {
            sets.push("container_instance = ?".to_string());
        }
        if patch.last_activity_at.is_some() {
            sets.push("last_activity_at = ?".to_string());
        }

        let sql = format!(
            "UPDATE sessions SET {} WHERE id = ? AND deleted_at IS NULL",
            sets.join(", ")
        );

        let mut query = sqlx::query(&sql).bind(now_rfc3339());
        if let Some(status) = patch.status {
            query = query.bind(status.to_string());
        }
        if let Some(error_message) = patch.error_message {
            query = query.bind(error_message);
        }
        if let Some(port) = patch.internal_port {
            query = query.bind(port);
        }
        if let Some(instance) = patch.container_instance {
            query = query.bind(instance);
        }
        if let Some(activity) = patch.last_activity_at {
            query = query.bind(activity);
        }

        query
            .bind(id)
            .execute(&self.pool)
            .await
            .context("updating session")?;

        self.get(id).await
    }

    /// Update status, optionally recording an error message.
    pub async fn update_status(
        &self,
        id: &str,
        status: SessionStatus,
        error_message: Option<&str>,
    ) -> Result<Option<SessionRecord>> {
        self.update(
            id,
            SessionPatch {
                status: Some(status),
                error_message: error_message.map(ToString::to_string),
                ..SessionPatch::default()
            },
        )
        .await
    }

    /// Bump the last-activity timestamp. Last-writer-wins.
    pub async fn update_activity(&self, id: &str) -> Result<()> {
        let now = now_rfc3339();
        sqlx::query(
            "UPDATE sessions SET last_activity_at = ?, updated_at = ? WHERE id = ? AND deleted_at IS NULL",
        )
        .bind(&now)
        .bind(&now)
        .bind(id)
        .execute(&self.pool)
        .await
        .context("updating session activity")?;

        Ok(())
    }

    /// Soft-delete a session: stamp `deleted_at` and force status to
    /// stopped. Returns false when the record was already gone.
    pub async fn soft_delete(&self, id: &str) -> Result<bool> {
        let now = now_rfc3339();
        let result = sqlx::query(
            "UPDATE sessions SET deleted_at = ?, status = ?, updated_at = ? WHERE id = ? AND deleted_at IS NULL",
        )
        .bind(&now)
        .bind(SessionStatus::Stopped.to_string())
        .bind(&now)
        .bind(id)
        .execute(&self.pool)
        .await
        .context("soft-deleting session")?;

        Ok(result.rows_affected() > 0)
    }

    /// List active sessions, optionally restricted to one instance.
    pub async fn list_active(
        &self,
        instance: Option<&str>,
        limit: i64,
    ) -> Result<Vec<SessionRecord>> {
        let mut sql = format!(
            "SELECT {} FROM sessions WHERE deleted_at IS NULL AND status IN {}",
            SESSION_COLUMNS, ACTIVE_STATUSES
        );
        if instance.is_some() {
            sql.push_str(" AND container_instance = ?");
        }
        sql.push_str(" ORDER BY created_at DESC LIMIT ?");

        let mut query = sqlx::query_as::<_, SessionRecord>(&sql);
        if let Some(instance) = instance {
            query = query.bind(instance);
        }
        let records = query
            .bind(limit)
            .fetch_all(&self.pool)
            .await
            .context("listing active sessions")?;

        Ok(records)
    }

    /// List every non-deleted session owned by an instance.
    pub async fn list_for_instance(&self, instance: &str) -> Result<Vec<SessionRecord>> {
        let query = format!(
            "SELECT {} FROM sessions WHERE container_instance = ? AND deleted_at IS NULL",
            SESSION_COLUMNS
        );
        let records = sqlx::query_as::<_, SessionRecord>(&query)
            .bind(instance)
            .fetch_all(&self.pool)
            .await
            .context("listing sessions for instance")?;

        Ok(records)
    }

    /// Sessions past their hard expiry.
    pub async fn find_expired(&self, limit: i64) -> Result<Vec<SessionRecord>> {
        let query = format!(
            "SELECT {} FROM sessions WHERE deleted_at IS NULL AND expires_at < ? LIMIT ?",
            SESSION_COLUMNS
        );
        let records = sqlx::query_as::<_, SessionRecord>(&query)
            .bind(now_rfc3339())
            .bind(limit)
            .fetch_all(&self.pool)
            .await
            .context("finding expired sessions")?;

        Ok(records)
    }

    /// Ready sessions with no traffic since `before`.
    pub async fn find_idle(&self, before: &str, limit: i64) -> Result<Vec<SessionRecord>> {
        let query = format!(
            "SELECT {} FROM sessions WHERE deleted_at IS NULL AND status = 'ready' AND last_activity_at < ? LIMIT ?",
            SESSION_COLUMNS
        );
        let records = sqlx::query_as::<_, SessionRecord>(&query)
            .bind(before)
            .bind(limit)
            .fetch_all(&self.pool)
            .await
            .context("finding idle sessions")?;

        Ok(records)
    }

    /// Most recent active, non-expired session for a repo triple, optionally
    /// restricted to one instance.
    pub async fn find_active_for_repo(
        &self,
        repo_owner: &str,
        repo_name: &str,
        repo_ref: &str,
        instance: Option<&str>,
    ) -> Result<Option<SessionRecord>> {
        let mut sql = format!(
            "SELECT {} FROM sessions \
             WHERE repo_owner = ? AND repo_name = ? AND repo_ref = ? \
             AND deleted_at IS NULL AND status IN {}",
            SESSION_COLUMNS, ACTIVE_STATUSES
        );
        if instance.is_some() {
            sql.push_str(" AND container_instance = ?");
        }
        sql.push_str(" ORDER BY created_at DESC LIMIT 1");

        let mut query = sqlx::query_as::<_, SessionRecord>(&sql)
            .bind(repo_owner)
            .bind(repo_name)
            .bind(repo_ref);
        if let Some(instance) = instance {
            query = query.bind(instance);
        }

        let record = query
            .fetch_optional(&self.pool)
            .await
            .context("finding active session for repo")?;

        // An expired record is unusable for reuse even if a sweeper has not
        // collected it yet.
        Ok(record.filter(|r| !r.is_expired()))
    }

    /// Mark stale active records as failed ("orphaned") and return them.
    ///
    /// A record is stale when its owning instance has not written to it
    /// since `stale_cutoff`. Workspaces of orphaned sessions are lost with
    /// the prior host and are never adopted.
    pub async fn claim_orphans(
        &self,
        _self_instance: &str,
        stale_cutoff: &str,
    ) -> Result<Vec<SessionRecord>> {
        let query = format!(
            "SELECT {} FROM sessions WHERE deleted_at IS NULL AND status IN {} AND updated_at < ?",
            SESSION_COLUMNS, ACTIVE_STATUSES
        );
        let stale = sqlx::query_as::<_, SessionRecord>(&query)
            .bind(stale_cutoff)
            .fetch_all(&self.pool)
            .await
            .context("finding orphaned sessions")?;

        for record in &stale {
            self.update_status(&record.id, SessionStatus::Failed, Some("orphaned"))
                .await?;
        }

        Ok(stale)
    }

    /// Hard-delete tombstones soft-deleted before `before`. Returns the
    /// number of rows removed.
    pub async fn purge_deleted(&self, before: &str, limit: i64) -> Result<u64> {
        let result = sqlx::query(
            "DELETE FROM sessions WHERE id IN (\
                SELECT id FROM sessions \
                WHERE deleted_at IS NOT NULL AND deleted_at < ? LIMIT ?\
            )",
        )
        .bind(before)
        .bind(limit)
        .execute(&self.pool)
        .await
        .context("purging deleted sessions")?;

        Ok(result.rows_affected())
    }
}
