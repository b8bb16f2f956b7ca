// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Durable transcript store on SQLite.
//!
//! The hub's only durable state lives here: users, runtimes, endpoints,
//! sessions, per-session message transcripts, endpoint permissions, the audit
//! log, and endpoint config overrides. Transcript `seq` assignment happens
//! inside the INSERT statement so two racing appends can never mint the same
//! sequence number.

use std::path::Path;
use std::str::FromStr;

use anyhow::Result;
use chrono::{DateTime, Utc};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use sqlx::SqlitePool;

use crate::protocol::EndpointRegistration;

#[derive(Debug, Clone, sqlx::FromRow)]
pub struct UserRow {
    pub id: String,
    pub username: String,
    pub role: String,
    pub org_id: String,
    pub token: String,
    pub created_at: String,
}

#[derive(Debug, Clone, sqlx::FromRow)]
pub struct RuntimeRow {
    pub id: String,
    pub org_id: String,
    pub online: i64,
    pub last_seen_at: String,
    pub created_at: String,
}

#[derive(Debug, Clone, sqlx::FromRow)]
pub struct EndpointRow {
    pub id: String,
    pub runtime_id: String,
    pub org_id: String,
    pub profile: String,
    pub name: String,
    /// JSON array string.
    pub tags: String,
    /// JSON array string.
    pub caps: String,
    /// JSON object string.
    pub security: String,
    pub updated_at: String,
}

#[derive(Debug, Clone, sqlx::FromRow)]
pub struct SessionRow {
    pub id: String,
    pub user_id: String,
    pub endpoint_id: String,
    pub runtime_id: String,
    pub org_id: String,
    pub profile: String,
    pub state: String,
    pub native_handle: Option<String>,
    pub created_at: String,
    pub updated_at: String,
}

#[derive(Debug, Clone, sqlx::FromRow)]
pub struct MessageRow {
    pub id: String,
    pub session_id: String,
    pub seq: i64,
    pub direction: String,
    pub channel: String,
    pub content: String,
    pub created_at: String,
}

#[derive(Debug, Clone, sqlx::FromRow)]
pub struct AuditRow {
    pub id: i64,
    pub event: String,
    pub session_id: Option<String>,
    pub runtime_id: Option<String>,
    pub user_id: Option<String>,
    /// JSON object string.
    pub detail: String,
    pub created_at: String,
}

#[derive(Debug, Clone, sqlx::FromRow)]
pub struct ConfigOverrideRow {
    pub endpoint_id: String,
    pub security: Option<String>,
    pub limits: Option<String>,
    pub updated_at: String,
}

/// Session states considered open for per-user caps and the idle reaper.
const OPEN_STATES: &str = "('creating','active','responding','idle')";

#[derive(Clone)]
pub struct Store {
    pool: SqlitePool,
}

impl Store {
    /// Open (creating if missing) the database at `path` and run migrations.
    pub async fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                tokio::fs::create_dir_all(parent).await?;
            }
        }
        let opts =
            SqliteConnectOptions::from_str(&format!("sqlite://{}?mode=rwc", path.display()))?
                .journal_mode(sqlx::sqlite::SqliteJournalMode::Wal)
                .synchronous(sqlx::sqlite::SqliteSynchronous::Normal)
                .busy_timeout(std::time::Duration::from_secs(5))
                .create_if_missing(true);
        let pool = SqlitePool::connect_with(opts).await?;
        Self::migrate(&pool).await?;
        Ok(Self { pool })
    }

    /// In-memory store for tests. Single connection: each SQLite `:memory:`
    /// connection is its own database.
    pub async fn open_in_memory() -> Result<Self> {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .min_connections(1)
            .connect("sqlite::memory:")
            .await?;
        Self::migrate(&pool).await?;
        Ok(Self { pool })
    }

    async fn migrate(pool: &SqlitePool) -> Result<()> {
        for sql in [include_str!("migrations/001_init.sql")] {
            for stmt in sql.split(';') {
                let stmt = stmt.trim();
                if !stmt.is_empty() {
                    sqlx::query(stmt).execute(pool).await?;
                }
            }
        }
        Ok(())
    }

    // -- Users ----------------------------------------------------------------

    pub async fn upsert_user(
        &self,
        id: &str,
        username: &str,
        role: &str,
        org_id: &str,
        token: &str,
    ) -> Result<()> {
        sqlx::query(
            "INSERT INTO users (id, username, role, org_id, token, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)
             ON CONFLICT(id) DO UPDATE SET
                 username = excluded.username,
                 role = excluded.role,
                 org_id = excluded.org_id,
                 token = excluded.token",
        )
        .bind(id)
        .bind(username)
        .bind(role)
        .bind(org_id)
        .bind(token)
        .bind(now_rfc3339())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn user_by_token(&self, token: &str) -> Result<Option<UserRow>> {
        let row = sqlx::query_as::<_, UserRow>("SELECT * FROM users WHERE token = ?1")
            .bind(token)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row)
    }

    // -- Runtimes -------------------------------------------------------------

    pub async fn upsert_runtime(&self, id: &str, org_id: &str, online: bool) -> Result<()> {
        let now = now_rfc3339();
        sqlx::query(
            "INSERT INTO runtimes (id, org_id, online, last_seen_at, created_at)
             VALUES (?1, ?2, ?3, ?4, ?4)
             ON CONFLICT(id) DO UPDATE SET
                 org_id = excluded.org_id,
                 online = excluded.online,
                 last_seen_at = excluded.last_seen_at",
        )
        .bind(id)
        .bind(org_id)
        .bind(online as i64)
        .bind(now)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn set_runtime_online(&self, id: &str, online: bool) -> Result<()> {
        sqlx::query("UPDATE runtimes SET online = ?2, last_seen_at = ?3 WHERE id = ?1")
            .bind(id)
            .bind(online as i64)
            .bind(now_rfc3339())
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn runtime(&self, id: &str) -> Result<Option<RuntimeRow>> {
        let row = sqlx::query_as::<_, RuntimeRow>("SELECT * FROM runtimes WHERE id = ?1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row)
    }

    pub async fn list_runtimes(&self) -> Result<Vec<RuntimeRow>> {
        let rows = sqlx::query_as::<_, RuntimeRow>("SELECT * FROM runtimes ORDER BY id")
            .fetch_all(&self.pool)
            .await?;
        Ok(rows)
    }

    // -- Endpoints ------------------------------------------------------------

    /// Upsert an endpoint registration. The latest registration wins the
    /// `runtime_id` claim.
    pub async fn upsert_endpoint(
        &self,
        reg: &EndpointRegistration,
        runtime_id: &str,
        org_id: &str,
    ) -> Result<()> {
        sqlx::query(
            "INSERT INTO endpoints (id, runtime_id, org_id, profile, name, tags, caps, security, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)
             ON CONFLICT(id) DO UPDATE SET
                 runtime_id = excluded.runtime_id,
                 org_id = excluded.org_id,
                 profile = excluded.profile,
                 name = excluded.name,
                 tags = excluded.tags,
                 caps = excluded.caps,
                 security = excluded.security,
                 updated_at = excluded.updated_at",
        )
        .bind(&reg.id)
        .bind(runtime_id)
        .bind(org_id)
        .bind(&reg.profile)
        .bind(&reg.name)
        .bind(serde_json::to_string(&reg.tags).unwrap_or_else(|_| "[]".to_owned()))
        .bind(serde_json::to_string(&reg.caps).unwrap_or_else(|_| "[]".to_owned()))
        .bind(serde_json::to_string(&reg.security).unwrap_or_else(|_| "{}".to_owned()))
        .bind(now_rfc3339())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn endpoint(&self, id: &str) -> Result<Option<EndpointRow>> {
        let row = sqlx::query_as::<_, EndpointRow>("SELECT * FROM endpoints WHERE id = ?1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row)
    }

    pub async fn list_endpoints(&self) -> Result<Vec<EndpointRow>> {
        let rows = sqlx::query_as::<_, EndpointRow>("SELECT * FROM endpoints ORDER BY id")
            .fetch_all(&self.pool)
            .await?;
        Ok(rows)
    }

    // -- Sessions -------------------------------------------------------------

    pub async fn create_session(
        &self,
        id: &str,
        user_id: &str,
        endpoint_id: &str,
        runtime_id: &str,
        org_id: &str,
        profile: &str,
    ) -> Result<SessionRow> {
        let now = now_rfc3339();
        sqlx::query(
            "INSERT INTO sessions (id, user_id, endpoint_id, runtime_id, org_id, profile, state, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, 'creating', ?7, ?7)",
        )
        .bind(id)
        .bind(user_id)
        .bind(endpoint_id)
        .bind(runtime_id)
        .bind(org_id)
        .bind(profile)
        .bind(&now)
        .execute(&self.pool)
        .await?;

        self.session(id)
            .await?
            .ok_or_else(|| anyhow::anyhow!("session {id} missing after insert"))
    }

    pub async fn session(&self, id: &str) -> Result<Option<SessionRow>> {
        let row = sqlx::query_as::<_, SessionRow>("SELECT * FROM sessions WHERE id = ?1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row)
    }

    pub async fn list_sessions_for_user(&self, user_id: &str) -> Result<Vec<SessionRow>> {
        let rows = sqlx::query_as::<_, SessionRow>(
            "SELECT * FROM sessions WHERE user_id = ?1 ORDER BY created_at DESC",
        )
        .bind(user_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }

    pub async fn list_sessions(&self) -> Result<Vec<SessionRow>> {
        let rows =
            sqlx::query_as::<_, SessionRow>("SELECT * FROM sessions ORDER BY created_at DESC")
                .fetch_all(&self.pool)
                .await?;
        Ok(rows)
    }

    /// Sessions the idle reaper should consider.
    pub async fn list_reapable_sessions(&self) -> Result<Vec<SessionRow>> {
        let sql = format!(
            "SELECT * FROM sessions WHERE state IN {} AND state != 'creating'",
            OPEN_STATES
        );
        let rows = sqlx::query_as::<_, SessionRow>(&sql).fetch_all(&self.pool).await?;
        Ok(rows)
    }

    pub async fn count_open_sessions_for_user(&self, user_id: &str) -> Result<i64> {
        let sql = format!(
            "SELECT COUNT(*) FROM sessions WHERE user_id = ?1 AND state IN {}",
            OPEN_STATES
        );
        let count: (i64,) =
            sqlx::query_as(&sql).bind(user_id).fetch_one(&self.pool).await?;
        Ok(count.0)
    }

    pub async fn update_session_state(&self, id: &str, state: &str) -> Result<()> {
        sqlx::query("UPDATE sessions SET state = ?2, updated_at = ?3 WHERE id = ?1")
            .bind(id)
            .bind(state)
            .bind(now_rfc3339())
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn set_native_handle(&self, id: &str, handle: &str) -> Result<()> {
        sqlx::query("UPDATE sessions SET native_handle = ?2, updated_at = ?3 WHERE id = ?1")
            .bind(id)
            .bind(handle)
            .bind(now_rfc3339())
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Bump `updated_at` so the idle reaper sees recent activity.
    pub async fn touch_session(&self, id: &str) -> Result<()> {
        sqlx::query("UPDATE sessions SET updated_at = ?2 WHERE id = ?1")
            .bind(id)
            .bind(now_rfc3339())
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    // -- Messages -------------------------------------------------------------

    /// Append a transcript row, assigning `seq` atomically inside the INSERT.
    ///
    /// Idempotent on `(session_id, id)`: re-appending an existing message id
    /// leaves the original row untouched and returns its `seq`.
    pub async fn append_message(
        &self,
        session_id: &str,
        message_id: &str,
        direction: &str,
        channel: &str,
        content: &str,
    ) -> Result<i64> {
        sqlx::query(
            "INSERT INTO messages (id, session_id, seq, direction, channel, content, created_at)
             VALUES (?1, ?2,
                 (SELECT COALESCE(MAX(seq), 0) + 1 FROM messages WHERE session_id = ?2),
                 ?3, ?4, ?5, ?6)
             ON CONFLICT(session_id, id) DO NOTHING",
        )
        .bind(message_id)
        .bind(session_id)
        .bind(direction)
        .bind(channel)
        .bind(content)
        .bind(now_rfc3339())
        .execute(&self.pool)
        .await?;

        let seq: (i64,) =
            sqlx::query_as("SELECT seq FROM messages WHERE session_id = ?1 AND id = ?2")
                .bind(session_id)
                .bind(message_id)
                .fetch_one(&self.pool)
                .await?;
        Ok(seq.0)
    }

    pub async fn message_exists(&self, session_id: &str, message_id: &str) -> Result<bool> {
        let row: Option<(i64,)> =
            sqlx::query_as("SELECT 1 FROM messages WHERE session_id = ?1 AND id = ?2")
                .bind(session_id)
                .bind(message_id)
                .fetch_optional(&self.pool)
                .await?;
        Ok(row.is_some())
    }

    pub async fn messages_after(
        &self,
        session_id: &str,
        after_seq: i64,
        limit: i64,
    ) -> Result<Vec<MessageRow>> {
        let rows = sqlx::query_as::<_, MessageRow>(
            "SELECT * FROM messages WHERE session_id = ?1 AND seq > ?2 ORDER BY seq LIMIT ?3",
        )
        .bind(session_id)
        .bind(after_seq)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }

    // -- Endpoint permissions -------------------------------------------------

    pub async fn grant_endpoint_permission(
        &self,
        endpoint_id: &str,
        user_id: &str,
        granted_by: &str,
    ) -> Result<()> {
        sqlx::query(
            "INSERT INTO endpoint_permissions (endpoint_id, user_id, granted_by, created_at)
             VALUES (?1, ?2, ?3, ?4)
             ON CONFLICT(endpoint_id, user_id) DO NOTHING",
        )
        .bind(endpoint_id)
        .bind(user_id)
        .bind(granted_by)
        .bind(now_rfc3339())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn revoke_endpoint_permission(
        &self,
        endpoint_id: &str,
        user_id: &str,
    ) -> Result<()> {
        sqlx::query("DELETE FROM endpoint_permissions WHERE endpoint_id = ?1 AND user_id = ?2")
            .bind(endpoint_id)
            .bind(user_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn check_endpoint_permission(
        &self,
        endpoint_id: &str,
        user_id: &str,
    ) -> Result<bool> {
        let row: Option<(i64,)> = sqlx::query_as(
            "SELECT 1 FROM endpoint_permissions WHERE endpoint_id = ?1 AND user_id = ?2",
        )
        .bind(endpoint_id)
        .bind(user_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.is_some())
    }

    /// Whether any grants exist for an endpoint. Endpoints with no grants are
    /// open to every user in the org.
    pub async fn endpoint_has_grants(&self, endpoint_id: &str) -> Result<bool> {
        let row: Option<(i64,)> =
            sqlx::query_as("SELECT 1 FROM endpoint_permissions WHERE endpoint_id = ?1 LIMIT 1")
                .bind(endpoint_id)
                .fetch_optional(&self.pool)
                .await?;
        Ok(row.is_some())
    }

    // -- Audit log ------------------------------------------------------------

    pub async fn append_audit(
        &self,
        event: &str,
        session_id: Option<&str>,
        runtime_id: Option<&str>,
        user_id: Option<&str>,
        detail: serde_json::Value,
    ) -> Result<()> {
        sqlx::query(
            "INSERT INTO audit_log (event, session_id, runtime_id, user_id, detail, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
        )
        .bind(event)
        .bind(session_id)
        .bind(runtime_id)
        .bind(user_id)
        .bind(detail.to_string())
        .bind(now_rfc3339())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn list_audit(
        &self,
        session_id: Option<&str>,
        event: Option<&str>,
        limit: i64,
    ) -> Result<Vec<AuditRow>> {
        let rows = sqlx::query_as::<_, AuditRow>(
            "SELECT * FROM audit_log
             WHERE (?1 IS NULL OR session_id = ?1)
               AND (?2 IS NULL OR event = ?2)
             ORDER BY id DESC LIMIT ?3",
        )
        .bind(session_id)
        .bind(event)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }

    // -- Endpoint config overrides --------------------------------------------

    pub async fn upsert_config_override(
        &self,
        endpoint_id: &str,
        security: Option<&serde_json::Value>,
        limits: Option<&serde_json::Value>,
    ) -> Result<()> {
        sqlx::query(
            "INSERT INTO endpoint_config_overrides (endpoint_id, security, limits, updated_at)
             VALUES (?1, ?2, ?3, ?4)
             ON CONFLICT(endpoint_id) DO UPDATE SET
                 security = excluded.security,
                 limits = excluded.limits,
                 updated_at = excluded.updated_at",
        )
        .bind(endpoint_id)
        .bind(security.map(|v| v.to_string()))
        .bind(limits.map(|v| v.to_string()))
        .bind(now_rfc3339())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn config_override(&self, endpoint_id: &str) -> Result<Option<ConfigOverrideRow>> {
        let row = sqlx::query_as::<_, ConfigOverrideRow>(
            "SELECT * FROM endpoint_config_overrides WHERE endpoint_id = ?1",
        )
        .bind(endpoint_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row)
    }

    pub async fn list_config_overrides(&self) -> Result<Vec<ConfigOverrideRow>> {
        let rows = sqlx::query_as::<_, ConfigOverrideRow>(
            "SELECT * FROM endpoint_config_overrides ORDER BY endpoint_id",
        )
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }

    // -- Retention ------------------------------------------------------------

    /// Delete transcript and audit rows created before `cutoff`. Returns
    /// (messages, audit rows) removed.
    pub async fn purge_before(&self, cutoff: DateTime<Utc>) -> Result<(u64, u64)> {
        let cutoff = cutoff.to_rfc3339();
        let messages = sqlx::query("DELETE FROM messages WHERE created_at < ?1")
            .bind(&cutoff)
            .execute(&self.pool)
            .await?
            .rows_affected();
        let audit = sqlx::query("DELETE FROM audit_log WHERE created_at < ?1")
            .bind(&cutoff)
            .execute(&self.pool)
            .await?
            .rows_affected();
        Ok((messages, audit))
    }
}

pub fn now_rfc3339() -> String {
    Utc::now().to_rfc3339()
}

#[cfg(test)]
#[path = "store_tests.rs"]
mod tests;
