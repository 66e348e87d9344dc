use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{
    sqlite::{SqliteConnectOptions, SqliteJournalMode, SqliteRow, SqliteSynchronous},
    Pool, Row, Sqlite,
};
use tracing::debug;

use crate::agent::Agent;
use crate::error::{GodmodeError, Result};
use crate::local_store::data_dir;
use crate::protocol::SessionRecord;
use crate::session::SessionSummary;

/// Service-side session table. `owner` is the caller's bearer token, `None`
/// for anonymous callers; every query is scoped by it.
#[async_trait]
pub trait SessionRepository: Send + Sync {
    /// Inserts or replaces the agent snapshot, keeping the original
    /// `created`. Returns false when the id belongs to another owner.
    async fn upsert_session(&self, owner: Option<&str>, agent: &Agent) -> Result<bool>;
    async fn list_sessions(&self, owner: Option<&str>) -> Result<Vec<SessionSummary>>;
    async fn get_session(&self, owner: Option<&str>, id: &str) -> Result<Option<SessionRecord>>;
    async fn delete_session(&self, owner: Option<&str>, id: &str) -> Result<bool>;
}

#[derive(Clone)]
pub struct SqliteSessionRepository {
    pool: Pool<Sqlite>,
}

impl SqliteSessionRepository {
    pub async fn initialize(database_url: Option<String>) -> anyhow::Result<Self> {
        let url = match database_url {
            Some(u) => u,
            None => resolve_default_db_url()?,
        };
        let options = url
            .parse::<SqliteConnectOptions>()?
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .synchronous(SqliteSynchronous::Full)
            .busy_timeout(Duration::from_secs(5));
        let pool = Pool::<Sqlite>::connect_with(options).await?;
        sqlx::migrate!("./migrations").run(&pool).await?;
        debug!(%url, "session store ready");
        Ok(Self { pool })
    }

    #[cfg(test)]
    pub fn pool(&self) -> &Pool<Sqlite> {
        &self.pool
    }
}

fn resolve_default_db_url() -> anyhow::Result<String> {
    let path = data_dir()?.join("sessions.db");
    Ok(format!("sqlite://{}", path.to_string_lossy()))
}

fn parse_time(s: &str) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(s)
        .map(|d| d.with_timezone(&Utc))
        .unwrap_or_else(|_| Utc::now())
}

fn summary_from_row(r: &SqliteRow) -> SessionSummary {
    let created: String = r.get("created");
    SessionSummary {
        agent_id: r.get("agent_id"),
        ai_name: r.get("ai_name"),
        ai_role: r.get("ai_role"),
        created: parse_time(&created),
    }
}

#[async_trait]
impl SessionRepository for SqliteSessionRepository {
    async fn upsert_session(&self, owner: Option<&str>, agent: &Agent) -> Result<bool> {
        if agent.id.is_empty() {
            return Err(GodmodeError::BadRequest("Agent data is required".into()));
        }
        let now = Utc::now().to_rfc3339();
        let agent_json = serde_json::to_string(agent)?;
        let res = sqlx::query(
            "INSERT INTO sessions (agent_id, owner, ai_name, ai_role, agent_json, created, updated)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?6)
             ON CONFLICT(agent_id) DO UPDATE SET
                ai_name = excluded.ai_name,
                ai_role = excluded.ai_role,
                agent_json = excluded.agent_json,
                updated = excluded.updated
             WHERE sessions.owner IS excluded.owner",
        )
        .bind(&agent.id)
        .bind(owner)
        .bind(&agent.name)
        .bind(&agent.description)
        .bind(agent_json)
        .bind(now)
        .execute(&self.pool)
        .await?;
        Ok(res.rows_affected() > 0)
    }

    async fn list_sessions(&self, owner: Option<&str>) -> Result<Vec<SessionSummary>> {
        let rows = sqlx::query(
            "SELECT agent_id, ai_name, ai_role, created FROM sessions \
             WHERE owner IS ?1 ORDER BY created DESC",
        )
        .bind(owner)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.iter().map(summary_from_row).collect())
    }

    async fn get_session(&self, owner: Option<&str>, id: &str) -> Result<Option<SessionRecord>> {
        let row = sqlx::query(
            "SELECT agent_json, created FROM sessions WHERE agent_id = ?1 AND owner IS ?2",
        )
        .bind(id)
        .bind(owner)
        .fetch_optional(&self.pool)
        .await?;
        let Some(r) = row else { return Ok(None) };
        let agent_json: String = r.get("agent_json");
        let created: String = r.get("created");
        let agent: Agent = serde_json::from_str(&agent_json)?;
        Ok(Some(SessionRecord::from_agent(&agent, parse_time(&created))))
    }

    async fn delete_session(&self, owner: Option<&str>, id: &str) -> Result<bool> {
        let res = sqlx::query("DELETE FROM sessions WHERE agent_id = ?1 AND owner IS ?2")
            .bind(id)
            .bind(owner)
            .execute(&self.pool)
            .await?;
        Ok(res.rows_affected() > 0)
    }
}
