use async_trait::async_trait;
use chrono::{DateTime, Duration, NaiveDate, TimeZone, Utc};
use serde::{Deserialize, Serialize};

use crate::agent::Agent;
use crate::error::Result;

/// Lightweight listing entry for a stored session.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SessionSummary {
    pub agent_id: String,
    #[serde(default)]
    pub ai_name: String,
    #[serde(default)]
    pub ai_role: String,
    pub created: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct SessionList {
    #[serde(default)]
    pub sessions: Vec<SessionSummary>,
}

pub fn sort_newest_first(sessions: &mut [SessionSummary]) {
    sessions.sort_by(|a, b| b.created.cmp(&a.created));
}

/// Sessions older than `max_age`, or created before `cutoff`, are read-only.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ArchivePolicy {
    pub max_age: Duration,
    pub cutoff: DateTime<Utc>,
}

impl Default for ArchivePolicy {
    fn default() -> Self {
        let cutoff = NaiveDate::from_ymd_opt(2024, 1, 29)
            .and_then(|d| d.and_hms_opt(0, 0, 0))
            .map(|dt| Utc.from_utc_datetime(&dt))
            .unwrap_or(DateTime::<Utc>::MIN_UTC);
        Self { max_age: Duration::days(7), cutoff }
    }
}

impl ArchivePolicy {
    pub fn is_archived(&self, created: DateTime<Utc>, now: DateTime<Utc>) -> bool {
        created < now - self.max_age || created < self.cutoff
    }
}

/// Remote store of agent sessions.
#[async_trait]
pub trait SessionDirectory: Send + Sync {
    /// Newest first.
    async fn list(&self) -> Result<Vec<SessionSummary>>;
    async fn get(&self, id: &str) -> Result<Agent>;
    async fn create(&self, agent: &Agent) -> Result<()>;
    async fn update(&self, id: &str, agent: &Agent) -> Result<()>;
    async fn delete(&self, id: &str) -> Result<()>;
}
