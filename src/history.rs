//! Local cache of recent conversations, newest first.

use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::agent::{Agent, Task};
use crate::local_store::{LocalStore, KEY_CONVERSATIONS};
use crate::models::ChatMessage;

pub const MAX_CONVERSATIONS: usize = 50;
const SUMMARY_CHARS: usize = 100;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ConversationEntry {
    pub id: String,
    /// Unix millis.
    pub timestamp: i64,
    pub agent: Agent,
    pub summary: String,
}

impl ConversationEntry {
    pub fn saved_at(&self) -> DateTime<Utc> {
        Utc.timestamp_millis_opt(self.timestamp).single().unwrap_or_default()
    }
}

/// Shape written by `export`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ExportedConversation {
    pub agent: String,
    pub description: String,
    pub goals: Vec<String>,
    pub timestamp: DateTime<Utc>,
    pub conversation: Vec<ChatMessage>,
    pub tasks: Vec<Task>,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct ConversationHistory {
    entries: Vec<ConversationEntry>,
}

/// Preview of the last message: its first 100 characters, with `...` when cut.
pub fn summary(agent: &Agent) -> String {
    let Some(last) = agent.output.last() else {
        return "No conversation yet".to_string();
    };
    let mut preview: String = last.content.chars().take(SUMMARY_CHARS).collect();
    if last.content.chars().count() > SUMMARY_CHARS {
        preview.push_str("...");
    }
    preview
}

impl ConversationHistory {
    pub fn load(store: &LocalStore) -> Self {
        let entries = match store.get(KEY_CONVERSATIONS) {
            None => Vec::new(),
            Some(raw) => serde_json::from_str(raw).unwrap_or_else(|e| {
                warn!(error = %e, "conversation history is unreadable, starting over");
                Vec::new()
            }),
        };
        Self { entries }
    }

    pub fn save(&self, store: &mut LocalStore) -> anyhow::Result<()> {
        store.set(KEY_CONVERSATIONS, serde_json::to_string(&self.entries)?)
    }

    pub fn entries(&self) -> &[ConversationEntry] {
        &self.entries
    }

    pub fn get(&self, id: &str) -> Option<&ConversationEntry> {
        self.entries.iter().find(|e| e.id == id)
    }

    /// Upserts `agent` at the front. Agents without output are not recorded.
    pub fn record(&mut self, agent: &Agent, now: DateTime<Utc>) -> bool {
        if agent.output.is_empty() {
            return false;
        }
        self.entries.retain(|e| e.id != agent.id);
        self.entries.insert(
            0,
            ConversationEntry {
                id: agent.id.clone(),
                timestamp: now.timestamp_millis(),
                agent: agent.clone(),
                summary: summary(agent),
            },
        );
        self.entries.truncate(MAX_CONVERSATIONS);
        true
    }

    pub fn delete(&mut self, id: &str) -> bool {
        let before = self.entries.len();
        self.entries.retain(|e| e.id != id);
        self.entries.len() != before
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }
}

pub fn export(entry: &ConversationEntry) -> ExportedConversation {
    ExportedConversation {
        agent: entry.agent.name.clone(),
        description: entry.agent.description.clone(),
        goals: entry.agent.goals.clone(),
        timestamp: entry.saved_at(),
        conversation: entry.agent.output.clone(),
        tasks: entry.agent.tasks.clone(),
    }
}

/// `godmode-conversation-<name>-<YYYY-MM-DD>.json`, with every character of
/// the name outside `[A-Za-z0-9_-]` replaced by `_`.
pub fn export_file_name(entry: &ConversationEntry) -> String {
    let name: String = entry
        .agent
        .name
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '_' || c == '-' { c } else { '_' })
        .collect();
    format!("godmode-conversation-{}-{}.json", name, entry.saved_at().format("%Y-%m-%d"))
}

/// Plain-text transcript, one `ROLE: content` block per message.
pub fn transcript(entry: &ConversationEntry) -> String {
    entry
        .agent
        .output
        .iter()
        .map(|m| format!("{}: {}", m.role.to_uppercase(), m.content))
        .collect::<Vec<_>>()
        .join("\n\n")
}
