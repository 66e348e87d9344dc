//! Request and response bodies of the backend HTTP surface.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::agent::{Agent, Arguments, JsonOrRaw, Task, Thoughts};
use crate::models::ChatMessage;
use crate::settings::Provider;

/// `POST /`
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct StepRequest {
    pub command: String,
    pub arguments: serde_json::Value,
    #[serde(default)]
    pub assistant_reply: String,
    #[serde(default)]
    pub message_history: Vec<ChatMessage>,
    #[serde(default)]
    pub ai_name: String,
    #[serde(default)]
    pub ai_description: String,
    #[serde(default)]
    pub ai_goals: Vec<String>,
    #[serde(default)]
    pub agent_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub openai_key: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub openrouter_key: Option<String>,
    #[serde(default)]
    pub use_openrouter: bool,
    #[serde(default)]
    pub selected_provider: Provider,
    #[serde(default)]
    pub gpt_model: String,
}

impl StepRequest {
    pub fn arguments_from(args: Arguments) -> serde_json::Value {
        match args {
            JsonOrRaw::Parsed(v) => v,
            JsonOrRaw::Raw(s) => serde_json::Value::String(s),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct StepResponse {
    #[serde(default)]
    pub command: String,
    #[serde(default)]
    pub arguments: serde_json::Value,
    #[serde(default)]
    pub thoughts: Option<Thoughts>,
    #[serde(default)]
    pub assistant_reply: String,
    #[serde(default)]
    pub message_history: Vec<ChatMessage>,
    #[serde(default)]
    pub result: Option<String>,
    #[serde(default)]
    pub task: Option<String>,
}

/// `POST /goal-subgoals`
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SubgoalsRequest {
    pub description: String,
    #[serde(rename = "openRouterKey", default, skip_serializing_if = "Option::is_none")]
    pub open_router_key: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct SubgoalsResponse {
    #[serde(default)]
    pub subgoals: Vec<String>,
}

/// `POST /files`
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct FilesRequest {
    pub agent_id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct SessionBody {
    #[serde(default)]
    pub agent: Option<Agent>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CreatedResponse {
    pub success: bool,
    pub id: String,
}

/// Stored session as returned by `GET /sessions/{id}`. Structured fields may
/// arrive JSON-encoded as strings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SessionRecord {
    pub agent_id: String,
    #[serde(default)]
    pub ai_name: String,
    #[serde(default)]
    pub ai_role: String,
    #[serde(default)]
    pub ai_goals: Vec<String>,
    #[serde(default)]
    pub command_name: String,
    #[serde(default)]
    pub arguments: serde_json::Value,
    #[serde(default)]
    pub assistant_reply: String,
    #[serde(default)]
    pub thoughts: serde_json::Value,
    #[serde(default)]
    pub full_message_history: serde_json::Value,
    #[serde(default)]
    pub tasks: serde_json::Value,
    #[serde(default)]
    pub result: Option<String>,
    pub created: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionEnvelope {
    pub session: SessionRecord,
}

impl SessionRecord {
    pub fn from_agent(agent: &Agent, created: DateTime<Utc>) -> Self {
        Self {
            agent_id: agent.id.clone(),
            ai_name: agent.name.clone(),
            ai_role: agent.description.clone(),
            ai_goals: agent.goals.clone(),
            command_name: agent.command.clone(),
            arguments: StepRequest::arguments_from(agent.arguments()),
            assistant_reply: agent.assistant_reply.clone(),
            thoughts: serde_json::to_value(&agent.thoughts).unwrap_or_default(),
            full_message_history: serde_json::to_value(&agent.output).unwrap_or_default(),
            tasks: serde_json::to_value(&agent.tasks).unwrap_or_default(),
            result: agent.result.clone(),
            created,
        }
    }

    pub fn into_agent(self) -> Agent {
        let output: JsonOrRaw<Vec<ChatMessage>> = JsonOrRaw::from_value(self.full_message_history);
        let tasks: JsonOrRaw<Vec<Task>> = JsonOrRaw::from_value(self.tasks);
        let thoughts: JsonOrRaw<Option<Thoughts>> = JsonOrRaw::from_value(self.thoughts);
        Agent {
            id: self.agent_id,
            name: self.ai_name,
            description: self.ai_role,
            goals: self.ai_goals,
            command: self.command_name,
            args: pretty_arguments(&self.arguments),
            assistant_reply: self.assistant_reply,
            thoughts: thoughts.parsed().flatten(),
            result: self.result,
            output: output.parsed().unwrap_or_default(),
            tasks: tasks.parsed().unwrap_or_default(),
        }
    }
}

/// Arguments as shown to the user: pretty JSON, or the bare string.
pub fn pretty_arguments(value: &serde_json::Value) -> String {
    match value {
        serde_json::Value::Null => String::new(),
        serde_json::Value::String(s) => s.clone(),
        other => serde_json::to_string_pretty(other).unwrap_or_else(|_| other.to_string()),
    }
}
