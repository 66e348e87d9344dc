//! Agent data model shared by the loop controller, the session directory and
//! the backend service.

pub mod auto_approve;
pub mod controller;
pub mod prompt;
pub mod state;
pub mod subgoals;

use chrono::Utc;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Deserializer, Serialize};
use uuid::Uuid;

use crate::models::ChatMessage;

/// Command value of an agent that has not made its first step.
pub const START_COMMAND: &str = "###start###";
pub const HUMAN_FEEDBACK_COMMAND: &str = "human_feedback";
pub const MAX_GOALS: usize = 5;
pub const DEFAULT_AGENT_NAME: &str = "GodmodeGPT";

/// Label shown for a command.
pub fn display_command(command: &str) -> &str {
    match command {
        START_COMMAND => "Start",
        "do_nothing" => "Proceed to the next step",
        other => other,
    }
}

/// True when the command carries the `error:` failure signal.
pub fn is_error_signal(command: &str) -> bool {
    command
        .get(..6)
        .is_some_and(|prefix| prefix.eq_ignore_ascii_case("error:"))
}

/// `agent_<unix millis>_<9 base36 chars>`.
pub fn generate_agent_id() -> String {
    const ALPHABET: &[u8] = b"0123456789abcdefghijklmnopqrstuvwxyz";
    let suffix: String = Uuid::new_v4()
        .as_bytes()
        .iter()
        .take(9)
        .map(|b| ALPHABET[(*b as usize) % ALPHABET.len()] as char)
        .collect();
    format!("agent_{}_{}", Utc::now().timestamp_millis(), suffix)
}

/// Best-effort JSON: either the decoded value or the original text.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum JsonOrRaw<T = serde_json::Value> {
    Parsed(T),
    Raw(String),
}

impl<T: DeserializeOwned> JsonOrRaw<T> {
    pub fn parse(text: &str) -> Self {
        match serde_json::from_str(text) {
            Ok(v) => JsonOrRaw::Parsed(v),
            Err(_) => JsonOrRaw::Raw(text.to_string()),
        }
    }

    /// Accepts a value that is either already structured or a JSON-encoded
    /// string, as stored sessions may hold either.
    pub fn from_value(value: serde_json::Value) -> Self {
        match value {
            serde_json::Value::String(s) => Self::parse(&s),
            other => match serde_json::from_value(other.clone()) {
                Ok(v) => JsonOrRaw::Parsed(v),
                Err(_) => JsonOrRaw::Raw(other.to_string()),
            },
        }
    }

    pub fn parsed(self) -> Option<T> {
        match self {
            JsonOrRaw::Parsed(v) => Some(v),
            JsonOrRaw::Raw(_) => None,
        }
    }
}

pub type Arguments = JsonOrRaw<serde_json::Value>;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct Thoughts {
    #[serde(default, alias = "text")]
    pub thoughts: String,
    #[serde(default)]
    pub reasoning: String,
    #[serde(default)]
    pub plan: String,
    #[serde(default)]
    pub criticism: String,
    #[serde(default)]
    pub speak: String,
    #[serde(default, deserialize_with = "string_or_number")]
    pub relevant_goal: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct Task {
    #[serde(default)]
    pub task_name: String,
    #[serde(default)]
    pub command_name: String,
    #[serde(default)]
    pub arguments: String,
    #[serde(default)]
    pub result: String,
    #[serde(default, deserialize_with = "string_or_number")]
    pub relevant_goal: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Agent {
    pub id: String,
    pub name: String,
    pub description: String,
    pub goals: Vec<String>,
    pub command: String,
    #[serde(default)]
    pub args: String,
    #[serde(default)]
    pub assistant_reply: String,
    #[serde(default)]
    pub thoughts: Option<Thoughts>,
    #[serde(default)]
    pub result: Option<String>,
    #[serde(default)]
    pub output: Vec<ChatMessage>,
    #[serde(default)]
    pub tasks: Vec<Task>,
}

impl Agent {
    /// A fresh agent in the not-started state.
    pub fn new(
        name: impl Into<String>,
        description: impl Into<String>,
        goals: Vec<String>,
    ) -> Self {
        Self {
            id: generate_agent_id(),
            name: name.into(),
            description: description.into(),
            goals,
            command: START_COMMAND.to_string(),
            args: String::new(),
            assistant_reply: String::new(),
            thoughts: None,
            result: None,
            output: Vec::new(),
            tasks: Vec::new(),
        }
    }

    pub fn arguments(&self) -> Arguments {
        Arguments::parse(&self.args)
    }
}

/// Parses a 1-based goal reference the way a lenient integer parse would
/// ("2", " 3 ", "2abc") and returns the 0-based index.
pub fn parse_goal_index(relevant_goal: &str) -> Option<usize> {
    let digits: String = relevant_goal
        .trim()
        .chars()
        .take_while(|c| c.is_ascii_digit())
        .collect();
    let n: usize = digits.parse().ok()?;
    n.checked_sub(1)
}

fn string_or_number<'de, D: Deserializer<'de>>(d: D) -> Result<String, D::Error> {
    let v = Option::<serde_json::Value>::deserialize(d)?;
    Ok(match v {
        None | Some(serde_json::Value::Null) => String::new(),
        Some(serde_json::Value::String(s)) => s,
        Some(other) => other.to_string(),
    })
}

/// Goal input slots: the non-empty goals followed by one blank slot, never
/// more than `MAX_GOALS` slots in total.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GoalEditor {
    slots: Vec<String>,
}

impl Default for GoalEditor {
    fn default() -> Self {
        Self { slots: vec![String::new()] }
    }
}

impl GoalEditor {
    pub fn from_goals<I, S>(goals: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut editor = Self::default();
        editor.set(goals.into_iter().map(Into::into).collect());
        editor
    }

    pub fn set(&mut self, goals: Vec<String>) {
        let mut slots: Vec<String> = goals.into_iter().filter(|g| !g.trim().is_empty()).collect();
        slots.push(String::new());
        slots.truncate(MAX_GOALS);
        self.slots = slots;
    }

    pub fn add(&mut self, goal: impl Into<String>) {
        let mut goals = self.goals();
        goals.push(goal.into());
        self.set(goals);
    }

    pub fn edit(&mut self, index: usize, goal: impl Into<String>) {
        let mut slots = self.slots.clone();
        if let Some(slot) = slots.get_mut(index) {
            *slot = goal.into();
        }
        self.set(slots);
    }

    pub fn remove(&mut self, index: usize) {
        let mut slots = self.slots.clone();
        if index < slots.len() {
            slots.remove(index);
        }
        self.set(slots);
    }

    pub fn slots(&self) -> &[String] {
        &self.slots
    }

    pub fn goals(&self) -> Vec<String> {
        self.slots.iter().filter(|g| !g.trim().is_empty()).cloned().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn agent_ids_are_unique_and_prefixed() {
        let a = generate_agent_id();
        let b = generate_agent_id();
        assert!(a.starts_with("agent_"));
        assert_ne!(a, b);
        let suffix = a.rsplit('_').next().unwrap();
        assert_eq!(suffix.len(), 9);
        assert!(suffix.chars().all(|c| c.is_ascii_alphanumeric()));
    }

    #[test]
    fn error_signal_is_case_insensitive_prefix() {
        assert!(is_error_signal("Error: could not parse"));
        assert!(is_error_signal("ERROR:x"));
        assert!(is_error_signal("error:"));
        assert!(!is_error_signal("errors happen"));
        assert!(!is_error_signal("web_search"));
        assert!(!is_error_signal("érror:"));
    }

    #[test]
    fn json_or_raw_keeps_text_when_not_json() {
        let parsed: Arguments = JsonOrRaw::parse("{\"query\": \"rust\"}");
        assert_eq!(parsed, JsonOrRaw::Parsed(serde_json::json!({"query": "rust"})));
        let raw: Arguments = JsonOrRaw::parse("just text");
        assert_eq!(raw, JsonOrRaw::Raw("just text".into()));
        assert_eq!(serde_json::to_value(&raw).unwrap(), serde_json::json!("just text"));
    }

    #[test]
    fn json_or_raw_from_encoded_string_value() {
        let v = serde_json::json!("[{\"role\":\"user\",\"content\":\"hi\"}]");
        let msgs: JsonOrRaw<Vec<ChatMessage>> = JsonOrRaw::from_value(v);
        assert_eq!(msgs.parsed().unwrap()[0].content, "hi");
        let direct: JsonOrRaw<Vec<ChatMessage>> =
            JsonOrRaw::from_value(serde_json::json!([{"role": "assistant", "content": "yo"}]));
        assert_eq!(direct.parsed().unwrap()[0].role, "assistant");
    }

    #[test]
    fn goal_index_parsing() {
        assert_eq!(parse_goal_index("2"), Some(1));
        assert_eq!(parse_goal_index(" 1 "), Some(0));
        assert_eq!(parse_goal_index("3abc"), Some(2));
        assert_eq!(parse_goal_index("abc"), None);
        assert_eq!(parse_goal_index("0"), None);
        assert_eq!(parse_goal_index(""), None);
    }

    #[test]
    fn thoughts_accept_numeric_relevant_goal() {
        let value = serde_json::json!({"text": "hmm", "relevant_goal": 2});
        let t: Thoughts = serde_json::from_value(value).unwrap();
        assert_eq!(t.relevant_goal, "2");
        assert_eq!(t.thoughts, "hmm");
    }

    #[test]
    fn goal_editor_stays_within_bounds() {
        let mut editor = GoalEditor::default();
        assert_eq!(editor.slots().len(), 1);
        for i in 0..10 {
            editor.add(format!("goal {i}"));
            assert!((1..=MAX_GOALS).contains(&editor.slots().len()));
        }
        assert_eq!(editor.goals().len(), MAX_GOALS);
        editor.edit(0, "   ");
        assert_eq!(editor.goals().len(), MAX_GOALS - 1);
        assert_eq!(editor.slots().last().map(String::as_str), Some(""));
        for _ in 0..10 {
            editor.remove(0);
            assert!((1..=MAX_GOALS).contains(&editor.slots().len()));
        }
        assert!(editor.goals().is_empty());
    }

    #[test]
    fn new_agent_is_not_started() {
        let a = Agent::new("GodmodeGPT", "Plan a launch", vec!["Research".into()]);
        assert_eq!(a.command, START_COMMAND);
        assert_eq!(display_command(&a.command), "Start");
    }
}
