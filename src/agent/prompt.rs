//! Prompts sent to the completion provider by the backend service, and the
//! lenient parsing of what comes back.

use serde_json::Value;

use super::{Thoughts, HUMAN_FEEDBACK_COMMAND, START_COMMAND};
use crate::models::ChatMessage;
use crate::protocol::StepRequest;
use crate::settings::ModelParams;

pub const AVAILABLE_COMMANDS: &[&str] = &[
    "web_search",
    "write_file",
    "read_file",
    "execute_code",
    "analyze_data",
    "research_topic",
    "do_nothing",
];

/// Command reported when the model's reply could not be understood. The
/// client treats the `Error:` prefix as a retry signal.
pub const UNPARSABLE_REPLY: &str = "Error: could not parse model reply";

/// Earlier messages kept in the prompt, oldest dropped first.
const HISTORY_WINDOW: usize = 20;

pub const SUBGOAL_SYSTEM_PROMPT: &str = "You are an AI assistant that breaks down complex goals into specific, actionable subgoals.

Given a main goal, provide 3-5 specific subgoals that would help accomplish it. Each subgoal should be:
- Specific and actionable
- Measurable
- Achievable
- Relevant to the main goal

Respond with a simple numbered list, one subgoal per line. Do not include any other text or formatting.

Example:
1. Research target market and competitors
2. Create detailed business plan with financial projections
3. Secure initial funding or investment
4. Develop minimum viable product
5. Launch marketing campaign";

pub fn step_params() -> ModelParams {
    ModelParams::new(0.7, 1000)
}

pub fn subgoal_params() -> ModelParams {
    ModelParams::new(0.5, 500)
}

pub fn system_prompt(name: &str, description: &str, goals: &[String]) -> String {
    let goals = goals
        .iter()
        .enumerate()
        .map(|(i, g)| format!("{}. {}", i + 1, g))
        .collect::<Vec<_>>()
        .join("\n");
    format!(
        r#"You are an AI agent named "{name}". Your task is to help accomplish the following goal: {description}

GOALS:
{goals}

Available commands: {commands}

Work on one goal at a time and propose exactly one command per reply.
Respond only with a JSON object in this format:
{{
  "thoughts": {{
    "text": "your thoughts",
    "reasoning": "why this is the right next step",
    "plan": "short bulleted plan",
    "criticism": "constructive self-criticism",
    "speak": "a brief summary for the user",
    "relevant_goal": "number of the goal this step serves"
  }},
  "task": "short name of the current task",
  "command": {{ "name": "command name", "args": {{ "arg name": "value" }} }}
}}"#,
        commands = AVAILABLE_COMMANDS.join(", "),
    )
}

/// What happened since the previous reply, as reported back to the client.
pub fn step_result(req: &StepRequest) -> Option<String> {
    match req.command.as_str() {
        START_COMMAND => None,
        HUMAN_FEEDBACK_COMMAND => Some(format!("Human feedback: {}", value_text(&req.arguments))),
        command => Some(format!(
            "Command {command} approved with arguments {}",
            value_text(&req.arguments)
        )),
    }
}

fn value_text(v: &Value) -> String {
    match v {
        Value::String(s) => s.clone(),
        Value::Null => String::new(),
        other => other.to_string(),
    }
}

pub fn build_step_messages(req: &StepRequest) -> Vec<ChatMessage> {
    let system = system_prompt(&req.ai_name, &req.ai_description, &req.ai_goals);
    let mut messages = vec![ChatMessage::system(system)];
    let history: Vec<&ChatMessage> =
        req.message_history.iter().filter(|m| m.role != "system").collect();
    let skip = history.len().saturating_sub(HISTORY_WINDOW);
    messages.extend(history.into_iter().skip(skip).cloned());
    let user = match step_result(req) {
        None => format!("Please help me with: {}", req.ai_description),
        Some(result) => format!(
            "{result}\nDetermine the next command to use, \
             and respond using the format specified above."
        ),
    };
    messages.push(ChatMessage::user(user));
    messages
}

pub fn build_subgoal_messages(description: &str) -> Vec<ChatMessage> {
    vec![
        ChatMessage::system(SUBGOAL_SYSTEM_PROMPT),
        ChatMessage::user(format!("Break down this goal into specific subgoals: {description}")),
    ]
}

#[derive(Debug, Clone, PartialEq)]
pub struct ModelReply {
    pub thoughts: Thoughts,
    pub command: String,
    pub arguments: Value,
    pub task: Option<String>,
}

impl ModelReply {
    fn unparsable(raw: &str) -> Self {
        Self {
            thoughts: Thoughts { thoughts: raw.trim().to_string(), ..Default::default() },
            command: UNPARSABLE_REPLY.to_string(),
            arguments: Value::Null,
            task: None,
        }
    }
}

/// Extracts the outermost JSON object, tolerating code fences and chatter
/// around it. `command` may be `{name, args}` or a bare name with top-level
/// `args`.
pub fn parse_model_reply(content: &str) -> ModelReply {
    let Some(obj) = extract_object(content) else {
        return ModelReply::unparsable(content);
    };
    let mut thoughts = match obj.get("thoughts") {
        Some(Value::String(s)) => Thoughts { thoughts: s.clone(), ..Default::default() },
        Some(v @ Value::Object(_)) => serde_json::from_value(v.clone()).unwrap_or_default(),
        _ => Thoughts::default(),
    };
    if thoughts.relevant_goal.is_empty() {
        thoughts.relevant_goal = obj.get("relevant_goal").map(value_text).unwrap_or_default();
    }
    let top_level_args = || {
        obj.get("args")
            .or_else(|| obj.get("arguments"))
            .cloned()
            .unwrap_or(Value::Null)
    };
    let (command, arguments) = match obj.get("command") {
        Some(Value::Object(c)) => (
            c.get("name").map(value_text).unwrap_or_default(),
            c.get("args").or_else(|| c.get("arguments")).cloned().unwrap_or_else(top_level_args),
        ),
        Some(Value::String(name)) => (name.clone(), top_level_args()),
        _ => (String::new(), Value::Null),
    };
    if command.trim().is_empty() {
        return ModelReply::unparsable(content);
    }
    ModelReply {
        thoughts,
        command: command.trim().to_string(),
        arguments,
        task: obj.get("task").map(value_text).filter(|t| !t.is_empty()),
    }
}

fn extract_object(content: &str) -> Option<serde_json::Map<String, Value>> {
    let start = content.find('{')?;
    let end = content.rfind('}')?;
    if end <= start {
        return None;
    }
    match serde_json::from_str(&content[start..=end]) {
        Ok(Value::Object(map)) => Some(map),
        _ => None,
    }
}
