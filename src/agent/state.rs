use serde::Serialize;
use tracing::debug;

use super::{parse_goal_index, Agent, Task, START_COMMAND};
use crate::protocol::{pretty_arguments, StepResponse};

/// Where the loop stands for the active agent.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "state", content = "detail", rename_all = "snake_case")]
pub enum LoopState {
    /// No agent loaded.
    Idle,
    NotStarted,
    AwaitingApproval { command: String },
    Running,
    /// Bound session is past the archival threshold.
    Archived,
    Failed { message: String },
}

impl LoopState {
    pub fn accepts_input(&self) -> bool {
        matches!(
            self,
            LoopState::NotStarted | LoopState::AwaitingApproval { .. } | LoopState::Failed { .. }
        )
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct GoalWithTasks {
    pub goal: String,
    pub tasks: Vec<Task>,
}

/// Tasks grouped under the goal their `relevant_goal` points at.
pub fn goal_projection(agent: &Agent) -> Vec<GoalWithTasks> {
    agent
        .goals
        .iter()
        .enumerate()
        .map(|(gi, goal)| GoalWithTasks {
            goal: goal.clone(),
            tasks: agent
                .tasks
                .iter()
                .filter(|t| parse_goal_index(&t.relevant_goal) == Some(gi))
                .cloned()
                .collect(),
        })
        .collect()
}

/// Mutable view of the active agent plus the flags the UI renders.
#[derive(Debug, Default)]
pub struct AgentStore {
    agent: Option<Agent>,
    generation: u64,
    current_goal: Option<usize>,
    last_result: Option<String>,
    loading: bool,
    error: Option<String>,
    archived: bool,
}

impl AgentStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn agent(&self) -> Option<&Agent> {
        self.agent.as_ref()
    }

    pub fn active_id(&self) -> Option<&str> {
        self.agent.as_ref().map(|a| a.id.as_str())
    }

    /// Bumped whenever the active agent is replaced or cleared.
    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn current_goal(&self) -> Option<usize> {
        self.current_goal
    }

    pub fn last_result(&self) -> Option<&str> {
        self.last_result.as_deref()
    }

    /// Replaces the active agent wholesale.
    pub fn load(&mut self, agent: Agent) {
        let len = agent.tasks.len();
        self.last_result = agent
            .tasks
            .last()
            .map(|t| t.result.clone())
            .filter(|r| !r.is_empty())
            .or_else(|| {
                len.checked_sub(2)
                    .and_then(|i| agent.tasks.get(i))
                    .map(|t| t.result.clone())
                    .filter(|r| !r.is_empty())
            });
        self.agent = Some(agent);
        self.generation += 1;
        self.current_goal = None;
        self.loading = false;
        self.error = None;
        self.archived = false;
    }

    pub fn clear(&mut self) {
        self.agent = None;
        self.generation += 1;
        self.current_goal = None;
        self.last_result = None;
        self.loading = false;
        self.error = None;
        self.archived = false;
    }

    pub fn set_archived(&mut self, archived: bool) {
        self.archived = archived;
    }

    pub fn set_loading(&mut self, loading: bool) {
        self.loading = loading;
    }

    pub fn set_error(&mut self, message: Option<String>) {
        self.error = message;
    }

    pub fn state(&self) -> LoopState {
        let Some(agent) = &self.agent else { return LoopState::Idle };
        if self.archived {
            return LoopState::Archived;
        }
        if self.loading {
            return LoopState::Running;
        }
        if let Some(message) = &self.error {
            return LoopState::Failed { message: message.clone() };
        }
        if agent.command == START_COMMAND {
            LoopState::NotStarted
        } else {
            LoopState::AwaitingApproval { command: agent.command.clone() }
        }
    }

    pub fn goals_with_tasks(&self) -> Vec<GoalWithTasks> {
        self.agent.as_ref().map(goal_projection).unwrap_or_default()
    }

    /// Folds a successful step into the active agent. Returns the index of the
    /// goal a task was appended under, if any.
    pub fn apply_step(&mut self, resp: &StepResponse) -> Option<usize> {
        let agent = self.agent.as_mut()?;

        agent.command = resp.command.clone();
        agent.args = pretty_arguments(&resp.arguments);
        agent.thoughts = resp.thoughts.clone();
        agent.assistant_reply = resp.assistant_reply.clone();
        agent.output = resp.message_history.clone();
        agent.result = resp.result.clone();
        self.last_result = resp.result.clone();

        let result = resp.result.as_deref().filter(|r| !r.is_empty());
        if let (Some(goal), Some(result)) = (self.current_goal, result) {
            if let Some(task) = agent
                .tasks
                .iter_mut()
                .rev()
                .find(|t| parse_goal_index(&t.relevant_goal) == Some(goal))
            {
                if task.result.is_empty() {
                    task.result = result.to_string();
                }
            }
        }

        let relevant_goal = resp
            .thoughts
            .as_ref()
            .map(|t| t.relevant_goal.as_str())
            .unwrap_or("");
        let goal_index = parse_goal_index(relevant_goal).filter(|gi| *gi < agent.goals.len());
        if goal_index.is_some() {
            agent.tasks.push(Task {
                task_name: resp.task.clone().unwrap_or_default(),
                command_name: resp.command.clone(),
                arguments: agent.args.clone(),
                result: String::new(),
                relevant_goal: relevant_goal.trim().to_string(),
            });
        } else {
            debug!(relevant_goal, "step has no usable goal reference");
        }
        self.current_goal = goal_index;
        goal_index
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent::Thoughts;
    use crate::models::ChatMessage;

    fn agent_with_goals(n: usize) -> Agent {
        Agent::new("GodmodeGPT", "Plan a launch", (1..=n).map(|i| format!("goal {i}")).collect())
    }

    fn step(command: &str, relevant_goal: &str, result: Option<&str>) -> StepResponse {
        StepResponse {
            command: command.into(),
            arguments: serde_json::json!({"query": "q"}),
            thoughts: Some(Thoughts {
                thoughts: "thinking".into(),
                relevant_goal: relevant_goal.into(),
                ..Default::default()
            }),
            assistant_reply: "reply".into(),
            message_history: vec![ChatMessage::user("hi")],
            result: result.map(str::to_string),
            task: Some("Search the web".into()),
        }
    }

    #[test]
    fn relevant_goal_two_lands_under_index_one_only() {
        let mut store = AgentStore::new();
        store.load(agent_with_goals(3));
        let gi = store.apply_step(&step("web_search", "2", None));
        assert_eq!(gi, Some(1));
        let proj = store.goals_with_tasks();
        assert_eq!(proj[0].tasks.len(), 0);
        assert_eq!(proj[1].tasks.len(), 1);
        assert_eq!(proj[2].tasks.len(), 0);
        assert_eq!(proj[1].tasks[0].task_name, "Search the web");
    }

    #[test]
    fn unparsable_relevant_goal_updates_fields_without_task() {
        let mut store = AgentStore::new();
        store.load(agent_with_goals(2));
        assert_eq!(store.apply_step(&step("web_search", "abc", None)), None);
        let agent = store.agent().unwrap();
        assert!(agent.tasks.is_empty());
        assert_eq!(agent.command, "web_search");
        assert!(agent.args.contains("\"query\""));
        assert_eq!(agent.thoughts.as_ref().unwrap().thoughts, "thinking");
        assert_eq!(store.current_goal(), None);
    }

    #[test]
    fn out_of_range_goal_adds_nothing() {
        let mut store = AgentStore::new();
        store.load(agent_with_goals(1));
        assert_eq!(store.apply_step(&step("x", "4", None)), None);
        assert!(store.agent().unwrap().tasks.is_empty());
    }

    #[test]
    fn result_backfills_last_task_of_tracked_goal() {
        let mut store = AgentStore::new();
        store.load(agent_with_goals(2));
        store.apply_step(&step("web_search", "1", None));
        store.apply_step(&step("write_file", "2", Some("found 3 competitors")));
        let proj = store.goals_with_tasks();
        assert_eq!(proj[0].tasks[0].result, "found 3 competitors");
        assert_eq!(proj[1].tasks[0].result, "");
        assert_eq!(store.last_result(), Some("found 3 competitors"));
    }

    #[test]
    fn tasks_only_grow() {
        let mut store = AgentStore::new();
        store.load(agent_with_goals(2));
        let mut last = 0;
        for rg in ["1", "x", "2", "", "1"] {
            store.apply_step(&step("c", rg, Some("r")));
            let n = store.agent().unwrap().tasks.len();
            assert!(n >= last);
            last = n;
        }
        assert_eq!(last, 3);
    }

    #[test]
    fn state_is_derived_explicitly() {
        let mut store = AgentStore::new();
        assert_eq!(store.state(), LoopState::Idle);
        store.load(agent_with_goals(1));
        assert_eq!(store.state(), LoopState::NotStarted);
        store.set_loading(true);
        assert_eq!(store.state(), LoopState::Running);
        store.set_loading(false);
        store.apply_step(&step("web_search", "1", None));
        assert_eq!(store.state(), LoopState::AwaitingApproval { command: "web_search".into() });
        store.set_error(Some("boom".into()));
        assert_eq!(store.state(), LoopState::Failed { message: "boom".into() });
        store.set_archived(true);
        assert_eq!(store.state(), LoopState::Archived);
        assert!(!store.state().accepts_input());
    }

    #[test]
    fn load_and_clear_bump_generation() {
        let mut store = AgentStore::new();
        let g0 = store.generation();
        store.load(agent_with_goals(1));
        assert!(store.generation() > g0);
        let g1 = store.generation();
        store.clear();
        assert!(store.generation() > g1);
        assert!(store.agent().is_none());
    }
}
