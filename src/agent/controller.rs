//! Agent loop controller: decides when to call the backend and folds the
//! answers into the [`AgentStore`].
//!
//! At most one step is in flight per controller. Retries triggered by an
//! `error:` command run inside that same single-flight section, so a timer
//! tick or a user click can never overlap them.

use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{debug, info, info_span, warn, Instrument};

use super::auto_approve::AutoApprove;
use super::state::{AgentStore, GoalWithTasks, LoopState};
use super::{is_error_signal, Agent, GoalEditor, DEFAULT_AGENT_NAME, HUMAN_FEEDBACK_COMMAND};
use crate::api_client::AgentBackend;
use crate::error::{GodmodeError, Result};
use crate::identity::Identity;
use crate::protocol::{StepRequest, StepResponse};
use crate::session::ArchivePolicy;
use crate::settings::SettingsHandle;

/// Consecutive `error:` replies retried automatically before giving up.
pub const MAX_ERROR_RETRIES: u32 = 3;
/// Completed steps allowed without a configured key.
pub const FREE_RUN_LIMIT: u32 = 3;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum AdvanceOutcome {
    Advanced { goal: Option<usize> },
    /// Another step is already in flight.
    Busy,
    NoAgent,
    Archived,
    /// The user must configure a key before continuing.
    NeedsCredentials,
    /// The backend rejected the identity; it has been signed out.
    SignedOut,
    Failed { message: String },
    RetriesExhausted { command: String },
    /// The active agent changed while the call was in flight.
    Stale,
}

/// Identifies the agent a dispatch was made for.
#[derive(Debug, Clone, PartialEq, Eq)]
struct DispatchTag {
    agent_id: String,
    generation: u64,
}

impl DispatchTag {
    fn matches(&self, store: &AgentStore) -> bool {
        store.generation() == self.generation && store.active_id() == Some(self.agent_id.as_str())
    }
}

enum StepDecision {
    Retry,
    Done(AdvanceOutcome),
}

/// Everything a renderer needs, taken in one lock.
#[derive(Debug, Clone, Serialize)]
pub struct LoopView {
    pub state: LoopState,
    pub agent: Option<Agent>,
    pub goals: Vec<GoalWithTasks>,
    pub current_goal: Option<usize>,
    pub last_result: Option<String>,
    pub auto_approve: bool,
    pub auto_approve_remaining: u32,
}

pub struct AgentLoop {
    backend: Arc<dyn AgentBackend>,
    settings: SettingsHandle,
    identity: Arc<dyn Identity>,
    archive: ArchivePolicy,
    store: Mutex<AgentStore>,
    auto_approve: Mutex<AutoApprove>,
    busy: AtomicBool,
    run_number: AtomicU32,
}

struct BusyGuard<'a>(&'a AtomicBool);

impl Drop for BusyGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

impl AgentLoop {
    pub fn new(
        backend: Arc<dyn AgentBackend>,
        settings: SettingsHandle,
        identity: Arc<dyn Identity>,
    ) -> Self {
        Self {
            backend,
            settings,
            identity,
            archive: ArchivePolicy::default(),
            store: Mutex::new(AgentStore::new()),
            auto_approve: Mutex::new(AutoApprove::default()),
            busy: AtomicBool::new(false),
            run_number: AtomicU32::new(0),
        }
    }

    fn store(&self) -> MutexGuard<'_, AgentStore> {
        match self.store.lock() {
            Ok(g) => g,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    fn auto(&self) -> MutexGuard<'_, AutoApprove> {
        match self.auto_approve.lock() {
            Ok(g) => g,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    /// Validates the start form and makes the new agent active.
    pub fn create(&self, name: &str, description: &str, goals: &GoalEditor) -> Result<Agent> {
        let description = description.trim();
        if description.is_empty() {
            return Err(GodmodeError::Validation("Description is required".into()));
        }
        let name = match name.trim() {
            "" => DEFAULT_AGENT_NAME,
            n => n,
        };
        let mut goals = goals.goals();
        if goals.is_empty() {
            goals.push(description.to_string());
        }
        let agent = Agent::new(name, description, goals);
        info!(agent_id = %agent.id, "agent created");
        self.load(agent.clone());
        Ok(agent)
    }

    /// Replaces the active agent. Any in-flight step for the previous agent
    /// will be discarded when it returns.
    pub fn load(&self, agent: Agent) {
        self.store().load(agent);
        self.run_number.store(0, Ordering::SeqCst);
        self.set_auto_approve(false);
    }

    /// Binds the session's creation time; archived sessions stop advancing.
    pub fn bind_session(&self, created: DateTime<Utc>) -> bool {
        let archived = self.archive.is_archived(created, Utc::now());
        self.store().set_archived(archived);
        if archived {
            self.set_auto_approve(false);
        }
        archived
    }

    pub fn clear(&self) {
        self.store().clear();
        self.run_number.store(0, Ordering::SeqCst);
        self.set_auto_approve(false);
    }

    pub fn agent(&self) -> Option<Agent> {
        self.store().agent().cloned()
    }

    pub fn state(&self) -> LoopState {
        self.store().state()
    }

    pub fn is_busy(&self) -> bool {
        self.busy.load(Ordering::SeqCst)
    }

    pub fn run_number(&self) -> u32 {
        self.run_number.load(Ordering::SeqCst)
    }

    pub fn view(&self) -> LoopView {
        let (auto_approve, auto_approve_remaining) = {
            let auto = self.auto();
            (auto.is_enabled(), auto.remaining_secs())
        };
        let store = self.store();
        LoopView {
            state: store.state(),
            agent: store.agent().cloned(),
            goals: store.goals_with_tasks(),
            current_goal: store.current_goal(),
            last_result: store.last_result().map(str::to_string),
            auto_approve,
            auto_approve_remaining,
        }
    }

    pub fn set_auto_approve(&self, enabled: bool) {
        let mut auto = self.auto();
        if auto.is_enabled() != enabled {
            info!(enabled, "auto-approve toggled");
        }
        auto.set(enabled);
    }

    pub fn auto_approve_enabled(&self) -> bool {
        self.auto().is_enabled()
    }

    /// One second of auto-approve time. Returns whether it is still on.
    pub fn tick_auto_approve(&self) -> bool {
        self.auto().tick()
    }

    /// Auto-start: advances once when the agent has not made its first step.
    pub async fn start(&self) -> Option<AdvanceOutcome> {
        if self.state() != LoopState::NotStarted {
            return None;
        }
        Some(self.advance(None).await)
    }

    /// Runs one step: approval of the proposed command, or feedback when
    /// `feedback` is non-empty.
    pub async fn advance(&self, feedback: Option<String>) -> AdvanceOutcome {
        let feedback = feedback.filter(|f| !f.trim().is_empty());
        match self.state() {
            LoopState::Idle => return AdvanceOutcome::NoAgent,
            LoopState::Archived => return AdvanceOutcome::Archived,
            _ => {}
        }
        if self
            .busy
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            debug!("step already in flight");
            return AdvanceOutcome::Busy;
        }
        let _busy = BusyGuard(&self.busy);

        let agent_id = self.store().active_id().unwrap_or_default().to_string();
        let outcome = self
            .run_steps(feedback)
            .instrument(info_span!("advance", agent_id = %agent_id))
            .await;
        match &outcome {
            AdvanceOutcome::Advanced { .. } | AdvanceOutcome::Stale => {}
            _ => self.set_auto_approve(false),
        }
        outcome
    }

    async fn run_steps(&self, mut feedback: Option<String>) -> AdvanceOutcome {
        let mut error_signals = 0u32;
        loop {
            if let Some(outcome) = self.check_credentials() {
                return outcome;
            }
            let (req, tag) = {
                let mut store = self.store();
                let Some(agent) = store.agent() else { return AdvanceOutcome::NoAgent };
                let req = self.build_request(agent, feedback.as_deref());
                let tag = DispatchTag {
                    agent_id: agent.id.clone(),
                    generation: store.generation(),
                };
                store.set_loading(true);
                store.set_error(None);
                (req, tag)
            };
            debug!(command = %req.command, attempt = error_signals + 1, "dispatching step");
            let result = self.backend.step(&req).await;
            match self.settle(&tag, result, &mut error_signals) {
                StepDecision::Retry => feedback = None,
                StepDecision::Done(outcome) => return outcome,
            }
        }
    }

    fn check_credentials(&self) -> Option<AdvanceOutcome> {
        let settings = self.settings.snapshot();
        if self.run_number() <= FREE_RUN_LIMIT || settings.has_credential() {
            return None;
        }
        if !settings.must_set_key {
            if let Err(e) = self.settings.update(|s| s.must_set_key = true) {
                warn!(error = %e, "could not persist settings");
            }
        }
        info!(runs = self.run_number(), "free runs used up, a key is required");
        Some(AdvanceOutcome::NeedsCredentials)
    }

    fn build_request(&self, agent: &Agent, feedback: Option<&str>) -> StepRequest {
        let settings = self.settings.snapshot();
        let (command, arguments) = match feedback {
            Some(text) => (
                HUMAN_FEEDBACK_COMMAND.to_string(),
                serde_json::Value::String(text.to_string()),
            ),
            None => (agent.command.clone(), StepRequest::arguments_from(agent.arguments())),
        };
        StepRequest {
            command,
            arguments,
            assistant_reply: agent.assistant_reply.clone(),
            message_history: agent.output.clone(),
            ai_name: agent.name.clone(),
            ai_description: agent.description.clone(),
            ai_goals: agent.goals.clone(),
            agent_id: agent.id.clone(),
            openai_key: settings.openai_key.clone(),
            openrouter_key: settings.openrouter_key.clone(),
            use_openrouter: settings.use_openrouter,
            selected_provider: settings.selected_provider,
            gpt_model: settings.gpt_model.clone(),
        }
    }

    fn settle(
        &self,
        tag: &DispatchTag,
        result: Result<StepResponse>,
        error_signals: &mut u32,
    ) -> StepDecision {
        let mut store = self.store();
        if !tag.matches(&store) {
            info!(agent_id = %tag.agent_id, "discarding response for an inactive agent");
            return StepDecision::Done(AdvanceOutcome::Stale);
        }
        let resp = match result {
            Ok(resp) => resp,
            Err(err) => {
                store.set_loading(false);
                store.set_error(Some(err.user_message()));
                drop(store);
                return StepDecision::Done(self.classify_failure(err));
            }
        };

        let goal = store.apply_step(&resp);
        if is_error_signal(&resp.command) {
            if *error_signals < MAX_ERROR_RETRIES {
                *error_signals += 1;
                warn!(command = %resp.command, retry = *error_signals, "agent error, retrying");
                return StepDecision::Retry;
            }
            warn!(command = %resp.command, "agent kept reporting errors, stopping");
            store.set_loading(false);
            store.set_error(Some(GodmodeError::RecoverableAgent(resp.command.clone()).to_string()));
            return StepDecision::Done(AdvanceOutcome::RetriesExhausted { command: resp.command });
        }

        store.set_loading(false);
        let runs = self.run_number.fetch_add(1, Ordering::SeqCst) + 1;
        info!(command = %resp.command, goal = ?goal, runs, "step applied");
        StepDecision::Done(AdvanceOutcome::Advanced { goal })
    }

    fn classify_failure(&self, err: GodmodeError) -> AdvanceOutcome {
        match err.status() {
            Some(403) => {
                warn!("backend refused the identity");
                self.identity.sign_out();
                AdvanceOutcome::SignedOut
            }
            Some(401) | Some(503) => {
                warn!(error = %err, "backend wants credentials");
                AdvanceOutcome::NeedsCredentials
            }
            _ => {
                warn!(error = %err, "step failed");
                AdvanceOutcome::Failed { message: err.user_message() }
            }
        }
    }

    pub fn backend(&self) -> &Arc<dyn AgentBackend> {
        &self.backend
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::agent::Thoughts;
    use crate::identity::TokenIdentity;
    use crate::models::ChatMessage;
    use crate::protocol::{SubgoalsRequest, SubgoalsResponse};
    use crate::settings::Settings;
    use async_trait::async_trait;
    use std::collections::VecDeque;
    use tokio::sync::Notify;

    /// Replays canned step results and records every request.
    #[derive(Default)]
    pub(crate) struct ScriptedBackend {
        pub replies: Mutex<VecDeque<Result<StepResponse>>>,
        pub requests: Mutex<Vec<StepRequest>>,
        pub gate: Option<Arc<Notify>>,
    }

    impl ScriptedBackend {
        pub fn with(replies: Vec<Result<StepResponse>>) -> Self {
            Self { replies: Mutex::new(replies.into()), ..Default::default() }
        }

        pub fn calls(&self) -> usize {
            self.requests.lock().unwrap().len()
        }
    }

    #[async_trait]
    impl AgentBackend for ScriptedBackend {
        async fn step(&self, req: &StepRequest) -> Result<StepResponse> {
            self.requests.lock().unwrap().push(req.clone());
            if let Some(gate) = &self.gate {
                gate.notified().await;
            }
            let next = self.replies.lock().unwrap().pop_front();
            next.unwrap_or_else(|| Ok(ok_step("do_nothing", "1")))
        }

        async fn subgoals(&self, _req: &SubgoalsRequest) -> Result<SubgoalsResponse> {
            Ok(SubgoalsResponse::default())
        }

        async fn files(&self, _agent_id: &str) -> Result<Vec<String>> {
            Ok(vec![])
        }
    }

    pub(crate) fn ok_step(command: &str, relevant_goal: &str) -> StepResponse {
        StepResponse {
            command: command.into(),
            arguments: serde_json::json!({"query": "launch plans"}),
            thoughts: Some(Thoughts {
                thoughts: format!("next: {command}"),
                relevant_goal: relevant_goal.into(),
                ..Default::default()
            }),
            assistant_reply: "{}".into(),
            message_history: vec![ChatMessage::user("go"), ChatMessage::assistant("{}")],
            result: Some("done".into()),
            task: Some("Research".into()),
        }
    }

    fn keyed_settings() -> SettingsHandle {
        SettingsHandle::new(Settings {
            openrouter_key: Some("sk-or-key".into()),
            ..Default::default()
        })
    }

    fn controller(
        backend: Arc<ScriptedBackend>,
        settings: SettingsHandle,
    ) -> (AgentLoop, Arc<TokenIdentity>) {
        let identity = Arc::new(TokenIdentity::new(Some("tok".into())));
        let l = AgentLoop::new(backend, settings, identity.clone());
        let goals = GoalEditor::from_goals(["Research", "Budget"]);
        l.create("GodmodeGPT", "Plan a product launch", &goals).unwrap();
        (l, identity)
    }

    #[tokio::test]
    async fn start_sends_start_command_then_awaits_approval() {
        let backend = Arc::new(ScriptedBackend::with(vec![Ok(ok_step("web_search", "1"))]));
        let (l, _) = controller(backend.clone(), keyed_settings());
        assert_eq!(l.state(), LoopState::NotStarted);
        let outcome = l.start().await.unwrap();
        assert_eq!(outcome, AdvanceOutcome::Advanced { goal: Some(0) });
        assert_eq!(backend.requests.lock().unwrap()[0].command, crate::agent::START_COMMAND);
        assert_eq!(l.state(), LoopState::AwaitingApproval { command: "web_search".into() });
        assert!(l.start().await.is_none());
    }

    #[tokio::test]
    async fn feedback_replaces_command_and_arguments() {
        let backend = Arc::new(ScriptedBackend::with(vec![
            Ok(ok_step("web_search", "1")),
            Ok(ok_step("write_file", "2")),
        ]));
        let (l, _) = controller(backend.clone(), keyed_settings());
        l.advance(None).await;
        l.advance(Some("focus on Europe".into())).await;
        let reqs = backend.requests.lock().unwrap();
        assert_eq!(reqs[1].command, HUMAN_FEEDBACK_COMMAND);
        assert_eq!(reqs[1].arguments, serde_json::json!("focus on Europe"));
        assert_eq!(reqs[1].openrouter_key.as_deref(), Some("sk-or-key"));
        assert_eq!(reqs[1].message_history.len(), 2);
    }

    #[tokio::test]
    async fn approval_sends_parsed_previous_arguments() {
        let backend = Arc::new(ScriptedBackend::with(vec![Ok(ok_step("web_search", "1"))]));
        let (l, _) = controller(backend.clone(), keyed_settings());
        l.advance(None).await;
        l.advance(Some("   ".into())).await;
        let reqs = backend.requests.lock().unwrap();
        assert_eq!(reqs[1].command, "web_search");
        assert_eq!(reqs[1].arguments, serde_json::json!({"query": "launch plans"}));
    }

    #[tokio::test]
    async fn four_error_signals_stop_and_disable_auto_approve() {
        let err = |n: u32| Ok(ok_step(&format!("Error: attempt {n}"), "x"));
        let backend = Arc::new(ScriptedBackend::with(vec![
            err(1),
            err(2),
            err(3),
            err(4),
            Ok(ok_step("web_search", "1")),
        ]));
        let (l, _) = controller(backend.clone(), keyed_settings());
        l.set_auto_approve(true);
        let outcome = l.advance(None).await;
        assert_eq!(
            outcome,
            AdvanceOutcome::RetriesExhausted { command: "Error: attempt 4".into() }
        );
        assert_eq!(backend.calls(), 4);
        assert!(!l.auto_approve_enabled());
        assert!(matches!(l.state(), LoopState::Failed { .. }));
        assert_eq!(l.run_number(), 0);
    }

    #[tokio::test]
    async fn error_signal_recovers_within_budget() {
        let backend = Arc::new(ScriptedBackend::with(vec![
            Ok(ok_step("error: bad json", "")),
            Ok(ok_step("web_search", "2")),
        ]));
        let (l, _) = controller(backend.clone(), keyed_settings());
        assert_eq!(l.advance(None).await, AdvanceOutcome::Advanced { goal: Some(1) });
        assert_eq!(backend.calls(), 2);
        assert_eq!(l.run_number(), 1);
    }

    #[tokio::test]
    async fn http_401_prompts_for_credentials_and_keeps_agent() {
        let rejected = GodmodeError::provider(401, "Invalid API key");
        let backend = Arc::new(ScriptedBackend::with(vec![Err(rejected)]));
        let (l, _) = controller(backend.clone(), keyed_settings());
        let before = l.agent().unwrap();
        assert_eq!(l.advance(None).await, AdvanceOutcome::NeedsCredentials);
        let after = l.agent().unwrap();
        assert_eq!(before, after);
        assert_eq!(backend.calls(), 1);
    }

    #[tokio::test]
    async fn http_403_signs_out() {
        let forbidden = GodmodeError::provider(403, "forbidden");
        let backend = Arc::new(ScriptedBackend::with(vec![Err(forbidden)]));
        let (l, identity) = controller(backend, keyed_settings());
        assert_eq!(l.advance(None).await, AdvanceOutcome::SignedOut);
        assert!(!identity.is_signed_in());
    }

    #[tokio::test]
    async fn other_failures_surface_without_retry() {
        let refused = GodmodeError::Transport("connection refused".into());
        let backend = Arc::new(ScriptedBackend::with(vec![Err(refused)]));
        let (l, _) = controller(backend.clone(), keyed_settings());
        l.set_auto_approve(true);
        let outcome = l.advance(None).await;
        assert!(matches!(
            outcome,
            AdvanceOutcome::Failed { ref message } if message.contains("connection refused")
        ));
        assert_eq!(backend.calls(), 1);
        assert!(!l.auto_approve_enabled());
        assert!(l.state().accepts_input());
    }

    #[tokio::test]
    async fn free_runs_then_credentials_required() {
        let backend = Arc::new(ScriptedBackend::default());
        let settings = SettingsHandle::new(Settings::default());
        let (l, _) = controller(backend.clone(), settings.clone());
        for _ in 0..=FREE_RUN_LIMIT {
            assert!(matches!(l.advance(None).await, AdvanceOutcome::Advanced { .. }));
        }
        assert_eq!(l.advance(None).await, AdvanceOutcome::NeedsCredentials);
        assert_eq!(backend.calls(), (FREE_RUN_LIMIT + 1) as usize);
        assert!(settings.snapshot().must_set_key);

        settings.update(|s| s.openrouter_key = Some("sk-or-now".into())).unwrap();
        assert!(matches!(l.advance(None).await, AdvanceOutcome::Advanced { .. }));
    }

    #[tokio::test]
    async fn second_trigger_while_in_flight_is_busy() {
        let gate = Arc::new(Notify::new());
        let backend = Arc::new(ScriptedBackend { gate: Some(gate.clone()), ..Default::default() });
        let (l, _) = controller(backend.clone(), keyed_settings());
        let l = Arc::new(l);
        let first = tokio::spawn({
            let l = l.clone();
            async move { l.advance(None).await }
        });
        while backend.calls() == 0 {
            tokio::task::yield_now().await;
        }
        assert_eq!(l.state(), LoopState::Running);
        assert_eq!(l.advance(None).await, AdvanceOutcome::Busy);
        gate.notify_one();
        assert!(matches!(first.await.unwrap(), AdvanceOutcome::Advanced { .. }));
        assert_eq!(backend.calls(), 1);
        assert!(!l.is_busy());
    }

    #[tokio::test]
    async fn response_for_replaced_agent_is_discarded() {
        let gate = Arc::new(Notify::new());
        let backend = Arc::new(ScriptedBackend { gate: Some(gate.clone()), ..Default::default() });
        let (l, _) = controller(backend.clone(), keyed_settings());
        let l = Arc::new(l);
        let pending = tokio::spawn({
            let l = l.clone();
            async move { l.advance(None).await }
        });
        while backend.calls() == 0 {
            tokio::task::yield_now().await;
        }
        let other = Agent::new("Other", "Something else", vec!["x".into()]);
        l.load(other.clone());
        gate.notify_one();
        assert_eq!(pending.await.unwrap(), AdvanceOutcome::Stale);
        assert_eq!(l.agent().unwrap(), other);
        assert_eq!(l.state(), LoopState::NotStarted);
    }

    #[tokio::test]
    async fn archived_sessions_do_not_advance() {
        let backend = Arc::new(ScriptedBackend::default());
        let (l, _) = controller(backend.clone(), keyed_settings());
        assert!(l.bind_session(Utc::now() - chrono::Duration::days(10)));
        assert_eq!(l.advance(None).await, AdvanceOutcome::Archived);
        assert_eq!(backend.calls(), 0);
    }

    #[test]
    fn create_requires_description_and_defaults_goals() {
        let l = AgentLoop::new(
            Arc::new(ScriptedBackend::default()),
            keyed_settings(),
            Arc::new(TokenIdentity::anonymous()),
        );
        assert!(matches!(
            l.create("n", "  ", &GoalEditor::default()),
            Err(GodmodeError::Validation(_))
        ));
        let agent = l.create("", "Plan a product launch", &GoalEditor::default()).unwrap();
        assert_eq!(agent.name, DEFAULT_AGENT_NAME);
        assert_eq!(agent.goals, vec!["Plan a product launch".to_string()]);
    }
}
