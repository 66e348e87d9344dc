//! Sub-goal suggestions: parsing the model's numbered list, the pool of
//! offered suggestions and the debounced watcher feeding it.

use std::sync::{Arc, LazyLock};
use std::time::Duration;

use regex::Regex;
use tokio::sync::{mpsc, watch};
use tracing::{debug, warn};

use crate::api_client::AgentBackend;
use crate::error::{GodmodeError, Result};
use crate::identity::Identity;
use crate::protocol::SubgoalsRequest;
use crate::settings::SettingsHandle;

use super::{GoalEditor, MAX_GOALS};

pub const DEBOUNCE: Duration = Duration::from_millis(500);

static NUMBERED: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^\d+\.\s*").expect("static regex"));

/// Keeps the items of a numbered list ("1. Research market"), numbering
/// stripped, empties dropped. Other lines are ignored.
pub fn parse_subgoals(content: &str) -> Vec<String> {
    content
        .lines()
        .map(str::trim)
        .filter(|line| NUMBERED.is_match(line))
        .map(|line| NUMBERED.replace(line, "").trim().to_string())
        .filter(|goal| !goal.is_empty())
        .collect()
}

/// Suggestions not yet accepted.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SuggestionPool {
    items: Vec<String>,
}

impl SuggestionPool {
    pub fn replace(&mut self, items: Vec<String>) {
        self.items = items;
    }

    pub fn items(&self) -> &[String] {
        &self.items
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn take(&mut self, index: usize) -> Option<String> {
        (index < self.items.len()).then(|| self.items.remove(index))
    }

    /// Moves suggestion `index` into the goal editor. Nothing moves while the
    /// editor already holds `MAX_GOALS` goals.
    pub fn accept(&mut self, index: usize, goals: &mut GoalEditor) -> Option<String> {
        if goals.goals().len() >= MAX_GOALS {
            return None;
        }
        let goal = self.take(index)?;
        goals.add(goal.clone());
        Some(goal)
    }
}

/// Waits for the next change and then until the value has been stable for
/// `delay`. Returns `None` once the sender is gone.
pub async fn debounce(rx: &mut watch::Receiver<String>, delay: Duration) -> Option<String> {
    rx.changed().await.ok()?;
    loop {
        match tokio::time::timeout(delay, rx.changed()).await {
            Ok(Ok(())) => continue,
            Ok(Err(_)) => return None,
            Err(_elapsed) => return Some(rx.borrow_and_update().clone()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SubgoalEvent {
    Suggestions(Vec<String>),
    /// Transient failure text.
    Notice(String),
    NeedsCredentials,
    SignedOut,
}

pub struct SubgoalHelper {
    backend: Arc<dyn AgentBackend>,
    settings: SettingsHandle,
    identity: Arc<dyn Identity>,
}

impl SubgoalHelper {
    pub fn new(
        backend: Arc<dyn AgentBackend>,
        settings: SettingsHandle,
        identity: Arc<dyn Identity>,
    ) -> Self {
        Self { backend, settings, identity }
    }

    pub async fn suggest(&self, description: &str) -> Result<Vec<String>> {
        let req = SubgoalsRequest {
            description: description.trim().to_string(),
            open_router_key: self.settings.snapshot().openrouter_key,
        };
        let resp = self.backend.subgoals(&req).await?;
        Ok(resp
            .subgoals
            .into_iter()
            .map(|g| g.trim().to_string())
            .filter(|g| !g.is_empty())
            .collect())
    }

    fn failure_event(&self, err: GodmodeError) -> SubgoalEvent {
        warn!(error = %err, "sub-goal suggestion failed");
        match err.status() {
            Some(403) => {
                self.identity.sign_out();
                SubgoalEvent::SignedOut
            }
            Some(401) | Some(503) => SubgoalEvent::NeedsCredentials,
            _ => SubgoalEvent::Notice(err.user_message()),
        }
    }

    /// Requests suggestions for each settled description while the panel
    /// (`open`) is shown. Ends when either input channel or `events` closes.
    pub async fn watch(
        &self,
        mut description: watch::Receiver<String>,
        open: watch::Receiver<bool>,
        events: mpsc::UnboundedSender<SubgoalEvent>,
    ) {
        while let Some(text) = debounce(&mut description, DEBOUNCE).await {
            if !*open.borrow() || text.trim().is_empty() {
                debug!("suggestion panel closed or description empty, skipping");
                continue;
            }
            let event = match self.suggest(&text).await {
                Ok(goals) => SubgoalEvent::Suggestions(goals),
                Err(e) => self.failure_event(e),
            };
            if events.send(event).is_err() {
                return;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::TokenIdentity;
    use crate::protocol::{StepRequest, StepResponse, SubgoalsResponse};
    use crate::settings::Settings;
    use async_trait::async_trait;
    use std::sync::Mutex;

    const LAUNCH_PLAN: &str = "Here you go:
1. Research target market and competitors
2.  Set a launch budget
3.
  4. Draft the announcement  
Thanks!";

    struct PlannerBackend {
        seen: Mutex<Vec<SubgoalsRequest>>,
        fail_with: Option<u16>,
    }

    impl PlannerBackend {
        fn new(fail_with: Option<u16>) -> Self {
            Self { seen: Mutex::new(vec![]), fail_with }
        }
    }

    #[async_trait]
    impl AgentBackend for PlannerBackend {
        async fn step(&self, _req: &StepRequest) -> Result<StepResponse> {
            Ok(StepResponse::default())
        }

        async fn subgoals(&self, req: &SubgoalsRequest) -> Result<SubgoalsResponse> {
            self.seen.lock().unwrap().push(req.clone());
            if let Some(status) = self.fail_with {
                return Err(GodmodeError::provider(status, "nope"));
            }
            Ok(SubgoalsResponse { subgoals: parse_subgoals(LAUNCH_PLAN) })
        }

        async fn files(&self, _agent_id: &str) -> Result<Vec<String>> {
            Ok(vec![])
        }
    }

    fn helper(backend: Arc<PlannerBackend>, identity: Arc<TokenIdentity>) -> SubgoalHelper {
        let settings = SettingsHandle::new(Settings {
            openrouter_key: Some("sk-or-abc".into()),
            ..Default::default()
        });
        SubgoalHelper::new(backend, settings, identity)
    }

    #[test]
    fn numbered_lines_only() {
        assert_eq!(
            parse_subgoals(LAUNCH_PLAN),
            vec![
                "Research target market and competitors",
                "Set a launch budget",
                "Draft the announcement"
            ]
        );
        assert!(parse_subgoals("no list here").is_empty());
        assert_eq!(parse_subgoals("10. Tenth"), vec!["Tenth"]);
    }

    #[test]
    fn pool_take_is_bounds_checked() {
        let mut pool = SuggestionPool::default();
        pool.replace(vec!["a".into(), "b".into()]);
        assert_eq!(pool.take(5), None);
        assert_eq!(pool.take(0).as_deref(), Some("a"));
        assert_eq!(pool.items(), ["b".to_string()]);
    }

    #[tokio::test]
    async fn product_launch_suggestion_moves_into_goals() {
        let backend = Arc::new(PlannerBackend::new(None));
        let h = helper(backend.clone(), Arc::new(TokenIdentity::anonymous()));
        let suggestions = h.suggest("Plan a product launch").await.unwrap();
        assert!(!suggestions.is_empty());
        assert!(suggestions.iter().all(|s| !s.is_empty()));
        assert_eq!(backend.seen.lock().unwrap()[0].open_router_key.as_deref(), Some("sk-or-abc"));

        let mut pool = SuggestionPool::default();
        pool.replace(suggestions.clone());
        let mut goals = GoalEditor::default();
        let accepted = pool.accept(0, &mut goals).unwrap();
        assert_eq!(goals.goals(), vec![accepted.clone()]);
        assert!(!pool.items().contains(&accepted));
        assert_eq!(pool.items().len(), suggestions.len() - 1);
    }

    #[test]
    fn full_goal_list_keeps_the_suggestion() {
        let mut goals = GoalEditor::from_goals(["a", "b", "c", "d", "e"]);
        let mut pool = SuggestionPool::default();
        pool.replace(vec!["sixth".into()]);
        assert_eq!(pool.accept(0, &mut goals), None);
        assert_eq!(pool.items(), ["sixth".to_string()]);
        assert_eq!(goals.goals(), vec!["a", "b", "c", "d", "e"]);

        goals.remove(4);
        assert_eq!(pool.accept(0, &mut goals).as_deref(), Some("sixth"));
        assert!(pool.is_empty());
        assert_eq!(goals.goals().last().map(String::as_str), Some("sixth"));
    }

    #[tokio::test(start_paused = true)]
    async fn debounce_waits_for_quiet_period() {
        let (tx, mut rx) = watch::channel(String::new());
        let typing = tokio::spawn(async move {
            for text in ["P", "Pl", "Plan", "Plan a launch"] {
                tx.send(text.to_string()).unwrap();
                tokio::time::sleep(Duration::from_millis(200)).await;
            }
            tokio::time::sleep(Duration::from_secs(2)).await;
            drop(tx);
        });
        let started = tokio::time::Instant::now();
        assert_eq!(debounce(&mut rx, DEBOUNCE).await.as_deref(), Some("Plan a launch"));
        assert!(started.elapsed() >= Duration::from_millis(600 + 500));
        assert_eq!(debounce(&mut rx, DEBOUNCE).await, None);
        typing.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn watcher_only_fires_while_open() {
        let backend = Arc::new(PlannerBackend::new(None));
        let h = helper(backend.clone(), Arc::new(TokenIdentity::anonymous()));
        let (desc_tx, desc_rx) = watch::channel(String::new());
        let (open_tx, open_rx) = watch::channel(false);
        let (tx, mut rx) = mpsc::unbounded_channel();
        let task = tokio::spawn(async move { h.watch(desc_rx, open_rx, tx).await });

        desc_tx.send("Plan a product launch".into()).unwrap();
        tokio::time::sleep(Duration::from_secs(1)).await;
        assert!(backend.seen.lock().unwrap().is_empty());

        open_tx.send(true).unwrap();
        desc_tx.send("Plan a product launch!".into()).unwrap();
        match rx.recv().await {
            Some(SubgoalEvent::Suggestions(s)) => assert_eq!(s.len(), 3),
            other => panic!("unexpected event {other:?}"),
        }
        drop(desc_tx);
        task.await.unwrap();
    }

    #[tokio::test]
    async fn forbidden_signs_out_and_503_asks_for_key() {
        let identity = Arc::new(TokenIdentity::new(Some("tok".into())));
        let h = helper(Arc::new(PlannerBackend::new(Some(403))), identity.clone());
        let err = h.suggest("x").await.unwrap_err();
        assert_eq!(h.failure_event(err), SubgoalEvent::SignedOut);
        assert!(!identity.is_signed_in());

        let h = helper(Arc::new(PlannerBackend::new(Some(503))), identity);
        let err = h.suggest("x").await.unwrap_err();
        assert_eq!(h.failure_event(err), SubgoalEvent::NeedsCredentials);
    }
}
