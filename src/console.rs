//! Interactive terminal front end for a running agent.

use std::fmt::Write as _;
use std::sync::{Arc, Mutex};

use chrono::Utc;
use tokio::io::{AsyncBufRead, Lines};
use tokio::sync::{mpsc, watch};
use tracing::warn;

use crate::agent::auto_approve;
use crate::agent::controller::{AdvanceOutcome, AgentLoop, LoopView};
use crate::agent::display_command;
use crate::agent::state::LoopState;
use crate::history::ConversationHistory;
use crate::local_store::LocalStore;
use crate::session::SessionDirectory;

pub const SET_KEY_HINT: &str = "godmode settings set --openrouter-key <key>";
pub const SIGNED_OUT: &str = "Your sign-in was rejected; you have been signed out.";

pub const HELP: &str = "\
  <enter> | y      approve the proposed command
  <text>           send feedback instead
  /auto            toggle auto-approve (10 minutes)
  /files           list files in the agent workspace
  /status          show goals and tasks again
  /delete          delete this session and leave
  /help            this text
  /quit            leave (the session stays on the server)";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Input {
    Approve,
    Feedback(String),
    ToggleAuto,
    Files,
    Status,
    Delete,
    Help,
    Quit,
}

pub fn parse_input(line: &str) -> Input {
    let line = line.trim();
    match line.to_ascii_lowercase().as_str() {
        "" | "y" | "yes" | "approve" => Input::Approve,
        "/auto" => Input::ToggleAuto,
        "/files" => Input::Files,
        "/status" => Input::Status,
        "/delete" => Input::Delete,
        "/help" | "?" => Input::Help,
        "/quit" | "/exit" | "q" => Input::Quit,
        _ => Input::Feedback(line.to_string()),
    }
}

pub fn render_view(view: &LoopView) -> String {
    let mut out = String::new();
    let Some(agent) = &view.agent else {
        return "No agent loaded.".to_string();
    };
    let _ = writeln!(out, "== {} ({})", agent.name, agent.id);
    let _ = writeln!(out, "   {}", agent.description);
    for (i, goal) in view.goals.iter().enumerate() {
        let marker = if view.current_goal == Some(i) { ">" } else { " " };
        let _ = writeln!(out, "{marker} {}. {}", i + 1, goal.goal);
        for task in &goal.tasks {
            let done = if task.result.is_empty() { " " } else { "x" };
            let _ = writeln!(out, "     [{done}] {} ({})", task.task_name, task.command_name);
        }
    }
    if let Some(thoughts) = &agent.thoughts {
        if !thoughts.thoughts.is_empty() {
            let _ = writeln!(out, "thoughts:  {}", thoughts.thoughts);
        }
        if !thoughts.reasoning.is_empty() {
            let _ = writeln!(out, "reasoning: {}", thoughts.reasoning);
        }
        if !thoughts.criticism.is_empty() {
            let _ = writeln!(out, "criticism: {}", thoughts.criticism);
        }
    }
    if let Some(result) = &view.last_result {
        let _ = writeln!(out, "result:    {result}");
    }
    match &view.state {
        LoopState::AwaitingApproval { command } => {
            let _ = writeln!(out, "next:      {}", display_command(command));
            if !agent.args.is_empty() {
                let _ = writeln!(out, "{}", agent.args);
            }
        }
        LoopState::Failed { message } => {
            let _ = writeln!(out, "error:     {message}");
        }
        LoopState::NotStarted => {
            let _ = writeln!(out, "next:      {}", display_command(&agent.command));
        }
        _ => {}
    }
    if view.auto_approve {
        let left = view.auto_approve_remaining;
        let _ = writeln!(out, "auto-approve on, {}m{:02}s left", left / 60, left % 60);
    }
    out
}

/// One-line notice for outcomes that need the user's attention.
pub fn render_outcome(outcome: &AdvanceOutcome) -> Option<String> {
    match outcome {
        AdvanceOutcome::Advanced { .. } | AdvanceOutcome::Stale => None,
        AdvanceOutcome::Busy => Some("A step is already running.".into()),
        AdvanceOutcome::NoAgent => Some("No agent loaded.".into()),
        AdvanceOutcome::Archived => Some("This session is archived and read-only.".into()),
        AdvanceOutcome::NeedsCredentials => {
            Some(format!("An API key is required: run `{SET_KEY_HINT}`."))
        }
        AdvanceOutcome::SignedOut => Some(SIGNED_OUT.into()),
        AdvanceOutcome::Failed { message } => Some(format!("Error: {message}")),
        AdvanceOutcome::RetriesExhausted { command } => {
            Some(format!(
                "The agent kept failing ({command}). Send feedback or approve to try again."
            ))
        }
    }
}

/// Drives an agent from stdin until `/quit` or EOF.
pub struct Console {
    agent_loop: Arc<AgentLoop>,
    sessions: Arc<dyn SessionDirectory>,
    store: Arc<Mutex<LocalStore>>,
    history: ConversationHistory,
}

impl Console {
    pub fn new(
        agent_loop: Arc<AgentLoop>,
        sessions: Arc<dyn SessionDirectory>,
        store: Arc<Mutex<LocalStore>>,
    ) -> Self {
        let history = match store.lock() {
            Ok(s) => ConversationHistory::load(&s),
            Err(_) => ConversationHistory::default(),
        };
        Self { agent_loop, sessions, store, history }
    }

    fn remember(&mut self) {
        let Some(agent) = self.agent_loop.agent() else { return };
        if !self.history.record(&agent, Utc::now()) {
            return;
        }
        let saved = match self.store.lock() {
            Ok(mut s) => self.history.save(&mut s),
            Err(_) => Err(anyhow::anyhow!("local store lock poisoned")),
        };
        if let Err(e) = saved {
            warn!(error = %e, "could not save conversation history");
        }
    }

    /// Saves the snapshot to the session directory.
    async fn persist(&self) {
        let Some(agent) = self.agent_loop.agent() else { return };
        if let Err(e) = self.sessions.update(&agent.id, &agent).await {
            warn!(agent_id = %agent.id, error = %e, "could not save session");
        }
    }

    async fn report(&mut self, outcome: &AdvanceOutcome) {
        if let AdvanceOutcome::Advanced { .. } = outcome {
            self.remember();
            self.persist().await;
            println!("{}", render_view(&self.agent_loop.view()));
        }
        if let Some(notice) = render_outcome(outcome) {
            println!("{notice}");
        }
    }

    async fn show_files(&self) {
        let Some(agent) = self.agent_loop.agent() else { return };
        match self.agent_loop.backend().files(&agent.id).await {
            Ok(files) if files.is_empty() => println!("(no files yet)"),
            Ok(files) => files.iter().for_each(|f| println!("  {f}")),
            Err(e) => println!("Error: {}", e.user_message()),
        }
    }

    /// Removes the session remotely and from the local cache, then clears
    /// the loop.
    async fn delete_active(&mut self) -> bool {
        let Some(agent) = self.agent_loop.agent() else { return false };
        if let Err(e) = self.sessions.delete(&agent.id).await {
            println!("Error: {}", e.user_message());
            return false;
        }
        if self.history.delete(&agent.id) {
            if let Ok(mut s) = self.store.lock() {
                if let Err(e) = self.history.save(&mut s) {
                    warn!(error = %e, "could not save conversation history");
                }
            }
        }
        self.agent_loop.clear();
        println!("Session {} deleted.", agent.id);
        true
    }

    pub async fn run<R>(mut self, auto: bool, lines: &mut Lines<R>) -> anyhow::Result<()>
    where
        R: AsyncBufRead + Unpin,
    {
        let (stop_tx, stop_rx) = watch::channel(false);
        let (tx, mut outcomes) = mpsc::unbounded_channel();
        let driver = tokio::spawn(auto_approve::drive(self.agent_loop.clone(), stop_rx, tx));

        println!("{}", render_view(&self.agent_loop.view()));
        if let Some(outcome) = self.agent_loop.start().await {
            self.report(&outcome).await;
        }
        if auto {
            self.agent_loop.set_auto_approve(true);
        }
        println!("Type /help for commands.");

        loop {
            tokio::select! {
                Some(outcome) = outcomes.recv() => self.report(&outcome).await,
                line = lines.next_line() => {
                    let Some(line) = line? else { break };
                    match parse_input(&line) {
                        Input::Quit => break,
                        Input::Help => println!("{HELP}"),
                        Input::Status => println!("{}", render_view(&self.agent_loop.view())),
                        Input::Files => self.show_files().await,
                        Input::Delete => {
                            if self.delete_active().await {
                                break;
                            }
                        }
                        Input::ToggleAuto => {
                            let on = !self.agent_loop.auto_approve_enabled();
                            self.agent_loop.set_auto_approve(on);
                            println!("auto-approve {}", if on { "on" } else { "off" });
                        }
                        Input::Approve => {
                            let outcome = self.agent_loop.advance(None).await;
                            self.report(&outcome).await;
                        }
                        Input::Feedback(text) => {
                            let outcome = self.agent_loop.advance(Some(text)).await;
                            self.report(&outcome).await;
                        }
                    }
                }
            }
        }

        self.agent_loop.set_auto_approve(false);
        let _ = stop_tx.send(true);
        let _ = driver.await;
        Ok(())
    }
}
