//! Interactive start form: description, goals and live sub-goal suggestions.
//!
//! Every description line is pushed into the suggestion watcher, which asks
//! the backend once typing has settled and the panel is open.

use std::fmt::Write as _;
use std::sync::Arc;

use tokio::io::{AsyncBufRead, Lines};
use tokio::sync::{mpsc, watch};

use crate::agent::subgoals::{SubgoalEvent, SubgoalHelper, SuggestionPool};
use crate::agent::{GoalEditor, MAX_GOALS};
use crate::console::{SET_KEY_HINT, SIGNED_OUT};

pub const FORM_HELP: &str = "\
  <text>           set the description
  /suggest         show or hide goal suggestions
  /pick 1 3        add suggestions as goals
  /goal <text>     add a goal
  /edit <n> <text> replace goal n
  /drop <n>        remove goal n
  /show            show the form again
  /go              start the agent
  /quit            leave without starting";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FormInput {
    Describe(String),
    ToggleSuggest,
    Pick(Vec<usize>),
    Goal(String),
    Edit(usize, String),
    Drop(usize),
    Show,
    Go,
    Help,
    Quit,
    Invalid(String),
}

/// 1-based user index to a 0-based one.
fn index(arg: &str) -> Option<usize> {
    arg.trim().parse::<usize>().ok()?.checked_sub(1)
}

pub fn parse_form_input(line: &str) -> FormInput {
    let line = line.trim();
    if !line.starts_with('/') {
        return FormInput::Describe(line.to_string());
    }
    let (cmd, rest) = line.split_once(' ').unwrap_or((line, ""));
    let rest = rest.trim();
    match cmd.to_ascii_lowercase().as_str() {
        "/suggest" => FormInput::ToggleSuggest,
        "/show" => FormInput::Show,
        "/go" | "/start" => FormInput::Go,
        "/help" => FormInput::Help,
        "/quit" | "/exit" => FormInput::Quit,
        "/goal" if !rest.is_empty() => FormInput::Goal(rest.to_string()),
        "/pick" => {
            let picked: Vec<usize> = rest
                .split(|c: char| c == ',' || c.is_whitespace())
                .filter_map(index)
                .collect();
            if picked.is_empty() {
                FormInput::Invalid("usage: /pick 1 3".into())
            } else {
                FormInput::Pick(picked)
            }
        }
        "/edit" => match rest.split_once(' ').and_then(|(n, text)| Some((index(n)?, text.trim()))) {
            Some((n, text)) if !text.is_empty() => FormInput::Edit(n, text.to_string()),
            _ => FormInput::Invalid("usage: /edit <n> <text>".into()),
        },
        "/drop" => match index(rest) {
            Some(n) => FormInput::Drop(n),
            None => FormInput::Invalid("usage: /drop <n>".into()),
        },
        _ => FormInput::Invalid(format!("unknown command {cmd}, try /help")),
    }
}

/// What the user filled in.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StartRequest {
    pub description: String,
    pub goals: GoalEditor,
}

pub struct StartForm {
    helper: Arc<SubgoalHelper>,
    description: String,
    goals: GoalEditor,
    pool: SuggestionPool,
    panel_open: bool,
}

impl StartForm {
    pub fn new(
        helper: Arc<SubgoalHelper>,
        description: String,
        goals: GoalEditor,
        panel_open: bool,
    ) -> Self {
        Self { helper, description, goals, pool: SuggestionPool::default(), panel_open }
    }

    pub fn render(&self) -> String {
        let mut out = String::new();
        let description =
            if self.description.is_empty() { "(none yet)" } else { self.description.as_str() };
        let _ = writeln!(out, "description: {description}");
        for (i, slot) in self.goals.slots().iter().enumerate() {
            if !slot.is_empty() {
                let _ = writeln!(out, "  goal {}: {slot}", i + 1);
            }
        }
        if self.panel_open {
            if self.pool.is_empty() {
                let _ = writeln!(out, "suggestions: (waiting for a description)");
            }
            for (i, s) in self.pool.items().iter().enumerate() {
                let _ = writeln!(out, "  [{}] {s}", i + 1);
            }
        }
        out
    }

    fn on_event(&mut self, event: SubgoalEvent) {
        match event {
            SubgoalEvent::Suggestions(items) => {
                self.pool.replace(items);
                if self.panel_open {
                    print!("{}", self.render());
                }
            }
            SubgoalEvent::Notice(message) => println!("Could not get suggestions: {message}"),
            SubgoalEvent::NeedsCredentials => {
                println!("Suggestions need an API key: run `{SET_KEY_HINT}`.")
            }
            SubgoalEvent::SignedOut => println!("{SIGNED_OUT}"),
        }
    }

    /// Accepts suggestions, highest index first so earlier picks keep their
    /// numbers.
    fn pick(&mut self, mut picked: Vec<usize>) {
        picked.sort_unstable();
        picked.dedup();
        for i in picked.into_iter().rev() {
            if self.goals.goals().len() >= MAX_GOALS {
                println!("Already {MAX_GOALS} goals; drop one first.");
                return;
            }
            if self.pool.accept(i, &mut self.goals).is_none() {
                println!("No suggestion {}.", i + 1);
            }
        }
    }

    /// Reads form lines until `/go`. `None` when the user quits or input
    /// ends.
    pub async fn run<R>(mut self, lines: &mut Lines<R>) -> anyhow::Result<Option<StartRequest>>
    where
        R: AsyncBufRead + Unpin,
    {
        let (description_tx, description_rx) = watch::channel(String::new());
        let (open_tx, open_rx) = watch::channel(self.panel_open);
        let (events_tx, mut events) = mpsc::unbounded_channel();
        let helper = self.helper.clone();
        let watcher =
            tokio::spawn(async move { helper.watch(description_rx, open_rx, events_tx).await });
        if !self.description.is_empty() {
            let _ = description_tx.send(self.description.clone());
        }
        print!("{}", self.render());

        let request = loop {
            tokio::select! {
                Some(event) = events.recv() => self.on_event(event),
                line = lines.next_line() => {
                    let Some(line) = line? else { break None };
                    match parse_form_input(&line) {
                        FormInput::Describe(text) if text.is_empty() => {}
                        FormInput::Describe(text) => {
                            self.description = text;
                            let _ = description_tx.send(self.description.clone());
                        }
                        FormInput::ToggleSuggest => {
                            self.panel_open = !self.panel_open;
                            let _ = open_tx.send(self.panel_open);
                            if self.panel_open {
                                let _ = description_tx.send(self.description.clone());
                            }
                            print!("{}", self.render());
                        }
                        FormInput::Pick(picked) => {
                            self.pick(picked);
                            print!("{}", self.render());
                        }
                        FormInput::Goal(text) => {
                            if self.goals.goals().len() >= MAX_GOALS {
                                println!("Already {MAX_GOALS} goals; drop one first.");
                            } else {
                                self.goals.add(text);
                            }
                        }
                        FormInput::Edit(n, text) => self.goals.edit(n, text),
                        FormInput::Drop(n) => self.goals.remove(n),
                        FormInput::Show => print!("{}", self.render()),
                        FormInput::Help => println!("{FORM_HELP}"),
                        FormInput::Invalid(message) => println!("{message}"),
                        FormInput::Quit => break None,
                        FormInput::Go if self.description.trim().is_empty() => {
                            println!("Description is required.");
                        }
                        FormInput::Go => {
                            break Some(StartRequest {
                                description: self.description.clone(),
                                goals: self.goals.clone(),
                            });
                        }
                    }
                }
            }
        };

        drop(description_tx);
        watcher.abort();
        Ok(request)
    }
}
