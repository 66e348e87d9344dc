use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use anyhow::Context;
use clap::{Parser, Subcommand};
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{info, warn};
use tracing_subscriber::{fmt, EnvFilter};

mod agent;
mod api_client;
mod console;
mod discovery;
mod error;
mod history;
mod identity;
mod local_store;
mod models;
mod protocol;
mod server;
mod session;
mod settings;
mod start_form;
mod storage;

use agent::controller::AgentLoop;
use agent::subgoals::SubgoalHelper;
use agent::GoalEditor;
use api_client::{AgentBackend, GodmodeClient};
use identity::TokenIdentity;
use local_store::{LocalStore, KEY_CLOSED_ABOUT, KEY_DISMISSED_DATASET};
use models::{ModelConnector, OpenRouterClient, OpenRouterConnector};
use session::SessionDirectory;
use settings::{Provider, SettingsHandle, SettingsPatch};

const ABOUT_BANNER: &str = "Godmode runs an autonomous agent one approved step at a time. \
Approve each proposed command, steer it with feedback, \
or let it auto-approve for up to ten minutes. \
(`godmode dismiss about` hides this note.)";
const DATASET_BANNER: &str = "Sessions may be used to improve the agent. \
(`godmode dismiss dataset` hides this note.)";

#[derive(Debug, Parser)]
#[command(name = "godmode")]
#[command(about = "Run and supervise autonomous agents from the terminal", long_about = None)]
struct Cli {
    /// Backend base URL.
    #[arg(
        long,
        global = true,
        env = "GODMODE_API_URL",
        default_value = api_client::DEFAULT_API_URL
    )]
    api_url: String,
    /// ID token sent as bearer identity.
    #[arg(long, global = true, env = "GODMODE_ID_TOKEN", hide_env_values = true)]
    token: Option<String>,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Run the backend service.
    Serve {
        #[arg(long, default_value = "127.0.0.1:7171")]
        listen: String,
        #[arg(long, env = "GODMODE_DATABASE_URL")]
        database_url: Option<String>,
        /// Directory holding one workspace per agent.
        #[arg(long)]
        workspace: Option<PathBuf>,
        #[arg(long, env = "OPENROUTER_API_KEY", hide_env_values = true)]
        fallback_key: Option<String>,
    },
    /// Start a new agent, or resume a stored session.
    Run {
        #[arg(long, default_value = agent::DEFAULT_AGENT_NAME)]
        name: String,
        #[arg(long, short)]
        description: Option<String>,
        /// Up to five goals; repeat the flag.
        #[arg(long = "goal", short)]
        goals: Vec<String>,
        /// Open the goal suggestion panel in the start form.
        #[arg(long)]
        suggest: bool,
        /// Start with auto-approve on.
        #[arg(long)]
        auto: bool,
        #[arg(long, conflicts_with_all = ["description", "goals", "suggest"])]
        resume: Option<String>,
    },
    #[command(subcommand)]
    Sessions(SessionsCmd),
    #[command(subcommand)]
    History(HistoryCmd),
    #[command(subcommand)]
    Settings(SettingsCmd),
    /// List models offered by the provider.
    Models,
    /// Check an OpenRouter key with a tiny completion.
    ValidateKey {
        key: Option<String>,
    },
    /// List files in an agent's workspace.
    Files {
        agent_id: String,
    },
    /// Hide a banner for good.
    Dismiss {
        #[arg(value_parser = ["about", "dataset"])]
        banner: String,
    },
}

#[derive(Debug, Subcommand)]
enum SessionsCmd {
    List,
    Show { id: String },
    Delete { id: String },
}

#[derive(Debug, Subcommand)]
enum HistoryCmd {
    List,
    /// Print the transcript (`ROLE: content`).
    Show { id: String },
    /// Write the conversation as JSON.
    Export {
        id: String,
        #[arg(long)]
        out: Option<PathBuf>,
    },
    Delete { id: String },
    Clear,
}

#[derive(Debug, Subcommand)]
enum SettingsCmd {
    Show,
    Set {
        /// Empty string clears the key.
        #[arg(long)]
        openai_key: Option<String>,
        #[arg(long)]
        openrouter_key: Option<String>,
        #[arg(long)]
        model: Option<String>,
        #[arg(long)]
        provider: Option<Provider>,
        #[arg(long)]
        free_tier: Option<bool>,
    },
}

fn mask(key: Option<&str>) -> String {
    match key {
        None => "(not set)".into(),
        Some(k) => match (k.get(..6), k.get(k.len().saturating_sub(4)..)) {
            (Some(head), Some(tail)) if k.len() > 10 => format!("{head}…{tail}"),
            _ => "****".into(),
        },
    }
}

fn open_store() -> anyhow::Result<Arc<Mutex<LocalStore>>> {
    Ok(Arc::new(Mutex::new(LocalStore::open_default()?)))
}

fn with_store<T>(
    store: &Mutex<LocalStore>,
    f: impl FnOnce(&mut LocalStore) -> T,
) -> anyhow::Result<T> {
    let mut guard = store.lock().map_err(|_| anyhow::anyhow!("local store lock poisoned"))?;
    Ok(f(&mut guard))
}

/// Persists a dismissed banner; anything but `about` is the dataset banner.
fn dismiss(store: &Mutex<LocalStore>, banner: &str) -> anyhow::Result<()> {
    let key = if banner == "about" { KEY_CLOSED_ABOUT } else { KEY_DISMISSED_DATASET };
    with_store(store, |s| s.set_flag(key, true))?
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    url::Url::parse(&cli.api_url).with_context(|| format!("invalid backend url {}", cli.api_url))?;
    let identity = Arc::new(TokenIdentity::new(cli.token.clone()));
    let client = Arc::new(GodmodeClient::new(cli.api_url.clone(), identity.clone()));

    match cli.command {
        Commands::Serve { listen, database_url, workspace, fallback_key } => {
            let addr: SocketAddr = listen.parse()?;
            let repo = storage::SqliteSessionRepository::initialize(database_url).await?;
            let workspace_root = match workspace {
                Some(w) => w,
                None => local_store::data_dir()?.join("workspaces"),
            };
            std::fs::create_dir_all(&workspace_root)?;
            let state = server::AppState {
                repo: Arc::new(repo),
                models: Arc::new(OpenRouterConnector::from_env()),
                fallback_key: fallback_key.filter(|k| !k.is_empty()),
                workspace_root,
            };
            server::serve(addr, state).await?;
        }
        Commands::Run { name, description, goals, suggest, auto, resume } => {
            let store = open_store()?;
            let settings = SettingsHandle::persistent(store.clone());
            let agent_loop =
                Arc::new(AgentLoop::new(client.clone(), settings.clone(), identity.clone()));

            let (closed_about, dismissed_dataset) = with_store(&store, |s| {
                (s.get_flag(KEY_CLOSED_ABOUT), s.get_flag(KEY_DISMISSED_DATASET))
            })?;
            if !closed_about {
                println!("{ABOUT_BANNER}\n");
            }
            if !dismissed_dataset {
                println!("{DATASET_BANNER}\n");
            }

            let mut lines = BufReader::new(tokio::io::stdin()).lines();
            match resume {
                Some(id) => {
                    let agent = client.get(&id).await?;
                    agent_loop.load(agent);
                    let created = client
                        .list()
                        .await?
                        .into_iter()
                        .find(|s| s.agent_id == id)
                        .map(|s| s.created);
                    if let Some(created) = created {
                        if agent_loop.bind_session(created) {
                            println!("This session is archived and read-only.");
                        }
                    }
                }
                None => {
                    let editor = GoalEditor::from_goals(goals);
                    let (description, editor) = match description {
                        Some(d) if !suggest => (d, editor),
                        d => {
                            let helper = SubgoalHelper::new(
                                client.clone(),
                                settings.clone(),
                                identity.clone(),
                            );
                            let form = start_form::StartForm::new(
                                Arc::new(helper),
                                d.unwrap_or_default(),
                                editor,
                                suggest,
                            );
                            println!("Describe the task, then /go. Type /help for commands.");
                            match form.run(&mut lines).await? {
                                Some(req) => (req.description, req.goals),
                                None => return Ok(()),
                            }
                        }
                    };
                    let agent = agent_loop.create(&name, &description, &editor)?;
                    if let Err(e) = client.create(&agent).await {
                        warn!(error = %e, "could not register session");
                    }
                }
            }
            console::Console::new(agent_loop, client.clone(), store)
                .run(auto, &mut lines)
                .await?;
        }
        Commands::Sessions(cmd) => match cmd {
            SessionsCmd::List => {
                let policy = session::ArchivePolicy::default();
                let now = chrono::Utc::now();
                for s in client.list().await? {
                    let tag = if policy.is_archived(s.created, now) { " [archived]" } else { "" };
                    println!(
                        "{}  {}  {}: {}{}",
                        s.created.format("%Y-%m-%d %H:%M"),
                        s.agent_id,
                        s.ai_name,
                        s.ai_role,
                        tag
                    );
                }
            }
            SessionsCmd::Show { id } => {
                let agent = client.get(&id).await?;
                println!("{}", serde_json::to_string_pretty(&agent)?);
            }
            SessionsCmd::Delete { id } => {
                client.delete(&id).await?;
                println!("Deleted {id}");
            }
        },
        Commands::History(cmd) => {
            let store = open_store()?;
            let mut conversations = with_store(&store, |s| history::ConversationHistory::load(s))?;
            match cmd {
                HistoryCmd::List => {
                    for e in conversations.entries() {
                        println!(
                            "{}  {}  {}\n    {}",
                            e.saved_at().format("%Y-%m-%d %H:%M"),
                            e.id,
                            e.agent.name,
                            e.summary
                        );
                    }
                }
                HistoryCmd::Show { id } => {
                    let entry = conversations
                        .get(&id)
                        .with_context(|| format!("no conversation {id}"))?;
                    println!("{}", history::transcript(entry));
                }
                HistoryCmd::Export { id, out } => {
                    let entry = conversations
                        .get(&id)
                        .with_context(|| format!("no conversation {id}"))?;
                    let path =
                        out.unwrap_or_else(|| PathBuf::from(history::export_file_name(entry)));
                    std::fs::write(&path, serde_json::to_string_pretty(&history::export(entry))?)?;
                    println!("Wrote {}", path.display());
                }
                HistoryCmd::Delete { id } => {
                    if !conversations.delete(&id) {
                        anyhow::bail!("no conversation {id}");
                    }
                    with_store(&store, |s| conversations.save(s))??;
                }
                HistoryCmd::Clear => {
                    conversations.clear();
                    with_store(&store, |s| s.remove(local_store::KEY_CONVERSATIONS))??;
                }
            }
        }
        Commands::Settings(cmd) => {
            let settings = SettingsHandle::persistent(open_store()?);
            if let SettingsCmd::Set {
                openai_key,
                openrouter_key,
                model,
                provider,
                free_tier,
            } = cmd
            {
                let patch = SettingsPatch {
                    openai_key,
                    openrouter_key,
                    gpt_model: model,
                    selected_provider: provider,
                    auto_use_free_tier: free_tier,
                };
                settings.update(|s| s.apply_patch(patch))?;
                info!("settings updated");
            }
            let s = settings.snapshot();
            println!("provider:        {}", s.selected_provider.as_str());
            println!("model:           {}", s.gpt_model);
            println!("openai key:      {}", mask(s.openai_key.as_deref()));
            println!("openrouter key:  {}", mask(s.openrouter_key.as_deref()));
            println!("free tier:       {}", s.auto_use_free_tier);
            if s.must_set_key && !s.has_credential() {
                println!("A key is required to keep running agents.");
            }
        }
        Commands::Models => {
            let settings = SettingsHandle::persistent(open_store()?).snapshot();
            let key = settings
                .openrouter_key
                .or_else(|| std::env::var("OPENROUTER_API_KEY").ok())
                .unwrap_or_default();
            for m in OpenRouterConnector::from_env().connect(&key).list_models().await {
                println!("{:<45} {:>8}  {}", m.id, m.context_length, m.name);
            }
        }
        Commands::ValidateKey { key } => {
            let key = match key {
                Some(k) => k,
                None => SettingsHandle::persistent(open_store()?)
                    .snapshot()
                    .openrouter_key
                    .context("no OpenRouter key configured")?,
            };
            if !OpenRouterClient::looks_like_openrouter_key(&key) {
                anyhow::bail!("that does not look like an OpenRouter key (expected `sk-or-…`)");
            }
            let valid = OpenRouterConnector::from_env().connect(&key).validate_key().await;
            println!("{}", if valid { "key is valid" } else { "key was rejected" });
            if !valid {
                std::process::exit(1);
            }
        }
        Commands::Files { agent_id } => {
            for f in client.files(&agent_id).await? {
                println!("{f}");
            }
        }
        Commands::Dismiss { banner } => dismiss(&*open_store()?, &banner)?,
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dismissed_banner_survives_reopening_the_store() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("local.json");
        let store = Mutex::new(LocalStore::open(&path).unwrap());
        dismiss(&store, "about").unwrap();
        dismiss(&store, "dataset").unwrap();

        let reopened = LocalStore::open(&path).unwrap();
        assert!(reopened.get_flag(KEY_CLOSED_ABOUT));
        assert!(reopened.get_flag(KEY_DISMISSED_DATASET));
    }
}
