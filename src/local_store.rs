//! Client-local key/value storage, persisted as a single JSON object.
//!
//! Values are plain strings; structured values (the conversation cache) are
//! stored JSON-encoded under their key. Every `set`/`remove` writes the file.

use std::collections::BTreeMap;
use std::path::PathBuf;

use tracing::warn;

pub const KEY_OPENAI_KEY: &str = "openAIKey";
pub const KEY_OPENROUTER_KEY: &str = "openRouterKey";
pub const KEY_USE_OPENROUTER: &str = "useOpenRouter";
pub const KEY_SELECTED_PROVIDER: &str = "selectedProvider";
pub const KEY_GPT_MODEL: &str = "gptModel";
pub const KEY_AUTO_USE_FREE_TIER: &str = "autoUseFreeTier";
pub const KEY_MUST_SET_KEY: &str = "mustSetKey";
pub const KEY_DISMISSED_DATASET: &str = "dismissdataset";
pub const KEY_CLOSED_ABOUT: &str = "closedAbout";
pub const KEY_CONVERSATIONS: &str = "godmode_conversations";

#[derive(Debug)]
pub struct LocalStore {
    path: Option<PathBuf>,
    values: BTreeMap<String, String>,
}

impl LocalStore {
    /// Opens the store at `path`. A missing or unreadable file starts empty.
    pub fn open(path: impl Into<PathBuf>) -> anyhow::Result<Self> {
        let path = path.into();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let values = match std::fs::read_to_string(&path) {
            Ok(raw) => serde_json::from_str(&raw).unwrap_or_else(|e| {
                warn!(path = %path.display(), error = %e, "local store is corrupt, starting empty");
                BTreeMap::new()
            }),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => BTreeMap::new(),
            Err(e) => return Err(e.into()),
        };
        Ok(Self { path: Some(path), values })
    }

    pub fn open_default() -> anyhow::Result<Self> {
        Self::open(data_dir()?.join("local.json"))
    }

    /// A store that never touches disk.
    #[cfg(test)]
    pub fn in_memory() -> Self {
        Self { path: None, values: BTreeMap::new() }
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.values.get(key).map(String::as_str)
    }

    pub fn get_flag(&self, key: &str) -> bool {
        self.get(key) == Some("true")
    }

    pub fn set(&mut self, key: &str, value: impl Into<String>) -> anyhow::Result<()> {
        self.values.insert(key.to_string(), value.into());
        self.flush()
    }

    pub fn set_flag(&mut self, key: &str, value: bool) -> anyhow::Result<()> {
        self.set(key, if value { "true" } else { "" })
    }

    pub fn remove(&mut self, key: &str) -> anyhow::Result<()> {
        if self.values.remove(key).is_some() {
            self.flush()?;
        }
        Ok(())
    }

    fn flush(&self) -> anyhow::Result<()> {
        let Some(path) = &self.path else { return Ok(()) };
        let json = serde_json::to_string_pretty(&self.values)?;
        let tmp = path.with_extension("json.tmp");
        std::fs::write(&tmp, json)?;
        std::fs::rename(&tmp, path)?;
        Ok(())
    }
}

/// `$XDG_DATA_HOME/godmode`, or `~/.local/share/godmode`.
pub fn data_dir() -> anyhow::Result<PathBuf> {
    let base = std::env::var("XDG_DATA_HOME").ok().map(PathBuf::from).unwrap_or_else(|| {
        let home = std::env::var("HOME").unwrap_or_else(|_| ".".into());
        PathBuf::from(home).join(".local").join("share")
    });
    let dir = base.join("godmode");
    std::fs::create_dir_all(&dir)?;
    Ok(dir)
}
