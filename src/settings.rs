use std::sync::{Arc, Mutex, RwLock};

use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::local_store::{
    LocalStore, KEY_AUTO_USE_FREE_TIER, KEY_GPT_MODEL, KEY_MUST_SET_KEY, KEY_OPENAI_KEY,
    KEY_OPENROUTER_KEY, KEY_SELECTED_PROVIDER, KEY_USE_OPENROUTER,
};

pub const DEFAULT_MODEL: &str = "deepseek/deepseek-chat-v3.1:free";

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum Provider {
    #[serde(rename = "openai")]
    OpenAi,
    #[default]
    OpenRouter,
}

impl Provider {
    pub fn as_str(&self) -> &'static str {
        match self {
            Provider::OpenAi => "openai",
            Provider::OpenRouter => "openrouter",
        }
    }
}

impl std::str::FromStr for Provider {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "openai" => Ok(Provider::OpenAi),
            "openrouter" => Ok(Provider::OpenRouter),
            other => Err(format!("unknown provider: {other}")),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct ModelParams {
    pub temperature: Option<f32>,
    pub max_tokens: Option<u32>,
    pub top_p: Option<f32>,
}

impl ModelParams {
    pub fn new(temperature: f32, max_tokens: u32) -> Self {
        Self { temperature: Some(temperature), max_tokens: Some(max_tokens), top_p: None }
    }
}

/// Sampling parameters with every field decided.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct EffectiveParams {
    pub temperature: f32,
    pub max_tokens: u32,
    pub top_p: f32,
}

impl Default for EffectiveParams {
    fn default() -> Self {
        Self { temperature: 0.7, max_tokens: 2000, top_p: 1.0 }
    }
}

/// Request values win over configured values, which win over built-in defaults.
pub fn resolve_params(configured: &ModelParams, request: &ModelParams) -> EffectiveParams {
    let defaults = EffectiveParams::default();
    EffectiveParams {
        temperature: request
            .temperature
            .or(configured.temperature)
            .unwrap_or(defaults.temperature),
        max_tokens: request
            .max_tokens
            .or(configured.max_tokens)
            .unwrap_or(defaults.max_tokens),
        top_p: request.top_p.or(configured.top_p).unwrap_or(defaults.top_p),
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Settings {
    pub openai_key: Option<String>,
    pub openrouter_key: Option<String>,
    pub must_set_key: bool,
    pub gpt_model: String,
    pub use_openrouter: bool,
    pub selected_provider: Provider,
    pub auto_use_free_tier: bool,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            openai_key: None,
            openrouter_key: None,
            must_set_key: false,
            gpt_model: DEFAULT_MODEL.to_string(),
            use_openrouter: true,
            selected_provider: Provider::OpenRouter,
            auto_use_free_tier: false,
        }
    }
}

impl Settings {
    pub fn load(store: &LocalStore) -> Self {
        let defaults = Settings::default();
        let non_empty = |key: &str| store.get(key).filter(|v| !v.is_empty()).map(str::to_string);
        let selected_provider = match store.get(KEY_SELECTED_PROVIDER) {
            Some(raw) => raw.parse().unwrap_or_else(|e| {
                warn!(error = %e, "ignoring stored provider");
                defaults.selected_provider
            }),
            None => defaults.selected_provider,
        };
        Self {
            openai_key: non_empty(KEY_OPENAI_KEY),
            openrouter_key: non_empty(KEY_OPENROUTER_KEY),
            must_set_key: store.get_flag(KEY_MUST_SET_KEY),
            gpt_model: non_empty(KEY_GPT_MODEL).unwrap_or(defaults.gpt_model),
            use_openrouter: store.get(KEY_USE_OPENROUTER).map(|v| v != "false").unwrap_or(true),
            selected_provider,
            auto_use_free_tier: store.get_flag(KEY_AUTO_USE_FREE_TIER),
        }
    }

    pub fn save(&self, store: &mut LocalStore) -> anyhow::Result<()> {
        match &self.openai_key {
            Some(k) => store.set(KEY_OPENAI_KEY, k.as_str())?,
            None => store.remove(KEY_OPENAI_KEY)?,
        }
        match &self.openrouter_key {
            Some(k) => store.set(KEY_OPENROUTER_KEY, k.as_str())?,
            None => store.remove(KEY_OPENROUTER_KEY)?,
        }
        store.set_flag(KEY_MUST_SET_KEY, self.must_set_key)?;
        store.set(KEY_GPT_MODEL, self.gpt_model.as_str())?;
        store.set(KEY_USE_OPENROUTER, if self.use_openrouter { "true" } else { "false" })?;
        store.set(KEY_SELECTED_PROVIDER, self.selected_provider.as_str())?;
        store.set_flag(KEY_AUTO_USE_FREE_TIER, self.auto_use_free_tier)?;
        Ok(())
    }

    /// The key for the selected provider, if one is configured.
    pub fn active_key(&self) -> Option<&str> {
        match self.selected_provider {
            Provider::OpenAi => self.openai_key.as_deref(),
            Provider::OpenRouter => self.openrouter_key.as_deref(),
        }
    }

    pub fn has_credential(&self) -> bool {
        self.active_key().is_some_and(|k| !k.is_empty())
    }

    pub fn apply_patch(&mut self, patch: SettingsPatch) {
        if let Some(k) = patch.openai_key {
            self.openai_key = Some(k).filter(|k| !k.is_empty());
        }
        if let Some(k) = patch.openrouter_key {
            self.openrouter_key = Some(k).filter(|k| !k.is_empty());
        }
        if let Some(m) = patch.gpt_model {
            self.gpt_model = m;
        }
        if let Some(p) = patch.selected_provider {
            self.selected_provider = p;
            self.use_openrouter = p == Provider::OpenRouter;
        }
        if let Some(f) = patch.auto_use_free_tier {
            self.auto_use_free_tier = f;
        }
        if self.has_credential() {
            self.must_set_key = false;
        }
    }
}

/// Partial update; `Some("")` clears a key.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct SettingsPatch {
    pub openai_key: Option<String>,
    pub openrouter_key: Option<String>,
    pub gpt_model: Option<String>,
    pub selected_provider: Option<Provider>,
    pub auto_use_free_tier: Option<bool>,
}

/// Shared, explicitly passed settings. Writes go through to the local store
/// when one is attached.
#[derive(Clone)]
pub struct SettingsHandle {
    inner: Arc<RwLock<Settings>>,
    store: Option<Arc<Mutex<LocalStore>>>,
}

impl SettingsHandle {
    pub fn new(settings: Settings) -> Self {
        Self { inner: Arc::new(RwLock::new(settings)), store: None }
    }

    pub fn persistent(store: Arc<Mutex<LocalStore>>) -> Self {
        let settings = match store.lock() {
            Ok(s) => Settings::load(&s),
            Err(_) => Settings::default(),
        };
        Self { inner: Arc::new(RwLock::new(settings)), store: Some(store) }
    }

    pub fn snapshot(&self) -> Settings {
        match self.inner.read() {
            Ok(s) => s.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    pub fn update(&self, f: impl FnOnce(&mut Settings)) -> anyhow::Result<()> {
        let updated = {
            let mut guard = match self.inner.write() {
                Ok(g) => g,
                Err(poisoned) => poisoned.into_inner(),
            };
            f(&mut guard);
            guard.clone()
        };
        if let Some(store) = &self.store {
            let mut store = store.lock().map_err(|_| anyhow::anyhow!("local store lock poisoned"))?;
            updated.save(&mut store)?;
        }
        Ok(())
    }
}
