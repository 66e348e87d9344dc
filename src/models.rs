use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::error::{GodmodeError, Result};
use crate::settings::{resolve_params, ModelParams};

pub const DEFAULT_BASE_URL: &str = "https://openrouter.ai/api/v1";
const APP_TITLE: &str = "Godmode Enhanced";
const APP_REFERER: &str = "https://godmode.space";

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ChatMessage {
    pub role: String,
    pub content: String,
}

impl ChatMessage {
    pub fn new(role: impl Into<String>, content: impl Into<String>) -> Self {
        Self { role: role.into(), content: content.into() }
    }

    pub fn system(content: impl Into<String>) -> Self {
        Self::new("system", content)
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self::new("user", content)
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self::new("assistant", content)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Completion {
    #[serde(default)]
    pub choices: Vec<Choice>,
    #[serde(default)]
    pub model: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Choice {
    pub message: ChoiceMessage,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChoiceMessage {
    #[serde(default)]
    pub content: Option<String>,
}

impl Completion {
    /// Content of the first choice, empty when absent.
    pub fn content(&self) -> &str {
        self.choices
            .first()
            .and_then(|c| c.message.content.as_deref())
            .unwrap_or("")
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ModelInfo {
    pub id: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub context_length: u64,
}

/// Models offered when the provider catalogue is unreachable.
pub fn free_models() -> Vec<ModelInfo> {
    let m = |id: &str, name: &str, description: &str, context_length: u64| ModelInfo {
        id: id.into(),
        name: name.into(),
        description: description.into(),
        context_length,
    };
    vec![
        m(
            "deepseek/deepseek-chat-v3.1:free",
            "DeepSeek V3.1 (Free)",
            "Large hybrid reasoning model supporting thinking and non-thinking modes.",
            164_000,
        ),
        m(
            "deepseek/deepseek-r1:free",
            "DeepSeek R1 (Free)",
            "Open reasoning model with fully open reasoning tokens.",
            164_000,
        ),
        m(
            "deepseek/deepseek-chat-v3-0324:free",
            "DeepSeek V3 (Free)",
            "Mixture-of-experts flagship chat model.",
            164_000,
        ),
        m(
            "tngtech/deepseek-r1t2-chimera:free",
            "DeepSeek R1T2 Chimera (Free)",
            "Supports contexts up to 60k tokens with consistent reasoning behaviour.",
            164_000,
        ),
        m(
            "zai/glm-4.5-air:free",
            "GLM 4.5 Air (Free)",
            "Fast general-purpose model.",
            128_000,
        ),
    ]
}

#[async_trait]
pub trait LanguageModel: Send + Sync {
    async fn complete(
        &self,
        model: &str,
        messages: &[ChatMessage],
        options: &ModelParams,
    ) -> Result<Completion>;

    async fn list_models(&self) -> Vec<ModelInfo>;

    /// Makes a tiny completion; any failure counts as an invalid key.
    async fn validate_key(&self) -> bool {
        let greeting = [ChatMessage::user("Hello")];
        let options = ModelParams { max_tokens: Some(5), ..Default::default() };
        match self.complete(&free_models()[0].id, &greeting, &options).await {
            Ok(c) => !c.content().is_empty(),
            Err(e) => {
                warn!(error = %e, "api key validation failed");
                false
            }
        }
    }
}

/// Builds a model client for a caller-supplied key.
pub trait ModelConnector: Send + Sync {
    fn connect(&self, api_key: &str) -> Arc<dyn LanguageModel>;
}

#[derive(Debug, Clone)]
pub struct OpenRouterConnector {
    pub base_url: String,
}

impl OpenRouterConnector {
    pub fn from_env() -> Self {
        let base_url =
            std::env::var("OPENROUTER_BASE_URL").unwrap_or_else(|_| DEFAULT_BASE_URL.into());
        Self { base_url }
    }
}

impl ModelConnector for OpenRouterConnector {
    fn connect(&self, api_key: &str) -> Arc<dyn LanguageModel> {
        Arc::new(OpenRouterClient::new(self.base_url.clone(), api_key))
    }
}

/// OpenAI-compatible chat completion client (OpenRouter by default).
#[derive(Clone)]
pub struct OpenRouterClient {
    base_url: String,
    api_key: String,
    http: reqwest::Client,
}

impl OpenRouterClient {
    pub fn new(base_url: impl Into<String>, api_key: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
            api_key: api_key.into(),
            http: reqwest::Client::new(),
        }
    }

    /// Cheap syntactic check, no network.
    pub fn looks_like_openrouter_key(key: &str) -> bool {
        key.starts_with("sk-or-") && key.len() > 20
    }

    fn endpoint(&self, path: &str) -> String {
        format!("{}/{}", self.base_url.trim_end_matches('/'), path)
    }
}

#[derive(Debug, Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: &'a [ChatMessage],
    temperature: f32,
    max_tokens: u32,
    top_p: f32,
    stream: bool,
}

#[derive(Debug, Deserialize)]
struct ProviderErrorBody {
    error: Option<ProviderErrorDetail>,
}

#[derive(Debug, Deserialize)]
struct ProviderErrorDetail {
    message: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ModelList {
    data: Option<Vec<ModelInfo>>,
}

#[async_trait]
impl LanguageModel for OpenRouterClient {
    async fn complete(
        &self,
        model: &str,
        messages: &[ChatMessage],
        options: &ModelParams,
    ) -> Result<Completion> {
        let params = resolve_params(&ModelParams::default(), options);
        let body = ChatRequest {
            model,
            messages,
            temperature: params.temperature,
            max_tokens: params.max_tokens,
            top_p: params.top_p,
            stream: false,
        };
        debug!(model, messages = messages.len(), "chat completion");
        let resp = self
            .http
            .post(self.endpoint("chat/completions"))
            .bearer_auth(&self.api_key)
            .header("HTTP-Referer", APP_REFERER)
            .header("X-Title", APP_TITLE)
            .json(&body)
            .send()
            .await?;
        let status = resp.status();
        if !status.is_success() {
            let message = resp
                .json::<ProviderErrorBody>()
                .await
                .ok()
                .and_then(|b| b.error)
                .and_then(|e| e.message)
                .unwrap_or_else(|| format!("HTTP {}", status.as_u16()));
            return Err(GodmodeError::provider(status.as_u16(), message));
        }
        Ok(resp.json::<Completion>().await?)
    }

    async fn list_models(&self) -> Vec<ModelInfo> {
        let resp = self
            .http
            .get(self.endpoint("models"))
            .bearer_auth(&self.api_key)
            .send()
            .await;
        let resp = match resp {
            Ok(r) if r.status().is_success() => r,
            Ok(r) => {
                warn!(status = r.status().as_u16(), "model listing failed, using free models");
                return free_models();
            }
            Err(e) => {
                warn!(error = %e, "model listing failed, using free models");
                return free_models();
            }
        };
        match resp.json::<ModelList>().await {
            Ok(ModelList { data: Some(models) }) => models,
            _ => free_models(),
        }
    }
}
