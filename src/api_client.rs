//! HTTP client for the Godmode backend: agent steps, sub-goals, files and the
//! session directory.

use std::sync::Arc;

use async_trait::async_trait;
use reqwest::{Method, RequestBuilder, Response};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use tracing::{debug, warn};
use url::Url;

use crate::agent::Agent;
use crate::error::{GodmodeError, Result};
use crate::identity::Identity;
use crate::protocol::{
    FilesRequest, SessionBody, SessionEnvelope, StepRequest, StepResponse, SubgoalsRequest,
    SubgoalsResponse,
};
use crate::session::{sort_newest_first, SessionDirectory, SessionList, SessionSummary};

pub const DEFAULT_API_URL: &str = "http://127.0.0.1:7171";

/// Remote calls the agent loop and the sub-goal helper depend on.
#[async_trait]
pub trait AgentBackend: Send + Sync {
    async fn step(&self, req: &StepRequest) -> Result<StepResponse>;
    async fn subgoals(&self, req: &SubgoalsRequest) -> Result<SubgoalsResponse>;
    async fn files(&self, agent_id: &str) -> Result<Vec<String>>;
}

#[derive(Clone)]
pub struct GodmodeClient {
    base_url: String,
    http: reqwest::Client,
    identity: Arc<dyn Identity>,
}

#[derive(Debug, Deserialize)]
struct ErrorBody {
    message: Option<String>,
    error: Option<serde_json::Value>,
}

impl GodmodeClient {
    pub fn new(base_url: impl Into<String>, identity: Arc<dyn Identity>) -> Self {
        Self {
            base_url: base_url.into(),
            http: reqwest::Client::new(),
            identity,
        }
    }

    /// Backend URL with `segments` appended, each one percent-encoded.
    fn url(&self, segments: &[&str]) -> Result<Url> {
        let invalid = || GodmodeError::BadRequest(format!("invalid backend url {}", self.base_url));
        let mut url = Url::parse(&self.base_url).map_err(|_| invalid())?;
        if !segments.is_empty() {
            url.path_segments_mut()
                .map_err(|_| invalid())?
                .pop_if_empty()
                .extend(segments);
        }
        Ok(url)
    }

    fn request(&self, method: Method, segments: &[&str]) -> Result<RequestBuilder> {
        let rb = self.http.request(method, self.url(segments)?);
        Ok(match self.identity.bearer_token() {
            Some(token) => rb.bearer_auth(token),
            None => rb,
        })
    }

    async fn send<R: DeserializeOwned>(&self, rb: RequestBuilder) -> Result<R> {
        let resp = check_status(rb.send().await?).await?;
        Ok(resp.json::<R>().await?)
    }

    async fn post<B, R>(&self, segments: &[&str], body: &B) -> Result<R>
    where
        B: Serialize + ?Sized,
        R: DeserializeOwned,
    {
        self.send(self.request(Method::POST, segments)?.json(body)).await
    }
}

/// Turns a non-2xx response into `GodmodeError::Provider`, preferring the
/// server's `message`, then `error`, then the raw body.
async fn check_status(resp: Response) -> Result<Response> {
    let status = resp.status();
    if status.is_success() {
        return Ok(resp);
    }
    let text = resp.text().await.unwrap_or_default();
    let message = serde_json::from_str::<ErrorBody>(&text)
        .ok()
        .and_then(|b| {
            b.message.or_else(|| match b.error {
                Some(serde_json::Value::String(s)) => Some(s),
                Some(other) => other.get("message").and_then(|m| m.as_str()).map(str::to_string),
                None => None,
            })
        })
        .or_else(|| Some(text.trim().to_string()).filter(|t| !t.is_empty()))
        .unwrap_or_else(|| format!("HTTP {}", status.as_u16()));
    warn!(status = status.as_u16(), %message, "backend call failed");
    Err(GodmodeError::provider(status.as_u16(), message))
}

#[async_trait]
impl AgentBackend for GodmodeClient {
    async fn step(&self, req: &StepRequest) -> Result<StepResponse> {
        debug!(agent_id = %req.agent_id, command = %req.command, "agent step");
        self.post(&[], req).await
    }

    async fn subgoals(&self, req: &SubgoalsRequest) -> Result<SubgoalsResponse> {
        if req.description.trim().is_empty() {
            return Err(GodmodeError::Validation("Description is required".into()));
        }
        self.post(&["goal-subgoals"], req).await
    }

    async fn files(&self, agent_id: &str) -> Result<Vec<String>> {
        self.post(&["files"], &FilesRequest { agent_id: agent_id.to_string() })
            .await
    }
}

#[async_trait]
impl SessionDirectory for GodmodeClient {
    async fn list(&self) -> Result<Vec<SessionSummary>> {
        let list: SessionList = self.post(&["sessions"], &serde_json::json!({})).await?;
        let mut sessions = list.sessions;
        sort_newest_first(&mut sessions);
        Ok(sessions)
    }

    async fn get(&self, id: &str) -> Result<Agent> {
        let rb = self.request(Method::GET, &["sessions", id])?;
        match self.send::<SessionEnvelope>(rb).await {
            Ok(env) => Ok(env.session.into_agent()),
            Err(GodmodeError::Provider { status: 404, .. }) => {
                Err(GodmodeError::NotFound(id.to_string()))
            }
            Err(e) => Err(e),
        }
    }

    async fn create(&self, agent: &Agent) -> Result<()> {
        if agent.id.is_empty() {
            return Err(GodmodeError::BadRequest("agent has no identifier".into()));
        }
        let body = SessionBody { agent: Some(agent.clone()) };
        let _: serde_json::Value = self.post(&["sessions"], &body).await?;
        Ok(())
    }

    async fn update(&self, id: &str, agent: &Agent) -> Result<()> {
        let body = SessionBody { agent: Some(agent.clone()) };
        let rb = self.request(Method::PUT, &["sessions", id])?.json(&body);
        let _: serde_json::Value = self.send(rb).await?;
        Ok(())
    }

    async fn delete(&self, id: &str) -> Result<()> {
        let rb = self.request(Method::DELETE, &["sessions", id])?;
        match self.send::<serde_json::Value>(rb).await {
            Ok(_) => Ok(()),
            Err(GodmodeError::Provider { status: 404, .. }) => {
                Err(GodmodeError::NotFound(id.to_string()))
            }
            Err(e) => Err(e),
        }
    }
}
