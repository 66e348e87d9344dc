use std::{net::SocketAddr, path::PathBuf, sync::Arc};

use axum::extract::{Path, State};
use axum::http::{header, HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::{routing::post, Json, Router};
use serde::Serialize;
use sha2::{Digest, Sha256};
use tracing::{error, info, warn};

use crate::agent::prompt::{
    build_step_messages, build_subgoal_messages, parse_model_reply, step_params, step_result,
    subgoal_params,
};
use crate::agent::state::AgentStore;
use crate::agent::subgoals::parse_subgoals;
use crate::agent::Agent;
use crate::discovery::{list_agent_files, MAX_LISTED_FILES};
use crate::error::GodmodeError;
use crate::models::{ChatMessage, ModelConnector};
use crate::protocol::{
    CreatedResponse, FilesRequest, SessionBody, SessionEnvelope, StepRequest, StepResponse,
    SubgoalsRequest,
    SubgoalsResponse,
};
use crate::session::SessionList;
use crate::settings::{Provider, DEFAULT_MODEL};
use crate::storage::SessionRepository;

#[derive(Clone)]
pub struct AppState {
    pub repo: Arc<dyn SessionRepository>,
    pub models: Arc<dyn ModelConnector>,
    /// Used when a request carries no key of its own.
    pub fallback_key: Option<String>,
    pub workspace_root: PathBuf,
}

/// JSON error body: `{error, message}` with the mapped status.
#[derive(Debug)]
pub struct ApiError(GodmodeError);

impl From<GodmodeError> for ApiError {
    fn from(e: GodmodeError) -> Self {
        Self(e)
    }
}

#[derive(Serialize)]
struct ErrorBody {
    error: String,
    message: String,
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match &self.0 {
            GodmodeError::Transport(_) | GodmodeError::Decode(_) => StatusCode::BAD_GATEWAY,
            GodmodeError::Storage(_) | GodmodeError::RecoverableAgent(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
            other => other
                .status()
                .and_then(|s| StatusCode::from_u16(s).ok())
                .unwrap_or(StatusCode::INTERNAL_SERVER_ERROR),
        };
        let message = match self.0 {
            GodmodeError::NotFound(m)
            | GodmodeError::BadRequest(m)
            | GodmodeError::Validation(m) => m,
            other => other.to_string(),
        };
        if status.is_server_error() {
            error!(status = status.as_u16(), %message, "request failed");
        }
        (status, Json(ErrorBody { error: message.clone(), message })).into_response()
    }
}

type ApiResult<T> = Result<T, ApiError>;

/// Owner key of the caller. Sessions are owned by a digest of the bearer
/// token; the token itself is never stored.
fn owner(headers: &HeaderMap) -> Option<String> {
    headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .map(str::trim)
        .filter(|t| !t.is_empty())
        .map(owner_key)
}

fn owner_key(token: &str) -> String {
    hex::encode(Sha256::digest(token.as_bytes()))
}

fn missing_key() -> ApiError {
    ApiError(GodmodeError::provider(401, "OpenRouter API key is required"))
}

impl AppState {
    fn step_key(&self, req: &StepRequest) -> Option<String> {
        let preferred = if req.use_openrouter || req.selected_provider == Provider::OpenRouter {
            [&req.openrouter_key, &req.openai_key]
        } else {
            [&req.openai_key, &req.openrouter_key]
        };
        preferred
            .into_iter()
            .flatten()
            .find(|k| !k.trim().is_empty())
            .cloned()
            .or_else(|| self.fallback_key.clone())
    }
}

async fn step(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(req): Json<StepRequest>,
) -> ApiResult<Json<StepResponse>> {
    if req.agent_id.trim().is_empty() {
        return Err(GodmodeError::BadRequest("agent_id is required".into()).into());
    }
    if req.ai_description.trim().is_empty() {
        return Err(GodmodeError::BadRequest("Description is required".into()).into());
    }
    let key = state.step_key(&req).ok_or_else(missing_key)?;
    let model = match req.gpt_model.trim() {
        "" => DEFAULT_MODEL,
        m => m,
    };

    let messages = build_step_messages(&req);
    let completion = state.models.connect(&key).complete(model, &messages, &step_params()).await?;
    let content = completion.content().to_string();
    let reply = parse_model_reply(&content);
    info!(agent_id = %req.agent_id, command = %reply.command, model, "step answered");

    let mut history: Vec<ChatMessage> =
        messages.into_iter().filter(|m| m.role != "system").collect();
    history.push(ChatMessage::assistant(content.clone()));
    let resp = StepResponse {
        command: reply.command,
        arguments: reply.arguments,
        thoughts: Some(reply.thoughts),
        assistant_reply: content,
        message_history: history,
        result: step_result(&req),
        task: reply.task,
    };

    let owner = owner(&headers);
    if let Err(e) = record_step(&state, owner.as_deref(), &req, &resp).await {
        warn!(agent_id = %req.agent_id, error = %e, "could not store session snapshot");
    }
    Ok(Json(resp))
}

/// Folds the step into the stored snapshot so the session shows up in the
/// directory.
async fn record_step(
    state: &AppState,
    owner: Option<&str>,
    req: &StepRequest,
    resp: &StepResponse,
) -> crate::error::Result<()> {
    let agent = match state.repo.get_session(owner, &req.agent_id).await? {
        Some(record) => record.into_agent(),
        None => {
            let mut agent =
                Agent::new(req.ai_name.clone(), req.ai_description.clone(), req.ai_goals.clone());
            agent.id = req.agent_id.clone();
            agent
        }
    };
    let mut store = AgentStore::new();
    store.load(agent);
    store.apply_step(resp);
    if let Some(agent) = store.agent() {
        state.repo.upsert_session(owner, agent).await?;
    }
    Ok(())
}

async fn goal_subgoals(
    State(state): State<AppState>,
    Json(req): Json<SubgoalsRequest>,
) -> ApiResult<Json<SubgoalsResponse>> {
    let key = req
        .open_router_key
        .clone()
        .filter(|k| !k.trim().is_empty())
        .or_else(|| state.fallback_key.clone())
        .ok_or_else(missing_key)?;
    if req.description.trim().is_empty() {
        return Err(GodmodeError::BadRequest("Description is required".into()).into());
    }
    let completion = state
        .models
        .connect(&key)
        .complete(DEFAULT_MODEL, &build_subgoal_messages(req.description.trim()), &subgoal_params())
        .await?;
    let subgoals = parse_subgoals(completion.content());
    info!(count = subgoals.len(), "sub-goals suggested");
    Ok(Json(SubgoalsResponse { subgoals }))
}

async fn files(
    State(state): State<AppState>,
    Json(req): Json<FilesRequest>,
) -> ApiResult<Json<Vec<String>>> {
    let root = state.workspace_root.clone();
    let listing = tokio::task::spawn_blocking(move || {
        list_agent_files(&root, &req.agent_id, MAX_LISTED_FILES)
    })
    .await
    .map_err(|e| GodmodeError::Storage(e.to_string()))??;
    Ok(Json(listing))
}

async fn list_sessions(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> ApiResult<Json<SessionList>> {
    let sessions = state.repo.list_sessions(owner(&headers).as_deref()).await?;
    Ok(Json(SessionList { sessions }))
}

/// `{agent}` creates, an empty body lists.
async fn create_or_list_sessions(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Option<Json<SessionBody>>,
) -> ApiResult<Response> {
    let Some(agent) = body.and_then(|Json(b)| b.agent) else {
        return Ok(list_sessions(State(state), headers).await?.into_response());
    };
    if agent.id.trim().is_empty() {
        return Err(GodmodeError::BadRequest("Agent data is required".into()).into());
    }
    if !state.repo.upsert_session(owner(&headers).as_deref(), &agent).await? {
        return Err(GodmodeError::BadRequest("Session belongs to another user".into()).into());
    }
    info!(agent_id = %agent.id, "session created");
    let created = CreatedResponse { success: true, id: agent.id };
    Ok((StatusCode::CREATED, Json(created)).into_response())
}

fn session_not_found() -> ApiError {
    ApiError(GodmodeError::NotFound("Session not found".into()))
}

async fn get_session(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(id): Path<String>,
) -> ApiResult<Json<SessionEnvelope>> {
    let session = state
        .repo
        .get_session(owner(&headers).as_deref(), &id)
        .await?
        .ok_or_else(session_not_found)?;
    Ok(Json(SessionEnvelope { session }))
}

async fn put_session(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(id): Path<String>,
    Json(body): Json<SessionBody>,
) -> ApiResult<Json<serde_json::Value>> {
    let mut agent = body
        .agent
        .ok_or_else(|| GodmodeError::BadRequest("Agent data is required".into()))?;
    agent.id = id;
    if !state.repo.upsert_session(owner(&headers).as_deref(), &agent).await? {
        return Err(session_not_found());
    }
    Ok(Json(serde_json::json!({ "success": true })))
}

async fn delete_session(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(id): Path<String>,
) -> ApiResult<Json<serde_json::Value>> {
    if !state.repo.delete_session(owner(&headers).as_deref(), &id).await? {
        return Err(session_not_found());
    }
    info!(agent_id = %id, "session deleted");
    Ok(Json(serde_json::json!({ "success": true })))
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/", post(step))
        .route("/goal-subgoals", post(goal_subgoals))
        .route("/files", post(files))
        .route("/sessions", post(create_or_list_sessions).get(list_sessions))
        .route(
            "/sessions/:id",
            axum::routing::get(get_session).put(put_session).delete(delete_session),
        )
        .with_state(state)
}

pub async fn serve(addr: SocketAddr, state: AppState) -> anyhow::Result<()> {
    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!(%addr, "listening");
    axum::serve(listener, router(state))
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
            info!("shutting down");
        })
        .await?;
    Ok(())
}
