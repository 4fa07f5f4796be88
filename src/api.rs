//! HTTP surface: REST contract, WebSocket upgrades, SSE tails, and the
//! git transport, composed into one router over shared state.

use std::sync::Arc;

use axum::{
    Json, Router,
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
};
use serde::{Deserialize, Serialize};

use crate::cards::{ApproveOutcome, CardService};
use crate::config::Config;
use crate::debugger::DebugController;
use crate::engine::PipelineEngine;
use crate::errors::{DispatchError, GitHostError, StoreError};
use crate::gateway::ws::PoolStatsFeed;
use crate::gateway::{sse, ws};
use crate::githost::{GitHost, assets, http as git_http};
use crate::queue::{JobQueue, QueuedJob};
use crate::runner::RunnerRegistry;
use crate::runner::session::runner_ws_handler;
use crate::store::Store;
use crate::store::models::{CardStatus, Step, StepConfig, TriggerDef};
use crate::triggers::TriggerService;

// ── Shared application state ──────────────────────────────────────────

pub struct AppState {
    pub store: Store,
    pub config: Config,
    pub githost: Arc<GitHost>,
    pub queue: Arc<JobQueue>,
    pub registry: Arc<RunnerRegistry>,
    pub engine: Arc<PipelineEngine>,
    pub cards: CardService,
    pub debugger: Arc<DebugController>,
    pub triggers: Arc<TriggerService>,
    pub pool_feed: Arc<PoolStatsFeed>,
}

pub type SharedState = Arc<AppState>;

// ── Error handling ────────────────────────────────────────────────────

/// User-visible failure: a short human message plus a stable kind code.
pub struct ApiError {
    status: StatusCode,
    kind: &'static str,
    message: String,
}

impl ApiError {
    pub fn not_found(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::NOT_FOUND,
            kind: "not_found",
            message: message.into(),
        }
    }

    pub fn bad_request(kind: &'static str, message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::BAD_REQUEST,
            kind,
            message: message.into(),
        }
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::INTERNAL_SERVER_ERROR,
            kind: "internal",
            message: message.into(),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (
            self.status,
            Json(serde_json::json!({"error": self.message, "kind": self.kind})),
        )
            .into_response()
    }
}

impl From<StoreError> for ApiError {
    fn from(e: StoreError) -> Self {
        let status = match &e {
            StoreError::NotFound { .. } => StatusCode::NOT_FOUND,
            StoreError::AlreadyExists(_) | StoreError::TransitionLost { .. } => {
                StatusCode::CONFLICT
            }
            StoreError::InvalidTransition { .. } | StoreError::Validation(_) => {
                StatusCode::BAD_REQUEST
            }
            StoreError::Database(_) | StoreError::LockPoisoned => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        };
        Self {
            status,
            kind: e.kind(),
            message: e.to_string(),
        }
    }
}

impl From<GitHostError> for ApiError {
    fn from(e: GitHostError) -> Self {
        let status = match &e {
            GitHostError::NotIngested(_) => StatusCode::CONFLICT,
            GitHostError::InvalidRef(_) | GitHostError::BranchNotFound(_) => {
                StatusCode::BAD_REQUEST
            }
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        Self {
            status,
            kind: e.kind(),
            message: e.to_string(),
        }
    }
}

impl From<DispatchError> for ApiError {
    fn from(e: DispatchError) -> Self {
        Self {
            status: StatusCode::CONFLICT,
            kind: e.kind(),
            message: e.to_string(),
        }
    }
}

type ApiResult<T> = Result<T, ApiError>;

// ── Request/response payloads ─────────────────────────────────────────

#[derive(Deserialize)]
pub struct CreateRepoRequest {
    pub name: String,
    #[serde(default)]
    pub default_branch: Option<String>,
}

#[derive(Deserialize)]
pub struct IngestRequest {
    /// Local directory or git URL to mirror.
    pub source: String,
}

#[derive(Serialize)]
pub struct IngestResponse {
    pub clone_url: String,
}

#[derive(Deserialize)]
pub struct CommitsQuery {
    pub branch: Option<String>,
    pub limit: Option<usize>,
}

#[derive(Deserialize)]
pub struct DiffQuery {
    pub base: String,
    pub head: String,
}

#[derive(Deserialize)]
pub struct CreateCardRequest {
    pub repo_id: i64,
    pub title: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub runner_type: Option<String>,
    #[serde(flatten)]
    pub step: StepConfig,
}

#[derive(Deserialize)]
pub struct UpdateCardRequest {
    pub title: Option<String>,
    pub description: Option<String>,
    pub runner_type: Option<String>,
    #[serde(flatten)]
    pub step: Option<StepConfig>,
}

#[derive(Deserialize)]
pub struct ListCardsQuery {
    pub repo_id: Option<i64>,
    pub status: Option<String>,
}

#[derive(Deserialize)]
pub struct ApproveRequest {
    #[serde(default)]
    pub target: Option<String>,
}

#[derive(Deserialize)]
pub struct RetryRequest {
    #[serde(default)]
    pub auto: bool,
}

#[derive(Deserialize)]
pub struct ScaleRequest {
    pub count: u32,
}

#[derive(Deserialize)]
pub struct CreatePipelineRequest {
    pub repo_id: i64,
    pub name: String,
    pub steps: Vec<Step>,
    #[serde(default)]
    pub triggers: Vec<TriggerDef>,
    #[serde(default)]
    pub is_template: bool,
}

#[derive(Deserialize)]
pub struct UpdatePipelineRequest {
    pub name: String,
    pub steps: Vec<Step>,
    #[serde(default)]
    pub triggers: Vec<TriggerDef>,
}

#[derive(Deserialize)]
pub struct RunPipelineRequest {
    #[serde(default)]
    pub branch: Option<String>,
}

#[derive(Deserialize)]
pub struct DebugRerunRequest {
    pub breakpoints: Vec<i64>,
    #[serde(default)]
    pub use_original_commit: bool,
    #[serde(default)]
    pub commit_sha: Option<String>,
    #[serde(default)]
    pub branch: Option<String>,
}

#[derive(Serialize)]
pub struct DebugRerunResponse {
    pub run_id: i64,
    pub debug_session_id: i64,
    pub token: String,
}

#[derive(Deserialize)]
pub struct CreateAgentFileRequest {
    pub name: String,
    #[serde(default)]
    pub description: String,
    pub content: String,
}

#[derive(Deserialize)]
pub struct UpdateAgentFileRequest {
    pub description: Option<String>,
    pub content: Option<String>,
}

#[derive(Deserialize)]
pub struct PlaygroundRequest {
    pub repo_id: i64,
    #[serde(default)]
    pub runner_type: Option<String>,
    #[serde(flatten)]
    pub step: StepConfig,
}

#[derive(Serialize)]
pub struct PlaygroundResponse {
    pub session: i64,
}

// ── Router ────────────────────────────────────────────────────────────

pub fn api_router() -> Router<SharedState> {
    Router::new()
        .route("/repos", get(list_repos).post(create_repo))
        .route("/repos/{id}", get(get_repo).delete(delete_repo))
        .route("/repos/{id}/ingest", post(ingest_repo))
        .route("/repos/{id}/branches", get(list_branches))
        .route("/repos/{id}/commits", get(list_commits))
        .route("/repos/{id}/diff", get(get_diff))
        .route("/repos/{id}/lazyaf/agents/{name}", get(get_repo_agent))
        .route("/repos/{id}/lazyaf/pipelines/{name}", get(get_repo_pipeline))
        .route("/cards", get(list_cards).post(create_card))
        .route(
            "/cards/{id}",
            get(get_card).patch(update_card).delete(delete_card),
        )
        .route("/cards/{id}/start", post(start_card))
        .route("/cards/{id}/approve", post(approve_card))
        .route("/cards/{id}/reject", post(reject_card))
        .route("/cards/{id}/retry", post(retry_card))
        .route("/jobs/{id}", get(get_job))
        .route("/jobs/{id}/cancel", post(cancel_job))
        .route("/jobs/{id}/logs/stream", get(sse::job_logs_stream))
        .route("/runners", get(list_runners))
        .route("/runners/scale", post(scale_runners))
        .route("/pipelines", get(list_pipelines).post(create_pipeline))
        .route(
            "/pipelines/{id}",
            get(get_pipeline).put(update_pipeline).delete(delete_pipeline),
        )
        .route("/pipelines/{id}/run", post(run_pipeline))
        .route("/pipeline-runs", get(list_runs))
        .route("/pipeline-runs/{id}", get(get_run))
        .route("/pipeline-runs/{id}/cancel", post(cancel_run))
        .route("/pipeline-runs/{id}/debug-rerun", post(debug_rerun))
        .route("/debug/{session}/resume", post(debug_resume))
        .route("/debug/{session}/abort", post(debug_abort))
        .route("/debug/{session}/stream", get(sse::debug_stream))
        .route("/agent-files", get(list_agent_files).post(create_agent_file))
        .route(
            "/agent-files/{id}",
            get(get_agent_file)
                .patch(update_agent_file)
                .delete(delete_agent_file),
        )
        .route("/playground", post(create_playground))
        .route("/playground/{session}/stream", get(sse::playground_stream))
        .route("/ws/runner", get(runner_ws_handler))
        .route("/ws/ui", get(ws::ui_ws_handler))
        .route("/health", get(health))
        .merge(git_http::git_router())
}

async fn health() -> &'static str {
    "ok"
}

// ── Repos ─────────────────────────────────────────────────────────────

async fn create_repo(
    State(state): State<SharedState>,
    Json(req): Json<CreateRepoRequest>,
) -> ApiResult<impl IntoResponse> {
    if req.name.trim().is_empty() {
        return Err(ApiError::bad_request("validation", "repo name is required"));
    }
    let default_branch = req.default_branch.unwrap_or_else(|| "main".to_string());
    let repo = state
        .store
        .create_repo(req.name, default_branch.clone(), state.config.base_url.clone())
        .await?;
    state.githost.init_bare(repo.id, &default_branch).await?;
    Ok((StatusCode::CREATED, Json(repo)))
}

async fn list_repos(State(state): State<SharedState>) -> ApiResult<impl IntoResponse> {
    Ok(Json(state.store.list_repos().await?))
}

async fn get_repo(
    State(state): State<SharedState>,
    Path(id): Path<i64>,
) -> ApiResult<impl IntoResponse> {
    let repo = state
        .store
        .get_repo(id)
        .await?
        .ok_or_else(|| ApiError::not_found(format!("repo {} not found", id)))?;
    Ok(Json(repo))
}

async fn delete_repo(
    State(state): State<SharedState>,
    Path(id): Path<i64>,
) -> ApiResult<impl IntoResponse> {
    let deleted = state.store.delete_repo(id).await?;
    if !deleted {
        return Err(ApiError::not_found(format!("repo {} not found", id)));
    }
    state.githost.delete_repo_dir(id).await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn ingest_repo(
    State(state): State<SharedState>,
    Path(id): Path<i64>,
    Json(req): Json<IngestRequest>,
) -> ApiResult<impl IntoResponse> {
    let repo = state
        .store
        .get_repo(id)
        .await?
        .ok_or_else(|| ApiError::not_found(format!("repo {} not found", id)))?;
    if repo.ingested {
        return Ok((
            StatusCode::OK,
            Json(IngestResponse {
                clone_url: repo.clone_url,
            }),
        ));
    }
    // A fresh bare dir from create_repo would block the mirror clone.
    if state.githost.is_ingested(id) {
        state.githost.delete_repo_dir(id).await?;
    }
    state
        .githost
        .ingest(id, &req.source, &repo.default_branch)
        .await?;
    let repo = state.store.mark_ingested(id).await?;
    tracing::info!(repo_id = id, "repo ingested");
    Ok((
        StatusCode::OK,
        Json(IngestResponse {
            clone_url: repo.clone_url,
        }),
    ))
}

async fn list_branches(
    State(state): State<SharedState>,
    Path(id): Path<i64>,
) -> ApiResult<impl IntoResponse> {
    Ok(Json(state.githost.list_branches(id).await?))
}

async fn list_commits(
    State(state): State<SharedState>,
    Path(id): Path<i64>,
    Query(query): Query<CommitsQuery>,
) -> ApiResult<impl IntoResponse> {
    let branch = match query.branch {
        Some(branch) => branch,
        None => {
            state
                .store
                .get_repo(id)
                .await?
                .ok_or_else(|| ApiError::not_found(format!("repo {} not found", id)))?
                .default_branch
        }
    };
    let commits = state
        .githost
        .commits(id, &branch, query.limit.unwrap_or(50))
        .await?;
    Ok(Json(commits))
}

async fn get_diff(
    State(state): State<SharedState>,
    Path(id): Path<i64>,
    Query(query): Query<DiffQuery>,
) -> ApiResult<impl IntoResponse> {
    Ok(Json(state.githost.diff(id, &query.base, &query.head).await?))
}

async fn get_repo_agent(
    State(state): State<SharedState>,
    Path((id, name)): Path<(i64, String)>,
) -> ApiResult<impl IntoResponse> {
    let repo = state
        .store
        .get_repo(id)
        .await?
        .ok_or_else(|| ApiError::not_found(format!("repo {} not found", id)))?;
    let asset = assets::read_repo_agent(&state.githost, id, &repo.default_branch, &name)
        .await?
        .ok_or_else(|| ApiError::not_found(format!("agent '{}' not found in repo", name)))?;
    Ok(Json(asset))
}

async fn get_repo_pipeline(
    State(state): State<SharedState>,
    Path((id, name)): Path<(i64, String)>,
) -> ApiResult<impl IntoResponse> {
    let repo = state
        .store
        .get_repo(id)
        .await?
        .ok_or_else(|| ApiError::not_found(format!("repo {} not found", id)))?;
    let asset = assets::read_repo_pipeline(&state.githost, id, &repo.default_branch, &name)
        .await?
        .ok_or_else(|| ApiError::not_found(format!("pipeline '{}' not found in repo", name)))?;
    Ok(Json(asset))
}

// ── Cards ─────────────────────────────────────────────────────────────

async fn create_card(
    State(state): State<SharedState>,
    Json(req): Json<CreateCardRequest>,
) -> ApiResult<impl IntoResponse> {
    let card = state
        .cards
        .create(
            req.repo_id,
            req.title,
            req.description,
            req.runner_type.unwrap_or_else(|| "any".to_string()),
            req.step,
        )
        .await?;
    Ok((StatusCode::CREATED, Json(card)))
}

async fn list_cards(
    State(state): State<SharedState>,
    Query(query): Query<ListCardsQuery>,
) -> ApiResult<impl IntoResponse> {
    let status = query
        .status
        .as_deref()
        .map(CardStatus::parse)
        .transpose()
        .map_err(|e| ApiError::bad_request("validation", e))?;
    Ok(Json(state.store.list_cards(query.repo_id, status).await?))
}

async fn get_card(
    State(state): State<SharedState>,
    Path(id): Path<i64>,
) -> ApiResult<impl IntoResponse> {
    let card = state
        .store
        .get_card(id)
        .await?
        .ok_or_else(|| ApiError::not_found(format!("card {} not found", id)))?;
    let jobs = state.store.list_jobs_for_card(id).await?;
    Ok(Json(serde_json::json!({"card": card, "jobs": jobs})))
}

async fn update_card(
    State(state): State<SharedState>,
    Path(id): Path<i64>,
    Json(req): Json<UpdateCardRequest>,
) -> ApiResult<impl IntoResponse> {
    let card = state
        .store
        .get_card(id)
        .await?
        .ok_or_else(|| ApiError::not_found(format!("card {} not found", id)))?;
    // Edits are only allowed while the card has not started; running jobs
    // hold their own snapshot regardless.
    if card.status != CardStatus::Todo {
        return Err(ApiError::bad_request(
            "invalid_transition",
            format!("card is {} and cannot be edited", card.status.as_str()),
        ));
    }
    if let Some(ref step) = req.step {
        step.validate()
            .map_err(|e| ApiError::bad_request("validation", e))?;
    }
    let card = state
        .store
        .update_card(id, req.title, req.description, req.runner_type, req.step)
        .await?;
    Ok(Json(card))
}

async fn delete_card(
    State(state): State<SharedState>,
    Path(id): Path<i64>,
) -> ApiResult<impl IntoResponse> {
    if !state.store.delete_card(id).await? {
        return Err(ApiError::not_found(format!("card {} not found", id)));
    }
    Ok(StatusCode::NO_CONTENT)
}

async fn start_card(
    State(state): State<SharedState>,
    Path(id): Path<i64>,
) -> ApiResult<impl IntoResponse> {
    let (card, job) = state.cards.start(id).await?;
    Ok(Json(serde_json::json!({"card": card, "job": job})))
}

async fn approve_card(
    State(state): State<SharedState>,
    Path(id): Path<i64>,
    Json(req): Json<ApproveRequest>,
) -> ApiResult<impl IntoResponse> {
    match state.cards.approve(id, req.target).await? {
        ApproveOutcome::Done { card } => Ok(Json(serde_json::json!({"card": card}))),
        ApproveOutcome::Conflict { card, merge } => Ok(Json(
            serde_json::json!({"card": card, "conflict": merge}),
        )),
    }
}

async fn reject_card(
    State(state): State<SharedState>,
    Path(id): Path<i64>,
) -> ApiResult<impl IntoResponse> {
    Ok(Json(state.cards.reject(id).await?))
}

async fn retry_card(
    State(state): State<SharedState>,
    Path(id): Path<i64>,
    Json(req): Json<RetryRequest>,
) -> ApiResult<impl IntoResponse> {
    Ok(Json(state.cards.retry(id, req.auto).await?))
}

// ── Jobs ──────────────────────────────────────────────────────────────

async fn get_job(
    State(state): State<SharedState>,
    Path(id): Path<i64>,
) -> ApiResult<impl IntoResponse> {
    let job = state
        .store
        .get_job(id)
        .await?
        .ok_or_else(|| ApiError::not_found(format!("job {} not found", id)))?;
    Ok(Json(job))
}

async fn cancel_job(
    State(state): State<SharedState>,
    Path(id): Path<i64>,
) -> ApiResult<impl IntoResponse> {
    state.registry.cancel_job(id, "cancelled").await?;
    let job = state
        .store
        .get_job(id)
        .await?
        .ok_or_else(|| ApiError::not_found(format!("job {} not found", id)))?;
    Ok(Json(job))
}

// ── Runners ───────────────────────────────────────────────────────────

async fn list_runners(State(state): State<SharedState>) -> ApiResult<impl IntoResponse> {
    let runners = state.store.list_runners().await?;
    let stats = state.registry.pool_stats().await?;
    let connected = state.registry.connected_count().await;
    Ok(Json(serde_json::json!({
        "runners": runners,
        "connected": connected,
        "pool": stats,
    })))
}

/// Informational only: actual scaling happens outside the core.
async fn scale_runners(
    State(state): State<SharedState>,
    Json(req): Json<ScaleRequest>,
) -> ApiResult<impl IntoResponse> {
    let connected = state.registry.connected_count().await;
    Ok(Json(serde_json::json!({
        "requested": req.count,
        "connected": connected,
    })))
}

// ── Pipelines ─────────────────────────────────────────────────────────

async fn create_pipeline(
    State(state): State<SharedState>,
    Json(req): Json<CreatePipelineRequest>,
) -> ApiResult<impl IntoResponse> {
    if state.store.get_repo(req.repo_id).await?.is_none() {
        return Err(ApiError::not_found(format!("repo {} not found", req.repo_id)));
    }
    let pipeline = state
        .store
        .create_pipeline(req.repo_id, req.name, req.steps, req.triggers, req.is_template)
        .await?;
    Ok((StatusCode::CREATED, Json(pipeline)))
}

async fn list_pipelines(
    State(state): State<SharedState>,
    Query(query): Query<ListCardsQuery>,
) -> ApiResult<impl IntoResponse> {
    Ok(Json(state.store.list_pipelines(query.repo_id).await?))
}

async fn get_pipeline(
    State(state): State<SharedState>,
    Path(id): Path<i64>,
) -> ApiResult<impl IntoResponse> {
    let pipeline = state
        .store
        .get_pipeline(id)
        .await?
        .ok_or_else(|| ApiError::not_found(format!("pipeline {} not found", id)))?;
    Ok(Json(pipeline))
}

async fn update_pipeline(
    State(state): State<SharedState>,
    Path(id): Path<i64>,
    Json(req): Json<UpdatePipelineRequest>,
) -> ApiResult<impl IntoResponse> {
    if state.store.get_pipeline(id).await?.is_none() {
        return Err(ApiError::not_found(format!("pipeline {} not found", id)));
    }
    let pipeline = state
        .store
        .update_pipeline(id, req.name, req.steps, req.triggers)
        .await?;
    Ok(Json(pipeline))
}

async fn delete_pipeline(
    State(state): State<SharedState>,
    Path(id): Path<i64>,
) -> ApiResult<impl IntoResponse> {
    if !state.store.delete_pipeline(id).await? {
        return Err(ApiError::not_found(format!("pipeline {} not found", id)));
    }
    Ok(StatusCode::NO_CONTENT)
}

async fn run_pipeline(
    State(state): State<SharedState>,
    Path(id): Path<i64>,
    Json(req): Json<RunPipelineRequest>,
) -> ApiResult<impl IntoResponse> {
    let run = state
        .engine
        .start_run(id, "manual", req.branch.clone(), serde_json::json!({}), req.branch)
        .await?;
    Ok((StatusCode::CREATED, Json(run)))
}

// ── Pipeline runs ─────────────────────────────────────────────────────

async fn list_runs(
    State(state): State<SharedState>,
    Query(query): Query<ListRunsQuery>,
) -> ApiResult<impl IntoResponse> {
    Ok(Json(state.store.list_runs(query.pipeline_id).await?))
}

#[derive(Deserialize)]
pub struct ListRunsQuery {
    pub pipeline_id: Option<i64>,
}

async fn get_run(
    State(state): State<SharedState>,
    Path(id): Path<i64>,
) -> ApiResult<impl IntoResponse> {
    let run = state
        .store
        .get_run(id)
        .await?
        .ok_or_else(|| ApiError::not_found(format!("pipeline run {} not found", id)))?;
    let steps = state.store.list_step_runs(id).await?;
    Ok(Json(serde_json::json!({"run": run, "steps": steps})))
}

async fn cancel_run(
    State(state): State<SharedState>,
    Path(id): Path<i64>,
) -> ApiResult<impl IntoResponse> {
    Ok(Json(state.engine.cancel(id).await?))
}

async fn debug_rerun(
    State(state): State<SharedState>,
    Path(id): Path<i64>,
    Json(req): Json<DebugRerunRequest>,
) -> ApiResult<impl IntoResponse> {
    let commit_sha = if req.use_original_commit {
        match req.commit_sha {
            Some(sha) => Some(sha),
            None => state
                .store
                .get_run(id)
                .await?
                .and_then(|run| {
                    run.trigger_context
                        .get("commit_sha")
                        .and_then(|v| v.as_str())
                        .map(|s| s.to_string())
                }),
        }
    } else {
        req.commit_sha
    };
    let (run, session, token) = state
        .engine
        .debug_rerun(id, req.breakpoints, req.branch, commit_sha)
        .await?;
    Ok((
        StatusCode::CREATED,
        Json(DebugRerunResponse {
            run_id: run.id,
            debug_session_id: session.id,
            token,
        }),
    ))
}

async fn debug_resume(
    State(state): State<SharedState>,
    Path(session): Path<i64>,
) -> ApiResult<impl IntoResponse> {
    Ok(Json(state.debugger.resume(session).await?))
}

async fn debug_abort(
    State(state): State<SharedState>,
    Path(session): Path<i64>,
) -> ApiResult<impl IntoResponse> {
    let run_id = state.debugger.abort(session).await?;
    // The engine short-circuits whether parked or mid-step.
    let run = state.engine.cancel(run_id).await?;
    Ok(Json(run))
}

// ── Agent files ───────────────────────────────────────────────────────

async fn create_agent_file(
    State(state): State<SharedState>,
    Json(req): Json<CreateAgentFileRequest>,
) -> ApiResult<impl IntoResponse> {
    let file = state
        .store
        .create_agent_file(req.name, req.description, req.content)
        .await?;
    Ok((StatusCode::CREATED, Json(file)))
}

async fn list_agent_files(State(state): State<SharedState>) -> ApiResult<impl IntoResponse> {
    Ok(Json(state.store.list_agent_files().await?))
}

async fn get_agent_file(
    State(state): State<SharedState>,
    Path(id): Path<i64>,
) -> ApiResult<impl IntoResponse> {
    let file = state
        .store
        .get_agent_file(id)
        .await?
        .ok_or_else(|| ApiError::not_found(format!("agent file {} not found", id)))?;
    Ok(Json(file))
}

async fn update_agent_file(
    State(state): State<SharedState>,
    Path(id): Path<i64>,
    Json(req): Json<UpdateAgentFileRequest>,
) -> ApiResult<impl IntoResponse> {
    if state.store.get_agent_file(id).await?.is_none() {
        return Err(ApiError::not_found(format!("agent file {} not found", id)));
    }
    let file = state
        .store
        .update_agent_file(id, req.description, req.content)
        .await?;
    Ok(Json(file))
}

async fn delete_agent_file(
    State(state): State<SharedState>,
    Path(id): Path<i64>,
) -> ApiResult<impl IntoResponse> {
    if !state.store.delete_agent_file(id).await? {
        return Err(ApiError::not_found(format!("agent file {} not found", id)));
    }
    Ok(StatusCode::NO_CONTENT)
}

// ── Playground ────────────────────────────────────────────────────────

/// A playground session is an ephemeral job: dispatched normally, but its
/// terminal transition touches no card or pipeline, and the result is
/// surfaced over SSE only.
async fn create_playground(
    State(state): State<SharedState>,
    Json(req): Json<PlaygroundRequest>,
) -> ApiResult<impl IntoResponse> {
    req.step
        .validate()
        .map_err(|e| ApiError::bad_request("validation", e))?;
    if state.store.get_repo(req.repo_id).await?.is_none() {
        return Err(ApiError::not_found(format!("repo {} not found", req.repo_id)));
    }
    let (prompt, agent_files) = match &req.step {
        StepConfig::Agent {
            prompt,
            agent_files,
        } => (prompt.clone(), agent_files.clone()),
        _ => (None, Vec::new()),
    };
    let job = state
        .store
        .create_job(
            req.repo_id,
            req.runner_type.unwrap_or_else(|| "any".to_string()),
            req.step,
            prompt,
            agent_files,
            false,
            None,
            true,
            state.config.step_timeout.as_secs(),
        )
        .await?;
    state
        .queue
        .enqueue(QueuedJob {
            job_id: job.id,
            runner_type: job.required_runner_type.clone(),
            pinned_runner_id: None,
        })
        .await;
    Ok((StatusCode::CREATED, Json(PlaygroundResponse { session: job.id })))
}
