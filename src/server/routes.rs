//! REST handlers.

use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::Json;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::core::{Event, RuntimeConfig, Task, TaskId, TreeId, TreeSummary, VersionedConfig};
use crate::error::Error;
use crate::orchestration::{ContinueOutcome, FlagScope, PausedTask, Submission};

use super::{ApiError, AppState, SystemState};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubmitRequest {
    pub instruction: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TreesResponse {
    pub all_trees: Vec<TreeSummary>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct MessagesQuery {
    pub since: Option<u64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MessagesResponse {
    pub tree_id: TreeId,
    pub events: Vec<Event>,
    /// Pass back as `since` to resume after the last returned event.
    pub cursor: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PausedResponse {
    pub paused: Vec<PausedTask>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContinueResponse {
    pub task_id: TaskId,
    pub outcome: ContinueOutcome,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FlagRequest {
    pub reason: String,
    /// Also flag every unresolved descendant.
    #[serde(default)]
    pub subtree: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FlagResponse {
    pub flagged: Vec<TaskId>,
}

fn parse_tree_id(raw: &str) -> Result<TreeId, ApiError> {
    raw.parse()
        .map_err(|e| ApiError(Error::Validation(format!("invalid tree id {:?}: {}", raw, e))))
}

pub async fn health(State(state): State<AppState>) -> Json<Value> {
    Json(json!({
        "healthy": true,
        "state": state.system_state().await,
    }))
}

pub async fn system_state(State(state): State<AppState>) -> Json<Value> {
    Json(json!({ "state": state.system_state().await }))
}

pub async fn submit(
    State(state): State<AppState>,
    Json(request): Json<SubmitRequest>,
) -> Result<(StatusCode, Json<Submission>), ApiError> {
    let orchestrator = state.orchestrator().await?;
    let system = state.system_state().await;
    if system != SystemState::Ready {
        return Err(ApiError(Error::NotReady(format!(
            "cannot accept tasks while {}",
            system
        ))));
    }
    let submission = orchestrator.submit(&request.instruction)?;
    Ok((StatusCode::CREATED, Json(submission)))
}

pub async fn all_trees(State(state): State<AppState>) -> Result<Json<TreesResponse>, ApiError> {
    let orchestrator = state.orchestrator().await?;
    Ok(Json(TreesResponse {
        all_trees: orchestrator.trees(),
    }))
}

pub async fn tree(
    State(state): State<AppState>,
    Path(tree_id): Path<String>,
) -> Result<Json<Vec<Task>>, ApiError> {
    let tree_id = parse_tree_id(&tree_id)?;
    let orchestrator = state.orchestrator().await?;
    Ok(Json(orchestrator.tree(tree_id)?))
}

pub async fn messages(
    State(state): State<AppState>,
    Path(tree_id): Path<String>,
    Query(query): Query<MessagesQuery>,
) -> Result<Json<MessagesResponse>, ApiError> {
    let tree_id = parse_tree_id(&tree_id)?;
    let since = query.since.unwrap_or(0);
    let orchestrator = state.orchestrator().await?;
    let events = orchestrator.replay(tree_id, since)?;
    let cursor = events.last().map_or(since, |event| event.sequence);
    Ok(Json(MessagesResponse {
        tree_id,
        events,
        cursor,
    }))
}

pub async fn paused(State(state): State<AppState>) -> Result<Json<PausedResponse>, ApiError> {
    let orchestrator = state.orchestrator().await?;
    Ok(Json(PausedResponse {
        paused: orchestrator.paused(),
    }))
}

pub async fn continue_task(
    State(state): State<AppState>,
    Path(task_id): Path<u64>,
) -> Result<Json<ContinueResponse>, ApiError> {
    let task_id = TaskId(task_id);
    let orchestrator = state.orchestrator().await?;
    let outcome = orchestrator.continue_task(task_id)?;
    Ok(Json(ContinueResponse { task_id, outcome }))
}

pub async fn flag(
    State(state): State<AppState>,
    Path(task_id): Path<u64>,
    Json(request): Json<FlagRequest>,
) -> Result<Json<FlagResponse>, ApiError> {
    if request.reason.trim().is_empty() {
        return Err(ApiError(Error::Validation(
            "reason must not be empty".to_string(),
        )));
    }
    let scope = if request.subtree {
        FlagScope::Subtree
    } else {
        FlagScope::Task
    };
    let orchestrator = state.orchestrator().await?;
    let flagged = orchestrator.flag_for_review(TaskId(task_id), &request.reason, scope)?;
    Ok(Json(FlagResponse { flagged }))
}

pub async fn get_config(
    State(state): State<AppState>,
) -> Result<Json<VersionedConfig>, ApiError> {
    let orchestrator = state.orchestrator().await?;
    Ok(Json(orchestrator.config().as_ref().clone()))
}

pub async fn put_config(
    State(state): State<AppState>,
    Json(config): Json<RuntimeConfig>,
) -> Result<Json<VersionedConfig>, ApiError> {
    let orchestrator = state.orchestrator().await?;
    let updated = orchestrator.update_config(config)?;
    Ok(Json(updated.as_ref().clone()))
}
