use std::collections::{HashMap, HashSet};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;

use axum::extract::rejection::JsonRejection;
use axum::extract::{Path, Query, Request, State};
use axum::http::StatusCode;
use axum::middleware::{self, Next};
use axum::response::Response;
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tower_http::cors::CorsLayer;
use tower_http::services::ServeDir;
use tower_http::trace::TraceLayer;
use tracing::{info, warn};

use crate::error::{json_error, AppError};
use crate::graph::{ChoiceEdge, NodeId};
use crate::interactions::{Interaction, InteractionLog};
use crate::realtime;
use crate::story::{StoryService, CHOICE_SELECTED_MESSAGE};

pub const API_KEY_HEADER: &str = "x-api-key";

pub struct AppState {
    pub start_time: Instant,
    pub story: Arc<StoryService>,
    pub interactions: InteractionLog,
    pub access: AccessPolicy,
}

/// Request admission rules applied before any handler runs.
#[derive(Clone, Default)]
pub struct AccessPolicy {
    api_key_digest: Option<[u8; 32]>,
    blocked_paths: HashSet<String>,
}

impl AccessPolicy {
    pub fn new(api_key: Option<&str>, blocked_paths: &[String]) -> Self {
        Self {
            api_key_digest: api_key.filter(|k| !k.is_empty()).map(digest),
            blocked_paths: blocked_paths.iter().cloned().collect(),
        }
    }

    pub fn requires_key(&self) -> bool {
        self.api_key_digest.is_some()
    }

    fn key_matches(&self, presented: &str) -> bool {
        match self.api_key_digest {
            Some(expected) => digest(presented) == expected,
            None => true,
        }
    }

    fn is_blocked(&self, path: &str) -> bool {
        self.blocked_paths.contains(path)
    }
}

fn digest(s: &str) -> [u8; 32] {
    Sha256::digest(s.as_bytes()).into()
}

#[derive(Serialize)]
struct Health {
    status: &'static str,
}

#[derive(Serialize)]
struct StartStoryResponse {
    story_id: String,
    initial_choice_type: String,
    initial_choices: Vec<String>,
    root_node_id: NodeId,
}

#[derive(Deserialize)]
pub struct GenerateChoicesRequest {
    pub story_id: String,
    pub current_node_id: NodeId,
    pub user_choice: String,
}

#[derive(Serialize)]
struct GenerateChoicesResponse {
    next_choice_type: String,
    choices: Vec<String>,
    next_node_id: NodeId,
}

#[derive(Deserialize)]
pub struct SelectChoiceRequest {
    pub story_id: String,
    pub current_node_id: NodeId,
    pub choice_text: String,
}

#[derive(Serialize)]
struct SelectChoiceResponse {
    message: &'static str,
    next_node_id: NodeId,
}

#[derive(Deserialize)]
pub struct StartStoryRequest {
    pub story_id: String,
}

#[derive(Serialize)]
struct FinalStoryResponse {
    story_intro: String,
}

#[derive(Serialize)]
struct ContextResponse {
    story_id: String,
    context: String,
}

#[derive(Serialize)]
struct ChoicesResponse {
    node_id: NodeId,
    choices: Vec<ChoiceEdge>,
}

fn require(field: &str, value: &str) -> Result<(), AppError> {
    if value.trim().is_empty() {
        return Err(AppError::InvalidInput(format!("{} must not be empty", field)));
    }
    Ok(())
}

pub fn build_router(state: Arc<AppState>, static_dir: Option<PathBuf>) -> Router {
    let protected = Router::new()
        .route("/story/start", post(story_start))
        .route("/story/next-choices", post(story_next_choices))
        .route("/story/select-choice", post(story_select_choice))
        .route("/story/start-story", post(story_final))
        .route("/story/:story_id/context", get(story_context))
        .route("/story/nodes/:node_id/choices", get(story_node_choices))
        .route("/status", get(status))
        .route("/interactions", get(interaction_list))
        .route("/interactions/:id", get(interaction_get))
        .route("/ws", get(realtime::ws_handler))
        .route_layer(middleware::from_fn_with_state(state.clone(), require_api_key));

    let mut router = Router::new().route("/health", get(health)).merge(protected);
    if let Some(dir) = static_dir {
        router = router.fallback_service(ServeDir::new(dir));
    }
    router
        .layer(middleware::from_fn_with_state(state.clone(), block_paths))
        .layer(middleware::from_fn(log_requests))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}

async fn health() -> Json<Health> {
    Json(Health { status: "healthy" })
}

async fn status(State(state): State<Arc<AppState>>) -> Json<serde_json::Value> {
    let uptime_ms = state.start_time.elapsed().as_millis() as u64;
    Json(serde_json::json!({ "uptime_ms": uptime_ms, "model": state.story.model() }))
}

async fn story_start(State(state): State<Arc<AppState>>) -> Result<Json<StartStoryResponse>, AppError> {
    let start = state.story.start_story().await?;
    Ok(Json(StartStoryResponse { story_id: start.story_id, initial_choice_type: start.choice_type, initial_choices: start.choices, root_node_id: start.root_node_id }))
}

async fn story_next_choices(State(state): State<Arc<AppState>>, payload: Result<Json<GenerateChoicesRequest>, JsonRejection>) -> Result<Json<GenerateChoicesResponse>, AppError> {
    let Json(req) = payload?;
    require("story_id", &req.story_id)?;
    require("user_choice", &req.user_choice)?;
    let next = state.story.next_choices(&req.story_id, req.current_node_id, &req.user_choice).await?;
    Ok(Json(GenerateChoicesResponse { next_choice_type: next.next_choice_type, choices: next.choices, next_node_id: next.next_node_id }))
}

async fn story_select_choice(State(state): State<Arc<AppState>>, payload: Result<Json<SelectChoiceRequest>, JsonRejection>) -> Result<Json<SelectChoiceResponse>, AppError> {
    let Json(req) = payload?;
    require("story_id", &req.story_id)?;
    require("choice_text", &req.choice_text)?;
    let next_node_id = state.story.select_choice(&req.story_id, req.current_node_id, &req.choice_text).await?;
    Ok(Json(SelectChoiceResponse { message: CHOICE_SELECTED_MESSAGE, next_node_id }))
}

async fn story_final(State(state): State<Arc<AppState>>, payload: Result<Json<StartStoryRequest>, JsonRejection>) -> Result<Json<FinalStoryResponse>, AppError> {
    let Json(req) = payload?;
    require("story_id", &req.story_id)?;
    let story_intro = state.story.final_story(&req.story_id).await?;
    Ok(Json(FinalStoryResponse { story_intro }))
}

async fn story_context(State(state): State<Arc<AppState>>, Path(story_id): Path<String>) -> Result<Json<ContextResponse>, AppError> {
    let context = state.story.context(&story_id).await?;
    Ok(Json(ContextResponse { story_id, context }))
}

async fn story_node_choices(State(state): State<Arc<AppState>>, Path(node_id): Path<NodeId>) -> Result<Json<ChoicesResponse>, AppError> {
    let choices = state.story.choices_from(node_id).await?;
    Ok(Json(ChoicesResponse { node_id, choices }))
}

#[derive(Deserialize)]
struct ListParams {
    limit: Option<usize>,
}

async fn interaction_list(State(state): State<Arc<AppState>>, Query(params): Query<ListParams>) -> Result<Json<serde_json::Value>, AppError> {
    let items = state.interactions.recent(params.limit.unwrap_or(20).min(200)).map_err(AppError::Graph)?;
    Ok(Json(serde_json::json!({ "interactions": items })))
}

async fn interaction_get(State(state): State<Arc<AppState>>, Path(id): Path<u64>) -> Result<Json<Interaction>, AppError> {
    match state.interactions.get(id).map_err(AppError::Graph)? {
        Some(rec) => Ok(Json(rec)),
        None => Err(AppError::NotFound(format!("interaction {} not found", id))),
    }
}

async fn require_api_key(State(state): State<Arc<AppState>>, req: Request, next: Next) -> Response {
    if !state.access.requires_key() {
        return next.run(req).await;
    }
    // Browsers cannot set headers on a WebSocket upgrade, so the query string is accepted too.
    let presented = req
        .headers()
        .get(API_KEY_HEADER)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string)
        .or_else(|| Query::<HashMap<String, String>>::try_from_uri(req.uri()).ok().and_then(|Query(mut q)| q.remove("api_key")));
    match presented {
        None => json_error(StatusCode::UNAUTHORIZED, "UNAUTHORIZED", "missing API key", None),
        Some(key) if !state.access.key_matches(&key) => {
            warn!(path = %req.uri().path(), "rejected request with invalid API key");
            json_error(StatusCode::FORBIDDEN, "FORBIDDEN", "could not validate credentials", None)
        }
        Some(_) => next.run(req).await,
    }
}

async fn block_paths(State(state): State<Arc<AppState>>, req: Request, next: Next) -> Response {
    if state.access.is_blocked(req.uri().path()) {
        return json_error(StatusCode::FORBIDDEN, "FORBIDDEN", "Forbidden", None);
    }
    next.run(req).await
}

async fn log_requests(req: Request, next: Next) -> Response {
    let started = Instant::now();
    let method = req.method().clone();
    let path = req.uri().path().to_string();
    let resp = next.run(req).await;
    info!(%method, %path, status = resp.status().as_u16(), elapsed_ms = started.elapsed().as_millis() as u64, "request handled");
    resp
}
