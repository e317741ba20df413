//! WebSocket event protocol.
//!
//! Frames are JSON text: `{"event": "<name>", "data": {...}}` in both directions.
//! Events from one socket are handled in arrival order; story text is forwarded as
//! `story_update` events as soon as the model produces it.

use std::net::SocketAddr;
use std::sync::Arc;

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{ConnectInfo, State};
use axum::response::IntoResponse;
use futures_util::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value as JsonValue};
use tokio::sync::mpsc;
use tracing::{info, warn};

use crate::error::AppError;
use crate::graph::NodeId;
use crate::http::AppState;
use crate::story::StoryService;

pub const INVALID_DATA: &str = "Invalid data received.";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServerEvent {
    pub event: String,
    pub data: JsonValue,
}

impl ServerEvent {
    pub fn new(event: &str, data: JsonValue) -> Self {
        Self { event: event.to_string(), data }
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self::new("error", json!({ "message": message.into() }))
    }
}

#[derive(Debug, Deserialize)]
struct ClientFrame {
    event: String,
    #[serde(default)]
    data: JsonValue,
}

#[derive(Debug, Default, Deserialize)]
struct StartStoryData {
    #[serde(default)]
    mode: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct MakeChoiceData {
    story_id: Option<String>,
    user_choice: Option<String>,
    current_node_id: Option<NodeId>,
}

#[derive(Debug, Default, Deserialize)]
struct UserResponseData {
    story_id: Option<String>,
    user_input: Option<String>,
    current_node_id: Option<NodeId>,
}

#[derive(Debug, Default, Deserialize)]
struct FinalStoryData {
    story_id: Option<String>,
}

fn present(v: Option<String>) -> Option<String> {
    v.filter(|s| !s.trim().is_empty())
}

/// Payload of a known event, or `None` when it does not decode.
fn decode<T: serde::de::DeserializeOwned + Default>(data: JsonValue) -> Option<T> {
    if data.is_null() {
        return Some(T::default());
    }
    serde_json::from_value(data).ok()
}

fn failure_event(err: anyhow::Error) -> ServerEvent {
    let err = AppError::classify(err);
    warn!(error = %err, "realtime event failed");
    ServerEvent::error(err.to_string())
}

/// One connected client. Outgoing events go through `out`; a closed channel means the
/// client is gone and any in-flight relay stops.
pub struct Session {
    story: Arc<StoryService>,
    out: mpsc::Sender<ServerEvent>,
}

impl Session {
    pub fn new(story: Arc<StoryService>, out: mpsc::Sender<ServerEvent>) -> Self {
        Self { story, out }
    }

    async fn emit(&self, event: ServerEvent) -> bool {
        self.out.send(event).await.is_ok()
    }

    pub async fn dispatch(&self, text: &str) {
        let frame: ClientFrame = match serde_json::from_str(text) {
            Ok(f) => f,
            Err(_) => {
                self.emit(ServerEvent::error(INVALID_DATA)).await;
                return;
            }
        };
        match frame.event.as_str() {
            "start_story" => self.start_story(decode(frame.data)).await,
            "make_choice" => self.make_choice(decode(frame.data)).await,
            "user_response" => self.user_response(decode(frame.data)).await,
            "get_final_story" => self.get_final_story(decode(frame.data)).await,
            other => {
                self.emit(ServerEvent::error(format!("Unknown event: {}", other))).await;
            }
        }
    }

    async fn start_story(&self, data: Option<StartStoryData>) {
        let Some(data) = data else {
            self.emit(ServerEvent::error(INVALID_DATA)).await;
            return;
        };
        let event = if data.mode.as_deref() == Some("conversation") {
            match self.story.start_conversation().await {
                Ok(t) => ServerEvent::new("llm_question", json!({ "story_id": t.story_id, "question": t.question, "current_node_id": t.node_id })),
                Err(e) => failure_event(e),
            }
        } else {
            match self.story.start_story_realtime().await {
                Ok(s) => ServerEvent::new(
                    "initial_choices",
                    json!({ "story_id": s.story_id, "choice_type": s.choice_type, "choices": s.choices, "current_node_id": s.root_node_id }),
                ),
                Err(e) => failure_event(e),
            }
        };
        self.emit(event).await;
    }

    async fn make_choice(&self, data: Option<MakeChoiceData>) {
        let data = data.unwrap_or_default();
        let (Some(story_id), Some(user_choice), Some(current_node_id)) = (present(data.story_id), present(data.user_choice), data.current_node_id) else {
            self.emit(ServerEvent::error(INVALID_DATA)).await;
            return;
        };

        let turn = match self.story.begin_choice_turn(&story_id, current_node_id, &user_choice).await {
            Ok(t) => t,
            Err(e) => {
                self.emit(failure_event(e)).await;
                return;
            }
        };
        let mut stream = match self.story.stream_continuation(&turn).await {
            Ok(s) => s,
            Err(e) => {
                self.emit(failure_event(e)).await;
                return;
            }
        };
        let mut narrative = String::new();
        while let Some(chunk) = stream.next().await {
            match chunk {
                Ok(delta) => {
                    narrative.push_str(&delta);
                    if !self.emit(ServerEvent::new("story_update", json!({ "content": delta }))).await {
                        return;
                    }
                }
                Err(e) => {
                    self.emit(failure_event(e)).await;
                    return;
                }
            }
        }
        drop(stream);

        let event = match self.story.finish_choice_turn(&turn, &narrative).await {
            Ok(next) => ServerEvent::new(
                "next_choices",
                json!({ "next_choice_type": next.next_choice_type, "choices": next.choices, "current_node_id": next.next_node_id }),
            ),
            Err(e) => failure_event(e),
        };
        self.emit(event).await;
    }

    async fn user_response(&self, data: Option<UserResponseData>) {
        let data = data.unwrap_or_default();
        let (Some(story_id), Some(user_input), Some(current_node_id)) = (present(data.story_id), present(data.user_input), data.current_node_id) else {
            self.emit(ServerEvent::error(INVALID_DATA)).await;
            return;
        };
        let event = match self.story.respond(&story_id, current_node_id, &user_input).await {
            Ok(t) => ServerEvent::new("llm_question", json!({ "story_id": t.story_id, "question": t.question, "current_node_id": t.node_id })),
            Err(e) => failure_event(e),
        };
        self.emit(event).await;
    }

    async fn get_final_story(&self, data: Option<FinalStoryData>) {
        let Some(story_id) = present(data.unwrap_or_default().story_id) else {
            self.emit(ServerEvent::error(INVALID_DATA)).await;
            return;
        };
        let event = match self.story.final_story(&story_id).await {
            Ok(content) => ServerEvent::new("final_story", json!({ "content": content })),
            Err(e) => failure_event(e),
        };
        self.emit(event).await;
    }
}

pub async fn ws_handler(State(state): State<Arc<AppState>>, connect: Option<ConnectInfo<SocketAddr>>, ws: WebSocketUpgrade) -> impl IntoResponse {
    let peer = connect.map(|ConnectInfo(addr)| addr.to_string()).unwrap_or_else(|| "unknown".to_string());
    let story = state.story.clone();
    ws.on_upgrade(move |socket| handle_socket(socket, story, peer))
}

async fn handle_socket(socket: WebSocket, story: Arc<StoryService>, peer: String) {
    info!(%peer, "Client connected");
    let (mut ws_tx, mut ws_rx) = socket.split();
    let (out_tx, mut out_rx) = mpsc::channel::<ServerEvent>(256);

    let writer = tokio::spawn(async move {
        while let Some(event) = out_rx.recv().await {
            let text = match serde_json::to_string(&event) {
                Ok(t) => t,
                Err(e) => {
                    warn!(error = %e, "failed to encode server event");
                    continue;
                }
            };
            if ws_tx.send(Message::Text(text)).await.is_err() {
                break;
            }
        }
    });

    let session = Session::new(story, out_tx);
    while let Some(msg) = ws_rx.next().await {
        match msg {
            Ok(Message::Text(text)) => session.dispatch(&text).await,
            Ok(Message::Close(_)) => break,
            Ok(_) => {}
            Err(err) => {
                warn!(%peer, ?err, "ws recv error");
                break;
            }
        }
        if writer.is_finished() {
            break;
        }
    }

    drop(session);
    if let Err(err) = writer.await {
        if err.is_panic() {
            warn!(%peer, ?err, "writer task panicked");
        }
    }
    info!(%peer, "Client disconnected");
}
