//! Language model access.
//!
//! [`MistralClient`] talks to the Mistral chat-completions API. Provider errors are
//! surfaced as-is; nothing here retries.

use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use futures_util::stream::BoxStream;
use futures_util::StreamExt;
use serde_json::{json, Value as JsonValue};
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tracing::{debug, warn};

use crate::config::LlmConfig;
use crate::sse::{SseDecoder, SseFrame};

/// Text deltas in provider order.
pub type TextStream = BoxStream<'static, Result<String>>;

#[derive(Debug, thiserror::Error)]
pub enum LlmError {
    #[error("API error: HTTP {status} - {message}")]
    Api { status: u16, message: String },

    #[error("empty response from LLM")]
    EmptyResponse,

    #[error("transport error: {0}")]
    Transport(#[from] reqwest::Error),
}

#[async_trait]
pub trait StoryLlm: Send + Sync {
    fn model(&self) -> &str;

    async fn complete(&self, prompt: &str) -> Result<String>;

    async fn stream(&self, prompt: &str) -> Result<TextStream>;
}

pub struct MistralClient {
    http: reqwest::Client,
    base_url: String,
    api_key: String,
    model: String,
}

impl MistralClient {
    pub fn new(cfg: &LlmConfig) -> Result<Self> {
        let http = reqwest::Client::builder().connect_timeout(Duration::from_secs(10)).build()?;
        Ok(Self {
            http,
            base_url: cfg.base_url.trim_end_matches('/').to_string(),
            api_key: cfg.api_key.clone(),
            model: cfg.model.clone(),
        })
    }

    fn request_body(&self, prompt: &str, stream: bool) -> JsonValue {
        json!({
            "model": self.model,
            "messages": [ { "role": "user", "content": prompt } ],
            "stream": stream,
        })
    }

    async fn send(&self, body: &JsonValue) -> Result<reqwest::Response, LlmError> {
        let resp = self
            .http
            .post(format!("{}/chat/completions", self.base_url))
            .bearer_auth(&self.api_key)
            .json(body)
            .send()
            .await?;
        let status = resp.status();
        if !status.is_success() {
            let message = resp.text().await.unwrap_or_default();
            warn!(status = status.as_u16(), "LLM provider returned an error");
            return Err(LlmError::Api { status: status.as_u16(), message });
        }
        Ok(resp)
    }
}

fn completion_text(v: &JsonValue) -> Option<&str> {
    v.get("choices")?.get(0)?.get("message")?.get("content")?.as_str()
}

fn delta_text(v: &JsonValue) -> Option<&str> {
    v.get("choices")?.get(0)?.get("delta")?.get("content")?.as_str()
}

#[async_trait]
impl StoryLlm for MistralClient {
    fn model(&self) -> &str {
        &self.model
    }

    async fn complete(&self, prompt: &str) -> Result<String> {
        let resp = self.send(&self.request_body(prompt, false)).await?;
        let body: JsonValue = resp.json().await.map_err(LlmError::from)?;
        let text = completion_text(&body).map(str::trim).filter(|s| !s.is_empty()).ok_or(LlmError::EmptyResponse)?;
        Ok(text.to_string())
    }

    async fn stream(&self, prompt: &str) -> Result<TextStream> {
        let resp = self.send(&self.request_body(prompt, true)).await?;
        let (tx, rx) = mpsc::channel::<Result<String>>(64);
        tokio::spawn(async move {
            let mut bytes = Box::pin(resp.bytes_stream());
            let mut decoder = SseDecoder::new();
            while let Some(chunk) = bytes.next().await {
                let chunk = match chunk {
                    Ok(c) => c,
                    Err(e) => {
                        let _ = tx.send(Err(LlmError::from(e).into())).await;
                        return;
                    }
                };
                for frame in decoder.push(&chunk) {
                    if !relay_frame(&tx, frame).await {
                        return;
                    }
                }
            }
            if let Some(frame) = decoder.finish() {
                relay_frame(&tx, frame).await;
            }
        });
        Ok(ReceiverStream::new(rx).boxed())
    }
}

/// Forwards one decoded frame; false once the stream is over or the receiver is gone.
async fn relay_frame(tx: &mpsc::Sender<Result<String>>, frame: SseFrame) -> bool {
    match frame {
        SseFrame::Done => false,
        SseFrame::Data(data) => {
            let value: JsonValue = match serde_json::from_str(&data) {
                Ok(v) => v,
                Err(e) => {
                    debug!(error = %e, "skipping undecodable stream frame");
                    return true;
                }
            };
            match delta_text(&value) {
                Some(delta) if !delta.is_empty() => tx.send(Ok(delta.to_string())).await.is_ok(),
                _ => true,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures_util::TryStreamExt;
    use wiremock::matchers::{body_partial_json, header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn client(server: &MockServer) -> MistralClient {
        MistralClient::new(&LlmConfig { api_key: "test-key".into(), model: "mistral-small-latest".into(), base_url: format!("{}/v1/", server.uri()) }).unwrap()
    }

    #[tokio::test]
    async fn complete_returns_trimmed_message_content() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1/chat/completions"))
            .and(header("authorization", "Bearer test-key"))
            .and(body_partial_json(json!({ "model": "mistral-small-latest", "stream": false })))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "choices": [ { "message": { "role": "assistant", "content": "  Once upon a time.\n" } } ]
            })))
            .mount(&server)
            .await;

        let text = client(&server).complete("begin").await.unwrap();
        assert_eq!(text, "Once upon a time.");
    }

    #[tokio::test]
    async fn complete_maps_provider_errors() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1/chat/completions"))
            .respond_with(ResponseTemplate::new(429).set_body_string("slow down"))
            .mount(&server)
            .await;

        let err = client(&server).complete("begin").await.unwrap_err();
        match err.downcast_ref::<LlmError>() {
            Some(LlmError::Api { status, message }) => {
                assert_eq!(*status, 429);
                assert_eq!(message, "slow down");
            }
            other => panic!("unexpected error: {:?}", other),
        }
    }

    #[tokio::test]
    async fn complete_without_content_is_empty_response() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "choices": [] })))
            .mount(&server)
            .await;

        let err = client(&server).complete("begin").await.unwrap_err();
        assert!(matches!(err.downcast_ref::<LlmError>(), Some(LlmError::EmptyResponse)));
    }

    #[tokio::test]
    async fn stream_relays_deltas_in_order_and_stops_at_done() {
        let server = MockServer::start().await;
        let body = concat!(
            "data: {\"choices\":[{\"delta\":{\"role\":\"assistant\",\"content\":\"\"}}]}\n\n",
            "data: {\"choices\":[{\"delta\":{\"content\":\"You step\"}}]}\n\n",
            "data: {\"choices\":[{\"delta\":{\"content\":\" into the cave.\"}}]}\n\n",
            "data: [DONE]\n\n",
            "data: {\"choices\":[{\"delta\":{\"content\":\"ignored\"}}]}\n\n",
        );
        Mock::given(method("POST"))
            .and(path("/v1/chat/completions"))
            .and(body_partial_json(json!({ "stream": true })))
            .respond_with(ResponseTemplate::new(200).set_body_raw(body, "text/event-stream"))
            .mount(&server)
            .await;

        let chunks: Vec<String> = client(&server).stream("go").await.unwrap().try_collect().await.unwrap();
        assert_eq!(chunks, vec!["You step".to_string(), " into the cave.".to_string()]);
    }

    #[tokio::test]
    async fn stream_surfaces_error_status_before_streaming() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(500).set_body_string("boom"))
            .mount(&server)
            .await;

        let err = client(&server).stream("go").await.err().expect("stream should fail");
        assert!(matches!(err.downcast_ref::<LlmError>(), Some(LlmError::Api { status: 500, .. })));
    }
}
