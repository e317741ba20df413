//! Test doubles shared by the module tests.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use anyhow::Result;
use async_trait::async_trait;
use futures_util::StreamExt;

use crate::graph::SledStoryGraph;
use crate::interactions::InteractionLog;
use crate::llm::{LlmError, StoryLlm, TextStream};
use crate::story::StoryService;

pub const CHOICES_JSON: &str = r#"{"choice_type": "hero", "choices": ["A knight", "A thief", "A witch"]}"#;

/// Replays canned answers in order and remembers every prompt it was given.
pub struct ScriptedLlm {
    answers: Mutex<VecDeque<String>>,
    prompts: Mutex<Vec<String>>,
    fail: bool,
}

impl ScriptedLlm {
    pub fn new(answers: Vec<&str>) -> Arc<Self> {
        Arc::new(Self { answers: Mutex::new(answers.into_iter().map(String::from).collect()), prompts: Mutex::new(Vec::new()), fail: false })
    }

    pub fn failing() -> Arc<Self> {
        Arc::new(Self { answers: Mutex::new(VecDeque::new()), prompts: Mutex::new(Vec::new()), fail: true })
    }

    pub fn prompts(&self) -> Vec<String> {
        self.prompts.lock().unwrap().clone()
    }

    fn next_answer(&self, prompt: &str) -> Result<String> {
        self.prompts.lock().unwrap().push(prompt.to_string());
        if self.fail {
            return Err(LlmError::Api { status: 503, message: "unavailable".into() }.into());
        }
        self.answers.lock().unwrap().pop_front().ok_or_else(|| LlmError::EmptyResponse.into())
    }
}

#[async_trait]
impl StoryLlm for ScriptedLlm {
    fn model(&self) -> &str {
        "scripted"
    }

    async fn complete(&self, prompt: &str) -> Result<String> {
        self.next_answer(prompt)
    }

    async fn stream(&self, prompt: &str) -> Result<TextStream> {
        let answer = self.next_answer(prompt)?;
        let mut chunks: Vec<Result<String>> = Vec::new();
        for (i, word) in answer.split(' ').enumerate() {
            chunks.push(Ok(if i == 0 { word.to_string() } else { format!(" {}", word) }));
        }
        Ok(futures_util::stream::iter(chunks).boxed())
    }
}

pub fn service_with(llm: Arc<ScriptedLlm>) -> (tempfile::TempDir, SledStoryGraph, StoryService) {
    let dir = tempfile::tempdir().unwrap();
    let db = sled::open(dir.path().join("kv")).unwrap();
    let graph = SledStoryGraph::open(db.clone()).unwrap();
    let interactions = InteractionLog::open(&db, None).unwrap();
    let svc = StoryService::new(Arc::new(graph.clone()), llm, interactions);
    (dir, graph, svc)
}
