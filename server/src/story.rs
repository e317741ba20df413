//! Story turns: each one reads context, appends nodes and edges, and asks the model
//! for narrative or the next set of options.

use std::sync::Arc;

use anyhow::Result;
use serde::Serialize;
use tracing::{info, warn};
use uuid::Uuid;

use crate::graph::{ChoiceEdge, EdgeKind, NodeId, StoryGraph};
use crate::interactions::InteractionLog;
use crate::llm::{StoryLlm, TextStream};
use crate::prompts::{self, ChoiceSet};

pub const CHOICE_SELECTED_MESSAGE: &str = "Choice stored successfully";
pub const CONTINUATION_LABEL: &str = "continuation";
pub const REPLY_LABEL: &str = "reply";

#[derive(Debug, thiserror::Error)]
#[error("could not read choices from LLM answer: {0}")]
pub struct ChoiceParseError(pub String);

#[derive(Debug, Clone, Serialize)]
pub struct StoryStart {
    pub story_id: String,
    pub root_node_id: NodeId,
    pub choice_type: String,
    pub choices: Vec<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct NextChoices {
    pub next_choice_type: String,
    pub choices: Vec<String>,
    pub next_node_id: NodeId,
}

#[derive(Debug, Clone, Serialize)]
pub struct ConversationTurn {
    pub story_id: String,
    pub question: String,
    pub node_id: NodeId,
}

/// State carried between the stages of a streamed choice turn.
#[derive(Debug, Clone)]
pub struct ChoiceTurn {
    pub story_id: String,
    pub user_choice: String,
    pub context: String,
    pub choice_node_id: NodeId,
}

pub struct StoryService {
    graph: Arc<dyn StoryGraph>,
    llm: Arc<dyn StoryLlm>,
    interactions: InteractionLog,
}

impl StoryService {
    pub fn new(graph: Arc<dyn StoryGraph>, llm: Arc<dyn StoryLlm>, interactions: InteractionLog) -> Self {
        Self { graph, llm, interactions }
    }

    pub fn model(&self) -> &str {
        self.llm.model()
    }

    pub fn interactions(&self) -> &InteractionLog {
        &self.interactions
    }

    fn log_interaction(&self, input: &str, output: &str) {
        if let Err(e) = self.interactions.record(input, output, self.llm.model()) {
            warn!(error = %e, "failed to record llm interaction");
        }
    }

    async fn ask(&self, prompt: &str) -> Result<String> {
        let answer = self.llm.complete(prompt).await?;
        self.log_interaction(prompt, &answer);
        Ok(answer)
    }

    async fn ask_choices(&self, prompt: &str) -> Result<ChoiceSet> {
        let prompt = prompts::with_choice_format(prompt);
        let answer = self.ask(&prompt).await?;
        prompts::parse_choice_set(&answer).map_err(|e| ChoiceParseError(e.to_string()).into())
    }

    async fn append(&self, story_id: &str, from: NodeId, content: &str, is_choice_point: bool, kind: EdgeKind, label: &str) -> Result<NodeId> {
        let node_id = self.graph.create_node(story_id, content, is_choice_point).await?;
        self.graph.create_edge(from, node_id, kind, label).await?;
        Ok(node_id)
    }

    pub async fn start_story(&self) -> Result<StoryStart> {
        self.start_with_prompt(prompts::START_STORY).await
    }

    pub async fn start_story_realtime(&self) -> Result<StoryStart> {
        self.start_with_prompt(&format!("{}\n{}", prompts::START_STORY_REALTIME, prompts::START_STORY)).await
    }

    async fn start_with_prompt(&self, prompt: &str) -> Result<StoryStart> {
        let story_id = Uuid::new_v4().to_string();
        self.graph.create_story(&story_id).await?;
        let set = self.ask_choices(prompt).await?;
        let root_content = format!("Choose a {}: {}", set.choice_type, set.choices.join(", "));
        let root_node_id = self.graph.create_node(&story_id, &root_content, true).await?;
        info!(%story_id, root_node_id, "story started");
        Ok(StoryStart { story_id, root_node_id, choice_type: set.choice_type, choices: set.choices })
    }

    pub async fn next_choices(&self, story_id: &str, current_node_id: NodeId, user_choice: &str) -> Result<NextChoices> {
        let context = self.graph.get_story_context(story_id).await?;
        let content = format!("Next part of the story based on the choice: {}", user_choice);
        let next_node_id = self.append(story_id, current_node_id, &content, true, EdgeKind::Choice, user_choice).await?;
        let set = self.ask_choices(&prompts::next_choice_type(&context, user_choice)).await?;
        info!(%story_id, current_node_id, next_node_id, "choices generated");
        Ok(NextChoices { next_choice_type: set.choice_type, choices: set.choices, next_node_id })
    }

    pub async fn select_choice(&self, story_id: &str, current_node_id: NodeId, choice_text: &str) -> Result<NodeId> {
        let content = format!("Next part of the story based on the choice: {}", choice_text);
        let next_node_id = self.append(story_id, current_node_id, &content, true, EdgeKind::Choice, choice_text).await?;
        info!(%story_id, current_node_id, next_node_id, "choice stored");
        Ok(next_node_id)
    }

    pub async fn final_story(&self, story_id: &str) -> Result<String> {
        let context = self.graph.get_story_context(story_id).await?;
        let story = self.ask(&prompts::final_story(&context)).await?;
        info!(%story_id, chars = story.len(), "final story generated");
        Ok(story)
    }

    pub async fn context(&self, story_id: &str) -> Result<String> {
        self.graph.get_story_context(story_id).await
    }

    pub async fn choices_from(&self, node_id: NodeId) -> Result<Vec<ChoiceEdge>> {
        self.graph.get_choices(node_id).await
    }

    pub async fn start_conversation(&self) -> Result<ConversationTurn> {
        let story_id = Uuid::new_v4().to_string();
        self.graph.create_story(&story_id).await?;
        let question = self.ask(prompts::CONVERSATION_OPENER).await?;
        let node_id = self.graph.create_node(&story_id, &question, false).await?;
        info!(%story_id, node_id, "conversation started");
        Ok(ConversationTurn { story_id, question, node_id })
    }

    /// Stores the user's free-form answer and the model's next question.
    pub async fn respond(&self, story_id: &str, current_node_id: NodeId, user_input: &str) -> Result<ConversationTurn> {
        let context = self.graph.get_story_context(story_id).await?;
        let input_node = self.append(story_id, current_node_id, &format!("User: {}", user_input), true, EdgeKind::Choice, user_input).await?;
        let question = self.ask(&prompts::conversation_reply(&context, user_input)).await?;
        let node_id = self.append(story_id, input_node, &question, false, EdgeKind::Response, REPLY_LABEL).await?;
        info!(%story_id, current_node_id, node_id, "conversation reply stored");
        Ok(ConversationTurn { story_id: story_id.to_string(), question, node_id })
    }

    /// First stage of a streamed turn: record the choice before any narrative exists.
    pub async fn begin_choice_turn(&self, story_id: &str, current_node_id: NodeId, user_choice: &str) -> Result<ChoiceTurn> {
        let context = self.graph.get_story_context(story_id).await?;
        let choice_node_id = self.append(story_id, current_node_id, &format!("User chose: {}", user_choice), true, EdgeKind::Choice, user_choice).await?;
        Ok(ChoiceTurn { story_id: story_id.to_string(), user_choice: user_choice.to_string(), context, choice_node_id })
    }

    pub async fn stream_continuation(&self, turn: &ChoiceTurn) -> Result<TextStream> {
        self.llm.stream(&prompts::continuation(&turn.context, &turn.user_choice)).await
    }

    /// Last stage: keep the streamed narrative and ask what comes next.
    pub async fn finish_choice_turn(&self, turn: &ChoiceTurn, narrative: &str) -> Result<NextChoices> {
        self.log_interaction(&prompts::continuation(&turn.context, &turn.user_choice), narrative);
        let mut last_node = turn.choice_node_id;
        if !narrative.trim().is_empty() {
            last_node = self.append(&turn.story_id, turn.choice_node_id, narrative.trim(), false, EdgeKind::Response, CONTINUATION_LABEL).await?;
        }
        let context = if narrative.trim().is_empty() { turn.context.clone() } else { format!("{}\n{}", turn.context, narrative.trim()) };
        let set = self.ask_choices(&prompts::next_options(&context, &turn.user_choice)).await?;
        info!(story_id = %turn.story_id, choice_node_id = turn.choice_node_id, next_node_id = last_node, "choice turn finished");
        Ok(NextChoices { next_choice_type: set.choice_type, choices: set.choices, next_node_id: last_node })
    }
}
