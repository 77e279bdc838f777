//! Retrieval-augmented chat
//!
//! Each user message is embedded, the closest index nodes are pulled in as
//! context, and the chat model answers with the agent instructions, that
//! context and the recent history in front of it.

use std::collections::VecDeque;
use std::sync::Arc;
use tracing::{debug, info};

use super::llm::{ChatMessage, ChatModel};
use crate::error::LlmError;
use crate::index::{Embedder, ScoredNode, VectorIndex};

const CONTEXT_HEADER: &str = "Context information is below.\n--------------------\n";
const CONTEXT_FOOTER: &str = "\n--------------------\n";

/// Chat engine bound to a shared, read-only index
pub struct ContextChatEngine {
    index: Arc<VectorIndex>,
    embedder: Arc<dyn Embedder>,
    model: Arc<dyn ChatModel>,
    top_k: usize,
    instructions: String,
    history: VecDeque<ChatMessage>,
    history_limit: usize,
}

impl ContextChatEngine {
    pub fn new(
        index: Arc<VectorIndex>,
        embedder: Arc<dyn Embedder>,
        model: Arc<dyn ChatModel>,
        top_k: usize,
    ) -> Self {
        Self {
            index,
            embedder,
            model,
            top_k,
            instructions: String::new(),
            history: VecDeque::new(),
            history_limit: 20,
        }
    }

    /// Keep at most `limit` past messages (user and assistant)
    pub fn with_history_limit(mut self, limit: usize) -> Self {
        self.history_limit = limit;
        self
    }

    pub fn set_instructions(&mut self, instructions: impl Into<String>) {
        self.instructions = instructions.into();
    }

    pub fn instructions(&self) -> &str {
        &self.instructions
    }

    pub fn history(&self) -> impl Iterator<Item = &ChatMessage> {
        self.history.iter()
    }

    /// Forget the conversation, keeping instructions
    pub fn reset(&mut self) {
        self.history.clear();
    }

    /// Record a message spoken by the assistant outside of `chat`, such as
    /// the greeting
    pub fn record_assistant(&mut self, text: impl Into<String>) {
        self.push_history(ChatMessage::assistant(text));
    }

    /// Answer `message` using retrieved context
    pub async fn chat(&mut self, message: &str) -> Result<String, LlmError> {
        let nodes = self.index.query(self.embedder.as_ref(), message, self.top_k).await?;
        debug!("Retrieved {} context nodes", nodes.len());

        let mut messages = Vec::with_capacity(self.history.len() + 2);
        messages.push(ChatMessage::system(self.system_prompt(&nodes)));
        messages.extend(self.history.iter().cloned());
        messages.push(ChatMessage::user(message));

        let reply = self.model.complete(&messages).await?;
        info!("Assistant: \"{}\"", reply);

        self.push_history(ChatMessage::user(message));
        self.push_history(ChatMessage::assistant(reply.clone()));
        Ok(reply)
    }

    fn system_prompt(&self, nodes: &[ScoredNode]) -> String {
        let context = nodes
            .iter()
            .map(|n| n.node.text.as_str())
            .collect::<Vec<_>>()
            .join("\n\n");

        let mut prompt = String::new();
        if !self.instructions.is_empty() {
            prompt.push_str(&self.instructions);
            prompt.push_str("\n\n");
        }
        prompt.push_str(CONTEXT_HEADER);
        prompt.push_str(&context);
        prompt.push_str(CONTEXT_FOOTER);
        prompt
    }

    fn push_history(&mut self, message: ChatMessage) {
        self.history.push_back(message);
        while self.history.len() > self.history_limit {
            self.history.pop_front();
        }
    }
}
