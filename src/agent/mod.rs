//! Agent module - retrieval-augmented conversation with the chat model

pub mod chat_engine;
pub mod llm;

pub use chat_engine::ContextChatEngine;
pub use llm::{ChatMessage, ChatModel, OllamaClient, Role};
