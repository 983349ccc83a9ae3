use futures_core::stream::BoxStream;
use serde::{Deserialize, Serialize};

/// One `{role, content}` entry of a chat request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: String,
    pub content: String,
}

impl ChatMessage {
    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: "user".to_string(),
            content: content.into(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct ChatRequest {
    pub model: String,
    pub messages: Vec<ChatMessage>,
}

impl ChatRequest {
    /// Request with the prompt as the sole user message.
    pub fn user_prompt(model: impl Into<String>, prompt: impl Into<String>) -> Self {
        Self {
            model: model.into(),
            messages: vec![ChatMessage::user(prompt)],
        }
    }
}

/// One fragment of streamed model output.
#[derive(Debug, Clone)]
pub struct ChatChunk {
    pub text: String,
}

pub type ChatStream = BoxStream<'static, anyhow::Result<ChatChunk>>;

/// Provider interface.
///
/// Only a streaming chat method. The stream ends normally when the backend
/// signals completion; any `Err` item ends the response.
pub trait Provider {
    fn name(&self) -> &'static str;

    /// Start streaming a response.
    fn stream_chat(
        &self,
        req: ChatRequest,
    ) -> std::pin::Pin<Box<dyn std::future::Future<Output = anyhow::Result<ChatStream>> + Send>>;
}
