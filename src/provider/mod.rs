pub mod ollama;
pub mod stub;
mod types;

pub use types::{ChatChunk, ChatMessage, ChatRequest, ChatStream, Provider};
