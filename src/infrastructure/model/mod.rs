pub mod openai;
pub mod traits;

pub use openai::OpenAiCompatBackend;
pub use traits::ModelBackend;

use crate::domain::types::{ChatMessage, ToolCallRequest};
use serde_json::Value;
use thiserror::Error;

/// One model invocation: conversation so far plus the projected toolset.
#[derive(Debug, Clone)]
pub struct ModelRequest {
    pub model: String,
    pub messages: Vec<ChatMessage>,
    pub tools: Vec<Value>,
    pub temperature: Option<f32>,
    pub max_tokens: Option<u32>,
}

#[derive(Debug, Clone)]
pub struct ModelResponse {
    pub message: ChatMessage,
}

/// One unit of a streamed response: an optional text delta and any tool
/// calls finalized so far. `done` marks the last chunk of the turn.
#[derive(Debug, Clone, Default)]
pub struct ModelChunk {
    pub content: Option<String>,
    pub tool_calls: Vec<ToolCallRequest>,
    pub done: bool,
}

/// Backend failures are fatal to the current request; output already
/// streamed stays delivered.
#[derive(Debug, Error)]
pub enum ModelError {
    #[error("model backend unreachable: {0}")]
    Network(String),
    #[error("model backend returned HTTP {status}: {message}")]
    Api { status: u16, message: String },
    #[error("model backend returned an invalid response: {0}")]
    InvalidResponse(String),
    #[error("model stream interrupted: {0}")]
    StreamInterrupted(String),
}

impl ModelError {
    /// Status for the request boundary when the failure happens before
    /// streaming begins.
    pub fn status(&self) -> u16 {
        match self {
            ModelError::Api { status, .. } if *status >= 400 && *status < 500 => *status,
            _ => 502,
        }
    }
}
