//! Language model abstraction with streaming output and bounded tool use.
//!
//! The pipeline talks to a [`LanguageModel`] which streams text deltas and
//! may, between reasoning steps, invoke tools supplied through a
//! [`ToolRunner`]. The runner is consulted before *every* model invocation,
//! so a tool whose budget is exhausted disappears from the request entirely
//! rather than being refused at call time.

pub mod gemini;
pub mod sse;

use std::pin::Pin;
use std::sync::Arc;

use async_trait::async_trait;
use futures_util::Stream;
use serde::{Deserialize, Serialize};

use crate::errors::AppError;

/// Role of a message presented to the model.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageRole {
    System,
    User,
    Assistant,
}

impl MessageRole {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::System => "system",
            Self::User => "user",
            Self::Assistant => "assistant",
        }
    }
}

/// One turn of conversational input for the model.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: MessageRole,
    pub content: String,
}

impl ChatMessage {
    #[must_use]
    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: MessageRole::User,
            content: content.into(),
        }
    }

    #[must_use]
    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: MessageRole::Assistant,
            content: content.into(),
        }
    }
}

/// Declaration of a callable tool, JSON-Schema parameters included.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolSpec {
    pub name: String,
    pub description: String,
    pub parameters: serde_json::Value,
}

/// Supplies tool declarations and executes tool calls mid-generation.
#[async_trait]
pub trait ToolRunner: Send + Sync {
    /// Tools currently available. Consulted before each model invocation;
    /// returning an empty list omits tools from the request.
    fn available(&self) -> Vec<ToolSpec>;

    /// Execute a tool call and return its JSON result.
    async fn run(&self, name: &str, args: serde_json::Value) -> Result<serde_json::Value, AppError>;
}

/// A runner with no tools, for plain-text generation.
pub struct NoTools;

#[async_trait]
impl ToolRunner for NoTools {
    fn available(&self) -> Vec<ToolSpec> {
        Vec::new()
    }

    async fn run(&self, name: &str, _args: serde_json::Value) -> Result<serde_json::Value, AppError> {
        Err(AppError::provider(format!("unknown tool: {name}")))
    }
}

/// Everything a generation call needs besides tools.
#[derive(Debug, Clone)]
pub struct GenerationRequest {
    /// Fixed system instruction (persona and scope constraints).
    pub system: String,
    /// Conversation history, oldest first, ending with the user's query.
    pub messages: Vec<ChatMessage>,
}

/// Incremental model output.
#[derive(Debug, Clone, PartialEq)]
pub enum StreamChunk {
    /// A fragment of assistant text.
    TextDelta(String),
    /// Generation finished; no further chunks follow.
    Finished { reason: Option<String> },
}

/// Boxed stream of model output.
pub type GenerationStream = Pin<Box<dyn Stream<Item = Result<StreamChunk, AppError>> + Send>>;

/// A streaming chat-completion backend.
#[async_trait]
pub trait LanguageModel: Send + Sync {
    /// Generate a streamed response.
    ///
    /// The implementation may take up to `max_steps` model invocations,
    /// executing tool calls through `tools` between them; the final step
    /// always runs without tools so the model must produce text. Errors
    /// after the stream has started are yielded through the stream.
    async fn stream_generate(
        &self,
        request: GenerationRequest,
        tools: Arc<dyn ToolRunner>,
        max_steps: usize,
    ) -> Result<GenerationStream, AppError>;

    /// Model identifier recorded in message metadata.
    fn model_name(&self) -> &str;
}
