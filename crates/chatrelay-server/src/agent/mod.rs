//! Agent boundary: the external collaborator that produces a turn's output.
//!
//! The relay only depends on the shape of the item sequence an agent emits:
//! text chunks tagged with the stage that produced them, tool invocations,
//! and message-completion markers.

mod openai;

use std::pin::Pin;

use tokio_stream::Stream;

pub use openai::{OpenAiAgent, OpenAiAgentConfig};

/// One item emitted by an agent while generating a turn.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AgentItem {
    /// A fragment of text from the named stage.
    Chunk { stage: String, content: String },
    /// Tools invoked in one agent step.
    ToolCalls { names: Vec<String> },
    /// A logical assistant message completed.
    MessageEnded,
}

impl AgentItem {
    pub fn chunk(stage: impl Into<String>, content: impl Into<String>) -> Self {
        Self::Chunk {
            stage: stage.into(),
            content: content.into(),
        }
    }
}

/// Thread-scoped context handed to the agent for one turn.
#[derive(Debug, Clone)]
pub struct ThreadContext {
    pub thread_id: String,
    pub stream_id: String,
    /// Unix timestamp of the user message that started the turn.
    pub last_activity: i64,
}

/// Lazily produced, single-consumption item sequence of one turn.
pub type AgentStream = Pin<Box<dyn Stream<Item = Result<AgentItem, AgentError>> + Send>>;

/// A response-generating agent.
pub trait Agent: Send + Sync {
    /// Start generating a reply to `message`. No work happens until the
    /// returned stream is polled.
    fn stream(&self, thread: &ThreadContext, message: &str) -> AgentStream;
}

/// Agent errors.
#[derive(Debug, thiserror::Error)]
pub enum AgentError {
    #[error("Agent configuration error: {0}")]
    Config(String),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Upstream returned {status}: {body}")]
    Status { status: u16, body: String },

    #[error("Stream read error: {0}")]
    Stream(String),

    #[error("Failed to decode upstream chunk: {0}")]
    Decode(String),
}
