//! Relay module types.

use std::fmt;
use std::str::FromStr;

use crate::storage::DatabaseError;

/// Kind of a log entry. The wire name doubles as the SSE event name.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    /// Answer text fragment.
    Chunk,
    /// Name of one invoked tool.
    ToolCall,
    /// A logical message completed.
    MessageEnded,
    /// Generation failed; always followed by [`EventKind::End`].
    Error,
    /// Terminal entry of every log.
    End,
}

impl EventKind {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Chunk => "chunk",
            Self::ToolCall => "tool_call",
            Self::MessageEnded => "system:message_ended",
            Self::Error => "system:error",
            Self::End => "system:end",
        }
    }
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EventKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "chunk" => Ok(Self::Chunk),
            "tool_call" => Ok(Self::ToolCall),
            "system:message_ended" => Ok(Self::MessageEnded),
            "system:error" => Ok(Self::Error),
            "system:end" => Ok(Self::End),
            other => Err(other.to_string()),
        }
    }
}

/// One entry of a turn's event log.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogEntry {
    /// Strictly increasing within the log, starting at 1.
    pub id: i64,
    pub kind: EventKind,
    pub payload: String,
}

/// Lifecycle of a turn.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TurnStatus {
    Running,
    Completed,
}

impl TurnStatus {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Running => "running",
            Self::Completed => "completed",
        }
    }
}

impl FromStr for TurnStatus {
    type Err = RelayError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "running" => Ok(Self::Running),
            "completed" => Ok(Self::Completed),
            other => Err(RelayError::UnknownStatus(other.to_string())),
        }
    }
}

/// Errors from relay operations.
#[derive(Debug, thiserror::Error)]
pub enum RelayError {
    #[error("Storage error: {0}")]
    Storage(#[from] DatabaseError),

    #[error("Unknown event kind {kind:?} in stream {stream_id}")]
    UnknownKind { stream_id: String, kind: String },

    #[error("Unknown turn status: {0}")]
    UnknownStatus(String),
}
