//! Streaming relay: event logs, the session registry, and the producer and
//! consumer sides that meet through them.

pub mod consumer;
pub mod event_log;
pub mod producer;
pub mod registry;
pub mod types;

pub use consumer::{Attachment, Consumer, Frame};
pub use event_log::EventLog;
pub use producer::Producer;
pub use registry::SessionRegistry;
pub use types::{EventKind, LogEntry, RelayError, TurnStatus};
