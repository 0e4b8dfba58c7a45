//! Producer: runs the agent for one turn and writes its output to the log.
//!
//! Each turn runs as a tracked background task. Whatever happens inside it,
//! the turn ends with exactly one `system:end` entry followed by the single
//! `running → completed` transition.

use std::sync::Arc;

use tokio_stream::StreamExt;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, warn};

use super::event_log::EventLog;
use super::registry::SessionRegistry;
use super::types::{EventKind, RelayError};
use crate::agent::{Agent, AgentError, AgentItem, ThreadContext};

/// Why a turn stopped without failing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Outcome {
    /// The agent sequence ran to its end.
    Finished,
    /// A newer turn took over the thread.
    Superseded,
}

#[derive(Debug, thiserror::Error)]
enum TurnError {
    #[error(transparent)]
    Agent(#[from] AgentError),

    #[error(transparent)]
    Relay(#[from] RelayError),

    #[error("Server shutting down")]
    Cancelled,

    #[error("Agent task failed: {0}")]
    Task(#[from] tokio::task::JoinError),
}

/// Starts turns and drives them to a terminal state.
#[derive(Clone)]
pub struct Producer {
    log: EventLog,
    registry: SessionRegistry,
    agent: Arc<dyn Agent>,
    /// Stage whose chunks are forwarded to readers.
    answer_stage: Arc<str>,
    shutdown: CancellationToken,
    tracker: TaskTracker,
}

impl Producer {
    pub fn new(
        log: EventLog,
        registry: SessionRegistry,
        agent: Arc<dyn Agent>,
        answer_stage: &str,
    ) -> Self {
        Self {
            log,
            registry,
            agent,
            answer_stage: Arc::from(answer_stage),
            shutdown: CancellationToken::new(),
            tracker: TaskTracker::new(),
        }
    }

    /// Register a new turn for `thread_id` and run it in the background.
    ///
    /// Returns the turn's stream id as soon as it is registered; generation
    /// failures never surface here.
    pub async fn start(&self, thread_id: &str, message: &str) -> Result<String, RelayError> {
        let stream_id = self.registry.start_turn(thread_id).await?;
        self.log.open(&stream_id).await?;

        #[cfg(feature = "metrics")]
        chatrelay_core::metrics::record_turn_started();

        let thread = ThreadContext {
            thread_id: thread_id.to_string(),
            stream_id: stream_id.clone(),
            last_activity: chatrelay_core::db::unix_timestamp(),
        };
        let producer = self.clone();
        let message = message.to_string();
        self.tracker.spawn(async move { producer.run_turn(thread, message).await });

        Ok(stream_id)
    }

    /// Cancel in-flight turns and wait until each has written its terminal entries.
    pub async fn shutdown(&self) {
        self.shutdown.cancel();
        self.tracker.close();
        self.tracker.wait().await;
        info!("All turns finalized");
    }

    async fn run_turn(self, thread: ThreadContext, message: String) {
        let thread_id = thread.thread_id.clone();
        let stream_id = thread.stream_id.clone();
        info!(thread_id = %thread_id, stream_id = %stream_id, "Turn started");

        // A panicking agent unwinds only the driver task; the turn is still finalized.
        let driver = self.clone();
        let result = tokio::spawn(async move { driver.drive(&thread, &message).await })
            .await
            .unwrap_or_else(|e| Err(TurnError::Task(e)));
        if let Err(e) = &result {
            warn!(thread_id = %thread_id, stream_id = %stream_id, error = %e, "Turn failed");
        }

        match self.finalize(&stream_id, result.as_ref().ok().copied()).await {
            Ok(()) => info!(thread_id = %thread_id, stream_id = %stream_id, "Turn completed"),
            Err(e) => {
                error!(thread_id = %thread_id, stream_id = %stream_id, error = %e, "Failed to finalize turn");
            }
        }
    }

    async fn drive(&self, thread: &ThreadContext, message: &str) -> Result<Outcome, TurnError> {
        let stream_id = thread.stream_id.as_str();
        let mut items = self.agent.stream(thread, message);

        loop {
            let next = tokio::select! {
                biased;
                () = self.shutdown.cancelled() => return Err(TurnError::Cancelled),
                next = items.next() => next,
            };
            let Some(item) = next else {
                return Ok(Outcome::Finished);
            };
            let item = item?;

            if !self.is_active(thread).await? {
                debug!(thread_id = %thread.thread_id, stream_id, "Turn superseded");
                return Ok(Outcome::Superseded);
            }

            self.translate(stream_id, item).await?;

            self.registry.touch(stream_id).await?;
            self.log.touch(stream_id).await?;
        }
    }

    async fn translate(&self, stream_id: &str, item: AgentItem) -> Result<(), RelayError> {
        match item {
            AgentItem::Chunk { stage, content } => {
                if stage == *self.answer_stage && !content.is_empty() {
                    self.log.append(stream_id, EventKind::Chunk, &content).await?;
                }
            }
            AgentItem::ToolCalls { names } => {
                for name in names.iter().filter(|n| !n.is_empty()) {
                    self.log.append(stream_id, EventKind::ToolCall, name).await?;
                }
            }
            AgentItem::MessageEnded => {
                let id = self
                    .log
                    .append(stream_id, EventKind::MessageEnded, "")
                    .await?;
                self.registry.set_finalized_entry(stream_id, id).await?;
            }
        }
        Ok(())
    }

    async fn is_active(&self, thread: &ThreadContext) -> Result<bool, RelayError> {
        let active = self.registry.get_active_stream(&thread.thread_id).await?;
        Ok(active.as_deref() == Some(thread.stream_id.as_str()))
    }

    /// Write the terminal entries. `outcome` is `None` for a failed turn.
    ///
    /// Every step is attempted even if an earlier one fails; the first
    /// failure is returned.
    async fn finalize(&self, stream_id: &str, outcome: Option<Outcome>) -> Result<(), RelayError> {
        let error_entry = match outcome {
            None => self.log.append(stream_id, EventKind::Error, "").await.map(drop),
            Some(_) => Ok(()),
        };
        let end_entry = self.log.append(stream_id, EventKind::End, "").await.map(drop);
        let completed = self.registry.set_completed(stream_id).await.map(|changed| {
            if !changed {
                warn!(stream_id, "Turn was not running at finalization");
            }
        });

        for (step, result) in [
            ("system:error", &error_entry),
            ("system:end", &end_entry),
            ("status", &completed),
        ] {
            if let Err(e) = result {
                error!(stream_id, step, error = %e, "Finalization step failed");
            }
        }

        #[cfg(feature = "metrics")]
        chatrelay_core::metrics::record_turn_finished(match outcome {
            Some(Outcome::Finished) => "completed",
            Some(Outcome::Superseded) => "superseded",
            None => "failed",
        });

        error_entry.and(end_entry).and(completed)
    }
}
