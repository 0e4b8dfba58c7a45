//! Consumer: tails a turn's log for one streaming connection.
//!
//! The consumer never writes. Dropping the frame stream (client disconnect)
//! has no effect on the turn.

use std::time::Duration;

use tokio::time::Instant;
use tokio_stream::Stream;
use tracing::{debug, warn};

use super::event_log::EventLog;
use super::registry::SessionRegistry;
use super::types::{EventKind, LogEntry, RelayError, TurnStatus};

/// A resolved turn plus the cursor to resume after.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Attachment {
    pub stream_id: String,
    /// Entries with `id > cursor` are streamed.
    pub cursor: i64,
}

/// One unit of output for a streaming connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    Entry(LogEntry),
    Heartbeat,
}

#[derive(Clone)]
pub struct Consumer {
    log: EventLog,
    registry: SessionRegistry,
    heartbeat: Duration,
    block: Duration,
}

impl Consumer {
    pub const fn new(
        log: EventLog,
        registry: SessionRegistry,
        heartbeat: Duration,
        block: Duration,
    ) -> Self {
        Self {
            log,
            registry,
            heartbeat,
            block,
        }
    }

    /// Resolve the running turn of `thread_id` and where to resume it.
    ///
    /// Returns `None` when there is nothing to stream: no turn, or a turn
    /// that already completed or expired.
    pub async fn attach(
        &self,
        thread_id: &str,
        last_event_id: Option<i64>,
    ) -> Result<Option<Attachment>, RelayError> {
        let Some(stream_id) = self.registry.get_active_stream(thread_id).await? else {
            debug!(thread_id, "No turn for thread");
            return Ok(None);
        };

        if self.registry.get_status(&stream_id).await? != Some(TurnStatus::Running) {
            debug!(thread_id, stream_id = %stream_id, "Turn not running");
            return Ok(None);
        }

        let tail = self.log.last_id(&stream_id).await?;
        let in_log = |id: &i64| (0..=tail).contains(id);

        let finalized = self.registry.get_finalized_entry(&stream_id).await?;
        if let Some(id) = finalized.filter(|id| !in_log(id)) {
            warn!(stream_id = %stream_id, entry_id = id, tail, "Finalized entry past log tail");
        }

        let cursor = last_event_id
            .filter(in_log)
            .or_else(|| finalized.filter(in_log))
            .unwrap_or(0);

        debug!(thread_id, stream_id = %stream_id, cursor, "Stream attached");
        #[cfg(feature = "metrics")]
        chatrelay_core::metrics::record_stream_attached();

        Ok(Some(Attachment { stream_id, cursor }))
    }

    /// Frames for an attachment, ending after `system:end`.
    ///
    /// A heartbeat is yielded whenever no entry went out for a full heartbeat
    /// interval.
    pub fn frames(&self, attachment: Attachment) -> impl Stream<Item = Frame> + Send + use<> {
        let Self {
            log,
            registry,
            heartbeat,
            block,
        } = self.clone();
        let Attachment {
            stream_id,
            mut cursor,
        } = attachment;

        async_stream::stream! {
            let mut next_heartbeat = Instant::now() + heartbeat;

            loop {
                if Instant::now() >= next_heartbeat {
                    yield Frame::Heartbeat;
                    next_heartbeat = Instant::now() + heartbeat;
                }

                // Never block past the next heartbeat.
                let wait = block.min(next_heartbeat.saturating_duration_since(Instant::now()));
                let entries = match log.read_from(&stream_id, cursor, wait).await {
                    Ok(entries) => entries,
                    Err(e) => {
                        warn!(stream_id = %stream_id, error = %e, "Log read failed, closing stream");
                        break;
                    }
                };

                let entries = if entries.is_empty() {
                    match registry.get_status(&stream_id).await {
                        Ok(Some(TurnStatus::Running)) => continue,
                        // Completed with nothing past the cursor: `system:end` is
                        // behind the reader, so nothing more can arrive.
                        Ok(Some(TurnStatus::Completed)) => {
                            match log.read_from(&stream_id, cursor, Duration::ZERO).await {
                                Ok(rest) if !rest.is_empty() => rest,
                                Ok(_) => {
                                    debug!(stream_id = %stream_id, cursor, "Turn completed, closing stream");
                                    break;
                                }
                                Err(e) => {
                                    warn!(stream_id = %stream_id, error = %e, "Log read failed, closing stream");
                                    break;
                                }
                            }
                        }
                        Ok(None) => {
                            debug!(stream_id = %stream_id, "Turn expired, closing stream");
                            break;
                        }
                        Err(e) => {
                            warn!(stream_id = %stream_id, error = %e, "Status lookup failed, closing stream");
                            break;
                        }
                    }
                } else {
                    entries
                };

                for entry in entries {
                    cursor = entry.id;
                    let end = entry.kind == EventKind::End;
                    yield Frame::Entry(entry);
                    if end {
                        return;
                    }
                }
                next_heartbeat = Instant::now() + heartbeat;
            }
        }
    }
}
