//! Append-only, replayable event log per turn.
//!
//! Entries live in the `log_entries` table. Readers tail a log with a cursor;
//! nothing is consumed, so any number of readers can replay the same log.

use std::collections::HashMap;
use std::sync::{Arc, Weak};
use std::time::Duration;

use tokio::sync::{Mutex, Notify};
use tokio::time::Instant;
use tracing::debug;

use super::types::{EventKind, LogEntry, RelayError};
use crate::storage::{AppendEntryParams, LogEntryRow, RelayDatabase};

/// Event log store shared by producers and consumers.
#[derive(Clone)]
pub struct EventLog {
    db: RelayDatabase,
    ttl_secs: i64,
    /// In-process wakers keyed by stream id. Held weakly so a stream without
    /// readers costs nothing.
    wakers: Arc<Mutex<HashMap<String, Weak<Notify>>>>,
}

impl EventLog {
    pub fn new(db: RelayDatabase, ttl_secs: i64) -> Self {
        Self {
            db,
            ttl_secs,
            wakers: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Create the log for a new turn.
    pub async fn open(&self, stream_id: &str) -> Result<(), RelayError> {
        self.db.create_event_log(stream_id, self.ttl_secs).await?;
        Ok(())
    }

    /// Append an entry, extend the log TTL and wake readers of the stream.
    pub async fn append(
        &self,
        stream_id: &str,
        kind: EventKind,
        payload: &str,
    ) -> Result<i64, RelayError> {
        let id = self
            .db
            .append_log_entry(&AppendEntryParams {
                stream_id,
                kind: kind.as_str(),
                payload,
                ttl_secs: self.ttl_secs,
            })
            .await?;

        debug!(stream_id, entry_id = id, kind = %kind, "Log entry appended");
        #[cfg(feature = "metrics")]
        chatrelay_core::metrics::record_entry_appended(kind.as_str());

        let notify = self.wakers.lock().await.get(stream_id).and_then(Weak::upgrade);
        if let Some(notify) = notify {
            notify.notify_waiters();
        }

        Ok(id)
    }

    /// Read entries with `id > after_id`, waiting up to `block` for the first
    /// one to arrive. Returns an empty batch on timeout.
    pub async fn read_from(
        &self,
        stream_id: &str,
        after_id: i64,
        block: Duration,
    ) -> Result<Vec<LogEntry>, RelayError> {
        let notify = self.waker(stream_id).await;
        let deadline = Instant::now() + block;

        loop {
            // Register interest before querying so an append in between wakes us.
            let notified = notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            let entries = self.fetch(stream_id, after_id).await?;
            if !entries.is_empty() || block.is_zero() {
                return Ok(entries);
            }

            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                return Ok(Vec::new());
            }
        }
    }

    /// Id of the newest entry, 0 for an empty or expired log.
    pub async fn last_id(&self, stream_id: &str) -> Result<i64, RelayError> {
        Ok(self.db.last_log_entry_id(stream_id).await?)
    }

    /// Extend the log TTL. Returns false if the log has already expired.
    pub async fn touch(&self, stream_id: &str) -> Result<bool, RelayError> {
        Ok(self.db.touch_event_log(stream_id, self.ttl_secs).await?)
    }

    async fn fetch(&self, stream_id: &str, after_id: i64) -> Result<Vec<LogEntry>, RelayError> {
        self.db
            .log_entries_after(stream_id, after_id)
            .await?
            .into_iter()
            .map(entry_from_row)
            .collect()
    }

    async fn waker(&self, stream_id: &str) -> Arc<Notify> {
        let mut wakers = self.wakers.lock().await;
        if let Some(notify) = wakers.get(stream_id).and_then(Weak::upgrade) {
            return notify;
        }

        wakers.retain(|_, weak| weak.strong_count() > 0);
        let notify = Arc::new(Notify::new());
        wakers.insert(stream_id.to_string(), Arc::downgrade(&notify));
        notify
    }

    #[cfg(test)]
    async fn waker_count(&self) -> usize {
        self.wakers.lock().await.len()
    }
}

fn entry_from_row(row: LogEntryRow) -> Result<LogEntry, RelayError> {
    let kind = row.kind.parse().map_err(|kind| RelayError::UnknownKind {
        stream_id: row.stream_id.clone(),
        kind,
    })?;

    Ok(LogEntry {
        id: row.id,
        kind,
        payload: row.payload,
    })
}
