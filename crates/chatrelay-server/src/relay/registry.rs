//! Session registry: which turn a thread is streaming and where that turn is.

use tracing::{debug, info};

use super::types::{RelayError, TurnStatus};
use crate::storage::{CreateTurnParams, RelayDatabase};

/// Thread → turn lookup and turn status, all TTL-bound.
#[derive(Clone)]
pub struct SessionRegistry {
    db: RelayDatabase,
    ttl_secs: i64,
}

impl SessionRegistry {
    pub const fn new(db: RelayDatabase, ttl_secs: i64) -> Self {
        Self { db, ttl_secs }
    }

    /// Register a running turn for `thread_id` and return its fresh stream id.
    ///
    /// Replaces whatever turn the thread pointed at before.
    pub async fn start_turn(&self, thread_id: &str) -> Result<String, RelayError> {
        let stream_id = uuid::Uuid::new_v4().to_string();
        self.db
            .create_turn(&CreateTurnParams {
                thread_id,
                stream_id: &stream_id,
                ttl_secs: self.ttl_secs,
            })
            .await?;

        info!(thread_id, stream_id = %stream_id, "Turn registered");
        Ok(stream_id)
    }

    pub async fn get_active_stream(&self, thread_id: &str) -> Result<Option<String>, RelayError> {
        Ok(self.db.get_thread(thread_id).await?.map(|t| t.stream_id))
    }

    /// Status of a turn; `None` if it expired or never existed.
    pub async fn get_status(&self, stream_id: &str) -> Result<Option<TurnStatus>, RelayError> {
        self.db
            .get_turn(stream_id)
            .await?
            .map(|turn| turn.status.parse())
            .transpose()
    }

    /// Id of the entry that closed the most recent message of the turn.
    pub async fn get_finalized_entry(&self, stream_id: &str) -> Result<Option<i64>, RelayError> {
        Ok(self
            .db
            .get_turn(stream_id)
            .await?
            .and_then(|turn| turn.finalized_entry_id))
    }

    /// Mark a running turn completed. Returns false if it was not running.
    pub async fn set_completed(&self, stream_id: &str) -> Result<bool, RelayError> {
        let completed = self.db.complete_turn(stream_id).await?;
        debug!(stream_id, completed, "Turn completion recorded");
        Ok(completed)
    }

    pub async fn set_finalized_entry(
        &self,
        stream_id: &str,
        entry_id: i64,
    ) -> Result<bool, RelayError> {
        Ok(self.db.set_finalized_entry(stream_id, entry_id).await?)
    }

    /// Keep a turn alive for another TTL period.
    pub async fn touch(&self, stream_id: &str) -> Result<bool, RelayError> {
        Ok(self.db.touch_turn(stream_id, self.ttl_secs).await?)
    }

    /// Delete expired mappings, turns and logs. Returns the number of rows removed.
    pub async fn purge_expired(&self) -> Result<u64, RelayError> {
        let turns = self.db.purge_expired_turns().await?;
        let logs = self.db.purge_expired_logs().await?;
        Ok(turns + logs)
    }
}
