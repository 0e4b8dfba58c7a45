//! Thread and turn queries.

use super::db::{DatabaseError, RelayDatabase};
use super::models::{ThreadRow, TurnRow};
use chatrelay_core::db::{expires_in, unix_timestamp};

/// Parameters for registering a new turn.
pub struct CreateTurnParams<'a> {
    pub thread_id: &'a str,
    pub stream_id: &'a str,
    pub ttl_secs: i64,
}

impl RelayDatabase {
    /// Insert a running turn and point the thread at it, replacing any
    /// previous mapping.
    pub async fn create_turn(&self, params: &CreateTurnParams<'_>) -> Result<(), DatabaseError> {
        let now = unix_timestamp();
        let expires_at = expires_in(params.ttl_secs);
        let mut tx = self.pool().begin().await?;

        sqlx::query(
            "INSERT INTO turns (stream_id, thread_id, status, finalized_entry_id, expires_at, created_at) \
             VALUES (?, ?, 'running', NULL, ?, ?)",
        )
        .bind(params.stream_id)
        .bind(params.thread_id)
        .bind(expires_at)
        .bind(now)
        .execute(&mut *tx)
        .await?;

        sqlx::query(
            "INSERT INTO threads (thread_id, stream_id, expires_at, updated_at) VALUES (?, ?, ?, ?) \
             ON CONFLICT(thread_id) DO UPDATE SET \
             stream_id = excluded.stream_id, expires_at = excluded.expires_at, updated_at = excluded.updated_at",
        )
        .bind(params.thread_id)
        .bind(params.stream_id)
        .bind(expires_at)
        .bind(now)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(())
    }

    /// Get the live thread mapping, if any.
    pub async fn get_thread(&self, thread_id: &str) -> Result<Option<ThreadRow>, DatabaseError> {
        let row = sqlx::query_as::<_, ThreadRow>(
            "SELECT * FROM threads WHERE thread_id = ? AND expires_at > ?",
        )
        .bind(thread_id)
        .bind(unix_timestamp())
        .fetch_optional(self.pool())
        .await?;

        Ok(row)
    }

    /// Get a live turn by stream id.
    pub async fn get_turn(&self, stream_id: &str) -> Result<Option<TurnRow>, DatabaseError> {
        let row = sqlx::query_as::<_, TurnRow>(
            "SELECT * FROM turns WHERE stream_id = ? AND expires_at > ?",
        )
        .bind(stream_id)
        .bind(unix_timestamp())
        .fetch_optional(self.pool())
        .await?;

        Ok(row)
    }

    /// Transition a turn from `running` to `completed`.
    ///
    /// Returns false if the turn was already completed or does not exist.
    pub async fn complete_turn(&self, stream_id: &str) -> Result<bool, DatabaseError> {
        let result = sqlx::query(
            "UPDATE turns SET status = 'completed' WHERE stream_id = ? AND status = 'running'",
        )
        .bind(stream_id)
        .execute(self.pool())
        .await?;

        Ok(result.rows_affected() > 0)
    }

    /// Record the id of the entry that closed the latest message.
    pub async fn set_finalized_entry(
        &self,
        stream_id: &str,
        entry_id: i64,
    ) -> Result<bool, DatabaseError> {
        let result = sqlx::query("UPDATE turns SET finalized_entry_id = ? WHERE stream_id = ?")
            .bind(entry_id)
            .bind(stream_id)
            .execute(self.pool())
            .await?;

        Ok(result.rows_affected() > 0)
    }

    /// Refresh the TTL of a live turn and of the thread mapping that still
    /// points at it. Returns false if the turn is gone.
    pub async fn touch_turn(&self, stream_id: &str, ttl_secs: i64) -> Result<bool, DatabaseError> {
        let now = unix_timestamp();
        let expires_at = expires_in(ttl_secs);
        let mut tx = self.pool().begin().await?;

        let turn = sqlx::query("UPDATE turns SET expires_at = ? WHERE stream_id = ? AND expires_at > ?")
            .bind(expires_at)
            .bind(stream_id)
            .bind(now)
            .execute(&mut *tx)
            .await?;

        sqlx::query("UPDATE threads SET expires_at = ? WHERE stream_id = ? AND expires_at > ?")
            .bind(expires_at)
            .bind(stream_id)
            .bind(now)
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;
        Ok(turn.rows_affected() > 0)
    }

    /// Remove expired thread mappings and turns. Returns the count removed.
    pub async fn purge_expired_turns(&self) -> Result<u64, DatabaseError> {
        let now = unix_timestamp();
        let mut tx = self.pool().begin().await?;

        let threads = sqlx::query("DELETE FROM threads WHERE expires_at <= ?")
            .bind(now)
            .execute(&mut *tx)
            .await?;
        let turns = sqlx::query("DELETE FROM turns WHERE expires_at <= ?")
            .bind(now)
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;
        Ok(threads.rows_affected() + turns.rows_affected())
    }
}
