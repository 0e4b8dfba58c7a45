//! Event log queries.

use super::db::{DatabaseError, RelayDatabase};
use super::models::LogEntryRow;
use chatrelay_core::db::{expires_in, unix_timestamp};

/// Upper bound on entries returned by one read.
pub const MAX_READ_BATCH: i64 = 256;

/// Parameters for appending one entry to a log.
pub struct AppendEntryParams<'a> {
    pub stream_id: &'a str,
    pub kind: &'a str,
    pub payload: &'a str,
    /// TTL applied to the log header on every append.
    pub ttl_secs: i64,
}

impl RelayDatabase {
    /// Create the log header for a new turn, or refresh its TTL if it exists.
    pub async fn create_event_log(
        &self,
        stream_id: &str,
        ttl_secs: i64,
    ) -> Result<(), DatabaseError> {
        sqlx::query(
            "INSERT INTO event_logs (stream_id, expires_at, created_at) VALUES (?, ?, ?) \
             ON CONFLICT(stream_id) DO UPDATE SET expires_at = excluded.expires_at",
        )
        .bind(stream_id)
        .bind(expires_in(ttl_secs))
        .bind(unix_timestamp())
        .execute(self.pool())
        .await?;

        Ok(())
    }

    /// Append an entry and return its id.
    ///
    /// The id is `MAX(id) + 1` within the stream, assigned inside the same
    /// transaction that extends the log TTL.
    pub async fn append_log_entry(
        &self,
        params: &AppendEntryParams<'_>,
    ) -> Result<i64, DatabaseError> {
        let now = unix_timestamp();
        let mut tx = self.pool().begin().await?;

        sqlx::query(
            "INSERT INTO event_logs (stream_id, expires_at, created_at) VALUES (?, ?, ?) \
             ON CONFLICT(stream_id) DO UPDATE SET expires_at = excluded.expires_at",
        )
        .bind(params.stream_id)
        .bind(expires_in(params.ttl_secs))
        .bind(now)
        .execute(&mut *tx)
        .await?;

        let id: i64 = sqlx::query_scalar(
            "INSERT INTO log_entries (stream_id, id, kind, payload, created_at) \
             SELECT ?, COALESCE(MAX(id), 0) + 1, ?, ?, ? FROM log_entries WHERE stream_id = ? \
             RETURNING id",
        )
        .bind(params.stream_id)
        .bind(params.kind)
        .bind(params.payload)
        .bind(now)
        .bind(params.stream_id)
        .fetch_one(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(id)
    }

    /// Fetch entries with `id > after_id` in id order, at most [`MAX_READ_BATCH`].
    ///
    /// An expired log reads as empty.
    pub async fn log_entries_after(
        &self,
        stream_id: &str,
        after_id: i64,
    ) -> Result<Vec<LogEntryRow>, DatabaseError> {
        let rows = sqlx::query_as::<_, LogEntryRow>(
            "SELECT e.stream_id, e.id, e.kind, e.payload, e.created_at \
             FROM log_entries e JOIN event_logs l ON l.stream_id = e.stream_id \
             WHERE e.stream_id = ? AND e.id > ? AND l.expires_at > ? \
             ORDER BY e.id ASC LIMIT ?",
        )
        .bind(stream_id)
        .bind(after_id)
        .bind(unix_timestamp())
        .bind(MAX_READ_BATCH)
        .fetch_all(self.pool())
        .await?;

        Ok(rows)
    }

    /// Id of the newest entry, or 0 when the log is empty, expired or unknown.
    pub async fn last_log_entry_id(&self, stream_id: &str) -> Result<i64, DatabaseError> {
        let row: (i64,) = sqlx::query_as(
            "SELECT COALESCE(MAX(e.id), 0) \
             FROM log_entries e JOIN event_logs l ON l.stream_id = e.stream_id \
             WHERE e.stream_id = ? AND l.expires_at > ?",
        )
        .bind(stream_id)
        .bind(unix_timestamp())
        .fetch_one(self.pool())
        .await?;

        Ok(row.0)
    }

    /// Extend the TTL of a live log. Returns false if the log is gone.
    pub async fn touch_event_log(
        &self,
        stream_id: &str,
        ttl_secs: i64,
    ) -> Result<bool, DatabaseError> {
        let result =
            sqlx::query("UPDATE event_logs SET expires_at = ? WHERE stream_id = ? AND expires_at > ?")
                .bind(expires_in(ttl_secs))
                .bind(stream_id)
                .bind(unix_timestamp())
                .execute(self.pool())
                .await?;

        Ok(result.rows_affected() > 0)
    }

    /// Remove expired logs; their entries go with them.
    pub async fn purge_expired_logs(&self) -> Result<u64, DatabaseError> {
        let result = sqlx::query("DELETE FROM event_logs WHERE expires_at <= ?")
            .bind(unix_timestamp())
            .execute(self.pool())
            .await?;

        Ok(result.rows_affected())
    }

    /// Count stored entries of a log regardless of expiry.
    pub async fn count_log_entries(&self, stream_id: &str) -> Result<i64, DatabaseError> {
        let row: (i64,) = sqlx::query_as("SELECT COUNT(*) FROM log_entries WHERE stream_id = ?")
            .bind(stream_id)
            .fetch_one(self.pool())
            .await?;

        Ok(row.0)
    }
}
