//! Data models for relay storage.

/// One stored event of a turn's log.
#[derive(Debug, Clone, PartialEq, Eq, sqlx::FromRow)]
pub struct LogEntryRow {
    pub stream_id: String,
    pub id: i64,
    pub kind: String,
    pub payload: String,
    pub created_at: i64,
}

#[derive(Debug, Clone, PartialEq, Eq, sqlx::FromRow)]
pub struct TurnRow {
    pub stream_id: String,
    pub thread_id: String,
    pub status: String,
    pub finalized_entry_id: Option<i64>,
    pub expires_at: i64,
    pub created_at: i64,
}

#[derive(Debug, Clone, PartialEq, Eq, sqlx::FromRow)]
pub struct ThreadRow {
    pub thread_id: String,
    pub stream_id: String,
    pub expires_at: i64,
    pub updated_at: i64,
}
