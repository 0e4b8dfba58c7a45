//! `SQLite` storage for the `ChatRelay` server.
//!
//! Provides persistence for the thread → turn mapping, turn status, and the
//! per-turn event logs. Every row is TTL-bound through `expires_at`.

mod db;
mod models;
mod queries_log;
mod queries_turns;

#[cfg(test)]
mod tests;

pub use db::{DatabaseError, RelayDatabase};
pub use models::*;
pub use queries_log::{AppendEntryParams, MAX_READ_BATCH};
pub use queries_turns::CreateTurnParams;
