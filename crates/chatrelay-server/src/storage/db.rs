//! `SQLite` database for the `ChatRelay` server.

pub use chatrelay_core::db::DatabaseError;

chatrelay_core::define_database!(RelayDatabase, "Relay database migrations complete");
