//! Storage layer tests for the relay.

use super::db::RelayDatabase;
use super::queries_log::AppendEntryParams;
use super::queries_turns::CreateTurnParams;

async fn test_db() -> RelayDatabase {
    RelayDatabase::open_in_memory().await.unwrap()
}

async fn append(db: &RelayDatabase, stream_id: &str, kind: &str, payload: &str) -> i64 {
    db.append_log_entry(&AppendEntryParams {
        stream_id,
        kind,
        payload,
        ttl_secs: 3600,
    })
    .await
    .unwrap()
}

async fn create_turn(db: &RelayDatabase, thread_id: &str, stream_id: &str, ttl_secs: i64) {
    db.create_turn(&CreateTurnParams {
        thread_id,
        stream_id,
        ttl_secs,
    })
    .await
    .unwrap();
}

// === Event log tests ===

#[tokio::test]
async fn append_assigns_increasing_ids_per_stream() {
    let db = test_db().await;
    db.create_event_log("s1", 3600).await.unwrap();

    assert_eq!(append(&db, "s1", "chunk", "Hel").await, 1);
    assert_eq!(append(&db, "s1", "chunk", "lo").await, 2);
    // Ids are scoped to the stream.
    assert_eq!(append(&db, "s2", "chunk", "other").await, 1);
    assert_eq!(append(&db, "s1", "system:end", "").await, 3);

    assert_eq!(db.last_log_entry_id("s1").await.unwrap(), 3);
    assert_eq!(db.last_log_entry_id("s2").await.unwrap(), 1);
}

#[tokio::test]
async fn entries_after_cursor_in_order() {
    let db = test_db().await;
    for payload in ["a", "b", "c", "d"] {
        append(&db, "s1", "chunk", payload).await;
    }

    let rows = db.log_entries_after("s1", 2).await.unwrap();
    let payloads: Vec<_> = rows.iter().map(|r| r.payload.as_str()).collect();
    assert_eq!(payloads, vec!["c", "d"]);
    assert_eq!(rows[0].id, 3);

    assert!(db.log_entries_after("s1", 4).await.unwrap().is_empty());
    assert!(db.log_entries_after("unknown", 0).await.unwrap().is_empty());
}

#[tokio::test]
async fn reads_do_not_consume_entries() {
    let db = test_db().await;
    append(&db, "s1", "chunk", "x").await;

    assert_eq!(db.log_entries_after("s1", 0).await.unwrap().len(), 1);
    assert_eq!(db.log_entries_after("s1", 0).await.unwrap().len(), 1);
}

#[tokio::test]
async fn expired_log_reads_as_empty_and_is_purged() {
    let db = test_db().await;
    db.append_log_entry(&AppendEntryParams {
        stream_id: "s1",
        kind: "chunk",
        payload: "gone",
        ttl_secs: -1,
    })
    .await
    .unwrap();

    assert!(db.log_entries_after("s1", 0).await.unwrap().is_empty());
    assert_eq!(db.last_log_entry_id("s1").await.unwrap(), 0);
    assert!(!db.touch_event_log("s1", 3600).await.unwrap());

    assert_eq!(db.purge_expired_logs().await.unwrap(), 1);
    assert_eq!(db.count_log_entries("s1").await.unwrap(), 0);
}

#[tokio::test]
async fn append_extends_log_ttl() {
    let db = test_db().await;
    db.create_event_log("s1", -1).await.unwrap();
    assert_eq!(db.last_log_entry_id("s1").await.unwrap(), 0);

    append(&db, "s1", "chunk", "revived").await;
    assert_eq!(db.log_entries_after("s1", 0).await.unwrap().len(), 1);
}

// === Turn and thread tests ===

#[tokio::test]
async fn create_turn_maps_thread() {
    let db = test_db().await;
    create_turn(&db, "t1", "s1", 3600).await;

    let thread = db.get_thread("t1").await.unwrap().unwrap();
    assert_eq!(thread.stream_id, "s1");

    let turn = db.get_turn("s1").await.unwrap().unwrap();
    assert_eq!(turn.thread_id, "t1");
    assert_eq!(turn.status, "running");
    assert_eq!(turn.finalized_entry_id, None);
}

#[tokio::test]
async fn new_turn_overwrites_thread_mapping() {
    let db = test_db().await;
    create_turn(&db, "t1", "s1", 3600).await;
    create_turn(&db, "t1", "s2", 3600).await;

    let thread = db.get_thread("t1").await.unwrap().unwrap();
    assert_eq!(thread.stream_id, "s2");
    // The orphaned turn still exists until it expires.
    assert!(db.get_turn("s1").await.unwrap().is_some());
}

#[tokio::test]
async fn complete_turn_only_once() {
    let db = test_db().await;
    create_turn(&db, "t1", "s1", 3600).await;

    assert!(db.complete_turn("s1").await.unwrap());
    assert!(!db.complete_turn("s1").await.unwrap());
    assert_eq!(db.get_turn("s1").await.unwrap().unwrap().status, "completed");
    assert!(!db.complete_turn("missing").await.unwrap());
}

#[tokio::test]
async fn finalized_entry_tracks_latest() {
    let db = test_db().await;
    create_turn(&db, "t1", "s1", 3600).await;

    assert!(db.set_finalized_entry("s1", 3).await.unwrap());
    assert!(db.set_finalized_entry("s1", 7).await.unwrap());
    assert_eq!(
        db.get_turn("s1").await.unwrap().unwrap().finalized_entry_id,
        Some(7)
    );
}

#[tokio::test]
async fn expired_turn_is_absent() {
    let db = test_db().await;
    create_turn(&db, "t1", "s1", -1).await;

    assert!(db.get_thread("t1").await.unwrap().is_none());
    assert!(db.get_turn("s1").await.unwrap().is_none());
    assert!(!db.touch_turn("s1", 3600).await.unwrap());

    assert_eq!(db.purge_expired_turns().await.unwrap(), 2);
}

#[tokio::test]
async fn touch_refreshes_only_current_mapping() {
    let db = test_db().await;
    create_turn(&db, "t1", "s1", 3600).await;
    create_turn(&db, "t1", "s2", 5).await;

    let before = db.get_thread("t1").await.unwrap().unwrap().expires_at;
    // Touching the superseded turn must not extend the newer mapping.
    assert!(db.touch_turn("s1", 7200).await.unwrap());
    assert_eq!(db.get_thread("t1").await.unwrap().unwrap().expires_at, before);

    assert!(db.touch_turn("s2", 7200).await.unwrap());
    assert!(db.get_thread("t1").await.unwrap().unwrap().expires_at > before);
}

// === File-backed database ===

#[tokio::test]
async fn log_survives_reopen() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("nested").join("relay.db");

    {
        let db = RelayDatabase::open(&path).await.unwrap();
        create_turn(&db, "t1", "s1", 3600).await;
        append(&db, "s1", "chunk", "persisted").await;
        db.pool().close().await;
    }

    let db = RelayDatabase::open(&path).await.unwrap();
    assert_eq!(db.get_thread("t1").await.unwrap().unwrap().stream_id, "s1");
    let rows = db.log_entries_after("s1", 0).await.unwrap();
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].payload, "persisted");
    // Ids continue from the stored tail.
    assert_eq!(append(&db, "s1", "system:end", "").await, 2);
}
