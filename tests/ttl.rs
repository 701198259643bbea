//! Document expiry (C3): `expireAt`/`ttl` based liveness, both
//! at read time (defensive filtering) and via the background sweeper.

use docstore::{CollectionOptions, Database, DatabaseOptions};
use serde_json::json;
use std::thread::sleep;
use std::time::Duration;
use tempfile::tempdir;

fn opts(ttl_cleanup_interval_ms: u64) -> DatabaseOptions {
    DatabaseOptions {
        collection_options: CollectionOptions { ttl_cleanup_interval_ms, checkpoint_interval_ms: 0, ..Default::default() },
        read_only: false,
    }
}

fn now_ms() -> i64 {
    std::time::SystemTime::now().duration_since(std::time::UNIX_EPOCH).unwrap().as_millis() as i64
}

#[test]
fn a_document_with_a_past_expire_at_is_invisible_to_reads() {
    let dir = tempdir().unwrap();
    let db = Database::open_with_options(dir.path(), opts(0)).unwrap();
    let sessions = db.collection("sessions").unwrap();

    sessions.insert(json!({"_id": "expired", "expireAt": now_ms() - 1000})).unwrap();
    sessions.insert(json!({"_id": "alive", "expireAt": now_ms() + 60_000})).unwrap();

    assert!(sessions.get_by_id("expired").unwrap().is_none());
    assert_eq!(sessions.get_by_id("alive").unwrap().unwrap()["_id"], "alive");
    assert_eq!(sessions.get_all().unwrap().len(), 1);
    assert_eq!(sessions.count(None).unwrap(), 1);
    db.close().unwrap();
}

#[test]
fn relative_ttl_is_measured_from_created_at() {
    let dir = tempdir().unwrap();
    let db = Database::open_with_options(dir.path(), opts(0)).unwrap();
    let sessions = db.collection("sessions").unwrap();

    // ttl in ms, relative to the server-stamped createdAt.
    let doc = sessions.insert(json!({"ttl": 50})).unwrap();
    let id = doc["_id"].as_str().unwrap().to_string();
    assert!(sessions.get_by_id(&id).unwrap().is_some());

    sleep(Duration::from_millis(150));
    assert!(sessions.get_by_id(&id).unwrap().is_none());
    db.close().unwrap();
}

#[test]
fn invalid_or_absent_ttl_fields_default_to_alive() {
    let dir = tempdir().unwrap();
    let db = Database::open_with_options(dir.path(), opts(0)).unwrap();
    let sessions = db.collection("sessions").unwrap();

    sessions.insert(json!({"_id": "no-ttl"})).unwrap();
    sessions.insert(json!({"_id": "garbage-expire", "expireAt": "not-a-date"})).unwrap();
    sessions.insert(json!({"_id": "garbage-ttl", "ttl": "not-a-number"})).unwrap();

    assert!(sessions.get_by_id("no-ttl").unwrap().is_some());
    assert!(sessions.get_by_id("garbage-expire").unwrap().is_some());
    assert!(sessions.get_by_id("garbage-ttl").unwrap().is_some());
    assert_eq!(sessions.count(None).unwrap(), 3);
    db.close().unwrap();
}

#[test]
fn the_background_sweeper_removes_expired_documents_without_a_read() {
    let dir = tempdir().unwrap();
    let db = Database::open_with_options(dir.path(), opts(30)).unwrap();
    let sessions = db.collection("sessions").unwrap();

    sessions.insert(json!({"_id": "soon-gone", "ttl": 10})).unwrap();
    sleep(Duration::from_millis(250));

    // No read has happened yet; the sweeper should have pruned it from the
    // in-memory map and recorded the removal on its own.
    let stats = sessions.stats().unwrap();
    assert_eq!(stats.document_count, 0);
    db.close().unwrap();
}

#[test]
fn expired_documents_do_not_survive_reopen() {
    let dir = tempdir().unwrap();
    {
        let db = Database::open_with_options(dir.path(), opts(0)).unwrap();
        let sessions = db.collection("sessions").unwrap();
        sessions.insert(json!({"_id": "expired", "expireAt": now_ms() - 1000})).unwrap();
        sessions.insert(json!({"_id": "alive", "expireAt": now_ms() + 60_000})).unwrap();
        db.close().unwrap();
    }

    let db = Database::open_with_options(dir.path(), opts(0)).unwrap();
    let sessions = db.collection("sessions").unwrap();
    assert!(sessions.get_by_id("expired").unwrap().is_none());
    assert!(sessions.get_by_id("alive").unwrap().is_some());
    db.close().unwrap();
}
