//! Database/collection open-close-reopen round trips.

use docstore::{CollectionOptions, Database, DatabaseOptions};
use serde_json::json;
use tempfile::tempdir;

fn opts() -> DatabaseOptions {
    DatabaseOptions {
        collection_options: CollectionOptions { ttl_cleanup_interval_ms: 0, checkpoint_interval_ms: 0, ..Default::default() },
        read_only: false,
    }
}

#[test]
fn documents_survive_close_and_reopen() {
    let dir = tempdir().unwrap();
    {
        let db = Database::open_with_options(dir.path(), opts()).unwrap();
        let users = db.collection("users").unwrap();
        users.insert(json!({"_id": "1", "name": "alice"})).unwrap();
        users.insert(json!({"_id": "2", "name": "bob"})).unwrap();
        db.close().unwrap();
    }

    let db = Database::open_with_options(dir.path(), opts()).unwrap();
    let users = db.collection("users").unwrap();
    assert_eq!(users.count(None).unwrap(), 2);
    assert_eq!(users.get_by_id("1").unwrap().unwrap()["name"], "alice");
    db.close().unwrap();
}

#[test]
fn a_second_exclusive_open_on_the_same_directory_is_refused() {
    let dir = tempdir().unwrap();
    let db = Database::open_with_options(dir.path(), opts()).unwrap();
    assert!(Database::open_with_options(dir.path(), opts()).is_err());
    db.close().unwrap();

    // once the first handle is closed and dropped, a fresh open succeeds
    drop(db);
    let db2 = Database::open_with_options(dir.path(), opts()).unwrap();
    db2.close().unwrap();
}

#[test]
fn operations_after_close_are_rejected() {
    let dir = tempdir().unwrap();
    let db = Database::open_with_options(dir.path(), opts()).unwrap();
    let users = db.collection("users").unwrap();
    users.insert(json!({"name": "a"})).unwrap();
    db.close().unwrap();

    assert!(users.insert(json!({"name": "b"})).is_err());
}

#[test]
fn multiple_collections_are_independent_and_both_persist() {
    let dir = tempdir().unwrap();
    let db = Database::open_with_options(dir.path(), opts()).unwrap();
    db.collection("users").unwrap().insert(json!({"_id": "u1"})).unwrap();
    db.collection("orders").unwrap().insert(json!({"_id": "o1"})).unwrap();
    db.close().unwrap();
    drop(db);

    let db = Database::open_with_options(dir.path(), opts()).unwrap();
    let mut names = db.list_collections().unwrap();
    names.sort();
    assert_eq!(names, vec!["orders".to_string(), "users".to_string()]);
    assert_eq!(db.collection("users").unwrap().count(None).unwrap(), 1);
    assert_eq!(db.collection("orders").unwrap().count(None).unwrap(), 1);
    db.close().unwrap();
}
