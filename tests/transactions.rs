//! Cross-collection transactions (C6): nothing lands on disk
//! until commit, and a successful commit makes every touched collection's
//! buffered ops durable and visible.

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
fn commit_makes_ops_durable_across_collections() {
    let dir = tempdir().unwrap();
    let db = Database::open_with_options(dir.path(), opts()).unwrap();

    let txn = db.begin();
    let user = txn.collection("users").insert(json!({"name": "alice"})).unwrap();
    let user_id = user["_id"].as_str().unwrap().to_string();
    txn.collection("orders").insert(json!({"user_id": user_id, "total": 42})).unwrap();
    txn.commit().unwrap();

    assert_eq!(db.collection("users").unwrap().count(None).unwrap(), 1);
    let orders = db.collection("orders").unwrap().get_all().unwrap();
    assert_eq!(orders.len(), 1);
    assert_eq!(orders[0]["total"], 42);
    db.close().unwrap();
}

#[test]
fn nothing_is_visible_before_commit() {
    let dir = tempdir().unwrap();
    let db = Database::open_with_options(dir.path(), opts()).unwrap();

    let txn = db.begin();
    txn.collection("users").insert(json!({"name": "alice"})).unwrap();
    // The transaction resolves (and thus lazily opens) "users" on commit, not
    // before, so nothing has touched disk yet: a fresh collection handle sees
    // zero documents until commit runs.
    assert_eq!(db.collection("users").unwrap().count(None).unwrap(), 0);

    txn.commit().unwrap();
    assert_eq!(db.collection("users").unwrap().count(None).unwrap(), 1);
    db.close().unwrap();
}

#[test]
fn rollback_discards_every_buffered_op() {
    let dir = tempdir().unwrap();
    let db = Database::open_with_options(dir.path(), opts()).unwrap();

    let txn = db.begin();
    txn.collection("users").insert(json!({"name": "alice"})).unwrap();
    txn.collection("orders").insert(json!({"total": 1})).unwrap();
    txn.rollback().unwrap();

    assert_eq!(db.collection("users").unwrap().count(None).unwrap(), 0);
    assert_eq!(db.collection("orders").unwrap().count(None).unwrap(), 0);
    db.close().unwrap();
}

#[test]
fn committed_transaction_survives_close_and_reopen() {
    let dir = tempdir().unwrap();
    {
        let db = Database::open_with_options(dir.path(), opts()).unwrap();
        let txn = db.begin();
        txn.collection("users").insert(json!({"_id": "1", "name": "alice"})).unwrap();
        txn.collection("orders").insert(json!({"_id": "o1", "user_id": "1"})).unwrap();
        txn.commit().unwrap();
        db.close().unwrap();
    }

    let db = Database::open_with_options(dir.path(), opts()).unwrap();
    assert_eq!(db.collection("users").unwrap().get_by_id("1").unwrap().unwrap()["name"], "alice");
    assert_eq!(db.collection("orders").unwrap().get_by_id("o1").unwrap().unwrap()["user_id"], "1");
    db.close().unwrap();
}

#[test]
fn update_on_a_missing_id_within_a_transaction_is_a_harmless_no_op() {
    let dir = tempdir().unwrap();
    {
        let db = Database::open_with_options(dir.path(), opts()).unwrap();
        let txn = db.begin();
        txn.collection("u").insert(json!({"_id": "1"})).unwrap();
        // "acct" is absent from the "a" collection; this must not fail the
        // transaction or the other collection's op.
        txn.collection("a").update("acct", json!({"balance": 10})).unwrap();
        txn.commit().unwrap();
        db.close().unwrap();
    }

    let db = Database::open_with_options(dir.path(), opts()).unwrap();
    assert!(db.collection("u").unwrap().get_by_id("1").unwrap().is_some());
    assert!(db.collection("a").unwrap().get_by_id("acct").unwrap().is_none());
    db.close().unwrap();
}

#[test]
fn transaction_cannot_be_committed_or_buffered_into_twice() {
    let dir = tempdir().unwrap();
    let db = Database::open_with_options(dir.path(), opts()).unwrap();

    let txn = db.begin();
    txn.collection("users").insert(json!({"name": "a"})).unwrap();
    let second_handle = txn.clone();
    second_handle.commit().unwrap();

    assert!(txn.collection("users").insert(json!({"name": "b"})).is_err());
    db.close().unwrap();
}
