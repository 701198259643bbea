//! Checkpoint segmentation and retention (C3), observed through
//! the public API plus direct inspection of the on-disk `_checkpoints/` dir
//! (`CheckpointManager` itself isn't exposed).

use docstore::{CollectionOptions, Database, DatabaseOptions};
use serde_json::json;
use tempfile::tempdir;

fn checkpoints_dir(db_dir: &std::path::Path, collection: &str) -> std::path::PathBuf {
    db_dir.join(collection).join("_checkpoints")
}

fn count_data_segments(dir: &std::path::Path) -> usize {
    std::fs::read_dir(dir)
        .map(|rd| {
            rd.filter_map(|e| e.ok())
                .filter(|e| e.file_name().to_string_lossy().starts_with("checkpoint_data_"))
                .count()
        })
        .unwrap_or(0)
}

fn count_meta_files(dir: &std::path::Path) -> usize {
    std::fs::read_dir(dir)
        .map(|rd| {
            rd.filter_map(|e| e.ok())
                .filter(|e| e.file_name().to_string_lossy().starts_with("checkpoint_meta_"))
                .count()
        })
        .unwrap_or(0)
}

#[test]
fn a_small_segment_budget_forces_multiple_data_files() {
    let dir = tempdir().unwrap();
    let db = Database::open_with_options(
        dir.path(),
        DatabaseOptions {
            collection_options: CollectionOptions {
                ttl_cleanup_interval_ms: 0,
                checkpoint_interval_ms: 0,
                max_segment_size_bytes: 64,
                ..Default::default()
            },
            read_only: false,
        },
    )
    .unwrap();
    let notes = db.collection("notes").unwrap();
    for i in 0..20 {
        notes.insert(json!({"_id": i.to_string(), "text": "x".repeat(40)})).unwrap();
    }
    notes.flush_to_disk().unwrap();

    let dir_path = checkpoints_dir(dir.path(), "notes");
    assert!(count_data_segments(&dir_path) > 1);
    assert_eq!(count_meta_files(&dir_path), 1);
    db.close().unwrap();
}

#[test]
fn repeated_flushes_keep_only_the_newest_checkpoints() {
    let dir = tempdir().unwrap();
    let db = Database::open_with_options(
        dir.path(),
        DatabaseOptions {
            collection_options: CollectionOptions {
                ttl_cleanup_interval_ms: 0,
                checkpoint_interval_ms: 0,
                checkpoints_to_keep: 2,
                ..Default::default()
            },
            read_only: false,
        },
    )
    .unwrap();
    let notes = db.collection("notes").unwrap();

    for round in 0..5 {
        notes.insert(json!({"_id": format!("r{round}"), "round": round})).unwrap();
        notes.flush_to_disk().unwrap();
        // Force each checkpoint onto a distinct millisecond timestamp.
        std::thread::sleep(std::time::Duration::from_millis(2));
    }

    let dir_path = checkpoints_dir(dir.path(), "notes");
    assert_eq!(count_meta_files(&dir_path), 2);
    db.close().unwrap();
}

#[test]
fn reopening_after_several_checkpoints_reflects_the_latest_state() {
    let dir = tempdir().unwrap();
    {
        let db = Database::open_with_options(
            dir.path(),
            DatabaseOptions {
                collection_options: CollectionOptions {
                    ttl_cleanup_interval_ms: 0,
                    checkpoint_interval_ms: 0,
                    checkpoints_to_keep: 1,
                    ..Default::default()
                },
                read_only: false,
            },
        )
        .unwrap();
        let notes = db.collection("notes").unwrap();
        notes.insert(json!({"_id": "1", "v": 1})).unwrap();
        notes.flush_to_disk().unwrap();

        notes.update("1", json!({"v": 2})).unwrap();
        notes.insert(json!({"_id": "2", "v": 1})).unwrap();
        notes.flush_to_disk().unwrap();
        db.close().unwrap();
    }

    let db = Database::open_with_options(dir.path(), DatabaseOptions::default()).unwrap();
    let notes = db.collection("notes").unwrap();
    assert_eq!(notes.count(None).unwrap(), 2);
    assert_eq!(notes.get_by_id("1").unwrap().unwrap()["v"], 2);
    db.close().unwrap();
}
