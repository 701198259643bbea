//! The database root: an advisory-locked directory of named collections.
//! `Database::open` takes ownership of the directory; `collection(name)`
//! lazily opens (and caches) a `Collection` rooted at `<dir>/<name>/`;
//! `begin()` hands back a `Transaction` that can touch any number of these
//! collections atomically (C6). Closing the database closes every
//! collection it has opened, as a single shutdown hook that iterates the
//! open collections.

use crate::core::collection::{Collection, CollectionOptions, Stats};
use crate::core::constants::LOCK_FILE_NAME;
use crate::core::errors::{Error, PoisonedLockExt, Result};
use crate::core::storage::ensure_dir;
use crate::core::transaction::Transaction;
use fs2::FileExt;
use std::collections::HashMap;
use std::fs::OpenOptions;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

/// Options applied to every collection the database opens (the per-collection
/// option table, lifted to the database level as a shared default; nothing
/// here currently varies per collection).
#[derive(Clone)]
pub struct DatabaseOptions {
    pub collection_options: CollectionOptions,
    /// Takes a shared advisory lock instead of an exclusive one, allowing
    /// other read-only processes to open the same directory concurrently.
    pub read_only: bool,
}

impl Default for DatabaseOptions {
    fn default() -> Self {
        Self { collection_options: CollectionOptions::default(), read_only: false }
    }
}

struct Shared {
    path: PathBuf,
    options: DatabaseOptions,
    collections: Mutex<HashMap<String, Collection>>,
    // Held for the database's lifetime; its advisory lock is what makes a
    // second concurrent `open` on the same directory fail.
    _lock_file: std::fs::File,
}

/// A cheaply-cloned handle to a directory of collections. Every clone shares
/// the same opened collections and the same directory lock.
#[derive(Clone)]
pub struct Database {
    shared: Arc<Shared>,
}

impl Database {
    pub fn open(path: impl AsRef<Path>) -> Result<Database> {
        Self::open_with_options(path, DatabaseOptions::default())
    }

    pub fn open_with_options(path: impl AsRef<Path>, options: DatabaseOptions) -> Result<Database> {
        let path = path.as_ref().to_path_buf();
        ensure_dir(&path)?;

        let lock_path = path.join(LOCK_FILE_NAME);
        let lock_file = OpenOptions::new().create(true).write(true).truncate(false).open(&lock_path)?;
        let lock_result = if options.read_only { lock_file.try_lock_shared() } else { lock_file.try_lock_exclusive() };
        lock_result.map_err(|_| {
            Error::ConfigurationError(format!(
                "database at {:?} is already locked by another process",
                path
            ))
        })?;

        Ok(Database {
            shared: Arc::new(Shared { path, options, collections: Mutex::new(HashMap::new()), _lock_file: lock_file }),
        })
    }

    pub fn path(&self) -> &Path {
        &self.shared.path
    }

    /// Lazily opens (or returns the already-opened handle for) the named
    /// collection, rooted at `<database dir>/<name>/`.
    pub fn collection(&self, name: &str) -> Result<Collection> {
        let mut collections = self.shared.collections.lock().recover_poison();
        if let Some(existing) = collections.get(name) {
            return Ok(existing.clone());
        }
        let dir = self.shared.path.join(name);
        let collection = Collection::open(&dir, name, self.shared.options.collection_options.clone())?;
        collections.insert(name.to_string(), collection.clone());
        Ok(collection)
    }

    /// Names of every collection subdirectory found on disk, whether or not
    /// this handle has opened it yet.
    pub fn list_collections(&self) -> Result<Vec<String>> {
        let mut names = Vec::new();
        for entry in std::fs::read_dir(&self.shared.path)? {
            let entry = entry?;
            if entry.file_type()?.is_dir() {
                if let Some(name) = entry.file_name().to_str() {
                    names.push(name.to_string());
                }
            }
        }
        names.sort();
        Ok(names)
    }

    /// Per-collection counters and index listings for every collection this
    /// handle has opened.
    pub fn stats(&self) -> Result<Vec<Stats>> {
        let collections = self.shared.collections.lock().recover_poison();
        collections.values().map(|c| c.stats()).collect()
    }

    /// Starts a cross-collection transaction (C6). Collections referenced
    /// inside it are resolved lazily through this same handle, so they're
    /// opened (and visible to `list_collections`/`stats`) on first use.
    pub fn begin(&self) -> Transaction {
        let db = self.clone();
        Transaction::new(move |name| db.collection(name))
    }

    /// Closes every collection this handle has opened. Idempotent: a
    /// collection already closed by a previous call to `close` is left alone.
    pub fn close(&self) -> Result<()> {
        let collections = self.shared.collections.lock().recover_poison();
        for collection in collections.values() {
            collection.close()?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tempfile::tempdir;

    fn opts() -> DatabaseOptions {
        DatabaseOptions {
            collection_options: CollectionOptions { ttl_cleanup_interval_ms: 0, checkpoint_interval_ms: 0, ..Default::default() },
            read_only: false,
        }
    }

    #[test]
    fn open_creates_directory_and_lock_file() {
        let dir = tempdir().unwrap();
        let db_path = dir.path().join("mydb");
        let db = Database::open_with_options(&db_path, opts()).unwrap();
        assert!(db_path.join(LOCK_FILE_NAME).exists());
        db.close().unwrap();
    }

    #[test]
    fn second_exclusive_open_on_same_directory_fails() {
        let dir = tempdir().unwrap();
        let db1 = Database::open_with_options(dir.path(), opts()).unwrap();
        let err = Database::open_with_options(dir.path(), opts());
        assert!(err.is_err());
        db1.close().unwrap();
    }

    #[test]
    fn collection_is_lazily_created_and_cached() {
        let dir = tempdir().unwrap();
        let db = Database::open_with_options(dir.path(), opts()).unwrap();
        let users = db.collection("users").unwrap();
        users.insert(json!({"name": "a"})).unwrap();

        let users_again = db.collection("users").unwrap();
        assert_eq!(users_again.count(None).unwrap(), 1);
        db.close().unwrap();
    }

    #[test]
    fn list_collections_reflects_disk_state() {
        let dir = tempdir().unwrap();
        let db = Database::open_with_options(dir.path(), opts()).unwrap();
        db.collection("users").unwrap();
        db.collection("orders").unwrap();
        let mut names = db.list_collections().unwrap();
        names.sort();
        assert_eq!(names, vec!["orders".to_string(), "users".to_string()]);
        db.close().unwrap();
    }

    #[test]
    fn cross_collection_transaction_commits_to_both() {
        let dir = tempdir().unwrap();
        let db = Database::open_with_options(dir.path(), opts()).unwrap();

        let txn = db.begin();
        let user = txn.collection("users").insert(json!({"name": "a"})).unwrap();
        txn.collection("orders").insert(json!({"user_id": user["_id"]})).unwrap();
        txn.commit().unwrap();

        assert_eq!(db.collection("users").unwrap().count(None).unwrap(), 1);
        assert_eq!(db.collection("orders").unwrap().count(None).unwrap(), 1);
        db.close().unwrap();
    }

    #[test]
    fn close_then_reopen_preserves_collections() {
        let dir = tempdir().unwrap();
        {
            let db = Database::open_with_options(dir.path(), opts()).unwrap();
            db.collection("users").unwrap().insert(json!({"_id": "1", "name": "a"})).unwrap();
            db.close().unwrap();
        }
        let db = Database::open_with_options(dir.path(), opts()).unwrap();
        let doc = db.collection("users").unwrap().get_by_id("1").unwrap().unwrap();
        assert_eq!(doc["name"], "a");
        db.close().unwrap();
    }
}
