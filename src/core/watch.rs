//! Change events (`watch`): one FIFO fan-out per collection,
//! filterable by the same `Filter` used by `find`. A subscription's
//! `WatchHandle` auto-unsubscribes on drop.

use crate::core::errors::*;
use crate::core::filter::Filter;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::mpsc::{channel, Receiver, Sender};
use std::sync::{Arc, RwLock};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChangeOperation {
    Insert,
    Update,
    Delete,
    /// The whole collection was emptied by a single `clear()` call, as
    /// opposed to one document being removed by `remove`/`removeMany`.
    Clear,
}

#[derive(Debug, Clone)]
pub struct ChangeEvent {
    pub collection: String,
    pub operation: ChangeOperation,
    pub doc_id: String,
    pub document: Option<Value>,
    /// The document's state before this change. Populated for `Update`
    /// (so subscribers can diff old vs. new); `None` for every other
    /// operation.
    pub old_document: Option<Value>,
}

pub(crate) struct Watcher {
    pub(crate) id: String,
    pub(crate) sender: Sender<ChangeEvent>,
    pub(crate) filter: Option<Filter>,
}

impl Watcher {
    pub(crate) fn matches(&self, event: &ChangeEvent) -> bool {
        let Some(filter) = &self.filter else {
            return true;
        };
        match &event.document {
            Some(Value::Object(doc)) => filter.eval(doc),
            // Delete/Clear events carry no document, so a filtered watcher never matches one.
            _ => false,
        }
    }

    pub(crate) fn send(&self, event: ChangeEvent) -> bool {
        self.sender.send(event).is_ok()
    }
}

pub(crate) type WatcherStorage = Arc<RwLock<HashMap<String, Vec<Watcher>>>>;

pub(crate) fn new_watcher_storage() -> WatcherStorage {
    Arc::new(RwLock::new(HashMap::new()))
}

pub struct WatchBuilder {
    collection: String,
    storage: WatcherStorage,
    filter: Option<Filter>,
}

impl WatchBuilder {
    pub(crate) fn new(collection: &str, storage: WatcherStorage) -> Self {
        Self {
            collection: collection.to_string(),
            storage,
            filter: None,
        }
    }

    /// Only events whose document matches `filter` are sent (the same
    /// filter-object query form `find` accepts).
    pub fn filter(mut self, filter: Value) -> Result<Self> {
        self.filter = Some(Filter::parse(&filter)?);
        Ok(self)
    }

    pub fn subscribe(self) -> Result<(WatchHandle, Receiver<ChangeEvent>)> {
        let (sender, receiver) = channel();
        let watcher_id = generate_watcher_id();

        let watcher = Watcher {
            id: watcher_id.clone(),
            sender,
            filter: self.filter,
        };

        {
            let mut storage = self
                .storage
                .write()
                .map_err(|_| Error::LockPoisoned { lock_name: "watcher_storage".to_string() })?;
            storage.entry(self.collection.clone()).or_default().push(watcher);
        }

        let handle = WatchHandle {
            collection: self.collection,
            watcher_id,
            storage: self.storage,
        };

        Ok((handle, receiver))
    }
}

/// Auto-unsubscribes when dropped.
pub struct WatchHandle {
    collection: String,
    watcher_id: String,
    storage: WatcherStorage,
}

impl Drop for WatchHandle {
    fn drop(&mut self) {
        if let Ok(mut storage) = self.storage.write() {
            if let Some(watchers) = storage.get_mut(&self.collection) {
                watchers.retain(|w| w.id != self.watcher_id);
                if watchers.is_empty() {
                    storage.remove(&self.collection);
                }
            }
        }
    }
}

impl WatchHandle {
    pub fn id(&self) -> &str {
        &self.watcher_id
    }

    pub fn collection(&self) -> &str {
        &self.collection
    }

    pub fn unsubscribe(self) {
        drop(self);
    }
}

/// Fans `event` out to every matching watcher of `collection`, pruning any
/// whose receiver has gone away.
pub(crate) fn emit_change(
    storage: &WatcherStorage,
    collection: &str,
    operation: ChangeOperation,
    doc_id: &str,
    document: Option<Value>,
) {
    emit_change_with_old(storage, collection, operation, doc_id, document, None)
}

/// Same as `emit_change`, additionally carrying the pre-change document
/// (only ever populated by `Update`).
pub(crate) fn emit_change_with_old(
    storage: &WatcherStorage,
    collection: &str,
    operation: ChangeOperation,
    doc_id: &str,
    document: Option<Value>,
    old_document: Option<Value>,
) {
    let event = ChangeEvent {
        collection: collection.to_string(),
        operation,
        doc_id: doc_id.to_string(),
        document,
        old_document,
    };

    let mut dead_watchers = Vec::new();
    if let Ok(storage) = storage.read() {
        if let Some(watchers) = storage.get(collection) {
            for watcher in watchers {
                if watcher.matches(&event) && !watcher.send(event.clone()) {
                    dead_watchers.push(watcher.id.clone());
                }
            }
        }
    }

    if !dead_watchers.is_empty() {
        if let Ok(mut storage) = storage.write() {
            if let Some(watchers) = storage.get_mut(collection) {
                watchers.retain(|w| !dead_watchers.contains(&w.id));
                if watchers.is_empty() {
                    storage.remove(collection);
                }
            }
        }
    }
}

fn generate_watcher_id() -> String {
    format!("watch_{}", crate::core::document::generate_id())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn watcher_with_no_filter_matches_everything() {
        let (tx, _rx) = channel();
        let watcher = Watcher { id: "t".to_string(), sender: tx, filter: None };
        let event = ChangeEvent {
            collection: "users".to_string(),
            operation: ChangeOperation::Insert,
            doc_id: "1".to_string(),
            document: Some(json!({"age": 30})),
            old_document: None,
        };
        assert!(watcher.matches(&event));
    }

    #[test]
    fn watcher_with_filter_only_matches_satisfying_docs() {
        let (tx, _rx) = channel();
        let filter = Filter::parse(&json!({"age": {"$gt": 25}})).unwrap();
        let watcher = Watcher { id: "t".to_string(), sender: tx, filter: Some(filter) };

        let matching = ChangeEvent {
            collection: "users".to_string(),
            operation: ChangeOperation::Insert,
            doc_id: "1".to_string(),
            document: Some(json!({"age": 30})),
            old_document: None,
        };
        let not_matching = ChangeEvent {
            collection: "users".to_string(),
            operation: ChangeOperation::Insert,
            doc_id: "2".to_string(),
            document: Some(json!({"age": 20})),
            old_document: None,
        };
        assert!(watcher.matches(&matching));
        assert!(!watcher.matches(&not_matching));
    }

    #[test]
    fn delete_events_never_match_a_filtered_watcher() {
        let (tx, _rx) = channel();
        let filter = Filter::parse(&json!({"age": {"$gt": 25}})).unwrap();
        let watcher = Watcher { id: "t".to_string(), sender: tx, filter: Some(filter) };
        let event = ChangeEvent {
            collection: "users".to_string(),
            operation: ChangeOperation::Delete,
            doc_id: "1".to_string(),
            document: None,
            old_document: None,
        };
        assert!(!watcher.matches(&event));
    }

    #[test]
    fn emit_change_delivers_to_subscriber() {
        let storage = new_watcher_storage();
        let (tx, rx) = channel();
        storage
            .write()
            .unwrap()
            .insert("users".to_string(), vec![Watcher { id: "t".to_string(), sender: tx, filter: None }]);

        emit_change(&storage, "users", ChangeOperation::Insert, "1", Some(json!({"name": "a"})));

        let event = rx.recv().unwrap();
        assert_eq!(event.doc_id, "1");
        assert_eq!(event.operation, ChangeOperation::Insert);
    }

    #[test]
    fn watch_handle_auto_unsubscribes_on_drop() {
        let storage = new_watcher_storage();
        let (tx, _rx) = channel();
        storage
            .write()
            .unwrap()
            .insert("users".to_string(), vec![Watcher { id: "t".to_string(), sender: tx, filter: None }]);

        let handle = WatchHandle {
            collection: "users".to_string(),
            watcher_id: "t".to_string(),
            storage: storage.clone(),
        };
        assert_eq!(storage.read().unwrap().get("users").unwrap().len(), 1);
        drop(handle);
        assert!(storage.read().unwrap().get("users").is_none());
    }
}
