//! C3: the checkpoint manager. A checkpoint at timestamp `T` for collection
//! `C` is one meta file plus one or more byte-budgeted data segments. Loading
//! tries newest-first and falls back to the previous checkpoint on any
//! corruption; retention keeps the newest `keep` metas and only the segments
//! they reference.

use crate::core::constants::*;
use crate::core::document::Doc;
use crate::core::storage;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IndexMetaEntry {
    #[serde(rename = "fieldName")]
    pub field_name: String,
    #[serde(rename = "type")]
    pub kind: String, // "unique" | "standard"
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CheckpointMeta {
    #[serde(rename = "collectionName")]
    pub collection_name: String,
    pub timestamp: i64,
    #[serde(rename = "documentCount")]
    pub document_count: usize,
    #[serde(rename = "indexesMeta")]
    pub indexes_meta: Vec<IndexMetaEntry>,
    #[serde(rename = "type")]
    pub kind: String, // always "meta"
}

pub struct LoadedCheckpoint {
    pub documents: HashMap<String, Doc>,
    pub indexes_meta: Vec<IndexMetaEntry>,
    pub timestamp: i64,
}

pub struct CheckpointManager {
    dir: PathBuf,
    collection: String,
}

impl CheckpointManager {
    pub fn new(collection_dir: &Path, collection: &str) -> CheckpointManager {
        CheckpointManager {
            dir: collection_dir.join(CHECKPOINT_DIR_NAME),
            collection: collection.to_string(),
        }
    }

    /// Writes a full checkpoint of `documents` at `timestamp`, bin-packing
    /// them greedily into segments capped at `max_segment_bytes`.
    pub fn write(
        &self,
        documents: &HashMap<String, Doc>,
        indexes_meta: Vec<IndexMetaEntry>,
        timestamp: i64,
        max_segment_bytes: usize,
    ) -> crate::core::errors::Result<()> {
        storage::ensure_dir(&self.dir)?;

        let segments = pack_segments(documents, max_segment_bytes);
        for (seg_num, segment) in segments.iter().enumerate() {
            let path = self.data_path(timestamp, seg_num);
            storage::write_json(&path, segment)?;
        }
        // A collection with zero documents still needs one (empty) segment so
        // the read path always finds at least a seg0 to concatenate.
        if segments.is_empty() {
            storage::write_json(&self.data_path(timestamp, 0), &Vec::<Doc>::new())?;
        }

        let meta = CheckpointMeta {
            collection_name: self.collection.clone(),
            timestamp,
            document_count: documents.len(),
            indexes_meta,
            kind: "meta".to_string(),
        };
        storage::write_json(&self.meta_path(timestamp), &meta)?;
        Ok(())
    }

    /// Tries the newest checkpoint first, falling back to progressively
    /// older ones on any corruption.
    pub fn load_latest(&self) -> crate::core::errors::Result<Option<LoadedCheckpoint>> {
        let candidates = self.list_meta_timestamps_desc()?;
        for ts in candidates {
            match self.try_load(ts) {
                Ok(Some(loaded)) => return Ok(Some(loaded)),
                Ok(None) => continue,
                Err(e) => {
                    log::warn!(
                        "checkpoint {:?} for collection '{}' at ts {} failed to load: {}; trying older",
                        self.dir,
                        self.collection,
                        ts,
                        e
                    );
                    continue;
                }
            }
        }
        Ok(None)
    }

    fn try_load(&self, ts: i64) -> crate::core::errors::Result<Option<LoadedCheckpoint>> {
        let meta_path = self.meta_path(ts);
        let meta: CheckpointMeta = storage::read_json(&meta_path)?;
        if meta.timestamp != ts {
            log::warn!(
                "checkpoint meta {:?} declares timestamp {} but filename says {}; skipping",
                meta_path,
                meta.timestamp,
                ts
            );
            return Ok(None);
        }

        let mut seg_num = 0;
        let mut documents = HashMap::new();
        loop {
            let seg_path = self.data_path(ts, seg_num);
            if !storage::exists(&seg_path) {
                break;
            }
            let docs: Vec<Doc> = storage::read_json(&seg_path)?;
            for doc in docs {
                if let Some(id) = doc.get(FIELD_ID).and_then(|v| v.as_str()) {
                    documents.insert(id.to_string(), doc);
                }
            }
            seg_num += 1;
        }
        if seg_num == 0 {
            log::warn!("checkpoint {:?} at ts {} has no data segments; skipping", self.dir, ts);
            return Ok(None);
        }

        Ok(Some(LoadedCheckpoint {
            documents,
            indexes_meta: meta.indexes_meta,
            timestamp: ts,
        }))
    }

    /// Deletes meta files older than the newest `keep`, plus any data segment
    /// whose timestamp isn't among the retained metas.
    pub fn enforce_retention(&self, keep: usize) -> crate::core::errors::Result<()> {
        let mut timestamps = self.list_meta_timestamps_desc()?;
        if timestamps.len() <= keep {
            return Ok(());
        }
        let stale: Vec<i64> = timestamps.split_off(keep);
        for ts in stale {
            storage::remove_file_if_exists(&self.meta_path(ts))?;
            let mut seg_num = 0;
            loop {
                let seg_path = self.data_path(ts, seg_num);
                if !storage::exists(&seg_path) {
                    break;
                }
                storage::remove_file_if_exists(&seg_path)?;
                seg_num += 1;
            }
        }
        Ok(())
    }

    fn list_meta_timestamps_desc(&self) -> crate::core::errors::Result<Vec<i64>> {
        if !storage::exists(&self.dir) {
            return Ok(Vec::new());
        }
        let prefix = format!("{}{}_", CHECKPOINT_META_PREFIX, self.collection);
        let mut timestamps = Vec::new();
        for entry in std::fs::read_dir(&self.dir)? {
            let entry = entry?;
            let name = entry.file_name();
            let name = name.to_string_lossy();
            if let Some(rest) = name.strip_prefix(&prefix) {
                if let Some(ts_str) = rest.strip_suffix(".json") {
                    if let Ok(ts) = ts_str.parse::<i64>() {
                        timestamps.push(ts);
                    }
                }
            }
        }
        timestamps.sort_unstable_by(|a, b| b.cmp(a));
        Ok(timestamps)
    }

    fn meta_path(&self, ts: i64) -> PathBuf {
        self.dir
            .join(format!("{}{}_{}.json", CHECKPOINT_META_PREFIX, self.collection, ts))
    }

    fn data_path(&self, ts: i64, seg_num: usize) -> PathBuf {
        self.dir.join(format!(
            "{}{}_{}_seg{}.json",
            CHECKPOINT_DATA_PREFIX, self.collection, ts, seg_num
        ))
    }
}

/// Greedy bin-packing: walk documents in (arbitrary but stable) order,
/// closing a segment once adding the next document would exceed the budget.
/// A single document larger than the budget still gets its own segment.
fn pack_segments(documents: &HashMap<String, Doc>, max_segment_bytes: usize) -> Vec<Vec<Doc>> {
    let mut ids: Vec<&String> = documents.keys().collect();
    ids.sort();

    let mut segments = Vec::new();
    let mut current: Vec<Doc> = Vec::new();
    let mut current_bytes = 2usize; // "[]"

    for id in ids {
        let doc = &documents[id];
        let size = serde_json::to_vec(doc).map(|b| b.len() + 1).unwrap_or(0);
        if !current.is_empty() && current_bytes + size > max_segment_bytes {
            segments.push(std::mem::take(&mut current));
            current_bytes = 2;
        }
        current_bytes += size;
        current.push(doc.clone());
    }
    if !current.is_empty() {
        segments.push(current);
    }
    segments
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tempfile::tempdir;

    fn doc(id: &str) -> Doc {
        json!({"_id": id, "name": "x".repeat(20)}).as_object().unwrap().clone()
    }

    #[test]
    fn write_and_load_round_trips() {
        let dir = tempdir().unwrap();
        let mgr = CheckpointManager::new(dir.path(), "users");
        let mut docs = HashMap::new();
        docs.insert("1".to_string(), doc("1"));
        docs.insert("2".to_string(), doc("2"));
        mgr.write(&docs, vec![], 1000, 2 * 1024 * 1024).unwrap();

        let loaded = mgr.load_latest().unwrap().unwrap();
        assert_eq!(loaded.documents.len(), 2);
        assert_eq!(loaded.timestamp, 1000);
    }

    #[test]
    fn falls_back_to_older_checkpoint_on_corruption() {
        let dir = tempdir().unwrap();
        let mgr = CheckpointManager::new(dir.path(), "users");
        let mut docs = HashMap::new();
        docs.insert("1".to_string(), doc("1"));
        mgr.write(&docs, vec![], 1000, 2 * 1024 * 1024).unwrap();
        mgr.write(&docs, vec![], 2000, 2 * 1024 * 1024).unwrap();

        // corrupt the newer meta
        std::fs::write(mgr.meta_path(2000), b"not json").unwrap();

        let loaded = mgr.load_latest().unwrap().unwrap();
        assert_eq!(loaded.timestamp, 1000);
    }

    #[test]
    fn retention_keeps_only_newest_k() {
        let dir = tempdir().unwrap();
        let mgr = CheckpointManager::new(dir.path(), "users");
        let mut docs = HashMap::new();
        docs.insert("1".to_string(), doc("1"));
        for ts in [1000, 2000, 3000, 4000] {
            mgr.write(&docs, vec![], ts, 50).unwrap();
        }
        mgr.enforce_retention(2).unwrap();
        let remaining = mgr.list_meta_timestamps_desc().unwrap();
        assert_eq!(remaining, vec![4000, 3000]);
    }

    #[test]
    fn segment_budget_splits_across_multiple_files() {
        let dir = tempdir().unwrap();
        let mgr = CheckpointManager::new(dir.path(), "users");
        let mut docs = HashMap::new();
        for i in 0..10 {
            docs.insert(i.to_string(), doc(&i.to_string()));
        }
        mgr.write(&docs, vec![], 1000, 50).unwrap();
        assert!(mgr.data_path(1000, 1).exists());
        let loaded = mgr.load_latest().unwrap().unwrap();
        assert_eq!(loaded.documents.len(), 10);
    }

    #[test]
    fn empty_document_set_still_produces_loadable_checkpoint() {
        let dir = tempdir().unwrap();
        let mgr = CheckpointManager::new(dir.path(), "users");
        mgr.write(&HashMap::new(), vec![], 1000, 2 * 1024 * 1024).unwrap();
        let loaded = mgr.load_latest().unwrap().unwrap();
        assert!(loaded.documents.is_empty());
    }
}
