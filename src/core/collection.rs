//! Collection engine (C5): the in-memory document map, the serialized write
//! queue that gives every mutation FIFO ordering, the TTL sweeper, checkpoint
//! triggers, event emission, and the collection lifecycle state machine.
//! Reads never enter the queue — they take the state `RwLock` directly.

use crate::core::checkpoint::{CheckpointManager, IndexMetaEntry};
use crate::core::constants::*;
use crate::core::document::{generate_id, is_alive, now_millis, now_rfc3339, stamp_new, Doc};
use crate::core::errors::{Error, PoisonedLockExt, Result};
use crate::core::filter::{FieldCond, Filter, Query};
use crate::core::index::{IndexKey, IndexManager};
use crate::core::projection::Projection;
use crate::core::transaction::TxnOp;
use crate::core::update::{apply_patch_with_unset, UpdateSpec};
use crate::core::wal::{Applied, Wal, WalRecord};
use crate::core::watch::{emit_change, emit_change_with_old, new_watcher_storage, ChangeOperation, WatchBuilder, WatcherStorage};
use serde_json::Value;
use std::collections::{BTreeSet, HashMap};
use std::fmt;
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::mpsc::{sync_channel, Receiver, SyncSender};
use std::sync::{Arc, Mutex, RwLock};
use std::thread;
use std::time::Duration;

/// Public configuration for a single collection.
#[derive(Clone)]
pub struct CollectionOptions {
    pub max_segment_size_bytes: usize,
    pub checkpoint_interval_ms: u64,
    pub max_wal_entries_before_checkpoint: u64,
    pub wal_force_sync: bool,
    pub checkpoints_to_keep: usize,
    pub ttl_cleanup_interval_ms: u64,
    pub max_docs_per_batch_wal_entry: usize,
    /// Abort (rather than skip) on the first malformed WAL line during recovery.
    pub strict_wal_replay: bool,
    pub id_generator: Arc<dyn Fn() -> String + Send + Sync>,
}

impl fmt::Debug for CollectionOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CollectionOptions")
            .field("max_segment_size_bytes", &self.max_segment_size_bytes)
            .field("checkpoint_interval_ms", &self.checkpoint_interval_ms)
            .field("max_wal_entries_before_checkpoint", &self.max_wal_entries_before_checkpoint)
            .field("wal_force_sync", &self.wal_force_sync)
            .field("checkpoints_to_keep", &self.checkpoints_to_keep)
            .field("ttl_cleanup_interval_ms", &self.ttl_cleanup_interval_ms)
            .field("max_docs_per_batch_wal_entry", &self.max_docs_per_batch_wal_entry)
            .field("strict_wal_replay", &self.strict_wal_replay)
            .finish()
    }
}

impl Default for CollectionOptions {
    fn default() -> Self {
        Self {
            max_segment_size_bytes: DEFAULT_MAX_SEGMENT_SIZE_BYTES,
            checkpoint_interval_ms: DEFAULT_CHECKPOINT_INTERVAL_MS,
            max_wal_entries_before_checkpoint: DEFAULT_MAX_WAL_ENTRIES_BEFORE_CHECKPOINT,
            wal_force_sync: false,
            checkpoints_to_keep: DEFAULT_CHECKPOINTS_TO_KEEP,
            ttl_cleanup_interval_ms: DEFAULT_TTL_CLEANUP_INTERVAL_MS,
            max_docs_per_batch_wal_entry: DEFAULT_MAX_DOCS_PER_BATCH_WAL_ENTRY,
            strict_wal_replay: false,
            id_generator: Arc::new(generate_id),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Lifecycle {
    Uninitialized,
    Open,
    Closing,
    Closed,
    Failed(String),
}

#[derive(Debug, Default)]
struct Counters {
    inserts: AtomicU64,
    updates: AtomicU64,
    removes: AtomicU64,
    clears: AtomicU64,
}

#[derive(Debug, Clone, serde::Serialize)]
pub struct IndexInfo {
    pub field: String,
    pub unique: bool,
}

#[derive(Debug, Clone, serde::Serialize)]
pub struct Stats {
    pub name: String,
    pub document_count: usize,
    pub inserts: u64,
    pub updates: u64,
    pub removes: u64,
    pub clears: u64,
    pub indexes: Vec<IndexInfo>,
}

#[derive(Debug, Clone, Copy, Default, serde::Serialize)]
pub struct UpdateManyResult {
    pub matched: usize,
    pub modified: usize,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UpsertResult {
    Inserted(String),
    Updated(String),
}

#[derive(Debug, Clone)]
pub struct UpsertOutcome {
    pub document: Value,
    pub operation: UpsertResult,
}

/// The live document map plus its secondary indexes, guarded by one `RwLock`.
struct State {
    documents: HashMap<String, Doc>,
    indexes: IndexManager,
}

enum Task {
    Insert(Doc, SyncSender<Result<Doc>>),
    InsertMany(Vec<Doc>, SyncSender<Result<Vec<Doc>>>),
    Update(String, Doc, SyncSender<Result<Option<Doc>>>),
    UpdateMany(Query, UpdateSpec, SyncSender<Result<UpdateManyResult>>),
    Remove(String, SyncSender<Result<bool>>),
    RemoveMany(Query, SyncSender<Result<usize>>),
    Clear(SyncSender<Result<()>>),
    Upsert(Filter, Doc, Option<Doc>, SyncSender<Result<UpsertOutcome>>),
    CreateIndex(String, bool, SyncSender<Result<()>>),
    DropIndex(String, SyncSender<Result<()>>),
    TtlSweep(SyncSender<Result<usize>>),
    Flush(SyncSender<Result<()>>),
    ApplyTxn(String, Vec<TxnOp>, SyncSender<Result<()>>),
}

struct Shared {
    name: String,
    wal: Wal,
    checkpoints: CheckpointManager,
    options: CollectionOptions,
    state: RwLock<State>,
    lifecycle: Mutex<Lifecycle>,
    counters: Counters,
    watchers: WatcherStorage,
    queue: Mutex<Option<SyncSender<Task>>>,
    wal_entries_since_checkpoint: AtomicU64,
    checkpoint_running: AtomicBool,
    shutdown: AtomicBool,
}

/// A cheaply-cloned handle to one named collection. Every clone shares the
/// same background worker, write queue, and in-memory state.
#[derive(Clone)]
pub struct Collection {
    shared: Arc<Shared>,
}

impl Collection {
    pub fn name(&self) -> &str {
        &self.shared.name
    }

    /// Opens (creating if absent) the collection rooted at `dir`: loads the
    /// newest consistent checkpoint, replays the WAL tail after it, rebuilds
    /// indexes, prunes TTL-expired documents, and starts the background
    /// worker plus its timers.
    pub(crate) fn open(dir: &Path, name: &str, options: CollectionOptions) -> Result<Collection> {
        crate::core::storage::ensure_dir(dir)?;
        let wal_path = dir.join(format!("{}{}{}", WAL_FILE_PREFIX, name, WAL_FILE_SUFFIX));
        let wal = Wal::open(&wal_path, options.wal_force_sync)?;
        let checkpoints = CheckpointManager::new(dir, name);

        let loaded = checkpoints.load_latest()?;
        let mut documents: HashMap<String, Doc> = HashMap::new();
        let mut indexes = IndexManager::new();
        let since_ms = loaded.as_ref().map(|l| l.timestamp);
        if let Some(loaded) = loaded {
            documents = loaded.documents;
            for entry in loaded.indexes_meta {
                let unique = entry.kind == "unique";
                indexes.create_index(&entry.field_name, unique, &documents)?;
            }
        }

        let applied = Wal::replay(&wal_path, since_ms, options.strict_wal_replay)?;
        for record in applied {
            apply_replayed(&mut documents, record);
        }

        let now = now_millis();
        let expired: Vec<String> = documents
            .iter()
            .filter(|(_, d)| !is_alive(d, now))
            .map(|(id, _)| id.clone())
            .collect();
        for id in &expired {
            documents.remove(id);
        }
        indexes.rebuild_from_data(&documents)?;

        let shared = Arc::new(Shared {
            name: name.to_string(),
            wal,
            checkpoints,
            options,
            state: RwLock::new(State { documents, indexes }),
            lifecycle: Mutex::new(Lifecycle::Uninitialized),
            counters: Counters::default(),
            watchers: new_watcher_storage(),
            queue: Mutex::new(None),
            wal_entries_since_checkpoint: AtomicU64::new(0),
            checkpoint_running: AtomicBool::new(false),
            shutdown: AtomicBool::new(false),
        });

        let collection = Collection { shared };
        collection.start()?;
        Ok(collection)
    }

    /// Spawns the worker and its timers as detached threads: they run for as
    /// long as the queue stays open and need no handle kept around.
    fn start(&self) -> Result<()> {
        let (tx, rx) = sync_channel::<Task>(1024);
        *self.shared.queue.lock().recover_poison() = Some(tx.clone());

        let worker_shared = self.shared.clone();
        thread::spawn(move || run_worker(worker_shared, rx));

        if self.shared.options.ttl_cleanup_interval_ms > 0 {
            let shared = self.shared.clone();
            let tx = tx.clone();
            thread::spawn(move || ttl_loop(shared, tx));
        }

        if self.shared.options.checkpoint_interval_ms > 0 {
            let shared = self.shared.clone();
            thread::spawn(move || checkpoint_timer_loop(shared, tx));
        }

        *self.shared.lifecycle.lock().recover_poison() = Lifecycle::Open;
        Ok(())
    }

    fn check_open(&self) -> Result<()> {
        match &*self.shared.lifecycle.lock().recover_poison() {
            Lifecycle::Open => Ok(()),
            Lifecycle::Closing | Lifecycle::Closed => Err(Error::CollectionClosed { name: self.shared.name.clone() }),
            Lifecycle::Failed(reason) => Err(Error::CollectionFailed { name: self.shared.name.clone(), reason: reason.clone() }),
            Lifecycle::Uninitialized => Err(Error::CollectionFailed { name: self.shared.name.clone(), reason: "not started".to_string() }),
        }
    }

    fn send<T>(&self, build: impl FnOnce(SyncSender<Result<T>>) -> Task) -> Result<T> {
        self.check_open()?;
        let (reply_tx, reply_rx) = sync_channel(1);
        let task = build(reply_tx);
        let queue = self.shared.queue.lock().recover_poison();
        let tx = queue.as_ref().ok_or_else(|| Error::QueueClosed { name: self.shared.name.clone() })?;
        tx.send(task).map_err(|_| Error::QueueClosed { name: self.shared.name.clone() })?;
        drop(queue);
        reply_rx.recv().map_err(|_| Error::QueueClosed { name: self.shared.name.clone() })?
    }

    pub fn insert(&self, doc: Value) -> Result<Value> {
        let obj = as_object(doc)?;
        let stored = self.send(|reply| Task::Insert(obj, reply))?;
        Ok(Value::Object(stored))
    }

    pub fn insert_many(&self, docs: Vec<Value>) -> Result<Vec<Value>> {
        let objs: Result<Vec<Doc>> = docs.into_iter().map(as_object).collect();
        let objs = objs?;
        let stored = self.send(|reply| Task::InsertMany(objs, reply))?;
        Ok(stored.into_iter().map(Value::Object).collect())
    }

    pub fn update(&self, id: &str, patch: Value) -> Result<Option<Value>> {
        let obj = as_object(patch)?;
        let updated = self.send(|reply| Task::Update(id.to_string(), obj, reply))?;
        Ok(updated.map(Value::Object))
    }

    pub fn update_many(&self, query: Query, update_spec: &Value) -> Result<UpdateManyResult> {
        let spec = UpdateSpec::parse(update_spec)?;
        self.send(|reply| Task::UpdateMany(query, spec, reply))
    }

    pub fn remove(&self, id: &str) -> Result<bool> {
        self.send(|reply| Task::Remove(id.to_string(), reply))
    }

    pub fn remove_many(&self, query: Query) -> Result<usize> {
        self.send(|reply| Task::RemoveMany(query, reply))
    }

    pub fn clear(&self) -> Result<()> {
        self.send(Task::Clear)
    }

    pub fn upsert(&self, filter: &Value, data: Value, set_on_insert: Option<Value>) -> Result<UpsertOutcome> {
        let filter = Filter::parse(filter)?;
        let data = as_object(data)?;
        let set_on_insert = set_on_insert.map(as_object).transpose()?;
        self.send(|reply| Task::Upsert(filter, data, set_on_insert, reply))
    }

    pub fn get_by_id(&self, id: &str) -> Result<Option<Value>> {
        self.check_open()?;
        let state = self.shared.state.read().recover_poison();
        let now = now_millis();
        Ok(state.documents.get(id).filter(|d| is_alive(d, now)).map(|d| Value::Object(d.clone())))
    }

    pub fn get_all(&self) -> Result<Vec<Value>> {
        self.check_open()?;
        let state = self.shared.state.read().recover_poison();
        let now = now_millis();
        Ok(state
            .documents
            .values()
            .filter(|d| is_alive(d, now))
            .map(|d| Value::Object(d.clone()))
            .collect())
    }

    pub fn count(&self, query: Option<&Query>) -> Result<usize> {
        self.check_open()?;
        let state = self.shared.state.read().recover_poison();
        let now = now_millis();
        let count = match query {
            None => state.documents.values().filter(|d| is_alive(d, now)).count(),
            Some(q) => candidate_ids(&state, q)
                .into_iter()
                .filter_map(|id| state.documents.get(&id))
                .filter(|d| is_alive(d, now) && q.matches(d))
                .count(),
        };
        Ok(count)
    }

    pub fn find(&self, query: &Query, projection: Option<&Value>) -> Result<Vec<Value>> {
        self.check_open()?;
        let projection = Projection::parse(projection)?;
        let state = self.shared.state.read().recover_poison();
        let now = now_millis();
        let mut out = Vec::new();
        for id in candidate_ids(&state, query) {
            if let Some(doc) = state.documents.get(&id) {
                if is_alive(doc, now) && query.matches(doc) {
                    out.push(Value::Object(projection.apply(doc)));
                }
            }
        }
        Ok(out)
    }

    pub fn find_one(&self, query: &Query, projection: Option<&Value>) -> Result<Option<Value>> {
        self.check_open()?;
        let projection = Projection::parse(projection)?;
        let state = self.shared.state.read().recover_poison();
        let now = now_millis();
        for id in candidate_ids(&state, query) {
            if let Some(doc) = state.documents.get(&id) {
                if is_alive(doc, now) && query.matches(doc) {
                    return Ok(Some(Value::Object(projection.apply(doc))));
                }
            }
        }
        Ok(None)
    }

    pub fn find_by_indexed_value(&self, field: &str, value: &Value) -> Result<Vec<Value>> {
        self.check_open()?;
        let state = self.shared.state.read().recover_poison();
        let now = now_millis();
        let ids = state.indexes.find_ids_by_eq(field, value).unwrap_or_default();
        Ok(ids
            .into_iter()
            .filter_map(|id| state.documents.get(&id))
            .filter(|d| is_alive(d, now))
            .map(|d| Value::Object(d.clone()))
            .collect())
    }

    pub fn find_one_by_indexed_value(&self, field: &str, value: &Value) -> Result<Option<Value>> {
        self.check_open()?;
        let state = self.shared.state.read().recover_poison();
        let now = now_millis();
        Ok(state
            .indexes
            .find_one_id_by_eq(field, value)
            .and_then(|id| state.documents.get(&id))
            .filter(|d| is_alive(d, now))
            .map(|d| Value::Object(d.clone())))
    }

    pub fn create_index(&self, field: &str, unique: bool) -> Result<()> {
        self.send(|reply| Task::CreateIndex(field.to_string(), unique, reply))
    }

    pub fn drop_index(&self, field: &str) -> Result<()> {
        self.send(|reply| Task::DropIndex(field.to_string(), reply))
    }

    pub fn get_indexes(&self) -> Result<Vec<IndexInfo>> {
        self.check_open()?;
        let state = self.shared.state.read().recover_poison();
        Ok(state.indexes.list().into_iter().map(|(field, unique)| IndexInfo { field, unique }).collect())
    }

    pub fn watch(&self) -> WatchBuilder {
        WatchBuilder::new(&self.shared.name, self.shared.watchers.clone())
    }

    pub fn stats(&self) -> Result<Stats> {
        self.check_open()?;
        let state = self.shared.state.read().recover_poison();
        Ok(Stats {
            name: self.shared.name.clone(),
            document_count: state.documents.len(),
            inserts: self.shared.counters.inserts.load(Ordering::Relaxed),
            updates: self.shared.counters.updates.load(Ordering::Relaxed),
            removes: self.shared.counters.removes.load(Ordering::Relaxed),
            clears: self.shared.counters.clears.load(Ordering::Relaxed),
            indexes: state.indexes.list().into_iter().map(|(field, unique)| IndexInfo { field, unique }).collect(),
        })
    }

    /// Forces a checkpoint and WAL compaction regardless of the configured triggers.
    pub fn flush_to_disk(&self) -> Result<()> {
        self.send(Task::Flush)
    }

    pub(crate) fn apply_transaction_block(&self, txn_id: &str, ops: Vec<TxnOp>) -> Result<()> {
        self.send(|reply| Task::ApplyTxn(txn_id.to_string(), ops, reply))
    }

    /// Stops timers, drains the queue, forces a final checkpoint, compacts the
    /// WAL, and marks the collection `Closed`: stop timers → drain queue →
    /// final checkpoint → compact → Closed.
    pub fn close(&self) -> Result<()> {
        {
            let mut lifecycle = self.shared.lifecycle.lock().recover_poison();
            if *lifecycle != Lifecycle::Open {
                return Ok(());
            }
            *lifecycle = Lifecycle::Closing;
        }
        self.flush_to_disk()?;
        self.shared.shutdown.store(true, Ordering::SeqCst);
        if let Some(tx) = self.shared.queue.lock().recover_poison().take() {
            drop(tx);
        }
        *self.shared.lifecycle.lock().recover_poison() = Lifecycle::Closed;
        Ok(())
    }
}

fn as_object(v: Value) -> Result<Doc> {
    v.as_object()
        .cloned()
        .ok_or_else(|| Error::InvalidArgument("document must be a JSON object".to_string()))
}

/// Index-assisted candidate seeding: prefer an exact match on any indexed
/// top-level field, else the first indexed field with a usable range
/// condition, else fall back to a full scan.
fn candidate_ids(state: &State, query: &Query) -> Vec<String> {
    if let Query::Filter(filter) = query {
        if let Some(ids) = seed_from_index(state, filter) {
            return ids;
        }
    }
    state.documents.keys().cloned().collect()
}

fn seed_from_index(state: &State, filter: &Filter) -> Option<Vec<String>> {
    let conds = filter.top_level_field_conds();
    let mut best: Option<Vec<String>> = None;
    for (field, cond) in conds {
        if !state.indexes.has(field) {
            continue;
        }
        match cond {
            FieldCond::Eq(v) => {
                return Some(state.indexes.find_ids_by_eq(field, v).unwrap_or_default());
            }
            FieldCond::Ops(_) => {
                if best.is_none() {
                    if let Some(ids) = state.indexes.find_ids_by_cond(field, cond) {
                        best = Some(ids);
                    }
                }
            }
        }
    }
    best
}

fn apply_replayed(documents: &mut HashMap<String, Doc>, applied: Applied) {
    match applied {
        Applied::Insert { mut doc, txn_id } => {
            tag_txn(&mut doc, txn_id);
            if let Some(id) = doc.get(FIELD_ID).and_then(|v| v.as_str()) {
                documents.insert(id.to_string(), doc);
            }
        }
        Applied::BatchInsert { docs, txn_id } => {
            for mut doc in docs {
                tag_txn(&mut doc, txn_id.clone());
                if let Some(id) = doc.get(FIELD_ID).and_then(|v| v.as_str()) {
                    documents.insert(id.to_string(), doc);
                }
            }
        }
        Applied::Update { id, data, txn_id } => {
            if let Some(existing) = documents.get_mut(&id) {
                apply_patch_with_unset(existing, &data);
                tag_txn(existing, txn_id);
            }
        }
        Applied::Remove { id, .. } => {
            documents.remove(&id);
        }
        Applied::Clear { .. } => {
            documents.clear();
        }
    }
}

/// Stamps the transaction-recovery tag: `_txn` carries the id of the
/// transaction that last touched the document, `TXN_APPLIED_TAG` marks that
/// the mutation was recovered from a committed transaction block (as opposed
/// to ordinary non-transactional replay).
fn tag_txn(doc: &mut Doc, txn_id: Option<String>) {
    if let Some(txn_id) = txn_id {
        doc.insert(FIELD_TXN.to_string(), Value::String(txn_id));
        doc.insert(TXN_APPLIED_TAG.to_string(), Value::Bool(true));
    }
}

fn run_worker(shared: Arc<Shared>, rx: Receiver<Task>) {
    for task in rx {
        let outcome = handle_task(&shared, task);
        if outcome {
            if let Err(e) = maybe_checkpoint(&shared) {
                log::error!("collection '{}': triggered checkpoint failed: {}", shared.name, e);
            }
        }
    }
}

/// Executes one task, returning whether a WAL-entry-count checkpoint trigger
/// should now be evaluated.
fn handle_task(shared: &Arc<Shared>, task: Task) -> bool {
    match task {
        Task::Insert(doc, reply) => {
            let result = op_insert(shared, doc);
            let wrote_wal = result.is_ok();
            let _ = reply.send(result);
            wrote_wal
        }
        Task::InsertMany(docs, reply) => {
            let result = op_insert_many(shared, docs);
            let wrote_wal = result.is_ok();
            let _ = reply.send(result);
            wrote_wal
        }
        Task::Update(id, patch, reply) => {
            let result = op_update(shared, &id, patch, None);
            let wrote_wal = matches!(result, Ok(Some(_)));
            let _ = reply.send(result);
            wrote_wal
        }
        Task::UpdateMany(query, spec, reply) => {
            let result = op_update_many(shared, &query, &spec);
            let wrote_wal = matches!(&result, Ok(r) if r.modified > 0);
            let _ = reply.send(result);
            wrote_wal
        }
        Task::Remove(id, reply) => {
            let result = op_remove(shared, &id);
            let wrote_wal = matches!(result, Ok(true));
            let _ = reply.send(result);
            wrote_wal
        }
        Task::RemoveMany(query, reply) => {
            let result = op_remove_many(shared, &query);
            let wrote_wal = matches!(&result, Ok(n) if *n > 0);
            let _ = reply.send(result);
            wrote_wal
        }
        Task::Clear(reply) => {
            let result = op_clear(shared);
            let wrote_wal = result.is_ok();
            let _ = reply.send(result);
            wrote_wal
        }
        Task::Upsert(filter, data, set_on_insert, reply) => {
            let result = op_upsert(shared, &filter, data, set_on_insert);
            let wrote_wal = result.is_ok();
            let _ = reply.send(result);
            wrote_wal
        }
        Task::CreateIndex(field, unique, reply) => {
            let result = op_create_index(shared, &field, unique);
            let _ = reply.send(result);
            false
        }
        Task::DropIndex(field, reply) => {
            let mut state = match shared.state.write() {
                Ok(s) => s,
                Err(e) => e.into_inner(),
            };
            state.indexes.drop_index(&field);
            let _ = reply.send(Ok(()));
            false
        }
        Task::TtlSweep(reply) => {
            let removed = op_ttl_sweep(shared);
            let _ = reply.send(Ok(removed));
            false
        }
        Task::Flush(reply) => {
            let result = checkpoint_now(shared, true);
            let _ = reply.send(result);
            false
        }
        Task::ApplyTxn(txn_id, ops, reply) => {
            let result = op_apply_txn(shared, &txn_id, ops);
            let wrote_wal = result.is_ok();
            let _ = reply.send(result);
            wrote_wal
        }
    }
}

fn op_insert(shared: &Arc<Shared>, doc: Doc) -> Result<Doc> {
    let stamped = stamp_new(doc, &*shared.options.id_generator);
    let id = stamped.get(FIELD_ID).and_then(|v| v.as_str()).unwrap_or_default().to_string();
    let ts = stamped.get(FIELD_UPDATED_AT).and_then(|v| v.as_str()).unwrap_or_default().to_string();

    let mut state = shared.state.write().recover_poison();
    state.indexes.check_new(&stamped)?;
    shared.wal.append(&WalRecord::Insert { doc: stamped.clone(), ts, txn_id: None })?;
    shared.bump_wal_entries(1);
    state.documents.insert(id.clone(), stamped.clone());
    state.indexes.after_insert(&stamped, &id)?;
    drop(state);

    shared.counters.inserts.fetch_add(1, Ordering::Relaxed);
    emit_change(&shared.watchers, &shared.name, ChangeOperation::Insert, &id, Some(Value::Object(stamped.clone())));
    Ok(stamped)
}

fn op_insert_many(shared: &Arc<Shared>, docs: Vec<Doc>) -> Result<Vec<Doc>> {
    let stamped: Vec<Doc> = docs.into_iter().map(|d| stamp_new(d, &*shared.options.id_generator)).collect();

    let mut state = shared.state.write().recover_poison();
    precheck_batch_unique(&state, &stamped)?;

    let chunk_size = shared.options.max_docs_per_batch_wal_entry.max(1);
    for chunk in stamped.chunks(chunk_size) {
        let ts = chunk[0].get(FIELD_UPDATED_AT).and_then(|v| v.as_str()).unwrap_or_default().to_string();
        shared.wal.append(&WalRecord::BatchInsert { docs: chunk.to_vec(), ts, txn_id: None })?;
        shared.bump_wal_entries(1);
    }

    for doc in &stamped {
        let id = doc.get(FIELD_ID).and_then(|v| v.as_str()).unwrap_or_default().to_string();
        state.documents.insert(id.clone(), doc.clone());
        state.indexes.after_insert(doc, &id)?;
    }
    drop(state);

    shared.counters.inserts.fetch_add(stamped.len() as u64, Ordering::Relaxed);
    for doc in &stamped {
        let id = doc.get(FIELD_ID).and_then(|v| v.as_str()).unwrap_or_default();
        emit_change(&shared.watchers, &shared.name, ChangeOperation::Insert, id, Some(Value::Object(doc.clone())));
    }
    Ok(stamped)
}

fn precheck_batch_unique(state: &State, docs: &[Doc]) -> Result<()> {
    for field in state.indexes.unique_fields() {
        let mut seen: BTreeSet<IndexKey> = BTreeSet::new();
        for doc in docs {
            if let Some(key) = doc.get(&field).and_then(IndexKey::from_value) {
                if !seen.insert(key) {
                    return Err(Error::UniqueConstraint { field: field.clone(), value: format!("{:?}", doc.get(&field)) });
                }
            }
        }
    }
    for doc in docs {
        state.indexes.check_new(doc)?;
    }
    Ok(())
}

fn op_update(shared: &Arc<Shared>, id: &str, patch: Doc, forced_ts: Option<String>) -> Result<Option<Doc>> {
    let mut state = shared.state.write().recover_poison();
    let Some(old) = state.documents.get(id).cloned() else {
        return Ok(None);
    };

    let mut candidate = old.clone();
    shallow_merge_update_sanitized(&mut candidate, &patch);
    let ts = forced_ts.unwrap_or_else(|| candidate.get(FIELD_UPDATED_AT).and_then(|v| v.as_str()).unwrap_or_default().to_string());

    // Uniqueness pre-check against the candidate post-merge value, excluding this id.
    check_unique_excluding(&state, &candidate, id)?;

    shared.wal.append(&WalRecord::Update { id: id.to_string(), data: sanitized_patch(&patch), ts, txn_id: None })?;
    shared.bump_wal_entries(1);

    state.documents.insert(id.to_string(), candidate.clone());
    state.indexes.after_update(&old, &candidate, id)?;
    drop(state);

    shared.counters.updates.fetch_add(1, Ordering::Relaxed);
    emit_change_with_old(
        &shared.watchers,
        &shared.name,
        ChangeOperation::Update,
        id,
        Some(Value::Object(candidate.clone())),
        Some(Value::Object(old)),
    );
    Ok(Some(candidate))
}

/// Applies the shallow-merge contract (never touching `_id`/`createdAt`) used
/// by both `update` and the full-replacement branch of `update_many`. A
/// `null` patch value deletes the key rather than storing it — the sentinel
/// `$unset` relies on, since `updateMany`'s operators and `update`'s direct
/// patches both funnel through the same `UPDATE` WAL record and must apply
/// identically live and on replay (`apply_patch_with_unset` is what WAL
/// replay uses for every `UPDATE` record, transactional or not).
fn shallow_merge_update_sanitized(existing: &mut Doc, patch: &Doc) {
    apply_patch_with_unset(existing, patch);
    existing.insert(FIELD_UPDATED_AT.to_string(), Value::String(now_rfc3339()));
}

fn sanitized_patch(patch: &Doc) -> Doc {
    let mut out = patch.clone();
    out.remove(FIELD_ID);
    out.remove(FIELD_CREATED_AT);
    out
}

fn check_unique_excluding(state: &State, candidate: &Doc, id: &str) -> Result<()> {
    for field in state.indexes.unique_fields() {
        if let Some(value) = candidate.get(&field) {
            if let Some(existing_id) = state.indexes.find_one_id_by_eq(&field, value) {
                if existing_id != id {
                    return Err(Error::UniqueConstraint { field, value: value.to_string() });
                }
            }
        }
    }
    Ok(())
}

fn op_update_many(shared: &Arc<Shared>, query: &Query, spec: &UpdateSpec) -> Result<UpdateManyResult> {
    let matched_ids: Vec<String> = {
        let state = shared.state.read().recover_poison();
        let now = now_millis();
        candidate_ids(&state, query)
            .into_iter()
            .filter(|id| state.documents.get(id).map(|d| is_alive(d, now) && query.matches(d)).unwrap_or(false))
            .collect()
    };

    let mut modified = 0;
    for id in &matched_ids {
        let patch_doc = {
            let state = shared.state.read().recover_poison();
            match state.documents.get(id) {
                Some(existing) => spec.to_patch(existing),
                None => continue,
            }
        };
        if op_update(shared, id, patch_doc, None)?.is_some() {
            modified += 1;
        }
    }

    Ok(UpdateManyResult { matched: matched_ids.len(), modified })
}

fn op_remove(shared: &Arc<Shared>, id: &str) -> Result<bool> {
    let mut state = shared.state.write().recover_poison();
    let Some(old) = state.documents.remove(id) else {
        return Ok(false);
    };
    let ts = now_rfc3339();
    if let Err(e) = shared.wal.append(&WalRecord::Remove { id: id.to_string(), ts, txn_id: None }) {
        state.documents.insert(id.to_string(), old);
        return Err(e);
    }
    shared.bump_wal_entries(1);
    state.indexes.after_remove(&old, id);
    drop(state);

    shared.counters.removes.fetch_add(1, Ordering::Relaxed);
    emit_change(&shared.watchers, &shared.name, ChangeOperation::Delete, id, Some(Value::Object(old)));
    Ok(true)
}

fn op_remove_many(shared: &Arc<Shared>, query: &Query) -> Result<usize> {
    let matched_ids: Vec<String> = {
        let state = shared.state.read().recover_poison();
        let now = now_millis();
        candidate_ids(&state, query)
            .into_iter()
            .filter(|id| state.documents.get(id).map(|d| is_alive(d, now) && query.matches(d)).unwrap_or(false))
            .collect()
    };

    let mut removed = 0;
    for id in &matched_ids {
        if op_remove(shared, id)? {
            removed += 1;
        }
    }
    Ok(removed)
}

fn op_clear(shared: &Arc<Shared>) -> Result<()> {
    let mut state = shared.state.write().recover_poison();
    let ts = now_rfc3339();
    shared.wal.append(&WalRecord::Clear { ts, txn_id: None })?;
    shared.bump_wal_entries(1);
    state.documents.clear();
    state.indexes = IndexManager::new();
    drop(state);

    shared.counters.clears.fetch_add(1, Ordering::Relaxed);
    emit_change(&shared.watchers, &shared.name, ChangeOperation::Clear, "*", None);
    Ok(())
}

fn op_upsert(shared: &Arc<Shared>, filter: &Filter, data: Doc, set_on_insert: Option<Doc>) -> Result<UpsertOutcome> {
    let existing_id = {
        let state = shared.state.read().recover_poison();
        let now = now_millis();
        state
            .documents
            .iter()
            .find(|(_, d)| is_alive(d, now) && filter.eval(d))
            .map(|(id, _)| id.clone())
    };

    match existing_id {
        Some(id) => {
            let updated = op_update(shared, &id, data, None)?;
            let doc = updated.ok_or_else(|| Error::DocumentNotFound { collection: shared.name.clone(), id: id.clone() })?;
            Ok(UpsertOutcome { document: Value::Object(doc), operation: UpsertResult::Updated(id) })
        }
        None => {
            let mut new_doc = data;
            if let Some(defaults) = set_on_insert {
                for (k, v) in defaults {
                    new_doc.entry(k).or_insert(v);
                }
            }
            let stored = op_insert(shared, new_doc)?;
            let id = stored.get(FIELD_ID).and_then(|v| v.as_str()).unwrap_or_default().to_string();
            Ok(UpsertOutcome { document: Value::Object(stored), operation: UpsertResult::Inserted(id) })
        }
    }
}

fn op_create_index(shared: &Arc<Shared>, field: &str, unique: bool) -> Result<()> {
    let mut state = shared.state.write().recover_poison();
    let documents = state.documents.clone();
    state.indexes.create_index(field, unique, &documents)
}

fn op_ttl_sweep(shared: &Arc<Shared>) -> usize {
    let mut state = match shared.state.write() {
        Ok(s) => s,
        Err(e) => e.into_inner(),
    };
    let now = now_millis();
    let expired: Vec<(String, Doc)> = state
        .documents
        .iter()
        .filter(|(_, d)| !is_alive(d, now))
        .map(|(id, d)| (id.clone(), d.clone()))
        .collect();
    for (id, doc) in &expired {
        state.documents.remove(id);
        state.indexes.after_remove(doc, id);
    }
    drop(state);

    if !expired.is_empty() {
        shared.counters.removes.fetch_add(expired.len() as u64, Ordering::Relaxed);
    }
    for (id, doc) in &expired {
        emit_change(&shared.watchers, &shared.name, ChangeOperation::Delete, id, Some(Value::Object(doc.clone())));
    }
    expired.len()
}

fn op_apply_txn(shared: &Arc<Shared>, txn_id: &str, ops: Vec<TxnOp>) -> Result<()> {
    let start_ts = now_rfc3339();
    shared.wal.append(&WalRecord::TxnStart { txn_id: txn_id.to_string(), ts: start_ts })?;

    for op in &ops {
        let ts = now_rfc3339();
        let record = match op.clone() {
            TxnOp::Insert(doc) => WalRecord::Insert { doc, ts, txn_id: Some(txn_id.to_string()) },
            TxnOp::InsertMany(docs) => WalRecord::BatchInsert { docs, ts, txn_id: Some(txn_id.to_string()) },
            TxnOp::Update(id, data) => WalRecord::Update { id, data, ts, txn_id: Some(txn_id.to_string()) },
            TxnOp::Remove(id) => WalRecord::Remove { id, ts, txn_id: Some(txn_id.to_string()) },
            TxnOp::Clear => WalRecord::Clear { ts, txn_id: Some(txn_id.to_string()) },
        };
        shared.wal.append(&record)?;
    }

    let commit_ts = now_rfc3339();
    shared.wal.append(&WalRecord::TxnCommit { txn_id: txn_id.to_string(), ts: commit_ts })?;
    shared.bump_wal_entries(ops.len() as u64 + 2);

    // Commit is durable at this point; per-op application failures are logged
    // and skipped, never retried or rolled back.
    let mut state = shared.state.write().recover_poison();
    for op in ops {
        let outcome = apply_txn_op_locked(&mut state, txn_id, op);
        if let Err(e) = outcome {
            log::warn!("collection '{}': transaction '{}' op failed to apply: {}", shared.name, txn_id, e);
        }
    }
    drop(state);
    Ok(())
}

fn apply_txn_op_locked(state: &mut State, txn_id: &str, op: TxnOp) -> Result<()> {
    match op {
        TxnOp::Insert(mut doc) => {
            doc.insert(FIELD_TXN.to_string(), Value::String(txn_id.to_string()));
            let stamped = stamp_new(doc, &generate_id);
            let id = stamped.get(FIELD_ID).and_then(|v| v.as_str()).unwrap_or_default().to_string();
            state.indexes.check_new(&stamped)?;
            state.indexes.after_insert(&stamped, &id)?;
            state.documents.insert(id, stamped);
            Ok(())
        }
        TxnOp::InsertMany(docs) => {
            for doc in docs {
                apply_txn_op_locked(state, txn_id, TxnOp::Insert(doc))?;
            }
            Ok(())
        }
        TxnOp::Update(id, patch) => {
            let Some(existing) = state.documents.get(&id).cloned() else {
                return Ok(()); // no-op: updating an absent id during replay/apply is tolerated
            };
            let mut candidate = existing.clone();
            apply_patch_with_unset(&mut candidate, &patch);
            candidate.insert(FIELD_UPDATED_AT.to_string(), Value::String(now_rfc3339()));
            candidate.insert(FIELD_TXN.to_string(), Value::String(txn_id.to_string()));
            state.indexes.after_update(&existing, &candidate, &id)?;
            state.documents.insert(id, candidate);
            Ok(())
        }
        TxnOp::Remove(id) => {
            if let Some(doc) = state.documents.remove(&id) {
                state.indexes.after_remove(&doc, &id);
            }
            Ok(())
        }
        TxnOp::Clear => {
            state.documents.clear();
            state.indexes = IndexManager::new();
            Ok(())
        }
    }
}

impl Shared {
    fn bump_wal_entries(&self, n: u64) {
        self.wal_entries_since_checkpoint.fetch_add(n, Ordering::SeqCst);
    }
}

fn maybe_checkpoint(shared: &Arc<Shared>) -> Result<()> {
    let threshold = shared.options.max_wal_entries_before_checkpoint;
    if threshold > 0 && shared.wal_entries_since_checkpoint.load(Ordering::SeqCst) >= threshold {
        checkpoint_now(shared, true)?;
    }
    Ok(())
}

/// C3's write path: freeze a snapshot under the write lock, prune TTL-expired
/// documents first, write meta + segments, enforce retention, and optionally
/// compact the WAL past this checkpoint's timestamp.
fn checkpoint_now(shared: &Arc<Shared>, compact: bool) -> Result<()> {
    if shared
        .checkpoint_running
        .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
        .is_err()
    {
        return Ok(()); // another checkpoint is already in flight; skip
    }
    let result = (|| -> Result<()> {
        let (documents, indexes_meta, ts_ms) = {
            let mut state = shared.state.write().recover_poison();
            let now = now_millis();
            let expired: Vec<String> = state
                .documents
                .iter()
                .filter(|(_, d)| !is_alive(d, now))
                .map(|(id, _)| id.clone())
                .collect();
            for id in &expired {
                if let Some(doc) = state.documents.remove(id) {
                    state.indexes.after_remove(&doc, id);
                }
            }
            let meta = state
                .indexes
                .list()
                .into_iter()
                .map(|(field_name, unique)| IndexMetaEntry { field_name, kind: if unique { "unique" } else { "standard" }.to_string() })
                .collect();
            (state.documents.clone(), meta, now)
        };

        shared.checkpoints.write(&documents, indexes_meta, ts_ms, shared.options.max_segment_size_bytes)?;
        shared.checkpoints.enforce_retention(shared.options.checkpoints_to_keep)?;
        if compact {
            shared.wal.compact_after(ts_ms)?;
        }
        shared.wal_entries_since_checkpoint.store(0, Ordering::SeqCst);
        Ok(())
    })();
    shared.checkpoint_running.store(false, Ordering::SeqCst);
    result
}

/// Timer loops poll the shutdown flag in small slices rather than sleeping
/// the whole interval in one call, so `close()` doesn't have to wait out a
/// multi-minute checkpoint interval (or a 60s TTL period) before its threads
/// actually stop.
const TIMER_POLL_SLICE: Duration = Duration::from_millis(100);

fn sleep_until_due_or_shutdown(shared: &Arc<Shared>, interval: Duration) -> bool {
    let mut remaining = interval;
    while remaining > Duration::ZERO {
        if shared.shutdown.load(Ordering::SeqCst) {
            return false;
        }
        let slice = remaining.min(TIMER_POLL_SLICE);
        thread::sleep(slice);
        remaining -= slice;
    }
    !shared.shutdown.load(Ordering::SeqCst)
}

fn ttl_loop(shared: Arc<Shared>, tx: SyncSender<Task>) {
    let interval = Duration::from_millis(shared.options.ttl_cleanup_interval_ms);
    loop {
        if !sleep_until_due_or_shutdown(&shared, interval) {
            return;
        }
        let (reply_tx, reply_rx) = sync_channel(1);
        if tx.send(Task::TtlSweep(reply_tx)).is_err() {
            return; // collection closed
        }
        let _ = reply_rx.recv();
    }
}

fn checkpoint_timer_loop(shared: Arc<Shared>, tx: SyncSender<Task>) {
    let interval = Duration::from_millis(shared.options.checkpoint_interval_ms);
    loop {
        if !sleep_until_due_or_shutdown(&shared, interval) {
            return;
        }
        let (reply_tx, reply_rx) = sync_channel(1);
        if tx.send(Task::Flush(reply_tx)).is_err() {
            return;
        }
        let _ = reply_rx.recv();
    }
}
