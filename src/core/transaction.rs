//! Cross-collection transactions (C6). A transaction buffers
//! operations per collection while it's open; nothing touches disk until
//! `commit()`, at which point each touched collection is handed its own
//! contiguous WAL block (`start`/`op…`/`commit`) to append and apply through
//! the same path `Collection::apply_transaction_block` already uses for
//! ordinary recovery. There is no cross-collection two-phase commit: once a
//! collection's block is durable, it's committed for good, so a later
//! collection's block failing aborts the transaction without undoing the
//! earlier ones. Per-op application failures *after* a block is durable are
//! logged and skipped by the collection itself, never rolled back.

use crate::core::collection::Collection;
use crate::core::document::{generate_id, stamp_new, Doc};
use crate::core::errors::{Error, PoisonedLockExt, Result};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};

/// One buffered mutation against a single collection. Replayed and persisted
/// verbatim via the collection's WAL, so the payload here is exactly what
/// ends up on disk.
#[derive(Debug, Clone)]
pub enum TxnOp {
    Insert(Doc),
    InsertMany(Vec<Doc>),
    Update(String, Doc),
    Remove(String),
    Clear,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TxnState {
    Pending,
    Committed,
    RolledBack,
}

type ResolveFn = dyn Fn(&str) -> Result<Collection> + Send + Sync;

struct Shared {
    id: String,
    resolve: Box<ResolveFn>,
    ops: Mutex<HashMap<String, Vec<TxnOp>>>,
    state: Mutex<TxnState>,
}

/// A pending cross-collection transaction. Cheaply cloned — every clone
/// shares the same buffered ops and the same commit/rollback outcome.
#[derive(Clone)]
pub struct Transaction {
    shared: Arc<Shared>,
}

impl Transaction {
    /// `resolve` looks up (lazily opening if necessary) the collection a
    /// buffered op should eventually be applied against. The database owns
    /// that resolution; the transaction itself holds no collection handles
    /// until commit time.
    pub(crate) fn new(resolve: impl Fn(&str) -> Result<Collection> + Send + Sync + 'static) -> Self {
        Self {
            shared: Arc::new(Shared {
                id: format!("txn_{}", generate_id()),
                resolve: Box::new(resolve),
                ops: Mutex::new(HashMap::new()),
                state: Mutex::new(TxnState::Pending),
            }),
        }
    }

    pub fn id(&self) -> &str {
        &self.shared.id
    }

    /// Returns a handle for buffering operations against one collection
    /// within this transaction. Multiple calls for the same name share the
    /// same buffer.
    pub fn collection(&self, name: &str) -> TxnCollection {
        TxnCollection { txn: self.clone(), name: name.to_string() }
    }

    fn check_pending(&self) -> Result<()> {
        if *self.shared.state.lock().recover_poison() != TxnState::Pending {
            return Err(Error::TransactionNotPending);
        }
        Ok(())
    }

    fn buffer(&self, collection: &str, op: TxnOp) -> Result<()> {
        self.check_pending()?;
        self.shared
            .ops
            .lock()
            .recover_poison()
            .entry(collection.to_string())
            .or_default()
            .push(op);
        Ok(())
    }

    /// Applies every touched collection's buffered ops as one WAL block per
    /// collection. Collections are committed independently of one another —
    /// if resolving or writing a later collection's block fails, earlier
    /// collections' blocks are already durable and stay that way; the error
    /// tells the caller commit did not fully succeed.
    pub fn commit(self) -> Result<()> {
        {
            let mut state = self.shared.state.lock().recover_poison();
            if *state != TxnState::Pending {
                return Err(Error::TransactionNotPending);
            }
            *state = TxnState::Committed;
        }

        let ops = std::mem::take(&mut *self.shared.ops.lock().recover_poison());
        for (name, collection_ops) in ops {
            if collection_ops.is_empty() {
                continue;
            }
            let collection = (self.shared.resolve)(&name)?;
            collection.apply_transaction_block(&self.shared.id, collection_ops)?;
        }
        Ok(())
    }

    /// Discards every buffered op. Nothing was ever written, so there's
    /// nothing to undo on disk.
    pub fn rollback(self) -> Result<()> {
        let mut state = self.shared.state.lock().recover_poison();
        if *state != TxnState::Pending {
            return Err(Error::TransactionNotPending);
        }
        *state = TxnState::RolledBack;
        self.shared.ops.lock().recover_poison().clear();
        Ok(())
    }
}

/// A transaction's view onto one collection: the same mutation surface as
/// `Collection`, minus anything that reads — reads still go straight to the
/// live collection state directly, so they're not offered here.
pub struct TxnCollection {
    txn: Transaction,
    name: String,
}

impl TxnCollection {
    pub fn insert(&self, doc: Value) -> Result<Value> {
        let stamped = stamp_new(as_object(doc)?, &generate_id);
        self.txn.buffer(&self.name, TxnOp::Insert(stamped.clone()))?;
        Ok(Value::Object(stamped))
    }

    pub fn insert_many(&self, docs: Vec<Value>) -> Result<Vec<Value>> {
        let mut stamped = Vec::with_capacity(docs.len());
        for doc in docs {
            stamped.push(stamp_new(as_object(doc)?, &generate_id));
        }
        self.txn.buffer(&self.name, TxnOp::InsertMany(stamped.clone()))?;
        Ok(stamped.into_iter().map(Value::Object).collect())
    }

    pub fn update(&self, id: &str, patch: Value) -> Result<()> {
        self.txn.buffer(&self.name, TxnOp::Update(id.to_string(), as_object(patch)?))
    }

    pub fn remove(&self, id: &str) -> Result<()> {
        self.txn.buffer(&self.name, TxnOp::Remove(id.to_string()))
    }

    pub fn clear(&self) -> Result<()> {
        self.txn.buffer(&self.name, TxnOp::Clear)
    }
}

fn as_object(v: Value) -> Result<Doc> {
    v.as_object()
        .cloned()
        .ok_or_else(|| Error::InvalidArgument("document must be a JSON object".to_string()))
}
