//! C2: the write-ahead log. One JSON record per line, appended
//! with a bounded retry on transient I/O errors and an optional `fsync` after
//! every append. Replay is deliberately tolerant: a blank line is skipped, an
//! oversized or malformed line is skipped with a `log::warn!` (or, in strict
//! mode, aborts recovery), and transaction blocks only apply once their
//! matching commit record is seen — with a commit timestamp strictly greater
//! than any `since` cutoff passed in.

use crate::core::constants::*;
use crate::core::document::{parse_timestamp_millis, Doc};
use crate::core::errors::{Error, Result};
use crate::core::storage;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::fs::File;
use std::io::{BufRead, BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::thread;
use std::time::Duration;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "op")]
pub enum WalRecord {
    #[serde(rename = "INSERT")]
    Insert {
        doc: Doc,
        ts: String,
        #[serde(skip_serializing_if = "Option::is_none", default)]
        txn_id: Option<String>,
    },
    #[serde(rename = "BATCH_INSERT")]
    BatchInsert {
        docs: Vec<Doc>,
        ts: String,
        #[serde(skip_serializing_if = "Option::is_none", default)]
        txn_id: Option<String>,
    },
    #[serde(rename = "UPDATE")]
    Update {
        id: String,
        data: Doc,
        ts: String,
        #[serde(skip_serializing_if = "Option::is_none", default)]
        txn_id: Option<String>,
    },
    #[serde(rename = "REMOVE")]
    Remove {
        id: String,
        ts: String,
        #[serde(skip_serializing_if = "Option::is_none", default)]
        txn_id: Option<String>,
    },
    #[serde(rename = "CLEAR")]
    Clear {
        ts: String,
        #[serde(skip_serializing_if = "Option::is_none", default)]
        txn_id: Option<String>,
    },
    #[serde(rename = "TXN_START")]
    TxnStart { txn_id: String, ts: String },
    #[serde(rename = "TXN_COMMIT")]
    TxnCommit { txn_id: String, ts: String },
    #[serde(rename = "TXN_ABORT")]
    TxnAbort { txn_id: String, ts: String },
}

impl WalRecord {
    fn txn_id(&self) -> Option<&str> {
        match self {
            WalRecord::Insert { txn_id, .. }
            | WalRecord::BatchInsert { txn_id, .. }
            | WalRecord::Update { txn_id, .. }
            | WalRecord::Remove { txn_id, .. }
            | WalRecord::Clear { txn_id, .. } => txn_id.as_deref(),
            WalRecord::TxnStart { txn_id, .. }
            | WalRecord::TxnCommit { txn_id, .. }
            | WalRecord::TxnAbort { txn_id, .. } => Some(txn_id.as_str()),
        }
    }

    /// The effective time used for `sinceTimestamp` filtering and compaction:
    /// a batch's first document's `updatedAt` if present, else the record's
    /// own `ts`. An unparseable timestamp means "keep unconditionally".
    fn effective_time_ms(&self) -> Option<i64> {
        match self {
            WalRecord::BatchInsert { docs, ts, .. } => {
                let from_doc = docs
                    .first()
                    .and_then(|d| d.get(FIELD_UPDATED_AT))
                    .and_then(parse_timestamp_millis);
                from_doc.or_else(|| parse_timestamp_millis(&Value::String(ts.clone())))
            }
            WalRecord::Insert { ts, .. }
            | WalRecord::Update { ts, .. }
            | WalRecord::Remove { ts, .. }
            | WalRecord::Clear { ts, .. }
            | WalRecord::TxnStart { ts, .. }
            | WalRecord::TxnCommit { ts, .. }
            | WalRecord::TxnAbort { ts, .. } => parse_timestamp_millis(&Value::String(ts.clone())),
        }
    }
}

/// What replay does with each record, already stripped of transaction framing.
/// `txn_id` is `Some` iff the record was part of a committed transaction block,
/// so the caller can stamp recovered documents per the transaction-tagging rule.
pub enum Applied {
    Insert { doc: Doc, txn_id: Option<String> },
    BatchInsert { docs: Vec<Doc>, txn_id: Option<String> },
    Update { id: String, data: Doc, txn_id: Option<String> },
    Remove { id: String, txn_id: Option<String> },
    Clear { txn_id: Option<String> },
}

struct WalInner {
    writer: BufWriter<File>,
    path: PathBuf,
}

pub struct Wal {
    inner: Mutex<WalInner>,
    sync_on_write: bool,
}

impl Wal {
    pub fn open(path: &Path, sync_on_write: bool) -> Result<Wal> {
        if let Some(parent) = path.parent() {
            storage::ensure_dir(parent)?;
        }
        let file = storage::open_append(path)?;
        let writer = BufWriter::new(file);
        Ok(Wal {
            inner: Mutex::new(WalInner {
                writer,
                path: path.to_path_buf(),
            }),
            sync_on_write,
        })
    }

    /// Appends one record, retrying transient I/O failures up to
    /// `WAL_IO_MAX_RETRIES` times with a short linear backoff before giving up.
    pub fn append(&self, record: &WalRecord) -> Result<()> {
        let mut line = serde_json::to_string(record)?;
        line.push('\n');

        let path = self.inner.lock()?.path.clone();
        let mut attempt = 0;
        loop {
            match self.try_append(&line) {
                Ok(()) => return Ok(()),
                Err(e) if attempt < WAL_IO_MAX_RETRIES => {
                    attempt += 1;
                    log::warn!(
                        "WAL append to {:?} failed (attempt {}/{}): {}; retrying",
                        path,
                        attempt,
                        WAL_IO_MAX_RETRIES,
                        e
                    );
                    thread::sleep(Duration::from_millis(20 * attempt as u64));
                }
                Err(e) => return Err(e),
            }
        }
    }

    fn try_append(&self, line: &str) -> Result<()> {
        let mut inner = self.inner.lock()?;
        inner.writer.write_all(line.as_bytes())?;
        inner.writer.flush()?;
        if self.sync_on_write {
            inner.writer.get_ref().sync_data()?;
        }
        Ok(())
    }

    pub fn sync(&self) -> Result<()> {
        let mut inner = self.inner.lock()?;
        inner.writer.flush()?;
        inner.writer.get_ref().sync_all()?;
        Ok(())
    }

    /// Replays every applied (i.e. fully committed) record in file order,
    /// keeping only those whose effective time is strictly greater than
    /// `since_ms` (pass `None` to replay everything, e.g. a fresh collection).
    /// Ops inside an unterminated transaction block are always discarded.
    /// Set `strict` to abort on the first malformed line instead of skipping it.
    pub fn replay(path: &Path, since_ms: Option<i64>, strict: bool) -> Result<Vec<Applied>> {
        let mut applied = Vec::new();
        for_each_record(path, strict, |record| {
            match &record {
                WalRecord::TxnStart { .. } | WalRecord::TxnAbort { .. } => {}
                WalRecord::TxnCommit { ts, .. } => {
                    let commit_ms = parse_timestamp_millis(&Value::String(ts.clone()));
                    let keep = match (commit_ms, since_ms) {
                        (Some(c), Some(s)) => c > s,
                        _ => true,
                    };
                    if !keep {
                        return TxnDecision::Discard;
                    }
                }
                _ => {
                    if record.txn_id().is_none() {
                        let keep = match (record.effective_time_ms(), since_ms) {
                            (Some(t), Some(s)) => t > s,
                            _ => true,
                        };
                        if !keep {
                            return TxnDecision::Skip;
                        }
                    }
                }
            }
            TxnDecision::Keep
        }, |record| {
            if let Some(a) = to_applied(record) {
                applied.push(a);
            }
        })?;
        Ok(applied)
    }

    /// Rewrites the WAL, keeping only entries (and fully-committed transaction
    /// blocks) whose effective/commit time is strictly greater than
    /// `checkpoint_ts_ms` — the same rule `replay` uses for its `since_ms`
    /// cutoff, so a freshly compacted WAL replays identically to the original.
    pub fn compact_after(&self, checkpoint_ts_ms: i64) -> Result<()> {
        let path = {
            let mut inner = self.inner.lock()?;
            inner.writer.flush()?;
            inner.path.clone()
        };

        let mut retained_lines: Vec<String> = Vec::new();
        let mut pending_block: Vec<(WalRecord, String)> = Vec::new();
        let mut in_block = false;

        for_each_raw_record(&path, |record, raw_line| {
            match &record {
                WalRecord::TxnStart { .. } => {
                    in_block = true;
                    pending_block.clear();
                    pending_block.push((record, raw_line.to_string()));
                }
                WalRecord::TxnAbort { .. } => {
                    in_block = false;
                    pending_block.clear();
                }
                WalRecord::TxnCommit { ts, .. } => {
                    let commit_ms = parse_timestamp_millis(&Value::String(ts.clone()));
                    let keep = match commit_ms {
                        Some(c) => c > checkpoint_ts_ms,
                        None => true,
                    };
                    if keep {
                        for (_, line) in pending_block.drain(..) {
                            retained_lines.push(line);
                        }
                        retained_lines.push(raw_line.to_string());
                    } else {
                        pending_block.clear();
                    }
                    in_block = false;
                }
                _ if in_block => {
                    pending_block.push((record, raw_line.to_string()));
                }
                _ => {
                    let keep = match record.effective_time_ms() {
                        Some(t) => t > checkpoint_ts_ms,
                        None => true,
                    };
                    if keep {
                        retained_lines.push(raw_line.to_string());
                    }
                }
            }
        })?;

        let mut bytes = String::new();
        for line in &retained_lines {
            bytes.push_str(line);
            bytes.push('\n');
        }

        let mut inner = self.inner.lock()?;
        let tmp_path = {
            let mut p = inner.path.clone();
            let name = format!(
                ".{}.compact",
                p.file_name().and_then(|n| n.to_str()).unwrap_or("wal")
            );
            p.set_file_name(name);
            p
        };
        storage::atomic_write(&tmp_path, bytes.as_bytes())?;
        std::fs::rename(&tmp_path, &inner.path)?;
        let file = storage::open_append(&inner.path)?;
        inner.writer = BufWriter::new(file);
        Ok(())
    }
}

enum TxnDecision {
    Keep,
    Skip,
    Discard,
}

/// Shared line-scanning core for `replay`: walks the file, buffers
/// transaction blocks until their terminator, and hands each surviving
/// record to `emit`. `decide` is consulted on every record (including
/// transaction terminators) to apply the `since_ms` cutoff.
fn for_each_record(
    path: &Path,
    strict: bool,
    mut decide: impl FnMut(&WalRecord) -> TxnDecision,
    mut emit: impl FnMut(WalRecord),
) -> Result<()> {
    if !storage::exists(path) {
        return Ok(());
    }
    let mut open_txns: HashMap<String, Vec<WalRecord>> = HashMap::new();

    for_each_raw_record_strict(path, strict, |record, _raw| {
        match &record {
            WalRecord::TxnStart { txn_id, .. } => {
                open_txns.insert(txn_id.clone(), Vec::new());
            }
            WalRecord::TxnAbort { txn_id, .. } => {
                open_txns.remove(txn_id);
            }
            WalRecord::TxnCommit { txn_id, .. } => {
                let decision = decide(&record);
                if let Some(buffered) = open_txns.remove(txn_id) {
                    if matches!(decision, TxnDecision::Keep) {
                        for r in buffered {
                            emit(r);
                        }
                    }
                }
            }
            _ => {
                if let Some(txn_id) = record.txn_id() {
                    match open_txns.get_mut(txn_id) {
                        Some(buffered) => buffered.push(record.clone()),
                        None => {
                            // An op tagged with a txn_id but no open (or already
                            // resolved) block: no matching `start` was seen.
                            // Discard orphaned ops with a warning.
                            log::warn!(
                                "WAL: orphaned transaction op for txn '{}' with no matching start, discarding",
                                txn_id
                            );
                        }
                    }
                    return;
                }
                match decide(&record) {
                    TxnDecision::Keep => emit(record),
                    TxnDecision::Skip | TxnDecision::Discard => {}
                }
            }
        }
    })?;

    if !open_txns.is_empty() {
        log::warn!(
            "WAL {:?}: {} transaction block(s) never committed, discarding their ops",
            path,
            open_txns.len()
        );
    }
    Ok(())
}

fn for_each_raw_record(path: &Path, mut f: impl FnMut(WalRecord, &str)) -> Result<()> {
    for_each_raw_record_strict(path, false, |r, raw| f(r, raw))
}

fn for_each_raw_record_strict(
    path: &Path,
    strict: bool,
    mut f: impl FnMut(WalRecord, &str),
) -> Result<()> {
    if !storage::exists(path) {
        return Ok(());
    }
    let file = File::open(path)?;
    let reader = BufReader::new(file);

    for (line_no, line) in reader.lines().enumerate() {
        let line = match line {
            Ok(l) => l,
            Err(e) => {
                log::warn!("WAL {:?}: I/O error reading line {}: {}", path, line_no, e);
                if strict {
                    return Err(e.into());
                }
                continue;
            }
        };
        let trimmed = line.trim();
        if trimmed.is_empty() {
            continue;
        }
        if trimmed.len() > WAL_MAX_LINE_BYTES {
            log::warn!(
                "WAL {:?}: line {} exceeds {} bytes, skipping",
                path,
                line_no,
                WAL_MAX_LINE_BYTES
            );
            continue;
        }

        let record: WalRecord = match serde_json::from_str(trimmed) {
            Ok(r) => r,
            Err(e) => {
                log::warn!("WAL {:?}: malformed record at line {}: {}", path, line_no, e);
                if strict {
                    return Err(Error::Corruption {
                        component: "wal".to_string(),
                        details: format!("{:?} line {}: {}", path, line_no, e),
                    });
                }
                continue;
            }
        };
        f(record, trimmed);
    }
    Ok(())
}

fn to_applied(record: WalRecord) -> Option<Applied> {
    match record {
        WalRecord::Insert { doc, txn_id, .. } => Some(Applied::Insert { doc, txn_id }),
        WalRecord::BatchInsert { docs, txn_id, .. } => Some(Applied::BatchInsert { docs, txn_id }),
        WalRecord::Update { id, data, txn_id, .. } => Some(Applied::Update { id, data, txn_id }),
        WalRecord::Remove { id, txn_id, .. } => Some(Applied::Remove { id, txn_id }),
        WalRecord::Clear { txn_id, .. } => Some(Applied::Clear { txn_id }),
        WalRecord::TxnStart { .. } | WalRecord::TxnCommit { .. } | WalRecord::TxnAbort { .. } => None,
    }
}
