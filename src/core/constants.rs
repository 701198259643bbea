//! Crate-wide defaults for the public configuration surface (see `DatabaseOptions`
//! and `CollectionOptions`). Every constant here has a corresponding option that
//! can override it.

/// Checkpoint data segment byte budget.
pub const DEFAULT_MAX_SEGMENT_SIZE_BYTES: usize = 2 * 1024 * 1024;

/// Periodic checkpoint interval. 0 disables the timer.
pub const DEFAULT_CHECKPOINT_INTERVAL_MS: u64 = 5 * 60 * 1000;

/// WAL entry count that triggers a checkpoint.
pub const DEFAULT_MAX_WAL_ENTRIES_BEFORE_CHECKPOINT: u64 = 1000;

/// Number of checkpoints (meta + matching segments) retained per collection.
pub const DEFAULT_CHECKPOINTS_TO_KEEP: usize = 2;

/// TTL sweep period.
pub const DEFAULT_TTL_CLEANUP_INTERVAL_MS: u64 = 60 * 1000;

/// `insertMany` is split into BATCH_INSERT WAL records of at most this many docs.
pub const DEFAULT_MAX_DOCS_PER_BATCH_WAL_ENTRY: usize = 1000;

/// A single WAL line longer than this is skipped with a warning during replay.
pub const WAL_MAX_LINE_BYTES: usize = 20 * 1024 * 1024;

/// Bounded retry count for transient WAL append/sync I/O errors.
pub const WAL_IO_MAX_RETRIES: u32 = 5;

pub const WAL_FILE_PREFIX: &str = "wal_";
pub const WAL_FILE_SUFFIX: &str = ".log";
pub const CHECKPOINT_DIR_NAME: &str = "_checkpoints";
pub const CHECKPOINT_META_PREFIX: &str = "checkpoint_meta_";
pub const CHECKPOINT_DATA_PREFIX: &str = "checkpoint_data_";
pub const LOCK_FILE_NAME: &str = ".lock";

/// The reserved document fields the engine manages itself.
pub const FIELD_ID: &str = "_id";
pub const FIELD_CREATED_AT: &str = "createdAt";
pub const FIELD_UPDATED_AT: &str = "updatedAt";
pub const FIELD_EXPIRE_AT: &str = "expireAt";
pub const FIELD_TTL: &str = "ttl";
pub const FIELD_TXN: &str = "_txn";

/// Tag stamped on documents applied during transaction-block WAL replay,
/// distinguishing them from ordinary non-transactional replay.
pub const TXN_APPLIED_TAG: &str = "_txn_applied_from_wal";
