
pub mod checkpoint;
pub mod collection;
pub mod constants;
pub mod database;
pub mod document;
pub mod errors;
pub mod filter;
pub mod index;
pub mod projection;
pub mod storage;
pub mod transaction;
pub mod update;
pub mod wal;
pub mod watch;

pub use collection::{Collection, CollectionOptions, IndexInfo, Stats, UpdateManyResult, UpsertOutcome, UpsertResult};
pub use database::{Database, DatabaseOptions};
pub use filter::{Filter, Query};
pub use transaction::{Transaction, TxnCollection, TxnOp};
pub use watch::{ChangeEvent, ChangeOperation, WatchBuilder, WatchHandle};
