
pub mod core;

pub use core::{
    ChangeEvent, ChangeOperation, Collection, CollectionOptions, Database, DatabaseOptions,
    Filter, IndexInfo, Query, Stats, Transaction, TxnCollection, TxnOp, UpdateManyResult,
    UpsertOutcome, UpsertResult, WatchBuilder, WatchHandle,
};
pub use core::errors::{Error, Result};
