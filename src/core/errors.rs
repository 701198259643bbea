use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Error, Debug, Clone)]
pub enum Error {
    #[error("unique constraint violation on field '{field}': value {value} already exists")]
    UniqueConstraint { field: String, value: String },

    #[error("document not found: collection={collection:?}, id={id:?}")]
    DocumentNotFound { collection: String, id: String },

    #[error("configuration error: {0}")]
    ConfigurationError(String),

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("collection '{name}' is closed")]
    CollectionClosed { name: String },

    #[error("collection '{name}' failed to initialize: {reason}")]
    CollectionFailed { name: String, reason: String },

    #[error("index '{field}' already exists with a different uniqueness setting; drop it first")]
    IndexUniquenessConflict { field: String },

    #[error("transaction is not pending")]
    TransactionNotPending,

    #[error("transaction aborted: {0}")]
    TransactionAborted(String),

    #[error("data corruption in {component}: {details}")]
    Corruption { component: String, details: String },

    #[error("lock poisoned: {lock_name} (another thread panicked while holding this lock)")]
    LockPoisoned { lock_name: String },

    #[error("write queue for collection '{name}' is not accepting new tasks")]
    QueueClosed { name: String },

    #[error("I/O error: {0}")]
    Io(String),

    #[error("JSON error: {0}")]
    Json(String),

    #[error("{0}")]
    Other(String),
}

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        Error::Io(err.to_string())
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Error::Json(err.to_string())
    }
}

impl<T> From<std::sync::PoisonError<T>> for Error {
    fn from(_: std::sync::PoisonError<T>) -> Self {
        Error::LockPoisoned {
            lock_name: "unknown".to_string(),
        }
    }
}

pub trait PoisonedLockExt<'a, T> {
    fn recover_poison(self) -> T;
}

impl<'a, T> PoisonedLockExt<'a, std::sync::RwLockReadGuard<'a, T>>
    for std::sync::LockResult<std::sync::RwLockReadGuard<'a, T>>
{
    fn recover_poison(self) -> std::sync::RwLockReadGuard<'a, T> {
        match self {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

impl<'a, T> PoisonedLockExt<'a, std::sync::RwLockWriteGuard<'a, T>>
    for std::sync::LockResult<std::sync::RwLockWriteGuard<'a, T>>
{
    fn recover_poison(self) -> std::sync::RwLockWriteGuard<'a, T> {
        match self {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

impl<'a, T> PoisonedLockExt<'a, std::sync::MutexGuard<'a, T>>
    for std::sync::LockResult<std::sync::MutexGuard<'a, T>>
{
    fn recover_poison(self) -> std::sync::MutexGuard<'a, T> {
        match self {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}
