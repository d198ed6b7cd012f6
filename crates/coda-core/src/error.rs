use crate::partition::{Partition, TaskId};

/// Low-level storage errors (RocksDB, serialization, key encoding).
/// Storage failures are infrastructure errors, never domain errors.
#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    /// Transient backend failure. Safe to retry; this crate never retries on
    /// its own.
    #[error("storage unavailable: {0}")]
    Unavailable(String),

    #[error("rocksdb error: {0}")]
    RocksDb(String),

    #[error("serialization error: {0}")]
    Serialization(String),

    #[error("corrupt data: {0}")]
    CorruptData(String),

    #[error("queue id is {0} bytes, keys allow at most 65535")]
    KeyTooLong(usize),
}

impl StorageError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, StorageError::Unavailable(_))
    }
}

impl From<rocksdb::Error> for StorageError {
    fn from(err: rocksdb::Error) -> Self {
        use rocksdb::ErrorKind;
        match err.kind() {
            ErrorKind::Busy
            | ErrorKind::TimedOut
            | ErrorKind::TryAgain
            | ErrorKind::Incomplete
            | ErrorKind::Aborted
            | ErrorKind::ShutdownInProgress => StorageError::Unavailable(err.into_string()),
            _ => StorageError::RocksDb(err.into_string()),
        }
    }
}

impl From<serde_json::Error> for StorageError {
    fn from(err: serde_json::Error) -> Self {
        StorageError::Serialization(err.to_string())
    }
}

/// A range filter combined fields that cannot be used together, or asked for
/// something the operation does not allow.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum InvalidFilter {
    #[error("task_id cannot be combined with range or threshold bounds")]
    PointWithRange,

    #[error("task_id_less_than_equals cannot be combined with min/max bounds")]
    ThresholdWithRange,

    #[error("delete requires a task_id, a threshold, or a min/max range")]
    Unbounded,

    #[error("page_size and limit must be greater than zero")]
    ZeroLimit,
}

/// The caller's ownership token no longer matches the partition's durable
/// token. The caller must re-acquire ownership.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error(
    "fenced out of partition {partition}: presented token {presented}, current token {current}"
)]
pub struct FencedOut {
    pub partition: Partition,
    pub presented: u64,
    pub current: u64,
}

#[derive(Debug, thiserror::Error)]
pub enum InsertError {
    /// A row with this `(range_hash, queue_id, task_id)` already exists, or
    /// the batch repeats the key. The whole batch was rejected.
    #[error("duplicate key: task {task_id} already exists in partition {partition}")]
    DuplicateKey { partition: Partition, task_id: TaskId },

    #[error(transparent)]
    FencedOut(#[from] FencedOut),

    #[error("row for partition {found} in a batch fenced on partition {expected}")]
    PartitionMismatch {
        expected: Partition,
        found: Partition,
    },

    #[error(transparent)]
    Storage(#[from] StorageError),
}

impl InsertError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, InsertError::Storage(e) if e.is_retryable())
    }
}

#[derive(Debug, thiserror::Error)]
pub enum SelectError {
    #[error(transparent)]
    InvalidFilter(#[from] InvalidFilter),

    #[error(transparent)]
    Storage(#[from] StorageError),
}

#[derive(Debug, thiserror::Error)]
pub enum DeleteError {
    #[error(transparent)]
    InvalidFilter(#[from] InvalidFilter),

    #[error(transparent)]
    FencedOut(#[from] FencedOut),

    #[error("delete filter targets partition {found} but is fenced on partition {expected}")]
    PartitionMismatch {
        expected: Partition,
        found: Partition,
    },

    #[error(transparent)]
    Storage(#[from] StorageError),
}

impl DeleteError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, DeleteError::Storage(e) if e.is_retryable())
    }
}

/// Errors from acquiring, closing, or extending ownership of a partition.
#[derive(Debug, thiserror::Error)]
pub enum OwnershipError {
    #[error("ownership of partition {partition} still contended after {attempts} attempts")]
    Contended { partition: Partition, attempts: u32 },

    #[error(transparent)]
    FencedOut(#[from] FencedOut),

    #[error("task id space exhausted for partition {0}")]
    TaskIdsExhausted(Partition),

    #[error(transparent)]
    Storage(#[from] StorageError),
}

#[derive(Debug, thiserror::Error)]
pub enum EnqueueError {
    #[error(transparent)]
    Ownership(#[from] OwnershipError),

    #[error(transparent)]
    Insert(#[from] InsertError),
}

impl EnqueueError {
    /// True when the partition was handed to another owner, either while
    /// reserving task ids or while writing.
    pub fn is_fenced_out(&self) -> bool {
        matches!(
            self,
            EnqueueError::Ownership(OwnershipError::FencedOut(_))
                | EnqueueError::Insert(InsertError::FencedOut(_))
        )
    }
}

#[derive(Debug, thiserror::Error)]
pub enum DlqError {
    #[error(transparent)]
    Enqueue(#[from] EnqueueError),

    #[error(transparent)]
    Ownership(#[from] OwnershipError),

    #[error(transparent)]
    Select(#[from] SelectError),

    #[error(transparent)]
    Delete(#[from] DeleteError),

    #[error(transparent)]
    Storage(#[from] StorageError),
}

impl DlqError {
    /// True when the DLQ partition was handed to another owner. The cached
    /// lease is useless after this.
    pub fn is_fenced_out(&self) -> bool {
        match self {
            DlqError::Enqueue(e) => e.is_fenced_out(),
            DlqError::Ownership(OwnershipError::FencedOut(_))
            | DlqError::Delete(DeleteError::FencedOut(_)) => true,
            _ => false,
        }
    }
}

/// Why a replication applier could not apply a message.
#[derive(Debug, thiserror::Error)]
pub enum ApplyError {
    #[error("message rejected: {0}")]
    Rejected(String),

    #[error(transparent)]
    Enqueue(#[from] EnqueueError),

    #[error(transparent)]
    Ownership(#[from] OwnershipError),
}

/// A purge that stopped part way. `purged` rows were deleted before `error`.
#[derive(Debug, thiserror::Error)]
#[error("purge stopped after {purged} rows: {error}")]
pub struct PurgeFailure {
    pub purged: u64,
    #[source]
    pub error: DlqError,
}

pub type StorageResult<T> = std::result::Result<T, StorageError>;
