pub mod config;
pub mod cursor;
pub mod dlq;
pub mod engine;
pub mod error;
pub mod filter;
pub mod metrics;
pub mod ownership;
pub mod partition;
pub mod storage;
pub mod telemetry;

pub use config::CodaConfig;
pub use cursor::{read_page, Cursor, Page, Pager};
pub use dlq::{
    DlqController, DlqRange, MergeFailure, MergeReport, ReplicationApplier, RequeueApplier,
};
pub use engine::QueueEngine;
pub use error::{
    ApplyError, DeleteError, DlqError, EnqueueError, FencedOut, InsertError, InvalidFilter,
    OwnershipError, PurgeFailure, SelectError, StorageError, StorageResult,
};
pub use filter::RangeFilter;
pub use ownership::{OwnershipGuard, PartitionLease};
pub use partition::{Fence, Partition, PartitionMeta, Payload, QueueRow, TaskId};
pub use storage::{MemoryStore, QueueStore, RocksDbStorage};
