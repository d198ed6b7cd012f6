use std::sync::Arc;

use tracing::info;

use crate::config::CodaConfig;
use crate::cursor::{read_page, Cursor, Page, Pager};
use crate::dlq::{DlqController, RequeueApplier};
use crate::error::{DeleteError, EnqueueError, OwnershipError, SelectError, StorageResult};
use crate::filter::RangeFilter;
use crate::metrics::Metrics;
use crate::ownership::{OwnershipGuard, PartitionLease};
use crate::partition::{Partition, PartitionMeta, Payload, TaskId};
use crate::storage::{QueueStore, RocksDbStorage};

/// Entry point for embedding the queue engine: one store, one ownership
/// guard, one DLQ controller, shared metrics.
///
/// Every method is a blocking call into the store. Callers own retries and
/// timeouts.
pub struct QueueEngine {
    store: Arc<dyn QueueStore>,
    guard: Arc<OwnershipGuard>,
    dlq: DlqController,
    metrics: Arc<Metrics>,
    config: CodaConfig,
}

impl QueueEngine {
    /// Open a RocksDB store at `config.storage.data_dir`.
    pub fn open(config: CodaConfig) -> StorageResult<Self> {
        let storage = RocksDbStorage::open(&config.storage.data_dir)?;
        info!(data_dir = %config.storage.data_dir, "storage opened");
        Ok(Self::new(Arc::new(storage), config))
    }

    pub fn new(store: Arc<dyn QueueStore>, config: CodaConfig) -> Self {
        Self::with_metrics(store, config, Arc::new(Metrics::new()))
    }

    pub fn with_metrics(
        store: Arc<dyn QueueStore>,
        config: CodaConfig,
        metrics: Arc<Metrics>,
    ) -> Self {
        let guard = Arc::new(OwnershipGuard::new(
            Arc::clone(&store),
            &config.ownership,
            Arc::clone(&metrics),
        ));
        let dlq = DlqController::new(
            Arc::clone(&store),
            Arc::clone(&guard),
            &config.dlq,
            Arc::clone(&metrics),
        );
        Self {
            store,
            guard,
            dlq,
            metrics,
            config,
        }
    }

    pub fn store(&self) -> &dyn QueueStore {
        self.store.as_ref()
    }

    pub fn ownership(&self) -> &OwnershipGuard {
        &self.guard
    }

    pub fn dlq(&self) -> &DlqController {
        &self.dlq
    }

    pub fn config(&self) -> &CodaConfig {
        &self.config
    }

    pub fn acquire(&self, partition: &Partition) -> Result<PartitionLease, OwnershipError> {
        self.guard.acquire(partition)
    }

    pub fn enqueue(
        &self,
        lease: &mut PartitionLease,
        payloads: Vec<Payload>,
    ) -> Result<Vec<TaskId>, EnqueueError> {
        self.guard.enqueue(lease, payloads)
    }

    /// Ordered pages starting after the cursor, sized by `cursor.page_size`.
    pub fn read_tasks(&self, cursor: Cursor) -> Pager<'_> {
        Pager::new(self.store.as_ref(), cursor, self.config.cursor.page_size)
    }

    /// One page for a pull-style replication reader. `read_level` is the last
    /// task id the reader already has.
    pub fn replication_messages(
        &self,
        partition: &Partition,
        read_level: Option<TaskId>,
        max_task_id: Option<TaskId>,
    ) -> Result<Page, SelectError> {
        read_page(
            self.store.as_ref(),
            partition,
            read_level,
            max_task_id,
            self.config.cursor.page_size,
        )
    }

    /// Operator removal of a single task. Not fenced: it is meant for
    /// repairing a partition regardless of who owns it.
    #[tracing::instrument(skip_all, fields(partition = %partition, task_id = task_id))]
    pub fn remove_task(&self, partition: &Partition, task_id: TaskId) -> Result<u64, DeleteError> {
        let removed = self
            .store
            .delete_rows(&RangeFilter::point(partition.clone(), task_id), None)?;
        self.metrics.record_deleted(partition, removed);
        info!(removed, "task removed");
        Ok(removed)
    }

    /// Fence out the current owner of `partition`. Returns the new token.
    pub fn close_partition(&self, partition: &Partition) -> Result<u64, OwnershipError> {
        self.guard.close(partition)
    }

    /// Every partition with ownership metadata.
    pub fn partitions(&self) -> StorageResult<Vec<(Partition, PartitionMeta)>> {
        self.store.list_partitions()
    }

    /// An applier that replays DLQ messages into `target`.
    pub fn requeue_applier(&self, target: Partition) -> RequeueApplier {
        RequeueApplier::new(Arc::clone(&self.guard), target)
    }

    pub fn flush(&self) -> StorageResult<()> {
        self.store.flush()
    }
}
