//! Dead-letter partitions for replication messages that failed to apply.
//!
//! Each source cluster has one DLQ partition. The controller owns it through
//! a cached lease; every write is fenced, reads are not.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

use tracing::{debug, info, warn};

use crate::config::DlqConfig;
use crate::cursor::{read_page, Page};
use crate::error::{ApplyError, DlqError, EnqueueError, PurgeFailure};
use crate::filter::RangeFilter;
use crate::metrics::Metrics;
use crate::ownership::{OwnershipGuard, PartitionLease};
use crate::partition::{Partition, Payload, QueueRow, TaskId};
use crate::storage::QueueStore;

/// The replication apply path a merge feeds. Implementations must tolerate
/// seeing the same message twice: a crash between apply and delete replays it.
pub trait ReplicationApplier {
    fn apply(&self, row: &QueueRow) -> Result<(), ApplyError>;
}

/// Task id bounds for reading or merging a DLQ partition.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DlqRange {
    /// Last task id already seen (exclusive). `None` starts at the oldest row.
    pub read_level: Option<TaskId>,
    /// Highest task id to include.
    pub inclusive_end: Option<TaskId>,
    /// Rows per read, or the most rows a merge will move.
    pub page_size: Option<usize>,
}

impl DlqRange {
    pub fn up_to(inclusive_end: TaskId) -> Self {
        Self {
            inclusive_end: Some(inclusive_end),
            ..Self::default()
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum MergeFailure {
    #[error("apply failed for task {task_id}: {source}")]
    Apply {
        task_id: TaskId,
        #[source]
        source: ApplyError,
    },

    #[error(transparent)]
    Dlq(#[from] DlqError),
}

/// Outcome of a merge. A merge never fails as a whole: it reports what it
/// moved and, if it stopped early, why and where to resume.
#[derive(Debug)]
pub struct MergeReport {
    pub merged: u64,
    /// First task id not yet merged, when rows in range remain.
    pub next_task_id: Option<TaskId>,
    pub failure: Option<MergeFailure>,
}

impl MergeReport {
    pub fn is_complete(&self) -> bool {
        self.failure.is_none() && self.next_task_id.is_none()
    }
}

type LeaseSlot = Arc<Mutex<Option<PartitionLease>>>;

pub struct DlqController {
    store: Arc<dyn QueueStore>,
    guard: Arc<OwnershipGuard>,
    config: DlqConfig,
    metrics: Arc<Metrics>,
    /// Keyed by source cluster. The map lock covers lookups only; each
    /// slot serializes the writes of its own source.
    leases: Mutex<HashMap<String, LeaseSlot>>,
}

impl DlqController {
    pub fn new(
        store: Arc<dyn QueueStore>,
        guard: Arc<OwnershipGuard>,
        config: &DlqConfig,
        metrics: Arc<Metrics>,
    ) -> Self {
        Self {
            store,
            guard,
            config: config.clone(),
            metrics,
            leases: Mutex::new(HashMap::new()),
        }
    }

    /// Buffer a message that could not be applied. Returns its task id.
    #[tracing::instrument(skip_all, fields(source = %source_cluster))]
    pub fn append(&self, source_cluster: &str, message: Payload) -> Result<TaskId, DlqError> {
        let partition = Partition::dlq(source_cluster);
        let task_id = self.with_lease(source_cluster, |guard, lease| {
            let task_id = guard.assign_task_id(lease)?;
            let row = QueueRow::new(
                lease.partition(),
                task_id,
                message.data,
                message.data_encoding,
            );
            guard.insert(lease, &[row]).map_err(EnqueueError::from)?;
            Ok(task_id)
        })?;

        self.metrics.record_dlq_appended(&partition);
        debug!(task_id, "message dead-lettered");
        Ok(task_id)
    }

    /// One page of a DLQ partition, oldest first.
    pub fn read(&self, source_cluster: &str, range: DlqRange) -> Result<Page, DlqError> {
        let page = read_page(
            self.store.as_ref(),
            &Partition::dlq(source_cluster),
            range.read_level,
            range.inclusive_end,
            range.page_size.unwrap_or(self.config.read_page_size),
        )?;
        Ok(page)
    }

    /// Delete every message at or below `inclusive_end`, in chunks. On
    /// failure the error carries how many rows were already gone.
    #[tracing::instrument(
        skip_all,
        fields(source = %source_cluster, inclusive_end = inclusive_end)
    )]
    pub fn purge(
        &self,
        source_cluster: &str,
        inclusive_end: TaskId,
    ) -> Result<u64, PurgeFailure> {
        let partition = Partition::dlq(source_cluster);
        let batch = self.config.purge_batch_size.max(1);
        let mut purged = 0u64;

        loop {
            let removed = self
                .with_lease(source_cluster, |guard, lease| {
                    Ok(guard.trim(lease, inclusive_end, Some(batch))?)
                })
                .map_err(|error| {
                    warn!(purged, error = %error, "purge stopped");
                    PurgeFailure { purged, error }
                })?;
            purged += removed;
            self.metrics.record_dlq_purged(&partition, removed);
            if (removed as usize) < batch {
                break;
            }
        }

        info!(purged, "dlq purged");
        Ok(purged)
    }

    /// Re-apply messages in order, deleting each one after it applies.
    ///
    /// Stops at the first failure, leaving that row and everything after it
    /// in place. Overlapping merges for one source must not run concurrently.
    #[tracing::instrument(skip_all, fields(source = %source_cluster))]
    pub fn merge(
        &self,
        source_cluster: &str,
        range: DlqRange,
        applier: &dyn ReplicationApplier,
    ) -> MergeReport {
        let partition = Partition::dlq(source_cluster);
        let budget = range.page_size.unwrap_or(usize::MAX);
        let mut report = MergeReport {
            merged: 0,
            next_task_id: None,
            failure: None,
        };
        let mut read_level = range.read_level;

        loop {
            let want = budget
                .saturating_sub(report.merged as usize)
                .min(self.config.merge_batch_size.max(1));
            let page = match read_page(
                self.store.as_ref(),
                &partition,
                read_level,
                range.inclusive_end,
                want,
            ) {
                Ok(page) => page,
                Err(e) => {
                    report.next_task_id = resume_point(read_level);
                    report.failure = Some(DlqError::from(e).into());
                    break;
                }
            };

            for row in &page.rows {
                if let Err(source) = applier.apply(row) {
                    report.next_task_id = Some(row.task_id);
                    report.failure = Some(MergeFailure::Apply {
                        task_id: row.task_id,
                        source,
                    });
                    break;
                }
                let point = RangeFilter::point(partition.clone(), row.task_id);
                let deleted = self.with_lease(source_cluster, |guard, lease| {
                    Ok(guard.delete(lease, &point)?)
                });
                if let Err(e) = deleted {
                    // Applied but still present: resuming re-applies it.
                    report.next_task_id = Some(row.task_id);
                    report.failure = Some(e.into());
                    break;
                }
                report.merged += 1;
                read_level = Some(row.task_id);
            }
            if report.failure.is_some() {
                break;
            }

            report.next_task_id = if page.has_more {
                resume_point(read_level)
            } else {
                None
            };
            if !page.has_more || report.merged as usize >= budget {
                break;
            }
        }

        self.metrics.record_dlq_merged(&partition, report.merged);
        match &report.failure {
            Some(failure) => {
                self.metrics.record_dlq_merge_failure(&partition);
                warn!(
                    merged = report.merged,
                    next_task_id = ?report.next_task_id,
                    error = %failure,
                    "merge stopped early"
                );
            }
            None => info!(merged = report.merged, "dlq merged"),
        }
        report
    }

    /// Source clusters that have a DLQ partition.
    pub fn sources(&self) -> Result<Vec<String>, DlqError> {
        let partitions = self.store.list_partitions()?;
        Ok(partitions
            .iter()
            .filter_map(|(p, _)| p.dlq_source_cluster().map(str::to_string))
            .collect())
    }

    fn slot(&self, source_cluster: &str) -> LeaseSlot {
        let mut leases = lock(&self.leases);
        Arc::clone(leases.entry(source_cluster.to_string()).or_default())
    }

    /// Run `op` with this source's lease, acquiring it on first use. Only
    /// calls for the same source wait on each other. A fenced-out result
    /// drops the lease so the next call re-acquires.
    fn with_lease<T>(
        &self,
        source_cluster: &str,
        op: impl FnOnce(&OwnershipGuard, &mut PartitionLease) -> Result<T, DlqError>,
    ) -> Result<T, DlqError> {
        let slot = self.slot(source_cluster);
        let mut held = lock(&slot);
        let mut lease = match held.take() {
            Some(lease) => lease,
            None => self.guard.acquire(&Partition::dlq(source_cluster))?,
        };

        let result = op(self.guard.as_ref(), &mut lease);
        if !matches!(&result, Err(e) if e.is_fenced_out()) {
            *held = Some(lease);
        }
        result
    }
}

/// Lease slots hold plain values; a panic elsewhere cannot leave one
/// half-updated.
fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

fn resume_point(read_level: Option<TaskId>) -> Option<TaskId> {
    match read_level {
        None => Some(TaskId::MIN),
        Some(level) => level.checked_add(1),
    }
}

/// Applies DLQ messages by enqueueing them onto a task-queue partition.
pub struct RequeueApplier {
    guard: Arc<OwnershipGuard>,
    target: Partition,
    lease: Mutex<Option<PartitionLease>>,
}

impl RequeueApplier {
    pub fn new(guard: Arc<OwnershipGuard>, target: Partition) -> Self {
        Self {
            guard,
            target,
            lease: Mutex::new(None),
        }
    }

    pub fn target(&self) -> &Partition {
        &self.target
    }
}

impl ReplicationApplier for RequeueApplier {
    fn apply(&self, row: &QueueRow) -> Result<(), ApplyError> {
        let mut slot = lock(&self.lease);
        let mut lease = match slot.take() {
            Some(lease) => lease,
            None => self.guard.acquire(&self.target)?,
        };

        let payload = Payload::new(row.data.clone(), row.data_encoding.clone());
        match self.guard.enqueue(&mut lease, vec![payload]) {
            // A fenced lease is dropped; the next apply re-acquires.
            Err(e) if e.is_fenced_out() => Err(e.into()),
            result => {
                *slot = Some(lease);
                result.map(|_| ()).map_err(ApplyError::from)
            }
        }
    }
}
