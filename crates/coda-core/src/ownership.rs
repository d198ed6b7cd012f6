//! Partition ownership and task id assignment.
//!
//! Ownership is a durable fencing token per partition. Acquiring bumps the
//! token; every mutation carries the token and the store rejects it unless it
//! is still the current one. Task ids come from blocks reserved against a
//! durable ceiling, so a new owner always starts above anything a previous
//! owner could have handed out.

use std::sync::Arc;

use tracing::{debug, info, warn};

use crate::config::OwnershipConfig;
use crate::error::{DeleteError, EnqueueError, FencedOut, InsertError, OwnershipError};
use crate::filter::RangeFilter;
use crate::metrics::Metrics;
use crate::partition::{Fence, Partition, PartitionMeta, Payload, QueueRow, TaskId};
use crate::storage::QueueStore;

/// A held ownership token plus the unused tail of its task id block.
///
/// Dropping a lease does not release anything: ownership only ends when
/// someone else acquires or closes the partition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PartitionLease {
    partition: Partition,
    token: u64,
    next_task_id: TaskId,
    block_end: TaskId,
}

impl PartitionLease {
    pub fn partition(&self) -> &Partition {
        &self.partition
    }

    pub fn token(&self) -> u64 {
        self.token
    }

    /// The task id the next enqueue will receive.
    pub fn next_task_id(&self) -> TaskId {
        self.next_task_id
    }

    pub fn fence(&self) -> Fence {
        Fence::new(self.partition.clone(), self.token)
    }
}

pub struct OwnershipGuard {
    store: Arc<dyn QueueStore>,
    block_size: TaskId,
    acquire_attempts: u32,
    metrics: Arc<Metrics>,
}

impl OwnershipGuard {
    pub fn new(
        store: Arc<dyn QueueStore>,
        config: &OwnershipConfig,
        metrics: Arc<Metrics>,
    ) -> Self {
        Self {
            store,
            block_size: config.task_id_block_size.max(1),
            acquire_attempts: config.acquire_attempts.max(1),
            metrics,
        }
    }

    /// Take ownership of `partition`, fencing out any previous holder, and
    /// reserve the first task id block for the new lease.
    #[tracing::instrument(skip_all, fields(partition = %partition))]
    pub fn acquire(&self, partition: &Partition) -> Result<PartitionLease, OwnershipError> {
        for _ in 0..self.acquire_attempts {
            let current = self.store.get_partition_meta(partition)?;
            let base = current.unwrap_or_default();
            let meta = PartitionMeta {
                fence_token: base.fence_token + 1,
                task_id_ceiling: self.extend(partition, base.task_id_ceiling)?,
            };

            let expected = current.map(|m| m.fence_token);
            if self
                .store
                .compare_and_set_partition_meta(partition, expected, &meta)?
            {
                self.metrics.record_acquired(partition);
                info!(
                    token = meta.fence_token,
                    ceiling = meta.task_id_ceiling,
                    "partition acquired"
                );
                return Ok(PartitionLease {
                    partition: partition.clone(),
                    token: meta.fence_token,
                    next_task_id: base.task_id_ceiling + 1,
                    block_end: meta.task_id_ceiling,
                });
            }
            debug!("ownership raced, retrying");
        }

        Err(OwnershipError::Contended {
            partition: partition.clone(),
            attempts: self.acquire_attempts,
        })
    }

    /// Bump the token without taking a lease, fencing out whoever holds the
    /// partition. Returns the new token.
    #[tracing::instrument(skip_all, fields(partition = %partition))]
    pub fn close(&self, partition: &Partition) -> Result<u64, OwnershipError> {
        for _ in 0..self.acquire_attempts {
            let current = self.store.get_partition_meta(partition)?;
            let base = current.unwrap_or_default();
            let meta = PartitionMeta {
                fence_token: base.fence_token + 1,
                ..base
            };
            if self.store.compare_and_set_partition_meta(
                partition,
                current.map(|m| m.fence_token),
                &meta,
            )? {
                info!(token = meta.fence_token, "partition closed");
                return Ok(meta.fence_token);
            }
        }

        Err(OwnershipError::Contended {
            partition: partition.clone(),
            attempts: self.acquire_attempts,
        })
    }

    /// The durable token, 0 for a partition that was never acquired.
    pub fn current_token(&self, partition: &Partition) -> Result<u64, OwnershipError> {
        Ok(self
            .store
            .get_partition_meta(partition)?
            .map(|m| m.fence_token)
            .unwrap_or(0))
    }

    /// Hand out `count` consecutive-per-block task ids, reserving new blocks
    /// as needed. Ids handed out and never written are skipped, not reused.
    pub fn allocate(
        &self,
        lease: &mut PartitionLease,
        count: usize,
    ) -> Result<Vec<TaskId>, OwnershipError> {
        let mut ids = Vec::with_capacity(count);
        while ids.len() < count {
            ids.push(self.assign_task_id(lease)?);
        }
        Ok(ids)
    }

    /// Hand out a single task id.
    pub fn assign_task_id(&self, lease: &mut PartitionLease) -> Result<TaskId, OwnershipError> {
        if lease.next_task_id > lease.block_end {
            self.renew(lease)?;
        }
        let task_id = lease.next_task_id;
        match task_id.checked_add(1) {
            Some(next) => lease.next_task_id = next,
            // Last id of the space: an empty block makes the next call renew,
            // and renewing reports exhaustion.
            None => lease.block_end = task_id - 1,
        }
        Ok(task_id)
    }

    /// Assign task ids to `payloads` and write them as one fenced batch.
    pub fn enqueue(
        &self,
        lease: &mut PartitionLease,
        payloads: Vec<Payload>,
    ) -> Result<Vec<TaskId>, EnqueueError> {
        if payloads.is_empty() {
            return Ok(Vec::new());
        }
        let ids = self.allocate(lease, payloads.len())?;
        let rows: Vec<QueueRow> = ids
            .iter()
            .zip(payloads)
            .map(|(id, p)| QueueRow::new(&lease.partition, *id, p.data, p.data_encoding))
            .collect();
        self.insert(lease, &rows)?;
        Ok(ids)
    }

    /// Write caller-assigned rows under the lease's fence.
    pub fn insert(&self, lease: &PartitionLease, rows: &[QueueRow]) -> Result<u64, InsertError> {
        let partition = &lease.partition;
        match self.store.insert_rows(rows, Some(&lease.fence())) {
            Ok(count) => {
                self.metrics.record_inserted(partition, count);
                debug!(%partition, count, "rows enqueued");
                Ok(count)
            }
            Err(err) => {
                match &err {
                    InsertError::DuplicateKey { task_id, .. } => {
                        self.metrics.record_duplicate(partition);
                        warn!(%partition, task_id, "duplicate task id rejected");
                    }
                    InsertError::FencedOut(fenced) => self.note_fenced_out(fenced),
                    _ => {}
                }
                Err(err)
            }
        }
    }

    /// Fenced delete of the oldest rows at or below `threshold`.
    pub fn trim(
        &self,
        lease: &PartitionLease,
        threshold: TaskId,
        limit: Option<usize>,
    ) -> Result<u64, DeleteError> {
        self.delete(
            lease,
            &RangeFilter::up_to(lease.partition.clone(), threshold, limit),
        )
    }

    /// Any delete on the leased partition, checked against the lease's fence.
    pub fn delete(&self, lease: &PartitionLease, filter: &RangeFilter) -> Result<u64, DeleteError> {
        match self.store.delete_rows(filter, Some(&lease.fence())) {
            Ok(count) => {
                self.metrics.record_deleted(&lease.partition, count);
                Ok(count)
            }
            Err(DeleteError::FencedOut(fenced)) => {
                self.note_fenced_out(&fenced);
                Err(DeleteError::FencedOut(fenced))
            }
            Err(err) => Err(err),
        }
    }

    /// Reserve the next block above the durable ceiling, guarded by the
    /// lease's own token.
    fn renew(&self, lease: &mut PartitionLease) -> Result<(), OwnershipError> {
        let partition = &lease.partition;
        let current = self.store.get_partition_meta(partition)?;
        if let Err(fenced) = lease.fence().check(current.as_ref()) {
            self.note_fenced_out(&fenced);
            return Err(fenced.into());
        }
        let base = current.unwrap_or_default();
        let meta = PartitionMeta {
            fence_token: lease.token,
            task_id_ceiling: self.extend(partition, base.task_id_ceiling)?,
        };

        if !self
            .store
            .compare_and_set_partition_meta(partition, Some(lease.token), &meta)?
        {
            let fenced = FencedOut {
                partition: partition.clone(),
                presented: lease.token,
                current: self.current_token(partition)?,
            };
            self.note_fenced_out(&fenced);
            return Err(fenced.into());
        }

        debug!(%partition, ceiling = meta.task_id_ceiling, "task id block reserved");
        lease.next_task_id = base.task_id_ceiling + 1;
        lease.block_end = meta.task_id_ceiling;
        Ok(())
    }

    fn extend(&self, partition: &Partition, ceiling: TaskId) -> Result<TaskId, OwnershipError> {
        ceiling
            .checked_add(self.block_size)
            .ok_or_else(|| OwnershipError::TaskIdsExhausted(partition.clone()))
    }

    fn note_fenced_out(&self, fenced: &FencedOut) {
        self.metrics.record_fenced_out(&fenced.partition);
        warn!(
            partition = %fenced.partition,
            presented = fenced.presented,
            current = fenced.current,
            "write fenced out"
        );
    }
}
