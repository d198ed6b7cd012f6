use std::collections::HashSet;

use crate::error::{DeleteError, InsertError, SelectError, StorageError, StorageResult};
use crate::filter::RangeFilter;
use crate::partition::{Fence, Partition, PartitionMeta, QueueRow};

/// Row store for partitioned queues. Implementations must be thread-safe.
///
/// Every backend runs the same conformance suite; behavior that is not
/// visible through this trait is not part of the contract.
pub trait QueueStore: Send + Sync {
    // --- Rows ---

    /// Insert a batch atomically. Either every row is written and the row
    /// count is returned, or nothing is written. A key that already exists,
    /// or is repeated within the batch, fails the batch with `DuplicateKey`.
    ///
    /// With a fence, every row must belong to the fenced partition and the
    /// fence token must match the partition's durable token at write time.
    fn insert_rows(&self, rows: &[QueueRow], fence: Option<&Fence>) -> Result<u64, InsertError>;

    /// Rows matching the filter, ascending by task id, truncated to the page
    /// size. No match is an empty vector, not an error.
    fn select_rows(&self, filter: &RangeFilter) -> Result<Vec<QueueRow>, SelectError>;

    /// Delete matching rows (lowest task ids first when limited) and return
    /// how many were removed. Deleting nothing is success.
    fn delete_rows(&self, filter: &RangeFilter, fence: Option<&Fence>) -> Result<u64, DeleteError>;

    // --- Partition metadata ---

    fn get_partition_meta(&self, partition: &Partition) -> StorageResult<Option<PartitionMeta>>;

    /// Write `meta` only if the stored token equals `expected_token`
    /// (`None`: no metadata stored yet). Returns whether the write happened.
    fn compare_and_set_partition_meta(
        &self,
        partition: &Partition,
        expected_token: Option<u64>,
        meta: &PartitionMeta,
    ) -> StorageResult<bool>;

    /// Every partition that has metadata, in key order.
    fn list_partitions(&self) -> StorageResult<Vec<(Partition, PartitionMeta)>>;

    /// Make completed writes durable.
    fn flush(&self) -> StorageResult<()>;
}

const MAX_QUEUE_ID_LEN: usize = u16::MAX as usize;

/// Queue ids are length-prefixed with a `u16` in stored keys. Every
/// backend enforces the limit, including ones that never encode keys.
pub(crate) fn check_queue_id(partition: &Partition) -> StorageResult<()> {
    let len = partition.queue_id.len();
    if len > MAX_QUEUE_ID_LEN {
        return Err(StorageError::KeyTooLong(len));
    }
    Ok(())
}

/// Reject rows outside the fenced partition, oversized queue ids and keys
/// repeated within the batch. Shared by all backends so they agree on batch
/// validation.
pub(crate) fn validate_batch(
    rows: &[QueueRow],
    fence: Option<&Fence>,
) -> Result<(), InsertError> {
    if let Some(fence) = fence {
        if let Some(row) = rows.iter().find(|r| !r.belongs_to(&fence.partition)) {
            return Err(InsertError::PartitionMismatch {
                expected: fence.partition.clone(),
                found: row.partition(),
            });
        }
        check_queue_id(&fence.partition)?;
    }
    if let Some(row) = rows
        .iter()
        .find(|r| r.queue_id.len() > MAX_QUEUE_ID_LEN)
    {
        return Err(StorageError::KeyTooLong(row.queue_id.len()).into());
    }

    let mut seen = HashSet::with_capacity(rows.len());
    for row in rows {
        if !seen.insert((row.range_hash, row.queue_id.as_slice(), row.task_id)) {
            return Err(InsertError::DuplicateKey {
                partition: row.partition(),
                task_id: row.task_id,
            });
        }
    }
    Ok(())
}

pub(crate) fn validate_delete_fence(
    filter: &RangeFilter,
    fence: Option<&Fence>,
) -> Result<(), DeleteError> {
    match fence {
        Some(fence) if fence.partition != filter.partition => Err(DeleteError::PartitionMismatch {
            expected: fence.partition.clone(),
            found: filter.partition.clone(),
        }),
        _ => Ok(()),
    }
}
