use std::collections::BTreeMap;
use std::sync::{Mutex, MutexGuard};

use crate::error::{DeleteError, InsertError, SelectError, StorageError, StorageResult};
use crate::filter::{FilterKind, RangeFilter};
use crate::partition::{Fence, Partition, PartitionMeta, QueueRow, TaskId};
use crate::storage::traits::{check_queue_id, validate_batch, validate_delete_fence, QueueStore};

type RowKey = (u32, Vec<u8>, TaskId);

#[derive(Default)]
struct MemoryState {
    rows: BTreeMap<RowKey, (Vec<u8>, String)>,
    partitions: BTreeMap<Partition, PartitionMeta>,
}

impl MemoryState {
    fn matching_keys(&self, partition: &Partition, kind: FilterKind) -> Vec<RowKey> {
        let limit = kind.limit();
        let (min, max) = match kind {
            FilterKind::Point(id) => (id, id),
            FilterKind::Range { min, max, .. } => (min, max),
        };
        if min > max {
            return Vec::new();
        }
        let lo = (partition.range_hash, partition.queue_id.clone(), min);
        let hi = (partition.range_hash, partition.queue_id.clone(), max);
        self.rows
            .range(lo..=hi)
            .take(limit)
            .map(|(k, _)| k.clone())
            .collect()
    }
}

/// In-process queue store. Nothing survives a restart.
#[derive(Default)]
pub struct MemoryStore {
    state: Mutex<MemoryState>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> StorageResult<MutexGuard<'_, MemoryState>> {
        self.state
            .lock()
            .map_err(|_| StorageError::Unavailable("memory store lock poisoned".to_string()))
    }
}

impl QueueStore for MemoryStore {
    fn insert_rows(&self, rows: &[QueueRow], fence: Option<&Fence>) -> Result<u64, InsertError> {
        validate_batch(rows, fence)?;

        let mut state = self.lock()?;
        if let Some(fence) = fence {
            fence.check(state.partitions.get(&fence.partition))?;
        }
        if let Some(row) = rows
            .iter()
            .find(|r| state.rows.contains_key(&(r.range_hash, r.queue_id.clone(), r.task_id)))
        {
            return Err(InsertError::DuplicateKey {
                partition: row.partition(),
                task_id: row.task_id,
            });
        }

        for row in rows {
            state.rows.insert(
                (row.range_hash, row.queue_id.clone(), row.task_id),
                (row.data.clone(), row.data_encoding.clone()),
            );
        }
        Ok(rows.len() as u64)
    }

    fn select_rows(&self, filter: &RangeFilter) -> Result<Vec<QueueRow>, SelectError> {
        let kind = filter.for_select()?;
        check_queue_id(&filter.partition)?;
        let state = self.lock()?;
        let rows = state
            .matching_keys(&filter.partition, kind)
            .into_iter()
            .filter_map(|key| {
                let (data, encoding) = state.rows.get(&key)?;
                Some(QueueRow::new(
                    &filter.partition,
                    key.2,
                    data.clone(),
                    encoding.clone(),
                ))
            })
            .collect();
        Ok(rows)
    }

    fn delete_rows(&self, filter: &RangeFilter, fence: Option<&Fence>) -> Result<u64, DeleteError> {
        let kind = filter.for_delete()?;
        validate_delete_fence(filter, fence)?;
        check_queue_id(&filter.partition)?;

        let mut state = self.lock()?;
        if let Some(fence) = fence {
            fence.check(state.partitions.get(&fence.partition))?;
        }
        let keys = state.matching_keys(&filter.partition, kind);
        for key in &keys {
            state.rows.remove(key);
        }
        Ok(keys.len() as u64)
    }

    fn get_partition_meta(&self, partition: &Partition) -> StorageResult<Option<PartitionMeta>> {
        check_queue_id(partition)?;
        Ok(self.lock()?.partitions.get(partition).copied())
    }

    fn compare_and_set_partition_meta(
        &self,
        partition: &Partition,
        expected_token: Option<u64>,
        meta: &PartitionMeta,
    ) -> StorageResult<bool> {
        check_queue_id(partition)?;
        let mut state = self.lock()?;
        let current = state.partitions.get(partition).map(|m| m.fence_token);
        if current != expected_token {
            return Ok(false);
        }
        state.partitions.insert(partition.clone(), *meta);
        Ok(true)
    }

    fn list_partitions(&self) -> StorageResult<Vec<(Partition, PartitionMeta)>> {
        Ok(self
            .lock()?
            .partitions
            .iter()
            .map(|(p, m)| (p.clone(), *m))
            .collect())
    }

    fn flush(&self) -> StorageResult<()> {
        Ok(())
    }
}
