use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard};

use rocksdb::{
    BoundColumnFamily, ColumnFamilyDescriptor, DBWithThreadMode, Direction, IteratorMode,
    MultiThreaded, Options, WriteBatch,
};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{DeleteError, InsertError, SelectError, StorageError, StorageResult};
use crate::filter::{FilterKind, RangeFilter};
use crate::partition::{Fence, Partition, PartitionMeta, QueueRow, TaskId};
use crate::storage::keys;
use crate::storage::traits::{validate_batch, validate_delete_fence, QueueStore};

const CF_ROWS: &str = "rows";
const CF_PARTITIONS: &str = "partitions";

/// All column family names (excluding `default` which RocksDB creates automatically).
const COLUMN_FAMILIES: &[&str] = &[CF_ROWS, CF_PARTITIONS];

type DB = DBWithThreadMode<MultiThreaded>;

#[derive(Serialize)]
struct RowValueRef<'a> {
    data: &'a [u8],
    data_encoding: &'a str,
}

#[derive(Deserialize)]
struct RowValue {
    data: Vec<u8>,
    data_encoding: String,
}

/// RocksDB-backed queue store.
///
/// Mutations hold `write_lock` so duplicate and fence checks see the same
/// state the write batch lands on. Reads never take the lock.
pub struct RocksDbStorage {
    db: DB,
    write_lock: Mutex<()>,
}

impl RocksDbStorage {
    /// Open or create a RocksDB database at the given path with all column families.
    pub fn open(path: impl AsRef<Path>) -> StorageResult<Self> {
        let mut db_opts = Options::default();
        db_opts.create_if_missing(true);
        db_opts.create_missing_column_families(true);

        let cf_descriptors: Vec<ColumnFamilyDescriptor> = COLUMN_FAMILIES
            .iter()
            .map(|name| ColumnFamilyDescriptor::new(*name, Options::default()))
            .collect();

        let db = DB::open_cf_descriptors(&db_opts, path, cf_descriptors)?;
        Ok(Self {
            db,
            write_lock: Mutex::new(()),
        })
    }

    fn cf(&self, name: &str) -> StorageResult<Arc<BoundColumnFamily<'_>>> {
        self.db
            .cf_handle(name)
            .ok_or_else(|| StorageError::RocksDb(format!("column family not found: {name}")))
    }

    fn writer(&self) -> StorageResult<MutexGuard<'_, ()>> {
        self.write_lock
            .lock()
            .map_err(|_| StorageError::Unavailable("rocksdb writer lock poisoned".to_string()))
    }

    /// Keys and values of rows matching `kind`, lowest task id first.
    fn scan(
        &self,
        partition: &Partition,
        kind: FilterKind,
    ) -> StorageResult<Vec<(Vec<u8>, TaskId, Vec<u8>)>> {
        let cf = self.cf(CF_ROWS)?;
        match kind {
            FilterKind::Point(task_id) => {
                let key = keys::row_key(partition, task_id)?;
                Ok(self
                    .db
                    .get_cf(&cf, &key)?
                    .map(|value| vec![(key, task_id, value)])
                    .unwrap_or_default())
            }
            FilterKind::Range { min, max, .. } => {
                let limit = kind.limit();
                let mut results = Vec::new();
                if min > max {
                    return Ok(results);
                }
                let prefix = keys::partition_prefix(partition)?;
                let start = keys::row_key(partition, min)?;
                let iter = self
                    .db
                    .iterator_cf(&cf, IteratorMode::From(&start, Direction::Forward));
                for item in iter {
                    let (key, value) = item?;
                    let Some(suffix) = key.strip_prefix(prefix.as_slice()) else {
                        break;
                    };
                    let task_id = keys::decode_task_id(suffix).ok_or_else(|| {
                        StorageError::CorruptData(format!("bad row key in partition {partition}"))
                    })?;
                    if task_id > max {
                        break;
                    }
                    results.push((key.to_vec(), task_id, value.to_vec()));
                    if results.len() >= limit {
                        break;
                    }
                }
                Ok(results)
            }
        }
    }

    fn current_meta(&self, partition: &Partition) -> StorageResult<Option<PartitionMeta>> {
        let cf = self.cf(CF_PARTITIONS)?;
        let key = keys::partition_prefix(partition)?;
        match self.db.get_cf(&cf, &key)? {
            Some(value) => Ok(Some(serde_json::from_slice(&value)?)),
            None => Ok(None),
        }
    }
}

impl QueueStore for RocksDbStorage {
    fn insert_rows(&self, rows: &[QueueRow], fence: Option<&Fence>) -> Result<u64, InsertError> {
        validate_batch(rows, fence)?;

        let _guard = self.writer()?;
        if let Some(fence) = fence {
            fence.check(self.current_meta(&fence.partition)?.as_ref())?;
        }
        if rows.is_empty() {
            return Ok(0);
        }

        let cf = self.cf(CF_ROWS)?;
        let mut batch = WriteBatch::default();
        for row in rows {
            let partition = row.partition();
            let key = keys::row_key(&partition, row.task_id)?;
            if self
                .db
                .get_pinned_cf(&cf, &key)
                .map_err(StorageError::from)?
                .is_some()
            {
                return Err(InsertError::DuplicateKey {
                    partition,
                    task_id: row.task_id,
                });
            }
            let value = serde_json::to_vec(&RowValueRef {
                data: &row.data,
                data_encoding: &row.data_encoding,
            })
            .map_err(StorageError::from)?;
            batch.put_cf(&cf, &key, &value);
        }

        self.db.write(batch).map_err(StorageError::from)?;
        debug!(rows = rows.len(), "rows inserted");
        Ok(rows.len() as u64)
    }

    fn select_rows(&self, filter: &RangeFilter) -> Result<Vec<QueueRow>, SelectError> {
        let kind = filter.for_select()?;
        let partition = &filter.partition;
        self.scan(partition, kind)?
            .into_iter()
            .map(|(_, task_id, value)| -> Result<QueueRow, SelectError> {
                let value: RowValue = serde_json::from_slice(&value).map_err(StorageError::from)?;
                Ok(QueueRow::new(
                    partition,
                    task_id,
                    value.data,
                    value.data_encoding,
                ))
            })
            .collect()
    }

    fn delete_rows(&self, filter: &RangeFilter, fence: Option<&Fence>) -> Result<u64, DeleteError> {
        let kind = filter.for_delete()?;
        validate_delete_fence(filter, fence)?;

        let _guard = self.writer()?;
        if let Some(fence) = fence {
            fence.check(self.current_meta(&fence.partition)?.as_ref())?;
        }

        let matched = self.scan(&filter.partition, kind)?;
        if matched.is_empty() {
            return Ok(0);
        }

        let cf = self.cf(CF_ROWS)?;
        let mut batch = WriteBatch::default();
        for (key, _, _) in &matched {
            batch.delete_cf(&cf, key);
        }
        self.db.write(batch).map_err(StorageError::from)?;
        Ok(matched.len() as u64)
    }

    fn get_partition_meta(&self, partition: &Partition) -> StorageResult<Option<PartitionMeta>> {
        self.current_meta(partition)
    }

    fn compare_and_set_partition_meta(
        &self,
        partition: &Partition,
        expected_token: Option<u64>,
        meta: &PartitionMeta,
    ) -> StorageResult<bool> {
        let _guard = self.writer()?;
        let current = self.current_meta(partition)?.map(|m| m.fence_token);
        if current != expected_token {
            return Ok(false);
        }
        let cf = self.cf(CF_PARTITIONS)?;
        let key = keys::partition_prefix(partition)?;
        self.db.put_cf(&cf, &key, serde_json::to_vec(meta)?)?;
        Ok(true)
    }

    fn list_partitions(&self) -> StorageResult<Vec<(Partition, PartitionMeta)>> {
        let cf = self.cf(CF_PARTITIONS)?;
        let iter = self.db.iterator_cf(&cf, IteratorMode::Start);
        let mut results = Vec::new();
        for item in iter {
            let (key, value) = item?;
            let (partition, _) = keys::parse_partition_prefix(&key).ok_or_else(|| {
                StorageError::CorruptData("bad partition metadata key".to_string())
            })?;
            results.push((partition, serde_json::from_slice(&value)?));
        }
        Ok(results)
    }

    fn flush(&self) -> StorageResult<()> {
        self.db.flush_wal(true)?;
        Ok(())
    }
}
