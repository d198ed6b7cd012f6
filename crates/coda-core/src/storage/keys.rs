//! Key encoding for RocksDB column families.
//!
//! All numeric values use big-endian encoding for correct lexicographic ordering.
//! Queue ids are length-prefixed with a big-endian u16 and followed by `:` (0x3A).
//! Task ids are signed, so the sign bit is flipped before encoding to keep
//! negative ids sorting below positive ones.

use crate::error::StorageResult;
use crate::partition::{Partition, TaskId};
use crate::storage::traits::check_queue_id;

const SEPARATOR: u8 = b':';
const SIGN_BIT: u64 = 1 << 63;

/// Encode a task id as 8 order-preserving bytes.
pub fn encode_task_id(task_id: TaskId) -> [u8; 8] {
    ((task_id as u64) ^ SIGN_BIT).to_be_bytes()
}

pub fn decode_task_id(bytes: &[u8]) -> Option<TaskId> {
    let bytes: [u8; 8] = bytes.try_into().ok()?;
    Some((u64::from_be_bytes(bytes) ^ SIGN_BIT) as TaskId)
}

/// Build a partition prefix: `{range_hash}{len}{queue_id}:`
///
/// This is both the key of the partition's metadata entry and the prefix of
/// every row key in the partition.
pub fn partition_prefix(partition: &Partition) -> StorageResult<Vec<u8>> {
    check_queue_id(partition)?;
    let len = partition.queue_id.len() as u16;
    let mut key = Vec::with_capacity(4 + 2 + partition.queue_id.len() + 1 + 8);
    key.extend_from_slice(&partition.range_hash.to_be_bytes());
    key.extend_from_slice(&len.to_be_bytes());
    key.extend_from_slice(&partition.queue_id);
    key.push(SEPARATOR);
    Ok(key)
}

/// Build a row key: `{partition_prefix}{task_id}`
pub fn row_key(partition: &Partition, task_id: TaskId) -> StorageResult<Vec<u8>> {
    let mut key = partition_prefix(partition)?;
    key.extend_from_slice(&encode_task_id(task_id));
    Ok(key)
}

/// Parse a partition prefix, returning the partition and the prefix length.
pub fn parse_partition_prefix(key: &[u8]) -> Option<(Partition, usize)> {
    let range_hash = u32::from_be_bytes(key.get(0..4)?.try_into().ok()?);
    let len = u16::from_be_bytes(key.get(4..6)?.try_into().ok()?) as usize;
    let queue_id = key.get(6..6 + len)?.to_vec();
    if *key.get(6 + len)? != SEPARATOR {
        return None;
    }
    Some((Partition::new(range_hash, queue_id), 6 + len + 1))
}
