//! Partition identity and row types.
//!
//! A partition is `(range_hash, queue_id)`. The hash routes the partition to a
//! storage shard and is allowed to collide; the queue id always travels with
//! it and disambiguates.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Per-partition sequence number. Strictly increasing within a partition and
/// assigned by the partition's current owner.
pub type TaskId = i64;

const DLQ_QUEUE_PREFIX: &str = "dlq:";

/// FNV-1a 32-bit hash.
#[inline]
pub fn fnv1a32(data: &[u8]) -> u32 {
    const FNV_OFFSET_BASIS: u32 = 2166136261;
    const FNV_PRIME: u32 = 16777619;

    let mut hash = FNV_OFFSET_BASIS;
    for byte in data {
        hash ^= *byte as u32;
        hash = hash.wrapping_mul(FNV_PRIME);
    }
    hash
}

/// Stable routing hash for a logical queue name.
#[inline]
pub fn range_hash(name: &str) -> u32 {
    fnv1a32(name.as_bytes())
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Partition {
    pub range_hash: u32,
    pub queue_id: Vec<u8>,
}

impl Partition {
    pub fn new(range_hash: u32, queue_id: impl Into<Vec<u8>>) -> Self {
        Self {
            range_hash,
            queue_id: queue_id.into(),
        }
    }

    /// Partition for a task queue, routed by the hash of its name.
    pub fn task_queue(name: &str) -> Self {
        Self::new(range_hash(name), name.as_bytes())
    }

    /// Dead-letter partition buffering messages from `source_cluster`.
    pub fn dlq(source_cluster: &str) -> Self {
        let mut queue_id = Vec::with_capacity(DLQ_QUEUE_PREFIX.len() + source_cluster.len());
        queue_id.extend_from_slice(DLQ_QUEUE_PREFIX.as_bytes());
        queue_id.extend_from_slice(source_cluster.as_bytes());
        Self::new(range_hash(source_cluster), queue_id)
    }

    /// The source cluster of a DLQ partition, or `None` for other partitions.
    pub fn dlq_source_cluster(&self) -> Option<&str> {
        let rest = self.queue_id.strip_prefix(DLQ_QUEUE_PREFIX.as_bytes())?;
        std::str::from_utf8(rest).ok()
    }
}

impl fmt::Display for Partition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}/{}",
            self.range_hash,
            String::from_utf8_lossy(&self.queue_id)
        )
    }
}

/// One enqueued item. Immutable once inserted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueRow {
    pub range_hash: u32,
    pub queue_id: Vec<u8>,
    pub task_id: TaskId,
    pub data: Vec<u8>,
    pub data_encoding: String,
}

impl QueueRow {
    pub fn new(
        partition: &Partition,
        task_id: TaskId,
        data: impl Into<Vec<u8>>,
        data_encoding: impl Into<String>,
    ) -> Self {
        Self {
            range_hash: partition.range_hash,
            queue_id: partition.queue_id.clone(),
            task_id,
            data: data.into(),
            data_encoding: data_encoding.into(),
        }
    }

    pub fn partition(&self) -> Partition {
        Partition::new(self.range_hash, self.queue_id.clone())
    }

    pub fn belongs_to(&self, partition: &Partition) -> bool {
        self.range_hash == partition.range_hash && self.queue_id == partition.queue_id
    }
}

/// Opaque payload waiting for a task id.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Payload {
    pub data: Vec<u8>,
    pub data_encoding: String,
}

impl Payload {
    pub fn new(data: impl Into<Vec<u8>>, data_encoding: impl Into<String>) -> Self {
        Self {
            data: data.into(),
            data_encoding: data_encoding.into(),
        }
    }
}

/// Durable per-partition ownership state, independent of the rows.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct PartitionMeta {
    /// Highest ownership token ever issued for the partition.
    pub fence_token: u64,
    /// Highest task id reserved by any owner so far.
    pub task_id_ceiling: TaskId,
}

/// Proof of ownership presented with a mutating call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Fence {
    pub partition: Partition,
    pub token: u64,
}

impl Fence {
    pub fn new(partition: Partition, token: u64) -> Self {
        Self { partition, token }
    }

    /// Check this fence against the partition's durable metadata. A partition
    /// that was never acquired has token 0, which no fence can match.
    pub fn check(&self, meta: Option<&PartitionMeta>) -> Result<(), crate::error::FencedOut> {
        let current = meta.map(|m| m.fence_token).unwrap_or(0);
        if current == 0 || self.token != current {
            return Err(crate::error::FencedOut {
                partition: self.partition.clone(),
                presented: self.token,
                current,
            });
        }
        Ok(())
    }
}
