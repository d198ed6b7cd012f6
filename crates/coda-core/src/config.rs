use serde::Deserialize;

use crate::partition::TaskId;

/// Top-level engine configuration, deserializable from TOML.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct CodaConfig {
    pub storage: StorageConfig,
    pub ownership: OwnershipConfig,
    pub cursor: CursorConfig,
    pub dlq: DlqConfig,
}

/// Where the RocksDB data directory lives.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    pub data_dir: String,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct OwnershipConfig {
    /// Task ids reserved per durable ceiling bump. Larger blocks mean fewer
    /// metadata writes and larger gaps in the sequence after a handoff.
    pub task_id_block_size: TaskId,
    /// Compare-and-swap attempts before `acquire` reports contention.
    pub acquire_attempts: u32,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CursorConfig {
    pub page_size: usize,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct DlqConfig {
    pub read_page_size: usize,
    pub merge_batch_size: usize,
    pub purge_batch_size: usize,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            data_dir: "data".to_string(),
        }
    }
}

impl Default for OwnershipConfig {
    fn default() -> Self {
        Self {
            task_id_block_size: 100_000,
            acquire_attempts: 5,
        }
    }
}

impl Default for CursorConfig {
    fn default() -> Self {
        Self { page_size: 100 }
    }
}

impl Default for DlqConfig {
    fn default() -> Self {
        Self {
            read_page_size: 100,
            merge_batch_size: 100,
            purge_batch_size: 1000,
        }
    }
}
