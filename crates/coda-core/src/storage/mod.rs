pub(crate) mod keys;
mod memory;
mod rocksdb;
mod traits;

#[cfg(test)]
mod conformance;

pub use self::memory::MemoryStore;
pub use self::rocksdb::RocksDbStorage;
pub use traits::QueueStore;
