//! Strata KV - Ordered, WAL-durable key-value store
//!
//! The persistence layer under the metadata engine:
//! - Write-ahead log with CRC-checked records
//! - In-memory B-tree index with ordered prefix and range scans
//! - Snapshot + replay recovery
//! - Atomic write batches and scoped transactions

pub mod index;
pub mod store;
pub mod txn;
pub mod types;
pub mod wal;

pub use index::{OrderedIndex, SnapshotConfig};
pub use store::{KvStore, KvStoreConfig};
pub use txn::{Transaction, WriteBatch};
pub use types::{KvEntry, KvOp};
pub use wal::{Wal, WalConfig, WalRecord};
