//! Operation and entry types for the KV store

use serde::{Deserialize, Serialize};

/// Mutation applied to the ordered index, as logged in the WAL
#[derive(Clone, Debug, Serialize, Deserialize)]
pub enum KvOp {
    /// Insert or update a key
    Put { key: Vec<u8>, value: Vec<u8> },
    /// Remove a key
    Delete { key: Vec<u8> },
    /// Atomic group of operations
    Batch { ops: Vec<KvOp> },
}

impl KvOp {
    /// Serialize to bytes for the WAL
    pub fn to_bytes(&self) -> Vec<u8> {
        bincode::serialize(self).unwrap_or_default()
    }

    /// Deserialize from bytes
    pub fn from_bytes(data: &[u8]) -> Option<Self> {
        bincode::deserialize(data).ok()
    }
}

/// Flattened index mutation produced by WAL replay
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct KvEntry {
    pub key: Vec<u8>,
    pub value: Vec<u8>,
    /// Log sequence number that produced this entry
    pub lsn: u64,
    /// Tombstone flag (true = deleted)
    pub deleted: bool,
}

impl KvEntry {
    pub fn put(key: Vec<u8>, value: Vec<u8>, lsn: u64) -> Self {
        Self {
            key,
            value,
            lsn,
            deleted: false,
        }
    }

    pub fn tombstone(key: Vec<u8>, lsn: u64) -> Self {
        Self {
            key,
            value: Vec::new(),
            lsn,
            deleted: true,
        }
    }
}
