//! Chunk store contract
//!
//! The engine addresses slice payloads through this trait and never looks
//! inside a key. Implementations may be local disks, object stores, or
//! anything else that honors the contract; failures are `NotFound`, `Io`,
//! or `InvalidArgument`.

use strata_common::Result;

/// Capacity numbers reported by a chunk store
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct CapacityInfo {
    pub total: u64,
    pub used: u64,
    pub available: u64,
}

/// Opaque byte store holding slice payloads
pub trait ChunkStore: Send + Sync {
    /// Store `data` under `key`, replacing any previous object
    fn put(&self, key: &str, data: &[u8]) -> Result<()>;

    /// Read the whole object
    fn get(&self, key: &str) -> Result<Vec<u8>>;

    /// Read up to `size` bytes starting at `offset`
    ///
    /// A read reaching past the end of the object returns the available
    /// bytes; that short read is success, not an error.
    fn get_range(&self, key: &str, offset: u64, size: u64) -> Result<Vec<u8>>;

    /// Remove the object
    fn delete(&self, key: &str) -> Result<()>;

    /// Whether the object exists
    fn exists(&self, key: &str) -> Result<bool>;

    /// Read several objects; the result order matches `keys`
    fn batch_get(&self, keys: &[String]) -> Result<Vec<Vec<u8>>> {
        keys.iter().map(|key| self.get(key)).collect()
    }

    /// Verify the store is reachable and writable
    fn health_check(&self) -> Result<()>;

    /// Capacity of the underlying medium
    fn capacity(&self) -> Result<CapacityInfo>;
}
