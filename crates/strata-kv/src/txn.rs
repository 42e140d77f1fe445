//! Write batches and scoped transactions
//!
//! A `Transaction` buffers mutations against a store and applies them as
//! one atomic, WAL-durable group on `commit`. Dropping an uncommitted
//! transaction discards the buffered operations.

use crate::store::KvStore;
use crate::types::KvOp;
use strata_common::Result;
use tracing::debug;

/// Ordered group of put/delete operations
#[derive(Clone, Debug, Default)]
pub struct WriteBatch {
    ops: Vec<KvOp>,
}

impl WriteBatch {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn put(&mut self, key: impl Into<Vec<u8>>, value: impl Into<Vec<u8>>) {
        self.ops.push(KvOp::Put {
            key: key.into(),
            value: value.into(),
        });
    }

    pub fn delete(&mut self, key: impl Into<Vec<u8>>) {
        self.ops.push(KvOp::Delete { key: key.into() });
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.ops.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }

    pub(crate) fn into_ops(self) -> Vec<KvOp> {
        self.ops
    }
}

/// Scoped transaction over a [`KvStore`]
///
/// Nothing is visible until `commit`; drop without commit rolls back.
pub struct Transaction<'a> {
    store: &'a KvStore,
    batch: WriteBatch,
    committed: bool,
}

impl<'a> Transaction<'a> {
    pub(crate) fn new(store: &'a KvStore) -> Self {
        Self {
            store,
            batch: WriteBatch::new(),
            committed: false,
        }
    }

    pub fn put(&mut self, key: impl Into<Vec<u8>>, value: impl Into<Vec<u8>>) {
        self.batch.put(key, value);
    }

    pub fn delete(&mut self, key: impl Into<Vec<u8>>) {
        self.batch.delete(key);
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.batch.is_empty()
    }

    /// Durably apply all buffered operations as one atomic group
    pub fn commit(mut self) -> Result<()> {
        let batch = std::mem::take(&mut self.batch);
        self.committed = true;
        self.store.write_batch(batch)?;
        Ok(())
    }

    /// Discard all buffered operations
    pub fn rollback(mut self) {
        self.committed = true;
        self.batch = WriteBatch::new();
    }
}

impl Drop for Transaction<'_> {
    fn drop(&mut self) {
        if !self.committed && !self.batch.is_empty() {
            debug!(
                ops = self.batch.len(),
                "transaction dropped without commit, discarding"
            );
        }
    }
}
