//! Ordered KV store
//!
//! Combines the write-ahead log and the in-memory ordered index into a
//! single interface with crash recovery (snapshot load + WAL replay) and
//! optional background compaction.

use crate::index::{OrderedIndex, SnapshotConfig};
use crate::txn::{Transaction, WriteBatch};
use crate::types::{KvEntry, KvOp};
use crate::wal::{Wal, WalConfig};
use parking_lot::Mutex;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;
use strata_common::{Error, Result};
use tracing::{debug, error, info, warn};

/// KV store configuration
#[derive(Clone, Debug)]
pub struct KvStoreConfig {
    /// Base directory for the WAL and snapshots
    pub data_dir: PathBuf,
    /// WAL configuration
    pub wal: WalConfig,
    /// Snapshot configuration
    pub snapshot: SnapshotConfig,
    /// Enable the background compaction thread
    pub background_compaction: bool,
    /// Compaction check interval
    pub compaction_interval: Duration,
}

impl Default for KvStoreConfig {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("./kv"),
            wal: WalConfig::default(),
            snapshot: SnapshotConfig::default(),
            background_compaction: false,
            compaction_interval: Duration::from_secs(60),
        }
    }
}

impl KvStoreConfig {
    /// Create a config rooted at `data_dir`
    pub fn with_data_dir(data_dir: impl AsRef<Path>) -> Self {
        let data_dir = data_dir.as_ref().to_path_buf();
        Self {
            snapshot: SnapshotConfig {
                snapshot_dir: data_dir.join("snapshots"),
                ..Default::default()
            },
            data_dir,
            ..Default::default()
        }
    }
}

/// Ordered, WAL-durable key-value store
pub struct KvStore {
    wal: Arc<Wal>,
    index: Arc<OrderedIndex>,
    config: KvStoreConfig,
    /// Serializes commits so index application matches WAL order
    commit_lock: Mutex<()>,
    shutdown: Arc<AtomicBool>,
    compaction_handle: Mutex<Option<thread::JoinHandle<()>>>,
}

impl KvStore {
    /// Open the store, creating it if absent and recovering committed
    /// state (newest snapshot + WAL replay) if present
    pub fn open(config: KvStoreConfig) -> Result<Self> {
        std::fs::create_dir_all(&config.data_dir)
            .map_err(|e| Error::io(format!("failed to create data dir: {e}")))?;
        std::fs::create_dir_all(&config.snapshot.snapshot_dir)
            .map_err(|e| Error::io(format!("failed to create snapshot dir: {e}")))?;

        let wal_path = config.data_dir.join("kv.wal");
        let wal = Arc::new(if wal_path.exists() {
            Wal::open(&wal_path, config.wal.clone())?
        } else {
            Wal::create(&wal_path, config.wal.clone())?
        });

        let index = Arc::new(OrderedIndex::load_snapshot(config.snapshot.clone())?);
        let snapshot_lsn = index.last_snapshot_lsn();

        let mut replayed = 0u64;
        wal.iter_entries(snapshot_lsn + 1, |entry| {
            index.apply_entry(entry);
            replayed += 1;
            Ok(())
        })?;
        if replayed > 0 {
            info!(replayed, from_lsn = snapshot_lsn + 1, "replayed WAL entries");
        }

        let store = Self {
            wal,
            index,
            config,
            commit_lock: Mutex::new(()),
            shutdown: Arc::new(AtomicBool::new(false)),
            compaction_handle: Mutex::new(None),
        };

        if store.config.background_compaction {
            store.start_background_compaction();
        }

        info!(
            data_dir = %store.config.data_dir.display(),
            entries = store.index.len(),
            "opened KV store"
        );
        Ok(store)
    }

    /// Point lookup
    pub fn get(&self, key: &[u8]) -> Option<Vec<u8>> {
        self.index.get(key)
    }

    /// Check key presence
    pub fn exists(&self, key: &[u8]) -> bool {
        self.index.contains(key)
    }

    /// Durably insert or update a single key
    pub fn put(&self, key: impl Into<Vec<u8>>, value: impl Into<Vec<u8>>) -> Result<u64> {
        let key = key.into();
        let value = value.into();

        let _commit = self.commit_lock.lock();
        let lsn = self.wal.append(&KvOp::Put {
            key: key.clone(),
            value: value.clone(),
        })?;
        self.index.put(key, value, lsn);
        debug!(lsn, "put");
        Ok(lsn)
    }

    /// Durably delete a single key
    pub fn delete(&self, key: &[u8]) -> Result<u64> {
        let _commit = self.commit_lock.lock();
        let lsn = self.wal.append(&KvOp::Delete { key: key.to_vec() })?;
        self.index.delete(key, lsn);
        debug!(lsn, "delete");
        Ok(lsn)
    }

    /// Atomically apply a batch: one WAL record, one index update
    ///
    /// On success every operation is visible; on failure none are.
    pub fn write_batch(&self, batch: WriteBatch) -> Result<u64> {
        if batch.is_empty() {
            return Ok(self.wal.current_lsn());
        }

        let ops = batch.into_ops();
        let _commit = self.commit_lock.lock();
        let lsn = self.wal.append_batch(ops.clone())?;

        let entries: Vec<KvEntry> = ops
            .into_iter()
            .filter_map(|op| match op {
                KvOp::Put { key, value } => Some(KvEntry::put(key, value, lsn)),
                KvOp::Delete { key } => Some(KvEntry::tombstone(key, lsn)),
                KvOp::Batch { .. } => None,
            })
            .collect();
        self.index.apply_batch(&entries);

        debug!(lsn, ops = entries.len(), "write_batch");
        Ok(lsn)
    }

    /// Begin a scoped transaction
    pub fn begin_transaction(&self) -> Transaction<'_> {
        Transaction::new(self)
    }

    /// Ascending scan of keys extending `prefix`; `limit == 0` is unbounded
    pub fn scan(&self, prefix: &[u8], limit: usize) -> Vec<(Vec<u8>, Vec<u8>)> {
        self.index.scan_prefix(prefix, limit)
    }

    /// Ascending scan of `[start, end)`; `limit == 0` is unbounded
    pub fn scan_range(&self, start: &[u8], end: &[u8], limit: usize) -> Vec<(Vec<u8>, Vec<u8>)> {
        self.index.scan_range(start, end, limit)
    }

    /// Greatest key in `[start, end)`, with its value
    pub fn last_in_range(&self, start: &[u8], end: &[u8]) -> Option<(Vec<u8>, Vec<u8>)> {
        self.index.last_in_range(start, end)
    }

    /// Force a snapshot and truncate the WAL behind it
    pub fn snapshot(&self) -> Result<PathBuf> {
        let path = self.index.write_snapshot()?;
        let snapshot_lsn = self.index.last_snapshot_lsn();
        info!(lsn = snapshot_lsn, "wrote snapshot");

        if snapshot_lsn > 0 {
            if let Err(e) = self.wal.truncate_before(snapshot_lsn) {
                warn!("failed to truncate WAL: {e}");
            }
        }
        Ok(path)
    }

    /// Snapshot if the index or WAL has grown past its threshold
    pub fn maybe_compact(&self) -> Result<Option<PathBuf>> {
        if self.needs_compaction() {
            Ok(Some(self.snapshot()?))
        } else {
            Ok(None)
        }
    }

    pub fn needs_compaction(&self) -> bool {
        self.index.needs_snapshot() || self.wal.needs_compaction()
    }

    /// Force buffered WAL records to stable storage
    pub fn sync(&self) -> Result<()> {
        self.wal.sync()
    }

    pub fn current_lsn(&self) -> u64 {
        self.wal.current_lsn()
    }

    pub fn len(&self) -> u64 {
        self.index.len()
    }

    pub fn is_empty(&self) -> bool {
        self.index.is_empty()
    }

    fn start_background_compaction(&self) {
        let wal = Arc::clone(&self.wal);
        let index = Arc::clone(&self.index);
        let shutdown = Arc::clone(&self.shutdown);
        let interval = self.config.compaction_interval;

        let handle = thread::spawn(move || {
            debug!("background compaction thread started");

            while !shutdown.load(Ordering::Relaxed) {
                thread::sleep(interval);
                if shutdown.load(Ordering::Relaxed) {
                    break;
                }

                if index.needs_snapshot() || wal.needs_compaction() {
                    match index.write_snapshot() {
                        Ok(path) => {
                            info!(path = %path.display(), "background snapshot completed");
                            let snapshot_lsn = index.last_snapshot_lsn();
                            if snapshot_lsn > 0 {
                                if let Err(e) = wal.truncate_before(snapshot_lsn) {
                                    warn!("failed to truncate WAL: {e}");
                                }
                            }
                        }
                        Err(e) => error!("background snapshot failed: {e}"),
                    }
                }
            }

            debug!("background compaction thread stopped");
        });

        *self.compaction_handle.lock() = Some(handle);
    }

    /// Stop background work and flush the WAL
    pub fn shutdown(&self) {
        self.shutdown.store(true, Ordering::Relaxed);
        if let Some(handle) = self.compaction_handle.lock().take() {
            let _ = handle.join();
        }
        if let Err(e) = self.wal.sync() {
            error!("failed to sync WAL on shutdown: {e}");
        }
    }
}

impl Drop for KvStore {
    fn drop(&mut self) {
        self.shutdown();
    }
}
