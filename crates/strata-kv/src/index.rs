//! In-memory ordered index with snapshot persistence
//!
//! A `BTreeMap` behind a reader-writer lock provides point lookups and
//! ordered scans. Periodic snapshots to disk plus WAL replay give fast
//! recovery.

use crate::types::KvEntry;
use parking_lot::RwLock;
use std::collections::BTreeMap;
use std::ops::Bound;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use strata_common::{Error, Result};

/// Snapshot magic number
const SNAPSHOT_MAGIC: u32 = 0x534B_5653; // "SKVS"

/// Snapshot format version
const SNAPSHOT_VERSION: u32 = 1;

/// Snapshot configuration
#[derive(Clone, Debug)]
pub struct SnapshotConfig {
    /// Directory holding snapshot files
    pub snapshot_dir: PathBuf,
    /// Mutations between automatic snapshots
    pub snapshot_threshold: u64,
    /// Number of old snapshots to retain
    pub snapshot_retention: usize,
}

impl Default for SnapshotConfig {
    fn default() -> Self {
        Self {
            snapshot_dir: PathBuf::from("."),
            snapshot_threshold: 10_000,
            snapshot_retention: 2,
        }
    }
}

/// Snapshot file header
#[derive(Clone, Debug)]
struct SnapshotHeader {
    lsn: u64,
    entry_count: u64,
    checksum: u32,
}

impl SnapshotHeader {
    const SIZE: usize = 28;

    fn to_bytes(&self) -> [u8; Self::SIZE] {
        let mut buf = [0u8; Self::SIZE];
        buf[0..4].copy_from_slice(&SNAPSHOT_MAGIC.to_be_bytes());
        buf[4..8].copy_from_slice(&SNAPSHOT_VERSION.to_be_bytes());
        buf[8..16].copy_from_slice(&self.lsn.to_be_bytes());
        buf[16..24].copy_from_slice(&self.entry_count.to_be_bytes());
        buf[24..28].copy_from_slice(&self.checksum.to_be_bytes());
        buf
    }

    fn from_bytes(data: &[u8]) -> Result<Self> {
        if data.len() < Self::SIZE {
            return Err(Error::corrupt("snapshot header truncated"));
        }
        let magic = u32::from_be_bytes(data[0..4].try_into().expect("sized slice"));
        if magic != SNAPSHOT_MAGIC {
            return Err(Error::corrupt("invalid snapshot magic"));
        }
        let version = u32::from_be_bytes(data[4..8].try_into().expect("sized slice"));
        if version > SNAPSHOT_VERSION {
            return Err(Error::corrupt(format!(
                "unsupported snapshot version {version}"
            )));
        }
        Ok(Self {
            lsn: u64::from_be_bytes(data[8..16].try_into().expect("sized slice")),
            entry_count: u64::from_be_bytes(data[16..24].try_into().expect("sized slice")),
            checksum: u32::from_be_bytes(data[24..28].try_into().expect("sized slice")),
        })
    }
}

/// Value stored in the index
#[derive(Clone, Debug)]
struct StoredValue {
    data: Vec<u8>,
    lsn: u64,
}

/// Ordered in-memory index
pub struct OrderedIndex {
    tree: RwLock<BTreeMap<Vec<u8>, StoredValue>>,
    lsn: AtomicU64,
    entry_count: AtomicU64,
    mutations_since_snapshot: AtomicU64,
    last_snapshot_lsn: AtomicU64,
    config: SnapshotConfig,
}

impl OrderedIndex {
    /// Create an empty index
    pub fn new(config: SnapshotConfig) -> Self {
        Self {
            tree: RwLock::new(BTreeMap::new()),
            lsn: AtomicU64::new(0),
            entry_count: AtomicU64::new(0),
            mutations_since_snapshot: AtomicU64::new(0),
            last_snapshot_lsn: AtomicU64::new(0),
            config,
        }
    }

    /// Load from the newest valid snapshot, or start empty
    pub fn load_snapshot(config: SnapshotConfig) -> Result<Self> {
        match Self::find_latest_snapshot(&config.snapshot_dir)? {
            Some(path) => {
                let (tree, header) = Self::read_snapshot(&path)?;
                Ok(Self {
                    entry_count: AtomicU64::new(tree.len() as u64),
                    tree: RwLock::new(tree),
                    lsn: AtomicU64::new(header.lsn),
                    mutations_since_snapshot: AtomicU64::new(0),
                    last_snapshot_lsn: AtomicU64::new(header.lsn),
                    config,
                })
            }
            None => Ok(Self::new(config)),
        }
    }

    fn snapshot_lsn_of(path: &Path) -> Option<u64> {
        let name = path.file_name()?.to_string_lossy().into_owned();
        name.strip_prefix("kv_")?
            .strip_suffix(".snapshot")?
            .parse::<u64>()
            .ok()
    }

    fn find_latest_snapshot(dir: &Path) -> Result<Option<PathBuf>> {
        if !dir.exists() {
            return Ok(None);
        }

        let mut snapshots: Vec<(PathBuf, u64)> = std::fs::read_dir(dir)
            .map_err(|e| Error::io(format!("failed to read snapshot dir: {e}")))?
            .filter_map(|entry| entry.ok())
            .filter_map(|entry| {
                let path = entry.path();
                Self::snapshot_lsn_of(&path).map(|lsn| (path, lsn))
            })
            .collect();

        snapshots.sort_by_key(|(_, lsn)| std::cmp::Reverse(*lsn));
        Ok(snapshots.into_iter().next().map(|(path, _)| path))
    }

    fn read_snapshot(path: &Path) -> Result<(BTreeMap<Vec<u8>, StoredValue>, SnapshotHeader)> {
        let raw =
            std::fs::read(path).map_err(|e| Error::io(format!("failed to read snapshot: {e}")))?;
        if raw.len() < SnapshotHeader::SIZE {
            return Err(Error::corrupt("snapshot file truncated"));
        }

        let header = SnapshotHeader::from_bytes(&raw[..SnapshotHeader::SIZE])?;
        let data = &raw[SnapshotHeader::SIZE..];

        if crc32c::crc32c(data) != header.checksum {
            return Err(Error::corrupt("snapshot checksum mismatch"));
        }

        let entries: Vec<(Vec<u8>, Vec<u8>, u64)> = bincode::deserialize(data)
            .map_err(|e| Error::corrupt(format!("failed to deserialize snapshot: {e}")))?;
        if entries.len() as u64 != header.entry_count {
            return Err(Error::corrupt(format!(
                "snapshot entry count mismatch: header {} vs payload {}",
                header.entry_count,
                entries.len()
            )));
        }

        let mut tree = BTreeMap::new();
        for (key, data, lsn) in entries {
            tree.insert(key, StoredValue { data, lsn });
        }

        Ok((tree, header))
    }

    /// Insert or update a key
    pub fn put(&self, key: Vec<u8>, value: Vec<u8>, lsn: u64) {
        let mut tree = self.tree.write();
        let is_new = tree.insert(key, StoredValue { data: value, lsn }).is_none();
        drop(tree);

        if is_new {
            self.entry_count.fetch_add(1, Ordering::Relaxed);
        }
        self.update_lsn(lsn);
        self.mutations_since_snapshot.fetch_add(1, Ordering::Relaxed);
    }

    /// Delete a key, returning whether it existed
    pub fn delete(&self, key: &[u8], lsn: u64) -> bool {
        let mut tree = self.tree.write();
        let removed = tree.remove(key).is_some();
        drop(tree);

        if removed {
            self.entry_count.fetch_sub(1, Ordering::Relaxed);
        }
        self.update_lsn(lsn);
        self.mutations_since_snapshot.fetch_add(1, Ordering::Relaxed);

        removed
    }

    /// Apply a group of entries under one write lock so readers never see
    /// a partially applied batch
    pub fn apply_batch(&self, entries: &[KvEntry]) {
        let mut tree = self.tree.write();
        let mut max_lsn = 0;
        let mut count_delta: i64 = 0;

        for entry in entries {
            if entry.deleted {
                if tree.remove(&entry.key).is_some() {
                    count_delta -= 1;
                }
            } else if tree
                .insert(
                    entry.key.clone(),
                    StoredValue {
                        data: entry.value.clone(),
                        lsn: entry.lsn,
                    },
                )
                .is_none()
            {
                count_delta += 1;
            }
            max_lsn = max_lsn.max(entry.lsn);
        }
        drop(tree);

        if count_delta >= 0 {
            self.entry_count
                .fetch_add(count_delta as u64, Ordering::Relaxed);
        } else {
            self.entry_count
                .fetch_sub(count_delta.unsigned_abs(), Ordering::Relaxed);
        }
        self.update_lsn(max_lsn);
        self.mutations_since_snapshot
            .fetch_add(entries.len() as u64, Ordering::Relaxed);
    }

    /// Apply one replayed WAL entry
    pub fn apply_entry(&self, entry: KvEntry) {
        if entry.deleted {
            self.delete(&entry.key, entry.lsn);
        } else {
            self.put(entry.key, entry.value, entry.lsn);
        }
    }

    /// Point lookup
    pub fn get(&self, key: &[u8]) -> Option<Vec<u8>> {
        let tree = self.tree.read();
        tree.get(key).map(|v| v.data.clone())
    }

    pub fn contains(&self, key: &[u8]) -> bool {
        let tree = self.tree.read();
        tree.contains_key(key)
    }

    /// Ascending scan of keys extending `prefix`; `limit == 0` is unbounded
    pub fn scan_prefix(&self, prefix: &[u8], limit: usize) -> Vec<(Vec<u8>, Vec<u8>)> {
        let end = prefix_successor(prefix);
        let tree = self.tree.read();

        let lower = Bound::Included(prefix.to_vec());
        let upper = match end {
            Some(end) => Bound::Excluded(end),
            None => Bound::Unbounded,
        };

        let iter = tree
            .range((lower, upper))
            .filter(|(k, _)| k.starts_with(prefix))
            .map(|(k, v)| (k.clone(), v.data.clone()));

        if limit > 0 {
            iter.take(limit).collect()
        } else {
            iter.collect()
        }
    }

    /// Ascending scan of `[start, end)`; `limit == 0` is unbounded
    pub fn scan_range(&self, start: &[u8], end: &[u8], limit: usize) -> Vec<(Vec<u8>, Vec<u8>)> {
        let tree = self.tree.read();
        let iter = tree
            .range::<[u8], _>((Bound::Included(start), Bound::Excluded(end)))
            .map(|(k, v)| (k.clone(), v.data.clone()));

        if limit > 0 {
            iter.take(limit).collect()
        } else {
            iter.collect()
        }
    }

    /// Greatest key in `[start, end)`, with its value
    pub fn last_in_range(&self, start: &[u8], end: &[u8]) -> Option<(Vec<u8>, Vec<u8>)> {
        let tree = self.tree.read();
        tree.range::<[u8], _>((Bound::Included(start), Bound::Excluded(end)))
            .next_back()
            .map(|(k, v)| (k.clone(), v.data.clone()))
    }

    /// Write an atomic snapshot (tmp file + rename), pruning old ones
    pub fn write_snapshot(&self) -> Result<PathBuf> {
        let lsn = self.lsn.load(Ordering::SeqCst);

        let entries: Vec<(Vec<u8>, Vec<u8>, u64)> = {
            let tree = self.tree.read();
            tree.iter()
                .map(|(k, v)| (k.clone(), v.data.clone(), v.lsn))
                .collect()
        };
        let entry_count = entries.len() as u64;

        let data = bincode::serialize(&entries)
            .map_err(|e| Error::io(format!("failed to serialize snapshot: {e}")))?;

        let header = SnapshotHeader {
            lsn,
            entry_count,
            checksum: crc32c::crc32c(&data),
        };

        std::fs::create_dir_all(&self.config.snapshot_dir)
            .map_err(|e| Error::io(format!("failed to create snapshot dir: {e}")))?;

        let snapshot_name = format!("kv_{lsn}.snapshot");
        let snapshot_path = self.config.snapshot_dir.join(&snapshot_name);
        let temp_path = self.config.snapshot_dir.join(format!("{snapshot_name}.tmp"));

        {
            use std::io::Write;
            let mut file = std::fs::File::create(&temp_path)
                .map_err(|e| Error::io(format!("failed to create snapshot file: {e}")))?;
            file.write_all(&header.to_bytes())
                .map_err(|e| Error::io(format!("failed to write snapshot header: {e}")))?;
            file.write_all(&data)
                .map_err(|e| Error::io(format!("failed to write snapshot data: {e}")))?;
            file.sync_all()
                .map_err(|e| Error::io(format!("failed to sync snapshot: {e}")))?;
        }

        std::fs::rename(&temp_path, &snapshot_path)
            .map_err(|e| Error::io(format!("failed to rename snapshot: {e}")))?;

        self.last_snapshot_lsn.store(lsn, Ordering::SeqCst);
        self.mutations_since_snapshot.store(0, Ordering::Relaxed);

        self.cleanup_old_snapshots()?;

        Ok(snapshot_path)
    }

    fn cleanup_old_snapshots(&self) -> Result<()> {
        let mut snapshots: Vec<(PathBuf, u64)> =
            std::fs::read_dir(&self.config.snapshot_dir)
                .map_err(|e| Error::io(format!("failed to read snapshot dir: {e}")))?
                .filter_map(|entry| entry.ok())
                .filter_map(|entry| {
                    let path = entry.path();
                    Self::snapshot_lsn_of(&path).map(|lsn| (path, lsn))
                })
                .collect();

        snapshots.sort_by_key(|(_, lsn)| std::cmp::Reverse(*lsn));
        for (path, _) in snapshots.into_iter().skip(self.config.snapshot_retention) {
            let _ = std::fs::remove_file(path);
        }

        Ok(())
    }

    pub fn needs_snapshot(&self) -> bool {
        self.mutations_since_snapshot.load(Ordering::Relaxed) >= self.config.snapshot_threshold
    }

    pub fn current_lsn(&self) -> u64 {
        self.lsn.load(Ordering::SeqCst)
    }

    pub fn last_snapshot_lsn(&self) -> u64 {
        self.last_snapshot_lsn.load(Ordering::SeqCst)
    }

    pub fn len(&self) -> u64 {
        self.entry_count.load(Ordering::Relaxed)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn update_lsn(&self, lsn: u64) {
        let _ = self
            .lsn
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |current| {
                if lsn > current {
                    Some(lsn)
                } else {
                    None
                }
            });
    }
}

/// Smallest key strictly greater than every key with the given prefix,
/// or `None` when the prefix is all 0xFF
fn prefix_successor(prefix: &[u8]) -> Option<Vec<u8>> {
    let mut end = prefix.to_vec();
    while let Some(last) = end.last_mut() {
        if *last < 0xFF {
            *last += 1;
            return Some(end);
        }
        end.pop();
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_index_put_get() {
        let index = OrderedIndex::new(SnapshotConfig::default());
        index.put(b"k".to_vec(), b"v".to_vec(), 1);
        assert_eq!(index.get(b"k").unwrap(), b"v");
        assert!(index.get(b"missing").is_none());
    }

    #[test]
    fn test_index_delete() {
        let index = OrderedIndex::new(SnapshotConfig::default());
        index.put(b"k".to_vec(), b"v".to_vec(), 1);
        assert!(index.delete(b"k", 2));
        assert!(!index.delete(b"k", 3));
        assert!(index.get(b"k").is_none());
    }

    #[test]
    fn test_scan_prefix_ordered_with_limit() {
        let index = OrderedIndex::new(SnapshotConfig::default());
        for i in [3u8, 1, 4, 2] {
            index.put(vec![b'a', i], vec![i], u64::from(i));
        }
        index.put(b"b1".to_vec(), b"x".to_vec(), 9);

        let all = index.scan_prefix(b"a", 0);
        let keys: Vec<Vec<u8>> = all.iter().map(|(k, _)| k.clone()).collect();
        assert_eq!(keys, vec![vec![b'a', 1], vec![b'a', 2], vec![b'a', 3], vec![b'a', 4]]);

        let limited = index.scan_prefix(b"a", 2);
        assert_eq!(limited.len(), 2);
        assert_eq!(limited[0].0, vec![b'a', 1]);
    }

    #[test]
    fn test_scan_prefix_trailing_ff() {
        let index = OrderedIndex::new(SnapshotConfig::default());
        index.put(vec![0x41, 0xFF, 0x01], b"in".to_vec(), 1);
        index.put(vec![0x42], b"out".to_vec(), 2);

        let hits = index.scan_prefix(&[0x41, 0xFF], 0);
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].1, b"in");
    }

    #[test]
    fn test_scan_range() {
        let index = OrderedIndex::new(SnapshotConfig::default());
        for i in 0..10u8 {
            index.put(vec![i], vec![i], u64::from(i) + 1);
        }
        let hits = index.scan_range(&[3], &[7], 0);
        assert_eq!(hits.len(), 4);
        assert_eq!(hits[0].0, vec![3]);
        assert_eq!(hits[3].0, vec![6]);

        let limited = index.scan_range(&[0], &[10], 3);
        assert_eq!(limited.len(), 3);
    }

    #[test]
    fn test_apply_batch_counts() {
        let index = OrderedIndex::new(SnapshotConfig::default());
        index.put(b"gone".to_vec(), b"v".to_vec(), 1);

        index.apply_batch(&[
            KvEntry::put(b"a".to_vec(), b"1".to_vec(), 2),
            KvEntry::put(b"b".to_vec(), b"2".to_vec(), 2),
            KvEntry::tombstone(b"gone".to_vec(), 2),
        ]);

        assert_eq!(index.len(), 2);
        assert_eq!(index.current_lsn(), 2);
        assert!(index.get(b"gone").is_none());
    }

    #[test]
    fn test_snapshot_roundtrip() {
        let dir = tempdir().unwrap();
        let config = SnapshotConfig {
            snapshot_dir: dir.path().to_path_buf(),
            snapshot_threshold: 10,
            snapshot_retention: 2,
        };

        let index = OrderedIndex::new(config.clone());
        for i in 0..100u8 {
            index.put(vec![i], vec![i, i], u64::from(i) + 1);
        }

        let path = index.write_snapshot().unwrap();
        assert!(path.exists());

        let loaded = OrderedIndex::load_snapshot(config).unwrap();
        assert_eq!(loaded.len(), 100);
        assert_eq!(loaded.get(&[42]).unwrap(), vec![42, 42]);
        assert_eq!(loaded.last_snapshot_lsn(), 100);
    }

    #[test]
    fn test_snapshot_rejects_corruption() {
        let dir = tempdir().unwrap();
        let config = SnapshotConfig {
            snapshot_dir: dir.path().to_path_buf(),
            ..Default::default()
        };

        let index = OrderedIndex::new(config.clone());
        index.put(b"k".to_vec(), b"v".to_vec(), 1);
        let path = index.write_snapshot().unwrap();

        let mut raw = std::fs::read(&path).unwrap();
        let last = raw.len() - 1;
        raw[last] ^= 0xFF;
        std::fs::write(&path, &raw).unwrap();

        assert!(OrderedIndex::load_snapshot(config).is_err());
    }

    #[test]
    fn test_prefix_successor() {
        assert_eq!(prefix_successor(b"ab"), Some(b"ac".to_vec()));
        assert_eq!(prefix_successor(&[0x41, 0xFF]), Some(vec![0x42]));
        assert_eq!(prefix_successor(&[0xFF, 0xFF]), None);
    }
}
