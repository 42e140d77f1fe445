//! Write-ahead log for KV mutations
//!
//! Append-only log with:
//! - Sequential LSN assignment
//! - CRC32C checksum per record
//! - Replay from any LSN
//! - Truncation after snapshot
//!
//! Record format:
//! ```text
//! +--------+------+--------+------+--------+
//! | Magic  | LSN  | Length | Data | CRC32C |
//! | 4B     | 8B   | 4B     | var  | 4B     |
//! +--------+------+--------+------+--------+
//! ```

use crate::types::{KvEntry, KvOp};
use parking_lot::Mutex;
use strata_common::{Error, Result};
use std::fs::{File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};

/// WAL record magic number
const WAL_MAGIC: u32 = 0x534B_4C47; // "SKLG"

/// Record header size (magic + lsn + length)
const RECORD_HEADER_SIZE: usize = 16;

/// WAL configuration
#[derive(Clone, Debug)]
pub struct WalConfig {
    /// Force the file to stable storage after every commit
    pub sync_on_commit: bool,
    /// WAL size that triggers compaction
    pub max_size_bytes: u64,
    /// Buffer size for writes
    pub write_buffer_size: usize,
}

impl Default for WalConfig {
    fn default() -> Self {
        Self {
            sync_on_commit: true,
            max_size_bytes: 64 * 1024 * 1024,
            write_buffer_size: 64 * 1024,
        }
    }
}

/// A single WAL record
#[derive(Debug)]
pub struct WalRecord {
    pub lsn: u64,
    pub data: Vec<u8>,
}

impl WalRecord {
    /// Serialize record to bytes
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(RECORD_HEADER_SIZE + self.data.len() + 4);

        buf.extend_from_slice(&WAL_MAGIC.to_be_bytes());
        buf.extend_from_slice(&self.lsn.to_be_bytes());
        buf.extend_from_slice(&(self.data.len() as u32).to_be_bytes());
        buf.extend_from_slice(&self.data);

        // CRC over everything except the CRC itself
        let crc = crc32c::crc32c(&buf);
        buf.extend_from_slice(&crc.to_be_bytes());

        buf
    }

    /// Parse one record from the front of `data`, returning it with its
    /// encoded size
    pub fn from_bytes(data: &[u8]) -> Result<(Self, usize)> {
        if data.len() < RECORD_HEADER_SIZE + 4 {
            return Err(Error::corrupt("WAL record too small"));
        }

        let magic = u32::from_be_bytes(data[0..4].try_into().map_err(|_| short_record())?);
        if magic != WAL_MAGIC {
            return Err(Error::corrupt("invalid WAL magic"));
        }

        let lsn = u64::from_be_bytes(data[4..12].try_into().map_err(|_| short_record())?);
        let data_len = u32::from_be_bytes(data[12..16].try_into().map_err(|_| short_record())?) as usize;

        let total_size = RECORD_HEADER_SIZE + data_len + 4;
        if data.len() < total_size {
            return Err(Error::corrupt("WAL record truncated"));
        }

        let payload = data[RECORD_HEADER_SIZE..RECORD_HEADER_SIZE + data_len].to_vec();
        let stored_crc = u32::from_be_bytes(
            data[RECORD_HEADER_SIZE + data_len..total_size]
                .try_into()
                .map_err(|_| short_record())?,
        );

        let computed_crc = crc32c::crc32c(&data[..RECORD_HEADER_SIZE + data_len]);
        if computed_crc != stored_crc {
            return Err(Error::corrupt("WAL record CRC mismatch"));
        }

        Ok((Self { lsn, data: payload }, total_size))
    }
}

fn short_record() -> Error {
    Error::corrupt("WAL record header truncated")
}

/// Write-ahead log
pub struct Wal {
    path: PathBuf,
    writer: Mutex<BufWriter<File>>,
    size: AtomicU64,
    next_lsn: AtomicU64,
    config: WalConfig,
}

impl Wal {
    /// Create a new WAL file, truncating any existing one
    pub fn create(path: impl AsRef<Path>, config: WalConfig) -> Result<Self> {
        let path = path.as_ref().to_path_buf();

        let file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(&path)
            .map_err(|e| Error::io(format!("failed to create WAL: {e}")))?;

        let writer = BufWriter::with_capacity(config.write_buffer_size, file);

        Ok(Self {
            path,
            writer: Mutex::new(writer),
            size: AtomicU64::new(0),
            next_lsn: AtomicU64::new(1),
            config,
        })
    }

    /// Open an existing WAL file, scanning it to find the last LSN
    pub fn open(path: impl AsRef<Path>, config: WalConfig) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let (last_lsn, valid_size) = Self::scan(&path)?;

        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .map_err(|e| Error::io(format!("failed to open WAL: {e}")))?;

        // Drop any torn tail record so new appends follow the valid prefix.
        file.set_len(valid_size)
            .map_err(|e| Error::io(format!("failed to truncate torn WAL tail: {e}")))?;

        let writer = BufWriter::with_capacity(config.write_buffer_size, file);

        Ok(Self {
            path,
            writer: Mutex::new(writer),
            size: AtomicU64::new(valid_size),
            next_lsn: AtomicU64::new(last_lsn + 1),
            config,
        })
    }

    /// Scan the file for the last valid LSN and the length of the valid
    /// prefix; a torn tail record is ignored
    fn scan(path: &Path) -> Result<(u64, u64)> {
        let data = match std::fs::read(path) {
            Ok(data) => data,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok((0, 0)),
            Err(e) => return Err(Error::io(format!("failed to read WAL: {e}"))),
        };

        let mut last_lsn = 0u64;
        let mut offset = 0usize;
        while offset < data.len() {
            match WalRecord::from_bytes(&data[offset..]) {
                Ok((record, size)) => {
                    last_lsn = record.lsn;
                    offset += size;
                }
                Err(_) => break,
            }
        }

        Ok((last_lsn, offset as u64))
    }

    /// Append one operation, returning its LSN
    pub fn append(&self, op: &KvOp) -> Result<u64> {
        let lsn = self.next_lsn.fetch_add(1, Ordering::SeqCst);
        let record = WalRecord {
            lsn,
            data: op.to_bytes(),
        };
        let bytes = record.to_bytes();

        let mut writer = self.writer.lock();
        writer
            .write_all(&bytes)
            .map_err(|e| Error::io(format!("WAL write failed: {e}")))?;

        if self.config.sync_on_commit {
            writer
                .flush()
                .map_err(|e| Error::io(format!("WAL flush failed: {e}")))?;
            writer
                .get_ref()
                .sync_data()
                .map_err(|e| Error::io(format!("WAL sync failed: {e}")))?;
        }

        self.size.fetch_add(bytes.len() as u64, Ordering::Relaxed);
        Ok(lsn)
    }

    /// Append a group of operations as one atomic record
    pub fn append_batch(&self, ops: Vec<KvOp>) -> Result<u64> {
        if ops.is_empty() {
            return Ok(self.current_lsn());
        }
        self.append(&KvOp::Batch { ops })
    }

    /// Force buffered records to stable storage
    pub fn sync(&self) -> Result<()> {
        let mut writer = self.writer.lock();
        writer
            .flush()
            .map_err(|e| Error::io(format!("WAL flush failed: {e}")))?;
        writer
            .get_ref()
            .sync_all()
            .map_err(|e| Error::io(format!("WAL sync failed: {e}")))
    }

    /// Replay records with `lsn >= from_lsn`, in order
    pub fn replay<F>(&self, from_lsn: u64, mut callback: F) -> Result<u64>
    where
        F: FnMut(u64, KvOp) -> Result<()>,
    {
        let data = match std::fs::read(&self.path) {
            Ok(data) => data,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(0),
            Err(e) => return Err(Error::io(format!("failed to read WAL for replay: {e}"))),
        };

        let mut last_lsn = from_lsn.saturating_sub(1);
        let mut offset = 0usize;
        while offset < data.len() {
            match WalRecord::from_bytes(&data[offset..]) {
                Ok((record, size)) => {
                    if record.lsn >= from_lsn {
                        if let Some(op) = KvOp::from_bytes(&record.data) {
                            callback(record.lsn, op)?;
                        }
                    }
                    last_lsn = record.lsn;
                    offset += size;
                }
                Err(_) => break,
            }
        }

        Ok(last_lsn)
    }

    /// Replay as flattened index entries (batches expanded in order)
    pub fn iter_entries<F>(&self, from_lsn: u64, mut callback: F) -> Result<u64>
    where
        F: FnMut(KvEntry) -> Result<()>,
    {
        self.replay(from_lsn, |lsn, op| {
            flatten_op(lsn, op, &mut callback)
        })
    }

    /// Rewrite the WAL keeping only records with `lsn >= snapshot_lsn`
    ///
    /// Called after a successful snapshot to reclaim space.
    pub fn truncate_before(&self, snapshot_lsn: u64) -> Result<()> {
        let new_path = self.path.with_extension("wal.new");

        {
            let new_wal = Wal::create(&new_path, self.config.clone())?;
            self.replay(snapshot_lsn, |_lsn, op| {
                new_wal.append(&op)?;
                Ok(())
            })?;
            new_wal.sync()?;
        }

        std::fs::rename(&new_path, &self.path)
            .map_err(|e| Error::io(format!("WAL rename failed: {e}")))?;

        let file = OpenOptions::new()
            .append(true)
            .open(&self.path)
            .map_err(|e| Error::io(format!("failed to reopen WAL: {e}")))?;

        let mut writer = self.writer.lock();
        *writer = BufWriter::with_capacity(self.config.write_buffer_size, file);

        let new_size = std::fs::metadata(&self.path).map(|m| m.len()).unwrap_or(0);
        self.size.store(new_size, Ordering::Relaxed);

        Ok(())
    }

    /// Last assigned LSN
    pub fn current_lsn(&self) -> u64 {
        self.next_lsn.load(Ordering::SeqCst).saturating_sub(1)
    }

    /// Current WAL size in bytes
    pub fn size(&self) -> u64 {
        self.size.load(Ordering::Relaxed)
    }

    /// Whether the WAL has outgrown its configured limit
    pub fn needs_compaction(&self) -> bool {
        self.size() > self.config.max_size_bytes
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

fn flatten_op<F>(lsn: u64, op: KvOp, callback: &mut F) -> Result<()>
where
    F: FnMut(KvEntry) -> Result<()>,
{
    match op {
        KvOp::Put { key, value } => callback(KvEntry::put(key, value, lsn)),
        KvOp::Delete { key } => callback(KvEntry::tombstone(key, lsn)),
        KvOp::Batch { ops } => {
            for sub_op in ops {
                match sub_op {
                    KvOp::Put { key, value } => callback(KvEntry::put(key, value, lsn))?,
                    KvOp::Delete { key } => callback(KvEntry::tombstone(key, lsn))?,
                    // Nested batches are never produced
                    KvOp::Batch { .. } => {}
                }
            }
            Ok(())
        }
    }
}
