//! Local-filesystem chunk store
//!
//! Keys map to files under a root directory; intermediate directories are
//! created on demand. Keys are validated so no object can escape the root.

use crate::backend::{CapacityInfo, ChunkStore};
use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use strata_common::{Error, Result};
use tracing::{debug, info};

/// Chunk store rooted at a local directory
pub struct LocalStore {
    root: PathBuf,
}

impl LocalStore {
    /// Open the store, creating the root directory if needed
    pub fn open(root: impl Into<PathBuf>) -> Result<Self> {
        let root = root.into();
        std::fs::create_dir_all(&root)
            .map_err(|e| Error::io(format!("failed to create chunk root: {e}")))?;
        info!(root = %root.display(), "opened local chunk store");
        Ok(Self { root })
    }

    /// Translate a key into a path under the root, rejecting traversal
    fn key_to_path(&self, key: &str) -> Result<PathBuf> {
        if key.is_empty() {
            return Err(Error::invalid_argument("empty chunk key"));
        }
        let mut path = self.root.clone();
        for part in key.split('/') {
            if part.is_empty() || part == "." || part == ".." {
                return Err(Error::invalid_argument(format!(
                    "invalid chunk key: {key:?}"
                )));
            }
            path.push(part);
        }
        Ok(path)
    }
}

impl ChunkStore for LocalStore {
    fn put(&self, key: &str, data: &[u8]) -> Result<()> {
        let path = self.key_to_path(key)?;
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| Error::io(format!("failed to create chunk dir: {e}")))?;
        }

        let mut file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(&path)
            .map_err(|e| Error::io(format!("failed to create chunk {key:?}: {e}")))?;
        file.write_all(data)
            .map_err(|e| Error::io(format!("failed to write chunk {key:?}: {e}")))?;

        debug!(key, bytes = data.len(), "stored chunk");
        Ok(())
    }

    fn get(&self, key: &str) -> Result<Vec<u8>> {
        let path = self.key_to_path(key)?;
        match std::fs::read(&path) {
            Ok(data) => Ok(data),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                Err(Error::not_found(format!("chunk {key:?}")))
            }
            Err(e) => Err(Error::io(format!("failed to read chunk {key:?}: {e}"))),
        }
    }

    fn get_range(&self, key: &str, offset: u64, size: u64) -> Result<Vec<u8>> {
        let path = self.key_to_path(key)?;
        let mut file = match File::open(&path) {
            Ok(file) => file,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(Error::not_found(format!("chunk {key:?}")));
            }
            Err(e) => return Err(Error::io(format!("failed to open chunk {key:?}: {e}"))),
        };

        let len = file
            .metadata()
            .map_err(|e| Error::io(format!("failed to stat chunk {key:?}: {e}")))?
            .len();
        if offset >= len {
            return Ok(Vec::new());
        }

        file.seek(SeekFrom::Start(offset))
            .map_err(|e| Error::io(format!("failed to seek chunk {key:?}: {e}")))?;

        let want = size.min(len - offset) as usize;
        let mut data = vec![0u8; want];
        file.read_exact(&mut data)
            .map_err(|e| Error::io(format!("failed to read chunk {key:?}: {e}")))?;
        Ok(data)
    }

    fn delete(&self, key: &str) -> Result<()> {
        let path = self.key_to_path(key)?;
        match std::fs::remove_file(&path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                Err(Error::not_found(format!("chunk {key:?}")))
            }
            Err(e) => Err(Error::io(format!("failed to delete chunk {key:?}: {e}"))),
        }
    }

    fn exists(&self, key: &str) -> Result<bool> {
        Ok(self.key_to_path(key)?.is_file())
    }

    fn health_check(&self) -> Result<()> {
        if self.root.is_dir() {
            Ok(())
        } else {
            Err(Error::io(format!(
                "chunk root missing: {}",
                self.root.display()
            )))
        }
    }

    #[cfg(unix)]
    fn capacity(&self) -> Result<CapacityInfo> {
        use std::os::unix::ffi::OsStrExt;

        let path = std::ffi::CString::new(self.root.as_os_str().as_bytes())
            .map_err(|_| Error::invalid_argument("chunk root contains NUL"))?;

        let mut stats: libc::statvfs = unsafe { std::mem::zeroed() };
        let rc = unsafe { libc::statvfs(path.as_ptr(), &mut stats) };
        if rc != 0 {
            return Err(Error::io(format!(
                "statvfs failed: {}",
                std::io::Error::last_os_error()
            )));
        }

        let frsize = stats.f_frsize as u64;
        let total = stats.f_blocks as u64 * frsize;
        let available = stats.f_bavail as u64 * frsize;
        Ok(CapacityInfo {
            total,
            used: total.saturating_sub(stats.f_bfree as u64 * frsize),
            available,
        })
    }

    #[cfg(not(unix))]
    fn capacity(&self) -> Result<CapacityInfo> {
        Ok(CapacityInfo::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn store(dir: &Path) -> LocalStore {
        LocalStore::open(dir).unwrap()
    }

    #[test]
    fn test_put_get_roundtrip() {
        let dir = tempdir().unwrap();
        let store = store(dir.path());

        store.put("chunks/1/1", b"hello").unwrap();
        assert_eq!(store.get("chunks/1/1").unwrap(), b"hello");
        assert!(store.exists("chunks/1/1").unwrap());
        assert!(!store.exists("chunks/1/2").unwrap());
    }

    #[test]
    fn test_get_missing() {
        let dir = tempdir().unwrap();
        let store = store(dir.path());
        assert!(store.get("nope").unwrap_err().is_not_found());
    }

    #[test]
    fn test_get_range() {
        let dir = tempdir().unwrap();
        let store = store(dir.path());
        store.put("k", b"0123456789").unwrap();

        assert_eq!(store.get_range("k", 2, 4).unwrap(), b"2345");
        assert_eq!(store.get_range("k", 0, 100).unwrap(), b"0123456789");
        // Past EOF: short read succeeds.
        assert_eq!(store.get_range("k", 8, 10).unwrap(), b"89");
        assert!(store.get_range("k", 20, 5).unwrap().is_empty());
    }

    #[test]
    fn test_delete() {
        let dir = tempdir().unwrap();
        let store = store(dir.path());
        store.put("k", b"x").unwrap();

        store.delete("k").unwrap();
        assert!(!store.exists("k").unwrap());
        assert!(store.delete("k").unwrap_err().is_not_found());
    }

    #[test]
    fn test_batch_get() {
        let dir = tempdir().unwrap();
        let store = store(dir.path());
        store.put("a", b"1").unwrap();
        store.put("b", b"2").unwrap();

        let data = store
            .batch_get(&["a".to_string(), "b".to_string()])
            .unwrap();
        assert_eq!(data, vec![b"1".to_vec(), b"2".to_vec()]);
    }

    #[test]
    fn test_key_traversal_rejected() {
        let dir = tempdir().unwrap();
        let store = store(dir.path());

        for key in ["", "../escape", "a/../../b", "a//b", "./x"] {
            assert!(
                matches!(store.put(key, b"x"), Err(Error::InvalidArgument(_))),
                "key {key:?} was not rejected"
            );
        }
    }

    #[test]
    fn test_health_and_capacity() {
        let dir = tempdir().unwrap();
        let store = store(dir.path());
        store.health_check().unwrap();

        #[cfg(unix)]
        {
            let capacity = store.capacity().unwrap();
            assert!(capacity.total > 0);
            assert!(capacity.available <= capacity.total);
        }
    }
}
