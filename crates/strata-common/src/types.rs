//! Core type definitions for Strata
//!
//! Identifiers and metadata records shared by the metadata engine, the
//! namespace layer, and the chunk store.

use crate::error::{Error, Result};
use std::time::{SystemTime, UNIX_EPOCH};

/// 64-bit inode identifier, dense within a partition's range
pub type InodeId = u64;

/// Inode id reserved for the filesystem root
pub const ROOT_INODE: InodeId = 1;

/// Default layout chunk size (read-time hint, does not bound a slice)
pub const DEFAULT_CHUNK_SIZE: u64 = 4 * 1024 * 1024;

/// File type stored in dentries
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[repr(u32)]
pub enum FileType {
    Regular = 1,
    Directory = 2,
    Symlink = 3,
}

impl FileType {
    /// Decode from the on-disk representation
    pub fn from_raw(raw: u32) -> Result<Self> {
        match raw {
            1 => Ok(Self::Regular),
            2 => Ok(Self::Directory),
            3 => Ok(Self::Symlink),
            other => Err(Error::corrupt(format!("unknown file type {other}"))),
        }
    }
}

/// POSIX-style mode word: file type in the top bits, permissions below
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct FileMode(pub u32);

impl FileMode {
    /// File type mask
    pub const IFMT: u32 = 0o170000;
    /// Directory type bits
    pub const IFDIR: u32 = 0o040000;
    /// Regular file type bits
    pub const IFREG: u32 = 0o100000;
    /// Symlink type bits
    pub const IFLNK: u32 = 0o120000;

    /// Regular file with the given permission bits
    #[must_use]
    pub const fn regular(perm: u32) -> Self {
        Self(Self::IFREG | (perm & !Self::IFMT))
    }

    /// Directory with the given permission bits
    #[must_use]
    pub const fn directory(perm: u32) -> Self {
        Self(Self::IFDIR | (perm & !Self::IFMT))
    }

    #[must_use]
    pub const fn is_regular(self) -> bool {
        self.0 & Self::IFMT == Self::IFREG
    }

    #[must_use]
    pub const fn is_directory(self) -> bool {
        self.0 & Self::IFMT == Self::IFDIR
    }

    #[must_use]
    pub const fn is_symlink(self) -> bool {
        self.0 & Self::IFMT == Self::IFLNK
    }

    /// Dentry file type for this mode
    #[must_use]
    pub fn file_type(self) -> FileType {
        if self.is_directory() {
            FileType::Directory
        } else if self.is_symlink() {
            FileType::Symlink
        } else {
            FileType::Regular
        }
    }

    /// Force the directory type bits, keeping permissions
    #[must_use]
    pub const fn as_directory(self) -> Self {
        Self(Self::IFDIR | (self.0 & !Self::IFMT))
    }
}

/// Inode attribute record
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct InodeAttr {
    pub inode_id: InodeId,
    pub mode: FileMode,
    pub uid: u32,
    pub gid: u32,
    pub size: u64,
    pub mtime: u64,
    pub ctime: u64,
    pub nlink: u64,
}

impl InodeAttr {
    /// Fresh attributes for a newly created inode
    #[must_use]
    pub fn new(inode_id: InodeId, mode: FileMode, uid: u32, gid: u32) -> Self {
        let now = now_secs();
        Self {
            inode_id,
            mode,
            uid,
            gid,
            size: 0,
            mtime: now,
            ctime: now,
            nlink: 1,
        }
    }
}

/// Directory entry: (parent, name) -> child edge in the namespace
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Dentry {
    pub name: String,
    pub inode_id: InodeId,
    pub file_type: FileType,
}

/// Contiguous byte range of one chunk-store object contributing to a file
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SliceInfo {
    pub slice_id: u64,
    /// Offset in the file
    pub offset: u64,
    pub size: u64,
    /// Opaque chunk-store key, conventionally `chunks/{inode}/{slice_id}`
    pub storage_key: String,
}

/// Ordered, non-overlapping slice list defining a file's content
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FileLayout {
    pub inode_id: InodeId,
    pub chunk_size: u64,
    pub slices: Vec<SliceInfo>,
}

impl FileLayout {
    /// Empty layout for a file with no slices yet
    #[must_use]
    pub fn empty(inode_id: InodeId) -> Self {
        Self {
            inode_id,
            chunk_size: DEFAULT_CHUNK_SIZE,
            slices: Vec::new(),
        }
    }

    /// One past the last byte covered by any slice
    #[must_use]
    pub fn end_offset(&self) -> u64 {
        self.slices
            .iter()
            .map(|s| s.offset + s.size)
            .max()
            .unwrap_or(0)
    }
}

/// `set_attr` mask bits; unlisted bits are ignored
pub mod attr_mask {
    pub const MODE: u32 = 1 << 0;
    pub const UID: u32 = 1 << 1;
    pub const GID: u32 = 1 << 2;
    pub const SIZE: u32 = 1 << 3;
    pub const MTIME: u32 = 1 << 4;
}

/// Seconds since the Unix epoch
#[must_use]
pub fn now_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

/// Milliseconds since the Unix epoch
#[must_use]
pub fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mode_type_bits() {
        let dir = FileMode::directory(0o755);
        assert!(dir.is_directory());
        assert!(!dir.is_regular());
        assert_eq!(dir.file_type(), FileType::Directory);

        let file = FileMode::regular(0o644);
        assert!(file.is_regular());
        assert_eq!(file.0 & FileMode::IFMT, FileMode::IFREG);
        assert_eq!(file.file_type(), FileType::Regular);

        assert!(FileMode(0o120777).is_symlink());
    }

    #[test]
    fn test_mode_as_directory() {
        let m = FileMode::regular(0o750).as_directory();
        assert!(m.is_directory());
        assert_eq!(m.0 & !FileMode::IFMT, 0o750);
    }

    #[test]
    fn test_file_type_from_raw() {
        assert_eq!(FileType::from_raw(1).unwrap(), FileType::Regular);
        assert_eq!(FileType::from_raw(2).unwrap(), FileType::Directory);
        assert!(FileType::from_raw(9).is_err());
    }

    #[test]
    fn test_layout_end_offset() {
        let mut layout = FileLayout::empty(7);
        assert_eq!(layout.end_offset(), 0);
        layout.slices.push(SliceInfo {
            slice_id: 1,
            offset: 100,
            size: 50,
            storage_key: "chunks/7/1".into(),
        });
        layout.slices.push(SliceInfo {
            slice_id: 2,
            offset: 0,
            size: 10,
            storage_key: "chunks/7/2".into(),
        });
        assert_eq!(layout.end_offset(), 150);
    }

    #[test]
    fn test_new_attr_defaults() {
        let attr = InodeAttr::new(5, FileMode::regular(0o644), 1000, 1000);
        assert_eq!(attr.size, 0);
        assert_eq!(attr.nlink, 1);
        assert!(attr.mtime > 0);
    }
}
