//! Unified namespace service
//!
//! Accepts either path shape and fuses metadata operations with
//! chunk-store I/O. Reads map the requested range onto layout slices and
//! concatenate ranged chunk reads, with holes reading as zeros; writes
//! store the payload first and only then publish it in metadata.

use crate::path::{ParsedPath, PathConverter};
use std::sync::Arc;
use strata_common::{
    CancelToken, Dentry, FileLayout, InodeAttr, InodeId, Result, SingleFlight, SliceInfo,
};
use strata_meta::MetadataService;
use strata_store::ChunkStore;
use tracing::debug;

/// Namespace front-end over the metadata service and a chunk store
pub struct NamespaceService {
    converter: PathConverter,
    metadata: Arc<MetadataService>,
    chunks: Arc<dyn ChunkStore>,
    /// Coalesces concurrent layout loads per inode
    layout_flights: SingleFlight<FileLayout>,
}

impl NamespaceService {
    pub fn new(
        metadata: Arc<MetadataService>,
        chunks: Arc<dyn ChunkStore>,
        default_bucket: impl Into<String>,
    ) -> Self {
        Self {
            converter: PathConverter::new(default_bucket),
            metadata,
            chunks,
            layout_flights: SingleFlight::new(),
        }
    }

    pub fn converter(&self) -> &PathConverter {
        &self.converter
    }

    /// Parse either path shape into its normalized form
    pub fn parse(&self, path: &str) -> ParsedPath {
        self.converter.parse(path)
    }

    /// Attributes of the file or directory at `path`
    pub fn get_attr(&self, path: &str) -> Result<InodeAttr> {
        let parsed = self.converter.parse(path);
        self.metadata.get_attr(&parsed.posix_path)
    }

    /// Layout of the file at `path`
    pub fn get_layout(&self, path: &str) -> Result<FileLayout> {
        let parsed = self.converter.parse(path);
        let inode = self.metadata.lookup_path(&parsed.posix_path)?;
        self.load_layout(inode)
    }

    /// Dentries of the directory at `path`
    pub fn readdir(&self, path: &str) -> Result<Vec<Dentry>> {
        let parsed = self.converter.parse(path);
        self.metadata.readdir(&parsed.posix_path)
    }

    /// Concurrent readers of one inode share a single layout load.
    fn load_layout(&self, inode: InodeId) -> Result<FileLayout> {
        let metadata = &self.metadata;
        self.layout_flights
            .run(&format!("layout/{inode}"), || metadata.get_layout(inode))
    }

    /// Read up to `size` bytes at `offset`
    ///
    /// Holes read as zeros; a range reaching past EOF shrinks to the
    /// available bytes and succeeds.
    pub fn read(
        &self,
        path: &str,
        offset: u64,
        size: u64,
        cancel: &CancelToken,
    ) -> Result<Vec<u8>> {
        cancel.check()?;
        let parsed = self.converter.parse(path);
        let inode = self.metadata.lookup_path(&parsed.posix_path)?;
        let attr = self.metadata.inode_attr(inode)?;

        if offset >= attr.size || size == 0 {
            return Ok(Vec::new());
        }
        let want = size.min(attr.size - offset);
        let end = offset + want;

        cancel.check()?;
        let layout = self.load_layout(inode)?;

        let mut buf = vec![0u8; want as usize];
        for slice in &layout.slices {
            let slice_end = slice.offset + slice.size;
            if slice_end <= offset || slice.offset >= end {
                continue;
            }

            let overlap_start = offset.max(slice.offset);
            let overlap_end = end.min(slice_end);

            cancel.check()?;
            let data = self.chunks.get_range(
                &slice.storage_key,
                overlap_start - slice.offset,
                overlap_end - overlap_start,
            )?;

            let dst = (overlap_start - offset) as usize;
            let copy = data.len().min((overlap_end - overlap_start) as usize);
            buf[dst..dst + copy].copy_from_slice(&data[..copy]);
        }

        debug!(path, offset, bytes = buf.len(), "read");
        Ok(buf)
    }

    /// Write `data` at `offset`, returning the file size afterwards
    ///
    /// The chunk lands before any metadata changes: a chunk-store failure
    /// aborts cleanly, and a metadata failure only orphans an unreachable
    /// chunk for the store to reclaim.
    pub fn write(
        &self,
        path: &str,
        data: &[u8],
        offset: u64,
        cancel: &CancelToken,
    ) -> Result<u64> {
        cancel.check()?;
        let parsed = self.converter.parse(path);
        let inode = self.metadata.lookup_path(&parsed.posix_path)?;

        let slice_id = self.metadata.generate_slice_id();
        let storage_key = format!("chunks/{inode}/{slice_id}");

        self.chunks.put(&storage_key, data)?;
        cancel.check()?;

        self.metadata.add_slice(
            inode,
            SliceInfo {
                slice_id,
                offset,
                size: data.len() as u64,
                storage_key,
            },
        )?;
        cancel.check()?;

        let attr = self
            .metadata
            .update_size(inode, offset + data.len() as u64)?;

        debug!(path, offset, bytes = data.len(), size = attr.size, "write");
        Ok(attr.size)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use strata_common::{Error, FileMode};
    use strata_meta::{MetaPartition, PartitionConfig};
    use strata_store::LocalStore;
    use tempfile::tempdir;

    fn namespace(dir: &std::path::Path) -> NamespaceService {
        let mut config = PartitionConfig::new(dir.join("meta"), 1, 1 << 20);
        config.sync_on_commit = false;
        let partition = Arc::new(MetaPartition::open(config).unwrap());
        let metadata = Arc::new(MetadataService::new(vec![partition]).unwrap());
        let chunks: Arc<dyn ChunkStore> = Arc::new(LocalStore::open(dir.join("chunks")).unwrap());
        NamespaceService::new(metadata, chunks, "testbucket")
    }

    fn create_file(ns: &NamespaceService, path: &str) {
        ns.metadata
            .create(path, FileMode::regular(0o644), 0, 0)
            .unwrap();
    }

    #[test]
    fn test_write_read_roundtrip() {
        let dir = tempdir().unwrap();
        let ns = namespace(dir.path());
        let cancel = CancelToken::new();

        create_file(&ns, "/f.txt");
        let size = ns.write("/f.txt", b"hello world", 0, &cancel).unwrap();
        assert_eq!(size, 11);

        let data = ns.read("/f.txt", 0, 11, &cancel).unwrap();
        assert_eq!(data, b"hello world");

        // The s3:// spelling reaches the same file.
        let data = ns
            .read("s3://testbucket/f.txt", 6, 5, &cancel)
            .unwrap();
        assert_eq!(data, b"world");
    }

    #[test]
    fn test_read_past_eof_is_partial_success() {
        let dir = tempdir().unwrap();
        let ns = namespace(dir.path());
        let cancel = CancelToken::new();

        create_file(&ns, "/f");
        ns.write("/f", b"0123456789", 0, &cancel).unwrap();

        let data = ns.read("/f", 8, 100, &cancel).unwrap();
        assert_eq!(data, b"89");
        assert!(ns.read("/f", 100, 10, &cancel).unwrap().is_empty());
    }

    #[test]
    fn test_holes_read_as_zeros() {
        let dir = tempdir().unwrap();
        let ns = namespace(dir.path());
        let cancel = CancelToken::new();

        create_file(&ns, "/sparse");
        ns.write("/sparse", b"tail", 100, &cancel).unwrap();

        let data = ns.read("/sparse", 96, 8, &cancel).unwrap();
        assert_eq!(data, b"\0\0\0\0tail");
    }

    #[test]
    fn test_overlapping_writes_last_wins() {
        let dir = tempdir().unwrap();
        let ns = namespace(dir.path());
        let cancel = CancelToken::new();

        create_file(&ns, "/f");
        ns.write("/f", &[b'a'; 100], 0, &cancel).unwrap();
        ns.write("/f", &[b'b'; 100], 50, &cancel).unwrap();

        let data = ns.read("/f", 0, 150, &cancel).unwrap();
        assert_eq!(&data[..50], &[b'a'; 50][..]);
        assert_eq!(&data[50..], &[b'b'; 100][..]);

        let layout = ns.get_layout("/f").unwrap();
        assert_eq!(layout.slices.len(), 2);
        assert_eq!(layout.slices[0].size, 50);
    }

    #[test]
    fn test_multi_slice_read_spans_chunks() {
        let dir = tempdir().unwrap();
        let ns = namespace(dir.path());
        let cancel = CancelToken::new();

        create_file(&ns, "/f");
        ns.write("/f", b"aaaa", 0, &cancel).unwrap();
        ns.write("/f", b"bbbb", 4, &cancel).unwrap();
        ns.write("/f", b"cccc", 8, &cancel).unwrap();

        let data = ns.read("/f", 2, 8, &cancel).unwrap();
        assert_eq!(data, b"aabbbbcc");
    }

    #[test]
    fn test_write_to_missing_file_fails_before_metadata() {
        let dir = tempdir().unwrap();
        let ns = namespace(dir.path());
        let cancel = CancelToken::new();

        let err = ns.write("/missing", b"x", 0, &cancel).unwrap_err();
        assert!(err.is_not_found());
    }

    #[test]
    fn test_cancellation() {
        let dir = tempdir().unwrap();
        let ns = namespace(dir.path());

        create_file(&ns, "/f");
        let cancel = CancelToken::new();
        cancel.cancel();

        assert!(matches!(
            ns.read("/f", 0, 10, &cancel),
            Err(Error::Cancelled)
        ));
        assert!(matches!(
            ns.write("/f", b"x", 0, &cancel),
            Err(Error::Cancelled)
        ));
    }

    #[test]
    fn test_get_attr_and_readdir_via_both_shapes() {
        let dir = tempdir().unwrap();
        let ns = namespace(dir.path());

        create_file(&ns, "/f");
        assert_eq!(ns.get_attr("/f").unwrap().size, 0);
        assert_eq!(ns.get_attr("s3://testbucket/f").unwrap().size, 0);

        let names: Vec<String> = ns
            .readdir("s3://testbucket")
            .unwrap()
            .into_iter()
            .map(|d| d.name)
            .collect();
        assert_eq!(names, vec!["f"]);
    }
}
