//! Metadata service
//!
//! Stateless front-end over a set of partitions: path resolution, inode
//! allocation, namespace mutations, and the data-plane layout hooks. The
//! service owns the next-inode counter; partitions own persistence.

use crate::partition::MetaPartition;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use strata_common::{
    attr_mask, now_millis, now_secs, Dentry, Error, FileLayout, FileMode, FileType, InodeAttr,
    InodeId, Result, SliceInfo, ROOT_INODE,
};
use tracing::{debug, info, warn};

/// Split an absolute path into `(parent_path, name)`
///
/// The root splits to `("/", "")`.
fn split_parent_child(path: &str) -> (&str, &str) {
    if path == "/" || path.is_empty() {
        return ("/", "");
    }
    let trimmed = path.strip_suffix('/').unwrap_or(path);
    match trimmed.rfind('/') {
        Some(0) => ("/", &trimmed[1..]),
        Some(pos) => (&trimmed[..pos], &trimmed[pos + 1..]),
        None => ("/", trimmed),
    }
}

/// Split an absolute path into its segments
///
/// Empty segments collapse; a path not starting with `/` is rejected.
pub fn parse_path(path: &str) -> Result<Vec<String>> {
    if !path.starts_with('/') {
        return Err(Error::invalid_argument(format!(
            "path must start with '/': {path:?}"
        )));
    }
    Ok(path
        .split('/')
        .filter(|part| !part.is_empty())
        .map(str::to_string)
        .collect())
}

/// Stateless metadata front-end over partitions
pub struct MetadataService {
    partitions: Vec<Arc<MetaPartition>>,
    next_inode: Mutex<InodeId>,
    next_slice_id: AtomicU64,
}

impl MetadataService {
    /// Build the service, creating the root inode if absent and seeding
    /// the inode allocator past every persisted id
    pub fn new(partitions: Vec<Arc<MetaPartition>>) -> Result<Self> {
        if partitions.is_empty() {
            return Err(Error::invalid_argument("at least one partition is required"));
        }

        let service = Self {
            partitions,
            next_inode: Mutex::new(ROOT_INODE + 1),
            next_slice_id: AtomicU64::new(now_millis()),
        };

        let root_partition = service.locate_partition(ROOT_INODE)?;
        if root_partition.lookup_inode(ROOT_INODE).is_err() {
            root_partition.create_inode(ROOT_INODE, FileMode::directory(0o755), 0, 0)?;
            info!("created root inode");
        }

        let mut max_seen = ROOT_INODE;
        for partition in &service.partitions {
            if let Some(max) = partition.max_inode()? {
                max_seen = max_seen.max(max);
            }
        }
        *service.next_inode.lock() = max_seen + 1;

        Ok(service)
    }

    /// Partition owning `inode`
    pub fn locate_partition(&self, inode: InodeId) -> Result<&Arc<MetaPartition>> {
        self.partitions
            .iter()
            .find(|p| p.owns(inode))
            .ok_or_else(|| Error::invalid_argument(format!("no partition owns inode {inode}")))
    }

    /// Allocate the next inode id
    pub fn generate_inode_id(&self) -> InodeId {
        let mut next = self.next_inode.lock();
        let id = *next;
        *next += 1;
        id
    }

    /// Allocate a slice id unique within this engine
    pub fn generate_slice_id(&self) -> u64 {
        self.next_slice_id.fetch_add(1, Ordering::Relaxed)
    }

    /// Resolve an absolute path to an inode id
    pub fn lookup_path(&self, path: &str) -> Result<InodeId> {
        let parts = parse_path(path)?;
        let mut current = ROOT_INODE;

        for part in &parts {
            let partition = self.locate_partition(current)?;
            let dentry = partition
                .lookup_dentry(current, part)
                .map_err(|_| Error::not_found(format!("path component {part:?} in {path:?}")))?;
            current = dentry.inode_id;
        }

        Ok(current)
    }

    /// Create a file or directory at `path`
    pub fn create(&self, path: &str, mode: FileMode, uid: u32, gid: u32) -> Result<InodeAttr> {
        let (parent_path, name) = split_parent_child(path);
        if name.is_empty() {
            return Err(Error::exists("root already exists"));
        }

        let parent = self
            .lookup_path(parent_path)
            .map_err(|_| Error::not_found(format!("parent directory {parent_path:?}")))?;
        let parent_partition = self.locate_partition(parent)?;

        if parent_partition.lookup_dentry(parent, name).is_ok() {
            return Err(Error::exists(format!("{path:?}")));
        }

        let inode = self.generate_inode_id();
        let target_partition = self.locate_partition(inode)?;

        if Arc::ptr_eq(parent_partition, target_partition) {
            return parent_partition.create_entry(parent, name, inode, mode, uid, gid);
        }

        // Inode and dentry live in different partitions: create the inode
        // first, compensate with a delete if the dentry commit fails.
        let attr = target_partition.create_inode(inode, mode, uid, gid)?;
        if let Err(e) = parent_partition.create_dentry(parent, name, inode, mode.file_type()) {
            warn!(inode, error = %e, "dentry commit failed, rolling back inode");
            if let Err(rollback) = target_partition.delete_inode(inode) {
                warn!(inode, error = %rollback, "compensating inode delete failed");
            }
            return Err(e);
        }
        Ok(attr)
    }

    /// Create a directory at `path`
    pub fn mkdir(&self, path: &str, mode: FileMode, uid: u32, gid: u32) -> Result<InodeAttr> {
        self.create(path, mode.as_directory(), uid, gid)
    }

    /// Attributes of the inode at `path`
    pub fn get_attr(&self, path: &str) -> Result<InodeAttr> {
        let inode = self.lookup_path(path)?;
        self.locate_partition(inode)?.lookup_inode(inode)
    }

    /// Merge attributes whose bit is set in `mask`; other bits are ignored
    pub fn set_attr(&self, path: &str, attr: &InodeAttr, mask: u32) -> Result<InodeAttr> {
        let inode = self.lookup_path(path)?;
        let partition = self.locate_partition(inode)?;

        let mut current = partition.lookup_inode(inode)?;
        if mask & attr_mask::MODE != 0 {
            current.mode = attr.mode;
        }
        if mask & attr_mask::UID != 0 {
            current.uid = attr.uid;
        }
        if mask & attr_mask::GID != 0 {
            current.gid = attr.gid;
        }
        if mask & attr_mask::SIZE != 0 {
            current.size = attr.size;
        }
        if mask & attr_mask::MTIME != 0 {
            current.mtime = attr.mtime;
        }
        current.ctime = now_secs();

        partition.update_inode(&current)?;
        Ok(current)
    }

    /// Unlink a file (directories use `rmdir`)
    pub fn unlink(&self, path: &str) -> Result<()> {
        let (parent_path, name) = split_parent_child(path);
        if name.is_empty() {
            return Err(Error::invalid_argument("cannot unlink root"));
        }

        let parent = self.lookup_path(parent_path)?;
        let parent_partition = self.locate_partition(parent)?;
        let dentry = parent_partition.lookup_dentry(parent, name)?;

        if dentry.file_type == FileType::Directory {
            return Err(Error::IsDirectory(format!("{path:?}")));
        }

        let target_partition = self.locate_partition(dentry.inode_id)?;
        let mut attr = target_partition.lookup_inode(dentry.inode_id)?;

        parent_partition.delete_dentry(parent, name)?;

        attr.nlink = attr.nlink.saturating_sub(1);
        if attr.nlink == 0 {
            // Chunk data is orphaned; the chunk store reclaims it later.
            target_partition.delete_inode(dentry.inode_id)?;
        } else {
            attr.ctime = now_secs();
            target_partition.update_inode(&attr)?;
        }

        debug!(path, inode = dentry.inode_id, "unlinked");
        Ok(())
    }

    /// Remove an empty directory
    pub fn rmdir(&self, path: &str) -> Result<()> {
        let (parent_path, name) = split_parent_child(path);
        if name.is_empty() {
            return Err(Error::invalid_argument("cannot remove root"));
        }

        let parent = self.lookup_path(parent_path)?;
        let parent_partition = self.locate_partition(parent)?;
        let dentry = parent_partition.lookup_dentry(parent, name)?;

        if dentry.file_type != FileType::Directory {
            return Err(Error::NotDirectory(format!("{path:?}")));
        }

        let target_partition = self.locate_partition(dentry.inode_id)?;
        if target_partition.has_dentries(dentry.inode_id) {
            return Err(Error::NotEmpty(format!("{path:?}")));
        }

        parent_partition.delete_dentry(parent, name)?;
        target_partition.delete_inode(dentry.inode_id)?;

        debug!(path, inode = dentry.inode_id, "removed directory");
        Ok(())
    }

    /// Rename `old` to `new`
    ///
    /// Atomic within one partition. Across partitions the new dentry is
    /// committed first; if removing the old one then fails, the operation
    /// surfaces `RenameIncomplete` and may be retried (the stale source
    /// dentry is what a crash-recovery orphan scan reaps).
    pub fn rename(&self, old: &str, new: &str) -> Result<()> {
        let (old_parent_path, old_name) = split_parent_child(old);
        let (new_parent_path, new_name) = split_parent_child(new);
        if old_name.is_empty() || new_name.is_empty() {
            return Err(Error::invalid_argument("cannot rename root"));
        }

        let old_parent = self.lookup_path(old_parent_path)?;
        let new_parent = self
            .lookup_path(new_parent_path)
            .map_err(|_| Error::not_found(format!("target directory {new_parent_path:?}")))?;

        let old_partition = self.locate_partition(old_parent)?;
        let new_partition = self.locate_partition(new_parent)?;

        let dentry = old_partition
            .lookup_dentry(old_parent, old_name)
            .map_err(|_| Error::not_found(format!("source {old:?}")))?;

        let new_parent_attr = new_partition.lookup_inode(new_parent)?;
        if !new_parent_attr.mode.is_directory() {
            return Err(Error::NotDirectory(format!("{new_parent_path:?}")));
        }

        if Arc::ptr_eq(old_partition, new_partition) {
            return old_partition.rename_dentry(old_parent, old_name, new_parent, new_name, &dentry);
        }

        new_partition.create_dentry(new_parent, new_name, dentry.inode_id, dentry.file_type)?;
        old_partition
            .delete_dentry(old_parent, old_name)
            .map_err(|e| {
                Error::RenameIncomplete(format!(
                    "new dentry {new:?} committed but old dentry {old:?} removal failed: {e}"
                ))
            })?;

        Ok(())
    }

    /// List the dentries of the directory at `path`
    pub fn readdir(&self, path: &str) -> Result<Vec<Dentry>> {
        let inode = self.lookup_path(path)?;
        let partition = self.locate_partition(inode)?;

        let attr = partition.lookup_inode(inode)?;
        if !attr.mode.is_directory() {
            return Err(Error::NotDirectory(format!("{path:?}")));
        }

        partition.list_dentries(inode)
    }

    /// Attributes of an inode already resolved to an id
    pub fn inode_attr(&self, inode: InodeId) -> Result<InodeAttr> {
        self.locate_partition(inode)?.lookup_inode(inode)
    }

    /// Load a file's layout
    pub fn get_layout(&self, inode: InodeId) -> Result<FileLayout> {
        self.locate_partition(inode)?.get_layout(inode)
    }

    /// Merge a slice into a file's layout
    pub fn add_slice(&self, inode: InodeId, slice: SliceInfo) -> Result<FileLayout> {
        self.locate_partition(inode)?.add_slice(inode, slice)
    }

    /// Grow a file's recorded size; sizes never shrink implicitly
    pub fn update_size(&self, inode: InodeId, new_size: u64) -> Result<InodeAttr> {
        let partition = self.locate_partition(inode)?;
        let mut attr = partition.lookup_inode(inode)?;

        attr.size = attr.size.max(new_size);
        attr.mtime = now_secs();
        partition.update_inode(&attr)?;
        Ok(attr)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::partition::PartitionConfig;
    use tempfile::tempdir;

    fn service(dir: &std::path::Path) -> MetadataService {
        let mut config = PartitionConfig::new(dir, 1, 1 << 20);
        config.sync_on_commit = false;
        let partition = Arc::new(MetaPartition::open(config).unwrap());
        MetadataService::new(vec![partition]).unwrap()
    }

    #[test]
    fn test_parse_path() {
        assert_eq!(parse_path("/a/b/c").unwrap(), vec!["a", "b", "c"]);
        assert_eq!(parse_path("/").unwrap(), Vec::<String>::new());
        assert_eq!(parse_path("//a//b/").unwrap(), vec!["a", "b"]);
        assert!(matches!(
            parse_path("no-leading-slash"),
            Err(Error::InvalidArgument(_))
        ));
    }

    #[test]
    fn test_split_parent_child() {
        assert_eq!(split_parent_child("/a/b/c"), ("/a/b", "c"));
        assert_eq!(split_parent_child("/a"), ("/", "a"));
        assert_eq!(split_parent_child("/"), ("/", ""));
    }

    #[test]
    fn test_inode_allocation_sequence() {
        let dir = tempdir().unwrap();
        let svc = service(dir.path());
        assert_eq!(svc.generate_inode_id(), 2);
        assert_eq!(svc.generate_inode_id(), 3);
        assert_eq!(svc.generate_inode_id(), 4);
    }

    #[test]
    fn test_create_and_lookup() {
        let dir = tempdir().unwrap();
        let svc = service(dir.path());

        let attr = svc.create("/f.txt", FileMode::regular(0o644), 0, 0).unwrap();
        assert_eq!(attr.inode_id, 2);

        assert_eq!(svc.lookup_path("/f.txt").unwrap(), 2);
        assert_eq!(svc.get_attr("/f.txt").unwrap().inode_id, 2);
        assert!(svc.lookup_path("/missing").is_err());
    }

    #[test]
    fn test_create_duplicate_fails() {
        let dir = tempdir().unwrap();
        let svc = service(dir.path());

        svc.create("/f", FileMode::regular(0o644), 0, 0).unwrap();
        let err = svc.create("/f", FileMode::regular(0o644), 0, 0).unwrap_err();
        assert!(matches!(err, Error::Exists(_)));
    }

    #[test]
    fn test_create_in_missing_parent_fails() {
        let dir = tempdir().unwrap();
        let svc = service(dir.path());

        let err = svc
            .create("/no/such/dir/f", FileMode::regular(0o644), 0, 0)
            .unwrap_err();
        assert!(err.is_not_found());
    }

    #[test]
    fn test_mkdir_and_nested_create() {
        let dir = tempdir().unwrap();
        let svc = service(dir.path());

        svc.mkdir("/data", FileMode(0o755), 0, 0).unwrap();
        assert!(svc.get_attr("/data").unwrap().mode.is_directory());

        svc.create("/data/f.txt", FileMode::regular(0o644), 0, 0)
            .unwrap();
        assert_eq!(svc.lookup_path("/data/f.txt").unwrap(), 3);

        let names: Vec<String> = svc
            .readdir("/data")
            .unwrap()
            .into_iter()
            .map(|d| d.name)
            .collect();
        assert_eq!(names, vec!["f.txt"]);
    }

    #[test]
    fn test_readdir_requires_directory() {
        let dir = tempdir().unwrap();
        let svc = service(dir.path());
        svc.create("/f", FileMode::regular(0o644), 0, 0).unwrap();

        assert!(matches!(svc.readdir("/f"), Err(Error::NotDirectory(_))));
    }

    #[test]
    fn test_set_attr_respects_mask() {
        let dir = tempdir().unwrap();
        let svc = service(dir.path());
        svc.create("/f", FileMode::regular(0o644), 1, 1).unwrap();

        let desired = InodeAttr {
            inode_id: 0,
            mode: FileMode::regular(0o600),
            uid: 42,
            gid: 43,
            size: 9999,
            mtime: 123,
            ctime: 0,
            nlink: 77,
        };

        let updated = svc
            .set_attr("/f", &desired, attr_mask::UID | attr_mask::MTIME)
            .unwrap();
        assert_eq!(updated.uid, 42);
        assert_eq!(updated.mtime, 123);
        // Unmasked fields are untouched.
        assert_eq!(updated.gid, 1);
        assert_eq!(updated.size, 0);
        assert_eq!(updated.mode, FileMode::regular(0o644));
        assert_eq!(updated.nlink, 1);

        // Unlisted mask bits are ignored.
        let same = svc.set_attr("/f", &desired, 1 << 30).unwrap();
        assert_eq!(same.uid, 42);
        assert_eq!(same.size, 0);
    }

    #[test]
    fn test_unlink() {
        let dir = tempdir().unwrap();
        let svc = service(dir.path());
        svc.create("/f", FileMode::regular(0o644), 0, 0).unwrap();

        svc.unlink("/f").unwrap();
        assert!(svc.lookup_path("/f").is_err());

        // The name is reusable afterwards.
        svc.create("/f", FileMode::regular(0o644), 0, 0).unwrap();
    }

    #[test]
    fn test_unlink_directory_rejected() {
        let dir = tempdir().unwrap();
        let svc = service(dir.path());
        svc.mkdir("/d", FileMode(0o755), 0, 0).unwrap();

        assert!(matches!(svc.unlink("/d"), Err(Error::IsDirectory(_))));
    }

    #[test]
    fn test_rmdir() {
        let dir = tempdir().unwrap();
        let svc = service(dir.path());
        svc.mkdir("/d", FileMode(0o755), 0, 0).unwrap();
        svc.create("/d/f", FileMode::regular(0o644), 0, 0).unwrap();

        assert!(matches!(svc.rmdir("/d"), Err(Error::NotEmpty(_))));

        svc.unlink("/d/f").unwrap();
        svc.rmdir("/d").unwrap();
        assert!(svc.lookup_path("/d").is_err());
    }

    #[test]
    fn test_rmdir_on_file_rejected() {
        let dir = tempdir().unwrap();
        let svc = service(dir.path());
        svc.create("/f", FileMode::regular(0o644), 0, 0).unwrap();

        assert!(matches!(svc.rmdir("/f"), Err(Error::NotDirectory(_))));
    }

    #[test]
    fn test_rename() {
        let dir = tempdir().unwrap();
        let svc = service(dir.path());
        svc.mkdir("/a", FileMode(0o755), 0, 0).unwrap();
        svc.mkdir("/b", FileMode(0o755), 0, 0).unwrap();
        svc.create("/a/f", FileMode::regular(0o644), 0, 0).unwrap();
        let inode = svc.lookup_path("/a/f").unwrap();

        svc.rename("/a/f", "/b/g").unwrap();
        assert!(svc.lookup_path("/a/f").is_err());
        assert_eq!(svc.lookup_path("/b/g").unwrap(), inode);
    }

    #[test]
    fn test_rename_missing_source() {
        let dir = tempdir().unwrap();
        let svc = service(dir.path());
        assert!(svc.rename("/nope", "/dest").unwrap_err().is_not_found());
    }

    #[test]
    fn test_layout_hooks_and_size_monotonicity() {
        let dir = tempdir().unwrap();
        let svc = service(dir.path());
        svc.create("/f", FileMode::regular(0o644), 0, 0).unwrap();
        let inode = svc.lookup_path("/f").unwrap();

        let layout = svc.get_layout(inode).unwrap();
        assert!(layout.slices.is_empty());

        svc.add_slice(
            inode,
            SliceInfo {
                slice_id: 1,
                offset: 0,
                size: 100,
                storage_key: format!("chunks/{inode}/1"),
            },
        )
        .unwrap();

        let attr = svc.update_size(inode, 100).unwrap();
        assert_eq!(attr.size, 100);

        // A smaller update never shrinks the file.
        let attr = svc.update_size(inode, 10).unwrap();
        assert_eq!(attr.size, 100);

        let layout = svc.get_layout(inode).unwrap();
        assert_eq!(layout.slices.len(), 1);
    }

    #[test]
    fn test_cross_partition_create_and_rename() {
        let dir = tempdir().unwrap();
        let mut low = PartitionConfig::new(dir.path().join("p0"), 1, 3);
        low.sync_on_commit = false;
        let mut high = PartitionConfig::new(dir.path().join("p1"), 3, 1000);
        high.sync_on_commit = false;
        let svc = MetadataService::new(vec![
            Arc::new(MetaPartition::open(low).unwrap()),
            Arc::new(MetaPartition::open(high).unwrap()),
        ])
        .unwrap();

        // Inode 2 lands in the low partition with root, inode 3 does not:
        // its dentry and inode commit in different partitions.
        svc.create("/same", FileMode::regular(0o644), 0, 0).unwrap();
        svc.create("/cross", FileMode::regular(0o644), 0, 0).unwrap();
        assert_eq!(svc.lookup_path("/cross").unwrap(), 3);
        assert_eq!(svc.get_attr("/cross").unwrap().inode_id, 3);

        // /d (inode 4) lives in the high partition; moving /cross under it
        // walks the two-transaction path.
        svc.mkdir("/d", FileMode(0o755), 0, 0).unwrap();
        svc.rename("/cross", "/d/cross").unwrap();
        assert!(svc.lookup_path("/cross").is_err());
        assert_eq!(svc.lookup_path("/d/cross").unwrap(), 3);

        let names: Vec<String> = svc
            .readdir("/d")
            .unwrap()
            .into_iter()
            .map(|d| d.name)
            .collect();
        assert_eq!(names, vec!["cross"]);
    }

    #[test]
    fn test_allocator_reseeds_past_persisted_inodes() {
        let dir = tempdir().unwrap();
        {
            let svc = service(dir.path());
            svc.create("/a", FileMode::regular(0o644), 0, 0).unwrap();
            svc.create("/b", FileMode::regular(0o644), 0, 0).unwrap();
        }

        // Reopening must not hand out ids already on disk.
        let svc = service(dir.path());
        assert_eq!(svc.generate_inode_id(), 4);
    }
}
