//! Key schema and record codecs for the metadata engine
//!
//! Keys are designed for ordered prefix scanning:
//! - Dentry keys: `'D' || parent (8B BE) || '/' || name`
//! - Inode keys:  `'I' || inode (8B BE)`
//! - Layout keys: `'L' || inode (8B BE)`
//!
//! All multi-byte integers are big-endian so numeric prefixes sort
//! lexicographically. Decoders are bounds-checked: a payload below the
//! minimum for its type, or an inner length pointing past the end, is
//! rejected as corrupt.

use strata_common::{
    Dentry, Error, FileLayout, FileMode, FileType, InodeAttr, InodeId, Result, SliceInfo,
};

/// Dentry key prefix byte
pub const DENTRY_PREFIX: u8 = b'D';
/// Inode key prefix byte
pub const INODE_PREFIX: u8 = b'I';
/// Layout key prefix byte
pub const LAYOUT_PREFIX: u8 = b'L';

const DENTRY_KEY_HEADER: usize = 1 + 8 + 1;
const INODE_VALUE_SIZE: usize = 52;
const LAYOUT_VALUE_HEADER: usize = 20;
const SLICE_FIXED_SIZE: usize = 28;

/// Key for a dentry under `(parent, name)`
pub fn dentry_key(parent: InodeId, name: &str) -> Vec<u8> {
    let mut key = Vec::with_capacity(DENTRY_KEY_HEADER + name.len());
    key.push(DENTRY_PREFIX);
    key.extend_from_slice(&parent.to_be_bytes());
    key.push(b'/');
    key.extend_from_slice(name.as_bytes());
    key
}

/// Scan prefix covering every dentry of `parent`
pub fn dentry_scan_prefix(parent: InodeId) -> Vec<u8> {
    let mut key = Vec::with_capacity(DENTRY_KEY_HEADER);
    key.push(DENTRY_PREFIX);
    key.extend_from_slice(&parent.to_be_bytes());
    key.push(b'/');
    key
}

/// Recover the entry name from a dentry key (located by key length)
pub fn dentry_name_from_key(key: &[u8]) -> Result<String> {
    if key.len() < DENTRY_KEY_HEADER || key[0] != DENTRY_PREFIX || key[9] != b'/' {
        return Err(Error::corrupt("malformed dentry key"));
    }
    String::from_utf8(key[DENTRY_KEY_HEADER..].to_vec())
        .map_err(|_| Error::corrupt("dentry name is not valid UTF-8"))
}

/// Key for an inode attribute record
pub fn inode_key(inode: InodeId) -> Vec<u8> {
    let mut key = Vec::with_capacity(9);
    key.push(INODE_PREFIX);
    key.extend_from_slice(&inode.to_be_bytes());
    key
}

/// Inode id from an inode key
pub fn inode_from_key(key: &[u8]) -> Result<InodeId> {
    if key.len() != 9 || key[0] != INODE_PREFIX {
        return Err(Error::corrupt("malformed inode key"));
    }
    Ok(u64::from_be_bytes(key[1..9].try_into().expect("sized slice")))
}

/// Key for a file layout record
pub fn layout_key(inode: InodeId) -> Vec<u8> {
    let mut key = Vec::with_capacity(9);
    key.push(LAYOUT_PREFIX);
    key.extend_from_slice(&inode.to_be_bytes());
    key
}

/// Bounds-checked cursor over a record payload
struct Reader<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    fn new(data: &'a [u8]) -> Self {
        Self { data, pos: 0 }
    }

    fn u32(&mut self) -> Result<u32> {
        let bytes = self.take(4)?;
        Ok(u32::from_be_bytes(bytes.try_into().expect("sized slice")))
    }

    fn u64(&mut self) -> Result<u64> {
        let bytes = self.take(8)?;
        Ok(u64::from_be_bytes(bytes.try_into().expect("sized slice")))
    }

    fn take(&mut self, len: usize) -> Result<&'a [u8]> {
        let end = self
            .pos
            .checked_add(len)
            .filter(|&end| end <= self.data.len())
            .ok_or_else(|| Error::corrupt("record truncated"))?;
        let slice = &self.data[self.pos..end];
        self.pos = end;
        Ok(slice)
    }

    fn string(&mut self) -> Result<String> {
        let len = self.u32()? as usize;
        let bytes = self.take(len)?;
        String::from_utf8(bytes.to_vec()).map_err(|_| Error::corrupt("string is not valid UTF-8"))
    }
}

/// Encode a dentry value: `inode_id (8) || file_type (4)`
///
/// The name lives in the key, not the value.
pub fn encode_dentry(dentry: &Dentry) -> Vec<u8> {
    let mut value = Vec::with_capacity(12);
    value.extend_from_slice(&dentry.inode_id.to_be_bytes());
    value.extend_from_slice(&(dentry.file_type as u32).to_be_bytes());
    value
}

/// Decode a dentry value, attaching the name recovered from its key
pub fn decode_dentry(name: String, value: &[u8]) -> Result<Dentry> {
    if value.len() < 12 {
        return Err(Error::corrupt(format!(
            "dentry value too small: {} bytes",
            value.len()
        )));
    }
    let mut reader = Reader::new(value);
    let inode_id = reader.u64()?;
    let file_type = FileType::from_raw(reader.u32()?)?;
    Ok(Dentry {
        name,
        inode_id,
        file_type,
    })
}

/// Encode an inode record:
/// `inode_id (8) || mode (4) || uid (4) || gid (4) || size (8) ||
///  mtime (8) || ctime (8) || nlink (8)`
pub fn encode_inode(attr: &InodeAttr) -> Vec<u8> {
    let mut value = Vec::with_capacity(INODE_VALUE_SIZE);
    value.extend_from_slice(&attr.inode_id.to_be_bytes());
    value.extend_from_slice(&attr.mode.0.to_be_bytes());
    value.extend_from_slice(&attr.uid.to_be_bytes());
    value.extend_from_slice(&attr.gid.to_be_bytes());
    value.extend_from_slice(&attr.size.to_be_bytes());
    value.extend_from_slice(&attr.mtime.to_be_bytes());
    value.extend_from_slice(&attr.ctime.to_be_bytes());
    value.extend_from_slice(&attr.nlink.to_be_bytes());
    value
}

/// Decode an inode record
pub fn decode_inode(value: &[u8]) -> Result<InodeAttr> {
    if value.len() < INODE_VALUE_SIZE {
        return Err(Error::corrupt(format!(
            "inode value too small: {} bytes",
            value.len()
        )));
    }
    let mut reader = Reader::new(value);
    Ok(InodeAttr {
        inode_id: reader.u64()?,
        mode: FileMode(reader.u32()?),
        uid: reader.u32()?,
        gid: reader.u32()?,
        size: reader.u64()?,
        mtime: reader.u64()?,
        ctime: reader.u64()?,
        nlink: reader.u64()?,
    })
}

/// Encode a layout record:
/// `inode_id (8) || chunk_size (8) || slice_count (4)` then per slice
/// `slice_id (8) || offset (8) || size (8) || key_len (4) || key`
pub fn encode_layout(layout: &FileLayout) -> Vec<u8> {
    let slices_size: usize = layout
        .slices
        .iter()
        .map(|s| SLICE_FIXED_SIZE + s.storage_key.len())
        .sum();
    let mut value = Vec::with_capacity(LAYOUT_VALUE_HEADER + slices_size);

    value.extend_from_slice(&layout.inode_id.to_be_bytes());
    value.extend_from_slice(&layout.chunk_size.to_be_bytes());
    value.extend_from_slice(&(layout.slices.len() as u32).to_be_bytes());

    for slice in &layout.slices {
        value.extend_from_slice(&slice.slice_id.to_be_bytes());
        value.extend_from_slice(&slice.offset.to_be_bytes());
        value.extend_from_slice(&slice.size.to_be_bytes());
        value.extend_from_slice(&(slice.storage_key.len() as u32).to_be_bytes());
        value.extend_from_slice(slice.storage_key.as_bytes());
    }

    value
}

/// Decode a layout record
pub fn decode_layout(value: &[u8]) -> Result<FileLayout> {
    if value.len() < LAYOUT_VALUE_HEADER {
        return Err(Error::corrupt(format!(
            "layout value too small: {} bytes",
            value.len()
        )));
    }
    let mut reader = Reader::new(value);

    let inode_id = reader.u64()?;
    let chunk_size = reader.u64()?;
    let slice_count = reader.u32()? as usize;

    let mut slices = Vec::with_capacity(slice_count.min(1024));
    for _ in 0..slice_count {
        let slice_id = reader.u64()?;
        let offset = reader.u64()?;
        let size = reader.u64()?;
        let storage_key = reader.string()?;
        slices.push(SliceInfo {
            slice_id,
            offset,
            size,
            storage_key,
        });
    }

    Ok(FileLayout {
        inode_id,
        chunk_size,
        slices,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use strata_common::DEFAULT_CHUNK_SIZE;

    #[test]
    fn test_key_prefixes_disjoint() {
        let d = dentry_key(1, "a");
        let i = inode_key(1);
        let l = layout_key(1);
        assert_eq!(d[0], b'D');
        assert_eq!(i[0], b'I');
        assert_eq!(l[0], b'L');
    }

    #[test]
    fn test_dentry_keys_sort_by_parent_then_name() {
        let a = dentry_key(1, "b");
        let b = dentry_key(1, "c");
        let c = dentry_key(2, "a");
        assert!(a < b);
        assert!(b < c);
    }

    #[test]
    fn test_dentry_name_recovery() {
        let key = dentry_key(42, "hello.txt");
        assert_eq!(dentry_name_from_key(&key).unwrap(), "hello.txt");
        assert!(dentry_name_from_key(b"Dxx").is_err());
    }

    #[test]
    fn test_inode_key_roundtrip() {
        let key = inode_key(0xDEAD_BEEF);
        assert_eq!(inode_from_key(&key).unwrap(), 0xDEAD_BEEF);
    }

    #[test]
    fn test_dentry_value_roundtrip() {
        let dentry = Dentry {
            name: "f".to_string(),
            inode_id: 77,
            file_type: FileType::Symlink,
        };
        let value = encode_dentry(&dentry);
        assert_eq!(value.len(), 12);
        let decoded = decode_dentry("f".to_string(), &value).unwrap();
        assert_eq!(decoded, dentry);
    }

    #[test]
    fn test_dentry_value_rejects_short() {
        assert!(decode_dentry("f".to_string(), &[0u8; 11]).is_err());
    }

    #[test]
    fn test_inode_value_roundtrip() {
        let attr = InodeAttr {
            inode_id: 5,
            mode: FileMode::regular(0o644),
            uid: 1000,
            gid: 100,
            size: 4096,
            mtime: 1_700_000_000,
            ctime: 1_699_999_999,
            nlink: 2,
        };
        let value = encode_inode(&attr);
        assert_eq!(value.len(), 52);
        assert_eq!(decode_inode(&value).unwrap(), attr);
    }

    #[test]
    fn test_inode_value_rejects_short() {
        assert!(decode_inode(&[0u8; 51]).is_err());
    }

    #[test]
    fn test_layout_roundtrip() {
        let layout = FileLayout {
            inode_id: 9,
            chunk_size: DEFAULT_CHUNK_SIZE,
            slices: vec![
                SliceInfo {
                    slice_id: 1,
                    offset: 0,
                    size: 100,
                    storage_key: "chunks/9/1".to_string(),
                },
                SliceInfo {
                    slice_id: 2,
                    offset: 100,
                    size: 50,
                    storage_key: "chunks/9/2".to_string(),
                },
            ],
        };
        let value = encode_layout(&layout);
        assert_eq!(decode_layout(&value).unwrap(), layout);
    }

    #[test]
    fn test_layout_empty_roundtrip() {
        let layout = FileLayout::empty(3);
        let decoded = decode_layout(&encode_layout(&layout)).unwrap();
        assert_eq!(decoded, layout);
    }

    #[test]
    fn test_layout_rejects_truncated_slice() {
        let layout = FileLayout {
            inode_id: 9,
            chunk_size: DEFAULT_CHUNK_SIZE,
            slices: vec![SliceInfo {
                slice_id: 1,
                offset: 0,
                size: 100,
                storage_key: "chunks/9/1".to_string(),
            }],
        };
        let value = encode_layout(&layout);
        // Cut into the slice's storage key.
        assert!(decode_layout(&value[..value.len() - 4]).is_err());
        assert!(decode_layout(&value[..LAYOUT_VALUE_HEADER - 1]).is_err());
    }

    #[test]
    fn test_layout_rejects_overlong_inner_key() {
        let layout = FileLayout {
            inode_id: 9,
            chunk_size: DEFAULT_CHUNK_SIZE,
            slices: vec![SliceInfo {
                slice_id: 1,
                offset: 0,
                size: 100,
                storage_key: "k".to_string(),
            }],
        };
        let mut value = encode_layout(&layout);
        // Declare a key length far beyond the payload.
        let key_len_at = LAYOUT_VALUE_HEADER + 24;
        value[key_len_at..key_len_at + 4].copy_from_slice(&u32::MAX.to_be_bytes());
        assert!(decode_layout(&value).is_err());
    }
}
