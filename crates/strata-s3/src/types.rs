//! S3 metadata records and their versioned wire codecs
//!
//! Every record starts with a 4-byte version (currently 1); decoders
//! reject anything newer. Strings are `u32 length || bytes`, numerics are
//! fixed-width big-endian. `user_metadata` is an ordered map so encoding
//! is deterministic.

use std::collections::BTreeMap;
use strata_common::{Error, Result};

/// Current record format version
const RECORD_VERSION: u32 = 1;

/// Bucket record
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct BucketMeta {
    pub name: String,
    pub owner: String,
    pub creation_time: u64,
    pub object_count: u64,
    pub total_size: u64,
    pub region: String,
    pub storage_class: String,
}

/// Object record
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ObjectMeta {
    pub bucket: String,
    pub key: String,
    pub size: u64,
    pub etag: String,
    pub content_type: String,
    pub last_modified: u64,
    pub storage_class: String,
    /// Chunk-store key holding the object body
    pub data_path: String,
    /// Captured `x-amz-meta-*` headers
    pub user_metadata: BTreeMap<String, String>,
}

fn put_u32(buf: &mut Vec<u8>, v: u32) {
    buf.extend_from_slice(&v.to_be_bytes());
}

fn put_u64(buf: &mut Vec<u8>, v: u64) {
    buf.extend_from_slice(&v.to_be_bytes());
}

fn put_string(buf: &mut Vec<u8>, s: &str) {
    put_u32(buf, s.len() as u32);
    buf.extend_from_slice(s.as_bytes());
}

struct Reader<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    fn new(data: &'a [u8]) -> Self {
        Self { data, pos: 0 }
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

    fn u32(&mut self) -> Result<u32> {
        Ok(u32::from_be_bytes(self.take(4)?.try_into().expect("sized slice")))
    }

    fn u64(&mut self) -> Result<u64> {
        Ok(u64::from_be_bytes(self.take(8)?.try_into().expect("sized slice")))
    }

    fn string(&mut self) -> Result<String> {
        let len = self.u32()? as usize;
        let bytes = self.take(len)?;
        String::from_utf8(bytes.to_vec()).map_err(|_| Error::corrupt("string is not valid UTF-8"))
    }

    fn version(&mut self) -> Result<u32> {
        let version = self.u32()?;
        if version > RECORD_VERSION {
            return Err(Error::corrupt(format!(
                "unsupported record version {version}"
            )));
        }
        Ok(version)
    }
}

impl BucketMeta {
    /// Serialize to the versioned wire format
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(64 + self.name.len() + self.owner.len());
        put_u32(&mut buf, RECORD_VERSION);
        put_string(&mut buf, &self.name);
        put_string(&mut buf, &self.owner);
        put_u64(&mut buf, self.creation_time);
        put_u64(&mut buf, self.object_count);
        put_u64(&mut buf, self.total_size);
        put_string(&mut buf, &self.region);
        put_string(&mut buf, &self.storage_class);
        buf
    }

    /// Deserialize, rejecting unknown versions and truncated payloads
    pub fn decode(data: &[u8]) -> Result<Self> {
        let mut reader = Reader::new(data);
        reader.version()?;
        Ok(Self {
            name: reader.string()?,
            owner: reader.string()?,
            creation_time: reader.u64()?,
            object_count: reader.u64()?,
            total_size: reader.u64()?,
            region: reader.string()?,
            storage_class: reader.string()?,
        })
    }
}

impl ObjectMeta {
    /// Serialize to the versioned wire format
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(96 + self.bucket.len() + self.key.len());
        put_u32(&mut buf, RECORD_VERSION);
        put_string(&mut buf, &self.bucket);
        put_string(&mut buf, &self.key);
        put_u64(&mut buf, self.size);
        put_string(&mut buf, &self.etag);
        put_string(&mut buf, &self.content_type);
        put_u64(&mut buf, self.last_modified);
        put_string(&mut buf, &self.storage_class);
        put_string(&mut buf, &self.data_path);
        put_u32(&mut buf, self.user_metadata.len() as u32);
        for (key, value) in &self.user_metadata {
            put_string(&mut buf, key);
            put_string(&mut buf, value);
        }
        buf
    }

    /// Deserialize, rejecting unknown versions and truncated payloads
    pub fn decode(data: &[u8]) -> Result<Self> {
        let mut reader = Reader::new(data);
        reader.version()?;

        let bucket = reader.string()?;
        let key = reader.string()?;
        let size = reader.u64()?;
        let etag = reader.string()?;
        let content_type = reader.string()?;
        let last_modified = reader.u64()?;
        let storage_class = reader.string()?;
        let data_path = reader.string()?;

        let count = reader.u32()?;
        let mut user_metadata = BTreeMap::new();
        for _ in 0..count {
            let meta_key = reader.string()?;
            let meta_value = reader.string()?;
            user_metadata.insert(meta_key, meta_value);
        }

        Ok(Self {
            bucket,
            key,
            size,
            etag,
            content_type,
            last_modified,
            storage_class,
            data_path,
            user_metadata,
        })
    }
}
