//! S3 metadata sub-store
//!
//! Bucket and object records on the shared KV abstraction, under key
//! prefixes disjoint from the inode-side schema:
//!
//! - `B:{name}`          bucket record
//! - `BL:{name}`         bucket list marker
//! - `O:{bucket}/{key}`  object record
//! - `OL:{bucket}/{key}` object list marker
//!
//! Record and list-marker keys are written in one atomic batch, so a
//! listing never sees a half-created entry. All listings ascend
//! lexicographically; `marker` is exclusive.

use crate::types::{BucketMeta, ObjectMeta};
use std::sync::Arc;
use strata_common::{Error, Result};
use strata_kv::{KvStore, WriteBatch};
use tracing::{debug, warn};

const BUCKET_PREFIX: &str = "B:";
const BUCKET_LIST_PREFIX: &str = "BL:";
const OBJECT_PREFIX: &str = "O:";
const OBJECT_LIST_PREFIX: &str = "OL:";

fn bucket_key(name: &str) -> Vec<u8> {
    format!("{BUCKET_PREFIX}{name}").into_bytes()
}

fn bucket_list_key(name: &str) -> Vec<u8> {
    format!("{BUCKET_LIST_PREFIX}{name}").into_bytes()
}

fn object_key(bucket: &str, key: &str) -> Vec<u8> {
    format!("{OBJECT_PREFIX}{bucket}/{key}").into_bytes()
}

fn object_list_key(bucket: &str, key: &str) -> Vec<u8> {
    format!("{OBJECT_LIST_PREFIX}{bucket}/{key}").into_bytes()
}

/// Smallest byte string strictly greater than every key with `prefix`
fn prefix_end(prefix: &[u8]) -> Vec<u8> {
    let mut end = prefix.to_vec();
    while let Some(last) = end.last_mut() {
        if *last < 0xFF {
            *last += 1;
            return end;
        }
        end.pop();
    }
    // An all-0xFF prefix has no successor; scan to the end of the space.
    vec![0xFF; prefix.len() + 9]
}

/// Saturating signed adjustment of an unsigned counter
fn apply_delta(value: u64, delta: i64) -> u64 {
    if delta >= 0 {
        value.saturating_add(delta as u64)
    } else {
        value.saturating_sub(delta.unsigned_abs())
    }
}

/// Bucket/object metadata store over the ordered KV store
pub struct S3MetaStore {
    store: Arc<KvStore>,
}

impl S3MetaStore {
    pub fn new(store: Arc<KvStore>) -> Self {
        Self { store }
    }

    /// Insert or replace a bucket record and its list marker atomically
    pub fn put_bucket(&self, meta: &BucketMeta) -> Result<()> {
        let mut batch = WriteBatch::new();
        batch.put(bucket_key(&meta.name), meta.encode());
        batch.put(bucket_list_key(&meta.name), Vec::new());
        self.store.write_batch(batch)?;
        debug!(bucket = %meta.name, "put bucket");
        Ok(())
    }

    pub fn get_bucket(&self, name: &str) -> Result<BucketMeta> {
        let value = self
            .store
            .get(&bucket_key(name))
            .ok_or_else(|| Error::not_found(format!("bucket {name}")))?;
        BucketMeta::decode(&value)
    }

    pub fn bucket_exists(&self, name: &str) -> bool {
        self.store.exists(&bucket_key(name))
    }

    /// Delete a bucket; refuses while any object remains
    pub fn delete_bucket(&self, name: &str) -> Result<()> {
        if !self.bucket_exists(name) {
            return Err(Error::not_found(format!("bucket {name}")));
        }

        let object_prefix = format!("{OBJECT_LIST_PREFIX}{name}/");
        if !self.store.scan(object_prefix.as_bytes(), 1).is_empty() {
            return Err(Error::NotEmpty(format!("bucket {name}")));
        }

        let mut batch = WriteBatch::new();
        batch.delete(bucket_key(name));
        batch.delete(bucket_list_key(name));
        self.store.write_batch(batch)?;
        debug!(bucket = name, "deleted bucket");
        Ok(())
    }

    /// All buckets in name order
    pub fn list_buckets(&self) -> Result<Vec<BucketMeta>> {
        let mut buckets = Vec::new();
        for (key, _) in self.store.scan(BUCKET_LIST_PREFIX.as_bytes(), 0) {
            let name = String::from_utf8(key[BUCKET_LIST_PREFIX.len()..].to_vec())
                .map_err(|_| Error::corrupt("bucket name is not valid UTF-8"))?;
            match self.get_bucket(&name) {
                Ok(meta) => buckets.push(meta),
                Err(e) => warn!(bucket = %name, error = %e, "skipping bucket with bad record"),
            }
        }
        Ok(buckets)
    }

    /// Insert or replace an object record and its list marker atomically
    pub fn put_object(&self, meta: &ObjectMeta) -> Result<()> {
        let mut batch = WriteBatch::new();
        batch.put(object_key(&meta.bucket, &meta.key), meta.encode());
        batch.put(object_list_key(&meta.bucket, &meta.key), Vec::new());
        self.store.write_batch(batch)?;
        debug!(bucket = %meta.bucket, key = %meta.key, "put object");
        Ok(())
    }

    pub fn get_object(&self, bucket: &str, key: &str) -> Result<ObjectMeta> {
        let value = self
            .store
            .get(&object_key(bucket, key))
            .ok_or_else(|| Error::not_found(format!("object {bucket}/{key}")))?;
        ObjectMeta::decode(&value)
    }

    pub fn object_exists(&self, bucket: &str, key: &str) -> bool {
        self.store.exists(&object_key(bucket, key))
    }

    pub fn delete_object(&self, bucket: &str, key: &str) -> Result<()> {
        if !self.object_exists(bucket, key) {
            return Err(Error::not_found(format!("object {bucket}/{key}")));
        }

        let mut batch = WriteBatch::new();
        batch.delete(object_key(bucket, key));
        batch.delete(object_list_key(bucket, key));
        self.store.write_batch(batch)?;
        debug!(bucket, key, "deleted object");
        Ok(())
    }

    /// List objects of `bucket` in ascending key order
    ///
    /// Returns exactly the keys `k` with `k > marker` and
    /// `k.starts_with(prefix)`, truncated to `max_keys`, plus whether more
    /// matching keys exist beyond the returned batch.
    pub fn list_objects(
        &self,
        bucket: &str,
        prefix: &str,
        marker: &str,
        max_keys: usize,
    ) -> Result<(Vec<ObjectMeta>, bool)> {
        let scan_base = format!("{OBJECT_LIST_PREFIX}{bucket}/");

        let prefix_start = format!("{scan_base}{prefix}").into_bytes();
        let end = prefix_end(&prefix_start);

        // Marker is exclusive: start at its immediate successor when that
        // is past the prefix's own start.
        let start = if marker.is_empty() {
            prefix_start
        } else {
            let mut after_marker = format!("{scan_base}{marker}").into_bytes();
            after_marker.push(0);
            after_marker.max(prefix_start)
        };

        let fetch = if max_keys == usize::MAX {
            0
        } else {
            max_keys + 1
        };
        let hits = self.store.scan_range(&start, &end, fetch);

        let truncated = hits.len() > max_keys;
        let mut objects = Vec::with_capacity(hits.len().min(max_keys));
        for (list_key, _) in hits.into_iter().take(max_keys) {
            let object_name = String::from_utf8(list_key[scan_base.len()..].to_vec())
                .map_err(|_| Error::corrupt("object key is not valid UTF-8"))?;
            objects.push(self.get_object(bucket, &object_name)?);
        }

        Ok((objects, truncated))
    }

    /// Adjust a bucket's cumulative object count and byte size
    pub fn update_bucket_stats(
        &self,
        bucket: &str,
        size_delta: i64,
        count_delta: i64,
    ) -> Result<BucketMeta> {
        let mut meta = self.get_bucket(bucket)?;
        meta.total_size = apply_delta(meta.total_size, size_delta);
        meta.object_count = apply_delta(meta.object_count, count_delta);
        self.put_bucket(&meta)?;
        Ok(meta)
    }
}
