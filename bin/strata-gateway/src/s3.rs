//! S3 API handlers

use axum::{
    body::Body,
    extract::{Path, Query, State},
    http::{header, HeaderMap, StatusCode},
    response::Response,
};
use bytes::Bytes;
use md5::{Digest, Md5};
use quick_xml::se::to_string as to_xml;
use serde::Serialize;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use strata_common::{now_secs, Error};
use strata_s3::{BucketMeta, ObjectMeta, S3MetaStore};
use strata_store::ChunkStore;
use tracing::{debug, error, warn};
use uuid::Uuid;

const S3_XMLNS: &str = "http://s3.amazonaws.com/doc/2006-03-01/";
const DEFAULT_MAX_KEYS: usize = 1000;
const DEFAULT_CONTENT_TYPE: &str = "application/octet-stream";

/// Application state shared across handlers
pub struct AppState {
    pub meta: S3MetaStore,
    pub chunks: Arc<dyn ChunkStore>,
    pub region: String,
    pub owner: String,
}

// XML response types for the S3 API

#[derive(Serialize)]
#[serde(rename = "ListAllMyBucketsResult")]
struct ListBucketsResult {
    #[serde(rename = "@xmlns")]
    xmlns: &'static str,
    #[serde(rename = "Owner")]
    owner: Owner,
    #[serde(rename = "Buckets")]
    buckets: Buckets,
}

#[derive(Serialize)]
struct Owner {
    #[serde(rename = "ID")]
    id: String,
    #[serde(rename = "DisplayName")]
    display_name: String,
}

#[derive(Serialize)]
struct Buckets {
    #[serde(rename = "Bucket")]
    bucket: Vec<Bucket>,
}

#[derive(Serialize)]
struct Bucket {
    #[serde(rename = "Name")]
    name: String,
    #[serde(rename = "CreationDate")]
    creation_date: String,
}

#[derive(Serialize)]
#[serde(rename = "ListBucketResult")]
struct ListBucketResult {
    #[serde(rename = "@xmlns")]
    xmlns: &'static str,
    #[serde(rename = "Name")]
    name: String,
    #[serde(rename = "Prefix")]
    prefix: String,
    #[serde(rename = "Delimiter")]
    #[serde(skip_serializing_if = "Option::is_none")]
    delimiter: Option<String>,
    #[serde(rename = "MaxKeys")]
    max_keys: usize,
    #[serde(rename = "KeyCount")]
    #[serde(skip_serializing_if = "Option::is_none")]
    key_count: Option<usize>,
    #[serde(rename = "IsTruncated")]
    is_truncated: bool,
    #[serde(rename = "NextMarker")]
    #[serde(skip_serializing_if = "Option::is_none")]
    next_marker: Option<String>,
    #[serde(rename = "NextContinuationToken")]
    #[serde(skip_serializing_if = "Option::is_none")]
    next_continuation_token: Option<String>,
    #[serde(rename = "CommonPrefixes")]
    #[serde(skip_serializing_if = "Vec::is_empty")]
    common_prefixes: Vec<CommonPrefix>,
    #[serde(rename = "Contents")]
    #[serde(skip_serializing_if = "Vec::is_empty")]
    contents: Vec<ObjectContent>,
}

#[derive(Serialize)]
struct CommonPrefix {
    #[serde(rename = "Prefix")]
    prefix: String,
}

#[derive(Serialize)]
struct ObjectContent {
    #[serde(rename = "Key")]
    key: String,
    #[serde(rename = "LastModified")]
    last_modified: String,
    #[serde(rename = "ETag")]
    etag: String,
    #[serde(rename = "Size")]
    size: u64,
    #[serde(rename = "StorageClass")]
    storage_class: String,
}

#[derive(Serialize)]
#[serde(rename = "Error")]
struct ErrorXml {
    #[serde(rename = "Code")]
    code: String,
    #[serde(rename = "Message")]
    message: String,
    #[serde(rename = "RequestId")]
    request_id: String,
}

fn xml_response(status: StatusCode, xml: String) -> Response {
    let body = format!("<?xml version=\"1.0\" encoding=\"UTF-8\"?>\n{xml}");
    Response::builder()
        .status(status)
        .header(header::CONTENT_TYPE, "application/xml")
        .body(Body::from(body))
        .unwrap_or_default()
}

fn error_xml(status: StatusCode, code: &str, message: &str) -> Response {
    let payload = ErrorXml {
        code: code.to_string(),
        message: message.to_string(),
        request_id: Uuid::new_v4().to_string(),
    };
    xml_response(status, to_xml(&payload).unwrap_or_default())
}

/// Map an engine error onto the S3 wire, with `NotFound` resolved to the
/// bucket or key code by context
fn engine_error(err: &Error, bucket_context: bool) -> Response {
    let code = match err {
        Error::NotFound(_) if bucket_context => "NoSuchBucket",
        _ => err.s3_error_code(),
    };
    let status =
        StatusCode::from_u16(err.http_status_code()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
    error_xml(status, code, &err.to_string())
}

fn timestamp_to_iso(ts: u64) -> String {
    use chrono::{DateTime, Utc};
    DateTime::<Utc>::from_timestamp(ts as i64, 0)
        .map(|dt| dt.format("%Y-%m-%dT%H:%M:%S%.3fZ").to_string())
        .unwrap_or_else(|| "1970-01-01T00:00:00.000Z".to_string())
}

fn timestamp_to_http_date(ts: u64) -> String {
    use chrono::{DateTime, Utc};
    DateTime::<Utc>::from_timestamp(ts as i64, 0)
        .map(|dt| dt.format("%a, %d %b %Y %H:%M:%S GMT").to_string())
        .unwrap_or_else(|| "Thu, 01 Jan 1970 00:00:00 GMT".to_string())
}

/// Capture `x-amz-meta-*` request headers
fn extract_user_metadata(headers: &HeaderMap) -> BTreeMap<String, String> {
    let mut metadata = BTreeMap::new();
    for (name, value) in headers.iter() {
        let name = name.as_str().to_lowercase();
        if let Some(key) = name.strip_prefix("x-amz-meta-") {
            if let Ok(value) = value.to_str() {
                metadata.insert(key.to_string(), value.to_string());
            }
        }
    }
    metadata
}

/// Restore `x-amz-meta-*` response headers
fn add_metadata_headers(
    mut builder: axum::http::response::Builder,
    user_metadata: &BTreeMap<String, String>,
) -> axum::http::response::Builder {
    for (key, value) in user_metadata {
        builder = builder.header(format!("x-amz-meta-{key}"), value);
    }
    builder
}

/// List all buckets (GET /)
pub async fn list_buckets(State(state): State<Arc<AppState>>) -> Response {
    let buckets = match state.meta.list_buckets() {
        Ok(buckets) => buckets,
        Err(e) => {
            error!("list buckets failed: {e}");
            return engine_error(&e, false);
        }
    };

    let result = ListBucketsResult {
        xmlns: S3_XMLNS,
        owner: Owner {
            id: state.owner.clone(),
            display_name: state.owner.clone(),
        },
        buckets: Buckets {
            bucket: buckets
                .into_iter()
                .map(|b| Bucket {
                    name: b.name,
                    creation_date: timestamp_to_iso(b.creation_time),
                })
                .collect(),
        },
    };

    xml_response(StatusCode::OK, to_xml(&result).unwrap_or_default())
}

/// Create a bucket (PUT /{bucket})
pub async fn create_bucket(
    State(state): State<Arc<AppState>>,
    Path(bucket): Path<String>,
) -> Response {
    if state.meta.bucket_exists(&bucket) {
        return error_xml(
            StatusCode::CONFLICT,
            "BucketAlreadyExists",
            &format!("bucket {bucket} already exists"),
        );
    }

    let meta = BucketMeta {
        name: bucket.clone(),
        owner: state.owner.clone(),
        creation_time: now_secs(),
        object_count: 0,
        total_size: 0,
        region: state.region.clone(),
        storage_class: "STANDARD".to_string(),
    };

    if let Err(e) = state.meta.put_bucket(&meta) {
        error!(%bucket, "create bucket failed: {e}");
        return engine_error(&e, true);
    }

    debug!(%bucket, "created bucket");
    Response::builder()
        .status(StatusCode::OK)
        .header(header::LOCATION, format!("/{bucket}"))
        .body(Body::empty())
        .unwrap_or_default()
}

/// Delete a bucket (DELETE /{bucket})
pub async fn delete_bucket(
    State(state): State<Arc<AppState>>,
    Path(bucket): Path<String>,
) -> Response {
    match state.meta.delete_bucket(&bucket) {
        Ok(()) => Response::builder()
            .status(StatusCode::NO_CONTENT)
            .body(Body::empty())
            .unwrap_or_default(),
        Err(e) => engine_error(&e, true),
    }
}

/// Probe a bucket (HEAD /{bucket})
pub async fn head_bucket(
    State(state): State<Arc<AppState>>,
    Path(bucket): Path<String>,
) -> Response {
    let status = if state.meta.bucket_exists(&bucket) {
        StatusCode::OK
    } else {
        StatusCode::NOT_FOUND
    };
    Response::builder()
        .status(status)
        .body(Body::empty())
        .unwrap_or_default()
}

/// List objects, v1 and v2 (GET /{bucket})
pub async fn list_objects(
    State(state): State<Arc<AppState>>,
    Path(bucket): Path<String>,
    Query(params): Query<HashMap<String, String>>,
) -> Response {
    if !state.meta.bucket_exists(&bucket) {
        return error_xml(
            StatusCode::NOT_FOUND,
            "NoSuchBucket",
            &format!("bucket {bucket} does not exist"),
        );
    }

    let v2 = params.get("list-type").map(String::as_str) == Some("2");
    let prefix = params.get("prefix").cloned().unwrap_or_default();
    let delimiter = params.get("delimiter").cloned().filter(|d| !d.is_empty());
    let marker = if v2 {
        params.get("continuation-token").cloned().unwrap_or_default()
    } else {
        params.get("marker").cloned().unwrap_or_default()
    };
    let max_keys = params
        .get("max-keys")
        .and_then(|v| v.parse::<usize>().ok())
        .unwrap_or(DEFAULT_MAX_KEYS);

    let (objects, is_truncated) = match state.meta.list_objects(&bucket, &prefix, &marker, max_keys)
    {
        Ok(listing) => listing,
        Err(e) => {
            error!(%bucket, "list objects failed: {e}");
            return engine_error(&e, false);
        }
    };

    let last_key = objects.last().map(|o| o.key.clone());

    // Group keys behind the delimiter into common prefixes.
    let mut contents = Vec::new();
    let mut common_prefixes: Vec<CommonPrefix> = Vec::new();
    let mut seen_prefixes = std::collections::HashSet::new();
    for object in objects {
        if let Some(delim) = &delimiter {
            let remainder = &object.key[prefix.len()..];
            if let Some(pos) = remainder.find(delim.as_str()) {
                let group = format!("{prefix}{}{delim}", &remainder[..pos]);
                if seen_prefixes.insert(group.clone()) {
                    common_prefixes.push(CommonPrefix { prefix: group });
                }
                continue;
            }
        }
        contents.push(ObjectContent {
            key: object.key,
            last_modified: timestamp_to_iso(object.last_modified),
            etag: format!("\"{}\"", object.etag),
            size: object.size,
            storage_class: object.storage_class,
        });
    }

    let key_count = contents.len() + common_prefixes.len();
    let result = ListBucketResult {
        xmlns: S3_XMLNS,
        name: bucket,
        prefix,
        delimiter,
        max_keys,
        key_count: v2.then_some(key_count),
        is_truncated,
        next_marker: (!v2 && is_truncated).then(|| last_key.clone().unwrap_or_default()),
        next_continuation_token: (v2 && is_truncated).then(|| last_key.unwrap_or_default()),
        common_prefixes,
        contents,
    };

    xml_response(StatusCode::OK, to_xml(&result).unwrap_or_default())
}

/// Store an object (PUT /{bucket}/{key})
pub async fn put_object(
    State(state): State<Arc<AppState>>,
    Path((bucket, key)): Path<(String, String)>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    if !state.meta.bucket_exists(&bucket) {
        return error_xml(
            StatusCode::NOT_FOUND,
            "NoSuchBucket",
            &format!("bucket {bucket} does not exist"),
        );
    }

    let etag = hex::encode(Md5::digest(&body));
    let content_type = headers
        .get(header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .unwrap_or(DEFAULT_CONTENT_TYPE)
        .to_string();
    let data_path = format!("objects/{bucket}/{key}");

    if let Err(e) = state.chunks.put(&data_path, &body) {
        error!(%bucket, %key, "object body write failed: {e}");
        return engine_error(&e, false);
    }

    let previous_size = state.meta.get_object(&bucket, &key).ok().map(|o| o.size);

    let meta = ObjectMeta {
        bucket: bucket.clone(),
        key: key.clone(),
        size: body.len() as u64,
        etag: etag.clone(),
        content_type,
        last_modified: now_secs(),
        storage_class: "STANDARD".to_string(),
        data_path,
        user_metadata: extract_user_metadata(&headers),
    };

    if let Err(e) = state.meta.put_object(&meta) {
        error!(%bucket, %key, "object metadata write failed: {e}");
        return engine_error(&e, false);
    }

    let (size_delta, count_delta) = match previous_size {
        Some(old) => (meta.size as i64 - old as i64, 0),
        None => (meta.size as i64, 1),
    };
    if let Err(e) = state.meta.update_bucket_stats(&bucket, size_delta, count_delta) {
        warn!(%bucket, "bucket stats update failed: {e}");
    }

    debug!(%bucket, %key, bytes = meta.size, "stored object");
    Response::builder()
        .status(StatusCode::OK)
        .header(header::ETAG, format!("\"{etag}\""))
        .body(Body::empty())
        .unwrap_or_default()
}

fn object_response(meta: &ObjectMeta, body: Option<Vec<u8>>) -> Response {
    let mut builder = Response::builder()
        .status(StatusCode::OK)
        .header(header::CONTENT_TYPE, &meta.content_type)
        .header(header::CONTENT_LENGTH, meta.size)
        .header(header::ETAG, format!("\"{}\"", meta.etag))
        .header(
            header::LAST_MODIFIED,
            timestamp_to_http_date(meta.last_modified),
        );
    builder = add_metadata_headers(builder, &meta.user_metadata);

    builder
        .body(match body {
            Some(data) => Body::from(data),
            None => Body::empty(),
        })
        .unwrap_or_default()
}

/// Fetch an object (GET /{bucket}/{key})
pub async fn get_object(
    State(state): State<Arc<AppState>>,
    Path((bucket, key)): Path<(String, String)>,
) -> Response {
    let meta = match state.meta.get_object(&bucket, &key) {
        Ok(meta) => meta,
        Err(e) => return engine_error(&e, false),
    };

    let body = match state.chunks.get(&meta.data_path) {
        Ok(body) => body,
        Err(e) => {
            error!(%bucket, %key, "object body read failed: {e}");
            return error_xml(
                StatusCode::INTERNAL_SERVER_ERROR,
                "InternalError",
                &e.to_string(),
            );
        }
    };

    object_response(&meta, Some(body))
}

/// Probe an object (HEAD /{bucket}/{key})
pub async fn head_object(
    State(state): State<Arc<AppState>>,
    Path((bucket, key)): Path<(String, String)>,
) -> Response {
    match state.meta.get_object(&bucket, &key) {
        Ok(meta) => object_response(&meta, None),
        Err(_) => Response::builder()
            .status(StatusCode::NOT_FOUND)
            .body(Body::empty())
            .unwrap_or_default(),
    }
}

/// Delete an object (DELETE /{bucket}/{key})
///
/// Idempotent: deleting an absent key still returns 204.
pub async fn delete_object(
    State(state): State<Arc<AppState>>,
    Path((bucket, key)): Path<(String, String)>,
) -> Response {
    if let Ok(meta) = state.meta.get_object(&bucket, &key) {
        if let Err(e) = state.meta.delete_object(&bucket, &key) {
            error!(%bucket, %key, "object metadata delete failed: {e}");
            return engine_error(&e, false);
        }

        if let Err(e) = state.chunks.delete(&meta.data_path) {
            if !e.is_not_found() {
                warn!(%bucket, %key, "object body delete failed: {e}");
            }
        }

        if let Err(e) = state
            .meta
            .update_bucket_stats(&bucket, -(meta.size as i64), -1)
        {
            warn!(%bucket, "bucket stats update failed: {e}");
        }
    }

    Response::builder()
        .status(StatusCode::NO_CONTENT)
        .body(Body::empty())
        .unwrap_or_default()
}
