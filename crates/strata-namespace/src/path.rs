//! Path translation between object and inode namespaces
//!
//! The converter recognizes `s3://bucket/key` paths and bare POSIX paths
//! and normalizes both into a parsed form carrying the bucket, the key,
//! and the inode-side path.

/// Normalized view of an input path
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ParsedPath {
    pub is_s3: bool,
    pub bucket: String,
    pub key: String,
    pub posix_path: String,
}

/// Bidirectional `s3://…` / `/…` converter with a default bucket
#[derive(Clone, Debug)]
pub struct PathConverter {
    default_bucket: String,
}

const S3_SCHEME: &str = "s3://";

impl PathConverter {
    pub fn new(default_bucket: impl Into<String>) -> Self {
        Self {
            default_bucket: default_bucket.into(),
        }
    }

    pub fn default_bucket(&self) -> &str {
        &self.default_bucket
    }

    /// `s3://bucket/data/f.txt` -> `/data/f.txt`
    ///
    /// Non-S3 input passes through unchanged.
    pub fn s3_to_posix(&self, s3_path: &str) -> String {
        let Some(rest) = s3_path.strip_prefix(S3_SCHEME) else {
            return s3_path.to_string();
        };
        match rest.find('/') {
            Some(pos) if pos + 1 < rest.len() => format!("/{}", &rest[pos + 1..]),
            _ => "/".to_string(),
        }
    }

    /// `/data/f.txt` -> `s3://{default_bucket}/data/f.txt`
    pub fn posix_to_s3(&self, posix_path: &str) -> String {
        format!("{S3_SCHEME}{}{posix_path}", self.default_bucket)
    }

    /// Parse either path shape into its normalized form
    pub fn parse(&self, path: &str) -> ParsedPath {
        if let Some(rest) = path.strip_prefix(S3_SCHEME) {
            return match rest.find('/') {
                Some(pos) => {
                    let bucket = rest[..pos].to_string();
                    let key = rest[pos + 1..].to_string();
                    let posix_path = format!("/{key}");
                    ParsedPath {
                        is_s3: true,
                        bucket,
                        key,
                        posix_path,
                    }
                }
                None => ParsedPath {
                    is_s3: true,
                    bucket: rest.to_string(),
                    key: String::new(),
                    posix_path: "/".to_string(),
                },
            };
        }

        ParsedPath {
            is_s3: false,
            bucket: self.default_bucket.clone(),
            key: if path.len() > 1 {
                path[1..].to_string()
            } else {
                String::new()
            },
            posix_path: path.to_string(),
        }
    }
}
