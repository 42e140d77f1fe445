//! Error types for Strata
//!
//! This module defines the common error type used throughout the engine.
//! Error kinds are stable: they appear in external mappings (FUSE errno,
//! S3 error codes), so new failure modes should reuse an existing kind
//! rather than invent one.

use thiserror::Error;

/// Common result type for Strata operations
pub type Result<T> = std::result::Result<T, Error>;

/// Common error type for Strata
///
/// Variants carry formatted messages rather than source errors so the enum
/// stays `Clone` — the single-flight map fans one failure out to every
/// waiter.
#[derive(Debug, Clone, Error)]
pub enum Error {
    #[error("not found: {0}")]
    NotFound(String),

    #[error("already exists: {0}")]
    Exists(String),

    #[error("permission denied: {0}")]
    PermissionDenied(String),

    #[error("is a directory: {0}")]
    IsDirectory(String),

    #[error("not a directory: {0}")]
    NotDirectory(String),

    #[error("not empty: {0}")]
    NotEmpty(String),

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("I/O error: {0}")]
    Io(String),

    #[error("no space left: {0}")]
    NoSpace(String),

    #[error("corrupt record: {0}")]
    Corrupt(String),

    #[error("rename incomplete: {0}")]
    RenameIncomplete(String),

    #[error("operation cancelled")]
    Cancelled,
}

impl Error {
    /// Create a not-found error
    pub fn not_found(msg: impl Into<String>) -> Self {
        Self::NotFound(msg.into())
    }

    /// Create an already-exists error
    pub fn exists(msg: impl Into<String>) -> Self {
        Self::Exists(msg.into())
    }

    /// Create an invalid-argument error
    pub fn invalid_argument(msg: impl Into<String>) -> Self {
        Self::InvalidArgument(msg.into())
    }

    /// Create an I/O error
    pub fn io(msg: impl Into<String>) -> Self {
        Self::Io(msg.into())
    }

    /// Create a corrupt-record error
    pub fn corrupt(msg: impl Into<String>) -> Self {
        Self::Corrupt(msg.into())
    }

    /// Check if this is a not-found error
    #[must_use]
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound(_))
    }

    /// Check if the caller may retry the operation as-is
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::RenameIncomplete(_))
    }

    /// Canonical POSIX errno for this kind (FUSE adapter mapping)
    #[must_use]
    pub fn errno(&self) -> i32 {
        match self {
            Self::NotFound(_) => 2,          // ENOENT
            Self::Io(_) | Self::Corrupt(_) => 5, // EIO
            Self::RenameIncomplete(_) => 11, // EAGAIN
            Self::PermissionDenied(_) => 13, // EACCES
            Self::Exists(_) => 17,           // EEXIST
            Self::NotDirectory(_) => 20,     // ENOTDIR
            Self::IsDirectory(_) => 21,      // EISDIR
            Self::InvalidArgument(_) => 22,  // EINVAL
            Self::NoSpace(_) => 28,          // ENOSPC
            Self::NotEmpty(_) => 39,         // ENOTEMPTY
            Self::Cancelled => 125,          // ECANCELED
        }
    }

    /// S3 error code for API compatibility
    ///
    /// `NotFound` defaults to `NoSuchKey`; bucket-level handlers substitute
    /// `NoSuchBucket` from context.
    #[must_use]
    pub fn s3_error_code(&self) -> &'static str {
        match self {
            Self::NotFound(_) => "NoSuchKey",
            Self::Exists(_) => "BucketAlreadyExists",
            Self::NotEmpty(_) => "BucketNotEmpty",
            Self::PermissionDenied(_) => "AccessDenied",
            Self::InvalidArgument(_) | Self::IsDirectory(_) | Self::NotDirectory(_) => {
                "InvalidArgument"
            }
            _ => "InternalError",
        }
    }

    /// HTTP status code for S3 API compatibility
    #[must_use]
    pub fn http_status_code(&self) -> u16 {
        match self {
            Self::NotFound(_) => 404,
            Self::Exists(_) | Self::NotEmpty(_) => 409,
            Self::PermissionDenied(_) => 403,
            Self::InvalidArgument(_) | Self::IsDirectory(_) | Self::NotDirectory(_) => 400,
            _ => 500,
        }
    }
}
