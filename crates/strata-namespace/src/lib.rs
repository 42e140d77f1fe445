//! Strata Namespace - Unified object/POSIX namespace
//!
//! Translates between `s3://bucket/key` and inode paths and drives the
//! read/write pipeline that splices metadata transactions with
//! chunk-store I/O.

pub mod path;
pub mod service;

pub use path::{ParsedPath, PathConverter};
pub use service::NamespaceService;
