//! Configuration types for Strata
//!
//! Top-level configuration consumed by binaries. Component-specific tuning
//! (WAL, snapshots, caches) lives next to the component it configures.

use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::PathBuf;

/// Root configuration
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Config {
    /// Engine state and data layout
    pub engine: EngineConfig,
    /// S3 gateway settings
    pub gateway: GatewayConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            engine: EngineConfig::default(),
            gateway: GatewayConfig::default(),
        }
    }
}

/// Engine data layout and namespace defaults
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Base directory for metadata state (KV store, snapshots)
    pub data_dir: PathBuf,
    /// Root directory of the local chunk store
    pub chunk_dir: PathBuf,
    /// Bucket assumed for bare POSIX paths
    pub default_bucket: String,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("/var/lib/strata/meta"),
            chunk_dir: PathBuf::from("/var/lib/strata/chunks"),
            default_bucket: "default".to_string(),
        }
    }
}

/// S3 gateway settings
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct GatewayConfig {
    /// Address for the S3 API listener
    pub listen: SocketAddr,
    /// Region name returned in responses
    pub region: String,
    /// Owner reported by ListBuckets
    pub owner: String,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            listen: "0.0.0.0:9000".parse().expect("static addr"),
            region: "us-east-1".to_string(),
            owner: "strata".to_string(),
        }
    }
}
