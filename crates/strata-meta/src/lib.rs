//! Strata Meta - The metadata engine
//!
//! This crate implements the metadata half of the data plane:
//! - Bit-exact key schema and record codecs
//! - The slice tree reconciling overlapping writes
//! - Segmented hot caches over the KV store
//! - Partitions owning disjoint inode ranges
//! - The stateless metadata service on top

pub mod cache;
pub mod codec;
pub mod partition;
pub mod service;
pub mod slice_tree;

pub use cache::{CacheStats, HotCache};
pub use partition::{MetaPartition, PartitionConfig};
pub use service::{parse_path, MetadataService};
pub use slice_tree::{SliceNode, SliceTree};
