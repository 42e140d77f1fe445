//! Strata Common - Shared types and utilities
//!
//! This crate provides the error model, core metadata types, configuration,
//! and concurrency primitives used across all Strata components.

pub mod cancel;
pub mod config;
pub mod error;
pub mod singleflight;
pub mod types;

pub use cancel::CancelToken;
pub use config::{Config, EngineConfig, GatewayConfig};
pub use error::{Error, Result};
pub use singleflight::SingleFlight;
pub use types::*;
