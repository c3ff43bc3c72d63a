//! Multi-sequence attention KV cache engine for Candle runtimes
//!
//! This crate serves many concurrent generation sequences over one shared
//! pool of storage cells: per-batch cell allocation, attention masks
//! encoding causality and sliding-window/chunked policies, prefix sharing,
//! rollback with key re-rotation, and a hybrid composition with
//! copy-on-write recurrent conv state for attention + short-conv models.

pub mod attention;
pub mod backend;
pub mod batch;
pub mod cache;
pub mod config;
pub mod error;

// Test modules
#[cfg(test)]
mod config_tests;

pub use backend::{Backend, ShiftFn};
pub use batch::Batch;
pub use cache::{Cache, CausalCache, HybridCache};
pub use config::CacheConfig;
pub use error::CacheError;

/// Library version
pub fn version() -> String {
    env!("CARGO_PKG_VERSION").to_string()
}
