//! Error types for the cache engine

use thiserror::Error;

/// Errors surfaced by cache operations
///
/// Every variant is caller-recoverable: a failed operation applies no
/// partial metadata update, so the caller may address the condition
/// (evict a sequence, shrink the batch) and retry.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum CacheError {
    #[error("cache full: {needed} needed, {free} free")]
    CacheFull { needed: usize, free: usize },

    #[error("not supported: {0}")]
    NotSupported(String),

    #[error("cannot shift a cell shared by multiple sequences")]
    UnsupportedShare,

    #[error("batch size mismatch: forward pass has {expected} tokens, got {got}")]
    BatchMismatch { expected: usize, got: usize },

    #[error("cache configuration is locked after init")]
    ConfigLocked,

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("backend error: {0}")]
    Backend(String),
}

impl From<candle_core::Error> for CacheError {
    fn from(err: candle_core::Error) -> Self {
        CacheError::Backend(err.to_string())
    }
}
