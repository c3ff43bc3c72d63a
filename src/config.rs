//! Cache configuration

use candle_core::DType;
use serde::{Deserialize, Serialize};

/// Storage layout options for a cache instance
///
/// Taken once before `init` (explicitly via `set_config`, or from the
/// backend's defaults), then locked for the lifetime of the cache.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CacheConfig {
    /// The mask window and cell storage are rounded up to a multiple of this
    pub cache_padding: usize,

    /// Store value tensors permuted so attention reads them without a
    /// contiguous copy
    pub permuted_v: bool,

    /// Dtype the mask tensor is published in
    #[serde(skip, default = "default_mask_dtype")]
    pub mask_dtype: DType,
}

fn default_mask_dtype() -> DType {
    DType::F32
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            cache_padding: 1,
            permuted_v: false,
            mask_dtype: DType::F32,
        }
    }
}

impl CacheConfig {
    /// Validate configuration values
    pub fn validate(&self) -> Result<(), String> {
        if self.cache_padding == 0 {
            return Err("cache_padding must be at least 1".to_string());
        }
        Ok(())
    }
}
