//! Compute backend handle
//!
//! The engine issues every tensor operation through Candle. This module
//! holds the device handle and the layout preferences a cache instance is
//! created against, plus the injected key re-rotation capability.

use candle_core::{DType, Device, Shape, Tensor};

use crate::config::CacheConfig;
use crate::error::CacheError;

/// Re-rotation hook invoked when cell positions shift
///
/// Receives the layer index, a key tensor of shape
/// `[head_dim, num_kv_heads, n]` gathered from the shifted cells, and an
/// i64 offset tensor of shape `[n]` (one position delta per column).
/// Returns the re-rotated keys with the same shape; the engine writes them
/// back over the original columns.
pub type ShiftFn = Box<dyn Fn(usize, &Tensor, &Tensor) -> Result<Tensor, CacheError>>;

/// Handle to the compute backend a cache instance runs on
#[derive(Debug, Clone)]
pub struct Backend {
    device: Device,
    cache_config: CacheConfig,
}

impl Backend {
    pub fn new(device: Device) -> Self {
        Self {
            device,
            cache_config: CacheConfig::default(),
        }
    }

    pub fn with_cache_config(device: Device, cache_config: CacheConfig) -> Self {
        Self {
            device,
            cache_config,
        }
    }

    pub fn device(&self) -> &Device {
        &self.device
    }

    pub fn cache_config(&self) -> &CacheConfig {
        &self.cache_config
    }

    /// Upload index data as a `[n]` u32 tensor
    pub fn ints_u32(&self, data: &[u32]) -> Result<Tensor, CacheError> {
        Ok(Tensor::from_vec(data.to_vec(), (data.len(),), &self.device)?)
    }

    /// Upload signed offsets as a `[n]` i64 tensor
    pub fn ints_i64(&self, data: &[i64]) -> Result<Tensor, CacheError> {
        Ok(Tensor::from_vec(data.to_vec(), (data.len(),), &self.device)?)
    }

    /// Upload host floats with the given shape
    pub fn floats<S: Into<Shape>>(&self, data: Vec<f32>, shape: S) -> Result<Tensor, CacheError> {
        Ok(Tensor::from_vec(data, shape, &self.device)?)
    }

    /// Allocate a zero-filled tensor
    pub fn zeros<S: Into<Shape>>(&self, dtype: DType, shape: S) -> Result<Tensor, CacheError> {
        Ok(Tensor::zeros(shape, dtype, &self.device)?)
    }
}
