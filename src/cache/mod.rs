//! Cache engine core
//!
//! The pool-backed causal cache, its hybrid composition with recurrent
//! conv state, and the `Cache` contract model layers drive.

pub mod causal;
pub mod cell;
pub mod hybrid;


pub use causal::CausalCache;
pub use hybrid::HybridCache;

use candle_core::{DType, Tensor};

use crate::backend::Backend;
use crate::batch::Batch;
use crate::error::CacheError;

/// Operations a model layer drives against any cache implementation
///
/// The per-pass protocol is `start_forward`, then per layer `set_layer`,
/// `put` the batch keys/values, and `get` the views plus mask for the
/// attention op. Everything else manages sequence history between passes.
pub trait Cache {
    /// Size the cell pool and bind the compute backend
    fn init(
        &mut self,
        backend: Backend,
        dtype: DType,
        max_sequences: usize,
        capacity: usize,
        max_batch: usize,
    ) -> Result<(), CacheError>;

    /// Release all per-layer tensors
    fn close(&mut self);

    /// Select the layer subsequent `get`/`put` operate on
    fn set_layer(&mut self, layer: usize);

    /// Begin a forward pass; `reserve` publishes worst-case shapes without
    /// touching sequence metadata
    fn start_forward(&mut self, batch: &Batch, reserve: bool) -> Result<(), CacheError>;

    /// Key view, value view, and mask for the active layer
    fn get(&self) -> Result<(Tensor, Tensor, Tensor), CacheError>;

    /// Write the batch keys/values, each `[head_dim, num_kv_heads, B]`,
    /// into the cells claimed by `start_forward`
    fn put(&mut self, k: &Tensor, v: &Tensor) -> Result<(), CacheError>;

    /// Share the first `prefix_len` positions of `src_seq` with `dst_seq`
    fn copy_prefix(&mut self, src_seq: i32, dst_seq: i32, prefix_len: i32)
        -> Result<(), CacheError>;

    /// Whether generation can continue from `pos` using retained history
    fn can_resume(&self, seq: i32, pos: i32) -> bool;

    /// Remove positions `[begin, end)` of `seq`; a finite `end` shifts the
    /// surviving tail and re-rotates its keys
    fn remove(&mut self, seq: i32, begin: i32, end: i32) -> Result<(), CacheError>;
}
