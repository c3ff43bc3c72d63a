//! Scaled dot-product attention over cached keys and values

use candle_core::Tensor;
use candle_nn::ops::softmax;

use crate::cache::Cache;
use crate::error::CacheError;

/// Run one attention step for the active layer
///
/// Writes the batch keys/values into the cache, then attends the query
/// against every cell the mask admits. `q` is `[num_heads, B, head_dim]`,
/// `k` and `v` are `[head_dim, num_kv_heads, B]` with
/// `num_kv_heads == num_heads`. Returns `[num_heads, B, head_dim]`.
pub fn attention_with_cache<C: Cache>(
    cache: &mut C,
    q: &Tensor,
    k: &Tensor,
    v: &Tensor,
    scale: f64,
) -> Result<Tensor, CacheError> {
    cache.put(k, v)?;
    let (ck, cv, mask) = cache.get()?;

    // [heads, B, head_dim] @ [heads, head_dim, cells] -> [heads, B, cells]
    let keys = ck.permute((1, 0, 2))?.contiguous()?;
    let scores = (q.contiguous()?.matmul(&keys)? * scale)?;
    let mask = mask.to_dtype(scores.dtype())?;
    let scores = scores.broadcast_add(&mask)?;
    let probs = softmax(&scores, candle_core::D::Minus1)?;

    // [heads, B, cells] @ [heads, cells, head_dim] -> [heads, B, head_dim]
    let values = cv.permute((1, 2, 0))?.contiguous()?;
    Ok(probs.matmul(&values)?)
}
