//! Causal KV cache over a shared pool of cells
//!
//! Many interleaved sequences share one fixed-size pool. Each forward pass
//! claims free cells for the batch tokens, prunes sliding-window history,
//! and publishes an attention mask encoding causality, per-sequence
//! membership, and the window/chunk policies.

use std::collections::{HashMap, HashSet};

use candle_core::{DType, Tensor};
use log::{debug, trace};

use crate::backend::{Backend, ShiftFn};
use crate::batch::Batch;
use crate::cache::cell::{Cell, CellRange};
use crate::cache::Cache;
use crate::config::CacheConfig;
use crate::error::CacheError;

/// Sentinel for an unbounded window or retention span
pub const NO_LIMIT: i32 = i32::MAX;

/// Per-layer key/value storage, allocated on the first `put` for the layer
struct LayerCache {
    k: Tensor,
    v: Tensor,
}

/// Causal KV cache
///
/// Construction picks one of four attention policies: plain causal
/// (`new`), sliding window (`sliding_window`), sliding window with
/// independent retention (`sliding_window_with_memory`), or chunked
/// (`chunked`). All four share the same runtime contract.
pub struct CausalCache {
    // attention policy, fixed at construction
    window_size: i32,
    memory_size: i32,
    chunk_size: i32,
    shift_fn: Option<ShiftFn>,

    // fixed at init
    backend: Option<Backend>,
    config: CacheConfig,
    config_set: bool,
    locked: bool,
    dtype: DType,
    max_batch: usize,
    pool_size: usize,

    // cell metadata
    cells: Vec<Cell>,
    cell_ranges: HashMap<i32, CellRange>,

    // per-layer tensors
    layers: HashMap<usize, LayerCache>,
    active_layer: usize,

    // state of the current forward pass
    reserve_pass: bool,
    cur_batch_size: usize,
    cur_positions: Vec<i32>,
    cur_sequences: Vec<i32>,
    cur_loc: Vec<usize>,
    cur_loc_tensor: Option<Tensor>,
    cur_range: CellRange,
    cur_mask: Option<Tensor>,
    padded_min: usize,
    padded_len: usize,
    causal_except: HashSet<usize>,
}

impl CausalCache {
    /// Plain causal cache: unbounded window and retention
    pub fn new(shift_fn: Option<ShiftFn>) -> Self {
        Self::with_policy(NO_LIMIT, NO_LIMIT, 0, shift_fn)
    }

    /// Sliding-window attention; retention equals the window
    pub fn sliding_window(
        window_size: i32,
        shift_fn: Option<ShiftFn>,
    ) -> Result<Self, CacheError> {
        Self::sliding_window_with_memory(window_size, window_size, shift_fn)
    }

    /// Sliding-window attention with independently chosen retention
    ///
    /// Retention must cover the window so jump-back within the window never
    /// needs history that was already discarded.
    pub fn sliding_window_with_memory(
        window_size: i32,
        memory_size: i32,
        shift_fn: Option<ShiftFn>,
    ) -> Result<Self, CacheError> {
        if window_size <= 0 {
            return Err(CacheError::InvalidConfig(
                "window size must be positive".to_string(),
            ));
        }
        if memory_size < window_size {
            return Err(CacheError::InvalidConfig(format!(
                "retention ({memory_size}) must be at least the window ({window_size})"
            )));
        }
        Ok(Self::with_policy(window_size, memory_size, 0, shift_fn))
    }

    /// Chunked attention: a token attends only within its own chunk
    pub fn chunked(chunk_size: i32, shift_fn: Option<ShiftFn>) -> Result<Self, CacheError> {
        if chunk_size <= 0 {
            return Err(CacheError::InvalidConfig(
                "chunk size must be positive".to_string(),
            ));
        }
        Ok(Self::with_policy(NO_LIMIT, NO_LIMIT, chunk_size, shift_fn))
    }

    fn with_policy(
        window_size: i32,
        memory_size: i32,
        chunk_size: i32,
        shift_fn: Option<ShiftFn>,
    ) -> Self {
        Self {
            window_size,
            memory_size,
            chunk_size,
            shift_fn,
            backend: None,
            config: CacheConfig::default(),
            config_set: false,
            locked: false,
            dtype: DType::F32,
            max_batch: 0,
            pool_size: 0,
            cells: Vec::new(),
            cell_ranges: HashMap::new(),
            layers: HashMap::new(),
            active_layer: 0,
            reserve_pass: false,
            cur_batch_size: 0,
            cur_positions: Vec::new(),
            cur_sequences: Vec::new(),
            cur_loc: Vec::new(),
            cur_loc_tensor: None,
            cur_range: CellRange::empty(),
            cur_mask: None,
            padded_min: 0,
            padded_len: 0,
            causal_except: HashSet::new(),
        }
    }

    /// Override the storage layout options; must happen before `init`
    pub fn set_config(&mut self, config: CacheConfig) -> Result<(), CacheError> {
        if self.locked {
            return Err(CacheError::ConfigLocked);
        }
        config.validate().map_err(CacheError::InvalidConfig)?;
        self.config = config;
        self.config_set = true;
        Ok(())
    }

    /// Disable the causality constraint for the given batch indices until
    /// the next `start_forward`
    ///
    /// May be called repeatedly within a pass; the mask is rebuilt only
    /// when the exception set changes.
    pub fn set_causal(&mut self, except: &[usize]) -> Result<(), CacheError> {
        let except: HashSet<usize> = except.iter().copied().collect();
        if except == self.causal_except {
            return Ok(());
        }
        self.causal_except = except;
        if self.cur_mask.is_some() {
            let backend = self.require_backend()?;
            self.build_mask(&backend)?;
        }
        Ok(())
    }

    /// Actual positions currently retained for a sequence, ascending
    pub fn seq_positions(&self, seq: i32) -> Vec<i32> {
        let mut positions = Vec::new();
        if let Some(range) = self.cell_ranges.get(&seq) {
            if !range.is_empty() {
                for idx in range.min..=range.max {
                    if self.cells[idx].has_seq(seq) {
                        positions.push(self.cells[idx].position);
                    }
                }
            }
        }
        positions.sort_unstable();
        positions
    }

    /// Number of cells currently free for allocation
    pub fn num_free_cells(&self) -> usize {
        self.cells.iter().filter(|c| c.is_free()).count()
    }

    fn require_backend(&self) -> Result<Backend, CacheError> {
        self.backend
            .clone()
            .ok_or_else(|| CacheError::NotSupported("cache is not initialized".to_string()))
    }

    /// Prune sliding-window history and derive the cell range this pass
    /// attends over. Must run before location allocation so freshly evicted
    /// cells are reusable by the batch.
    fn update_sliding_window(&mut self) {
        self.cur_range = CellRange::empty();

        if self.memory_size == NO_LIMIT {
            // no retention limit: the pass window is the union of the batch
            // sequences' ranges
            let mut seen: Vec<i32> = Vec::new();
            for &seq in &self.cur_sequences {
                if seen.contains(&seq) {
                    continue;
                }
                seen.push(seq);
                if let Some(range) = self.cell_ranges.get(&seq) {
                    self.cur_range.union(range);
                }
            }
            return;
        }

        // lowest relevant position per sequence: batch sequences use their
        // lowest batch position, idle sequences their last known position + 1
        let mut lowest: HashMap<i32, (i32, bool)> = HashMap::new();
        for (i, &seq) in self.cur_sequences.iter().enumerate() {
            let pos = self.cur_positions[i];
            lowest
                .entry(seq)
                .and_modify(|e| {
                    if pos < e.0 {
                        e.0 = pos;
                    }
                })
                .or_insert((pos, true));
        }
        let known: Vec<i32> = self.cell_ranges.keys().copied().collect();
        for seq in known {
            if lowest.contains_key(&seq) {
                continue;
            }
            let mut last = i32::MIN;
            if let Some(range) = self.cell_ranges.get(&seq) {
                if !range.is_empty() {
                    for idx in range.min..=range.max {
                        let cell = &self.cells[idx];
                        if cell.has_seq(seq) && cell.position > last {
                            last = cell.position;
                        }
                    }
                }
            }
            if last == i32::MIN {
                self.cell_ranges.remove(&seq);
                continue;
            }
            lowest.insert(seq, (last + 1, false));
        }

        let memory = self.memory_size as i64;
        let window = self.window_size as i64;
        let mut evicted = 0usize;
        for (&seq, &(low, in_batch)) in &lowest {
            let old_range = match self.cell_ranges.get(&seq) {
                Some(r) if !r.is_empty() => *r,
                _ => continue,
            };
            let mut new_range = CellRange::empty();
            for idx in old_range.min..=old_range.max {
                let cell = &mut self.cells[idx];
                if !cell.has_seq(seq) {
                    continue;
                }
                if (cell.position as i64) < low as i64 - memory {
                    cell.remove_seq(seq);
                    evicted += 1;
                    continue;
                }
                new_range.add(idx);
                if in_batch && (cell.position as i64) >= low as i64 - window {
                    self.cur_range.add(idx);
                }
            }
            if new_range.is_empty() {
                self.cell_ranges.remove(&seq);
            } else {
                self.cell_ranges.insert(seq, new_range);
            }
        }
        if evicted > 0 {
            debug!("sliding window evicted {evicted} cells");
        }
    }

    /// Build the mask over the padded cell window for the current batch
    ///
    /// Rows are batch tokens, columns are cells `[padded_min, padded_max]`.
    /// An entry is `-inf` when the cell belongs to another sequence, sits in
    /// the causal future, falls in a previous chunk, or lies outside the
    /// sliding window.
    fn build_mask(&mut self, backend: &Backend) -> Result<(), CacheError> {
        if self.cur_range.is_empty() {
            self.cur_mask = None;
            return Ok(());
        }

        let pad = self.config.cache_padding;
        let padded_min = (self.cur_range.min / pad) * pad;
        let padded_max = (self.cur_range.max + pad) / pad * pad - 1;
        let len = padded_max - padded_min + 1;
        let b = self.cur_batch_size;

        let window = self.window_size as i64;
        let chunk = self.chunk_size as i64;
        let mut mask = vec![0f32; b * len];
        for i in 0..b {
            let seq = self.cur_sequences[i];
            let pos = self.cur_positions[i] as i64;
            let causal = !self.causal_except.contains(&i);
            for j in padded_min..=padded_max {
                let cell = &self.cells[j];
                let cell_pos = cell.position as i64;
                let hidden = !cell.has_seq(seq)
                    || (causal && cell_pos > pos)
                    || (chunk > 0 && cell_pos < pos - pos.rem_euclid(chunk))
                    || cell_pos < pos - window;
                if hidden {
                    mask[i * len + (j - padded_min)] = f32::NEG_INFINITY;
                }
            }
        }

        let mut mask = backend.floats(mask, (b, len))?;
        if self.config.mask_dtype != DType::F32 {
            mask = mask.to_dtype(self.config.mask_dtype)?;
        }
        self.cur_mask = Some(mask);
        self.padded_min = padded_min;
        self.padded_len = len;
        Ok(())
    }

    /// Re-rotate the keys of shifted cells through the injected hook,
    /// batched so no single call covers more than `max_batch` columns
    fn shift_cells(&self, indices: &[usize], offset: i32) -> Result<(), CacheError> {
        let backend = self.require_backend()?;
        let Some(shift_fn) = self.shift_fn.as_ref() else {
            return Err(CacheError::NotSupported(
                "position shift requires a shift hook".to_string(),
            ));
        };
        let step = self.max_batch.max(1);
        for chunk in indices.chunks(step) {
            let idx: Vec<u32> = chunk.iter().map(|&i| i as u32).collect();
            let idx_t = backend.ints_u32(&idx)?;
            let off_t = backend.ints_i64(&vec![offset as i64; chunk.len()])?;
            for (&layer_idx, layer) in &self.layers {
                let keys = layer.k.index_select(&idx_t, 2)?;
                let rotated = shift_fn(layer_idx, &keys, &off_t)?;
                let scatter_idx = idx_t
                    .reshape((1, 1, chunk.len()))?
                    .broadcast_as(rotated.shape())?
                    .contiguous()?;
                layer.k.scatter_set(&scatter_idx, &rotated, 2)?;
            }
        }
        debug!("shifted {} cells by {offset}", indices.len());
        Ok(())
    }
}

impl Cache for CausalCache {
    fn init(
        &mut self,
        backend: Backend,
        dtype: DType,
        max_sequences: usize,
        capacity: usize,
        max_batch: usize,
    ) -> Result<(), CacheError> {
        if !self.config_set {
            self.config = backend.cache_config().clone();
        }
        self.config.validate().map_err(CacheError::InvalidConfig)?;
        let first_init = !self.locked;
        self.locked = true;

        // finite retention with several sequences keeps one extra token so a
        // sequence can jump back to the window edge cleanly
        if first_init && self.memory_size != NO_LIMIT && max_sequences > 1 {
            self.memory_size += 1;
        }

        let pool = if self.memory_size == NO_LIMIT {
            max_sequences * capacity
        } else {
            max_sequences * self.memory_size as usize + max_batch
        };
        let pad = self.config.cache_padding;
        let pool = (pool + pad - 1) / pad * pad;

        self.backend = Some(backend);
        self.dtype = dtype;
        self.max_batch = max_batch;
        self.pool_size = pool;
        self.cells = vec![Cell::default(); pool];
        self.cell_ranges.clear();
        self.layers.clear();
        self.cur_mask = None;
        self.cur_loc_tensor = None;
        self.cur_batch_size = 0;
        debug!("kv cache init: {pool} cells, max batch {max_batch}");
        Ok(())
    }

    fn close(&mut self) {
        self.layers.clear();
        self.cur_mask = None;
        self.cur_loc_tensor = None;
    }

    fn set_layer(&mut self, layer: usize) {
        self.active_layer = layer;
    }

    fn start_forward(&mut self, batch: &Batch, reserve: bool) -> Result<(), CacheError> {
        let backend = self.require_backend()?;
        let b = batch.len();

        self.reserve_pass = reserve;
        self.causal_except.clear();
        self.cur_positions = batch.positions().to_vec();
        self.cur_sequences = batch.sequences().to_vec();
        self.cur_batch_size = b;

        if reserve {
            // worst-case shapes for graph pre-allocation; metadata untouched
            self.cur_loc = (0..b).collect();
            self.cur_range = CellRange {
                min: 0,
                max: self.pool_size - 1,
            };
            let locs: Vec<u32> = (0..b as u32).collect();
            self.cur_loc_tensor = Some(backend.ints_u32(&locs)?);
            return self.build_mask(&backend);
        }

        self.update_sliding_window();

        // claim the lowest-indexed free cells; collect before writing so a
        // full cache leaves the metadata untouched
        let mut locs = Vec::with_capacity(b);
        for (idx, cell) in self.cells.iter().enumerate() {
            if cell.is_free() {
                locs.push(idx);
                if locs.len() == b {
                    break;
                }
            }
        }
        if locs.len() < b {
            return Err(CacheError::CacheFull {
                needed: b,
                free: locs.len(),
            });
        }

        for (i, &loc) in locs.iter().enumerate() {
            let seq = self.cur_sequences[i];
            let cell = &mut self.cells[loc];
            cell.position = self.cur_positions[i];
            cell.sequences.clear();
            cell.sequences.push(seq);
            self.cell_ranges
                .entry(seq)
                .or_insert_with(CellRange::empty)
                .add(loc);
            self.cur_range.add(loc);
        }
        trace!(
            "forward pass: {b} tokens over cells [{}, {}]",
            self.cur_range.min,
            self.cur_range.max
        );

        let loc_u32: Vec<u32> = locs.iter().map(|&l| l as u32).collect();
        self.cur_loc = locs;
        self.cur_loc_tensor = Some(backend.ints_u32(&loc_u32)?);
        self.build_mask(&backend)
    }

    fn get(&self) -> Result<(Tensor, Tensor, Tensor), CacheError> {
        let mask = self
            .cur_mask
            .clone()
            .ok_or_else(|| CacheError::NotSupported("no active forward pass".to_string()))?;
        let layer = self.layers.get(&self.active_layer).ok_or_else(|| {
            CacheError::NotSupported(format!(
                "layer {} has no cached tensors",
                self.active_layer
            ))
        })?;

        let k = layer.k.narrow(2, self.padded_min, self.padded_len)?;
        let v = if self.config.permuted_v {
            // stored [cells, head_dim, kv_heads]; expose the logical
            // [head_dim, kv_heads, cells] through permuted strides
            layer
                .v
                .narrow(0, self.padded_min, self.padded_len)?
                .permute((1, 2, 0))?
        } else {
            layer.v.narrow(2, self.padded_min, self.padded_len)?
        };
        Ok((k, v, mask))
    }

    fn put(&mut self, k: &Tensor, v: &Tensor) -> Result<(), CacheError> {
        let backend = self.require_backend()?;
        let loc = self
            .cur_loc_tensor
            .clone()
            .ok_or_else(|| CacheError::NotSupported("no active forward pass".to_string()))?;

        let (head_dim, num_kv_heads, got) = k.dims3()?;
        if got != self.cur_batch_size {
            return Err(CacheError::BatchMismatch {
                expected: self.cur_batch_size,
                got,
            });
        }
        if v.dims3()? != (head_dim, num_kv_heads, got) {
            return Err(CacheError::Backend(format!(
                "key/value shape mismatch: {:?} vs {:?}",
                k.shape(),
                v.shape()
            )));
        }

        let layer = self.active_layer;
        if !self.layers.contains_key(&layer) {
            let kt = backend.zeros(self.dtype, (head_dim, num_kv_heads, self.pool_size))?;
            let vt = if self.config.permuted_v {
                backend.zeros(self.dtype, (self.pool_size, head_dim, num_kv_heads))?
            } else {
                backend.zeros(self.dtype, (head_dim, num_kv_heads, self.pool_size))?
            };
            trace!("allocated cache tensors for layer {layer}");
            self.layers.insert(layer, LayerCache { k: kt, v: vt });
        }
        let Some(cache) = self.layers.get(&layer) else {
            return Err(CacheError::Backend(
                "layer cache allocation failed".to_string(),
            ));
        };

        if self.reserve_pass {
            // reserve passes size the graph but must not clobber live cells
            return Ok(());
        }

        let k = if k.dtype() != self.dtype {
            k.to_dtype(self.dtype)?
        } else {
            k.clone()
        };
        let v = if v.dtype() != self.dtype {
            v.to_dtype(self.dtype)?
        } else {
            v.clone()
        };

        let idx = loc.reshape((1, 1, got))?.broadcast_as(k.shape())?.contiguous()?;
        cache.k.scatter_set(&idx, &k, 2)?;
        if self.config.permuted_v {
            let src = v.permute((2, 0, 1))?.contiguous()?;
            let idx = loc.reshape((got, 1, 1))?.broadcast_as(src.shape())?.contiguous()?;
            cache.v.scatter_set(&idx, &src, 0)?;
        } else {
            let idx = loc.reshape((1, 1, got))?.broadcast_as(v.shape())?.contiguous()?;
            cache.v.scatter_set(&idx, &v, 2)?;
        }
        Ok(())
    }

    fn copy_prefix(
        &mut self,
        src_seq: i32,
        dst_seq: i32,
        prefix_len: i32,
    ) -> Result<(), CacheError> {
        let mut dst_range = CellRange::empty();
        for idx in 0..self.cells.len() {
            let cell = &mut self.cells[idx];
            // the destination holds no leftover history
            cell.remove_seq(dst_seq);
            if cell.has_seq(src_seq) && cell.position < prefix_len {
                cell.add_seq(dst_seq);
                dst_range.add(idx);
            }
        }
        if dst_range.is_empty() {
            self.cell_ranges.remove(&dst_seq);
        } else {
            self.cell_ranges.insert(dst_seq, dst_range);
        }
        trace!("shared prefix of seq {src_seq} (first {prefix_len} positions) with seq {dst_seq}");
        Ok(())
    }

    fn can_resume(&self, seq: i32, pos: i32) -> bool {
        if self.window_size == NO_LIMIT {
            return true;
        }
        let mut first = i32::MAX;
        let mut last = i32::MIN;
        if let Some(range) = self.cell_ranges.get(&seq) {
            if !range.is_empty() {
                for idx in range.min..=range.max {
                    let cell = &self.cells[idx];
                    if cell.has_seq(seq) {
                        first = first.min(cell.position);
                        last = last.max(cell.position);
                    }
                }
            }
        }
        if last == i32::MIN {
            return pos == 0;
        }
        let window_start = (pos as i64 - self.window_size as i64).max(0);
        first as i64 <= window_start && pos as i64 <= last as i64 + 1
    }

    fn remove(&mut self, seq: i32, begin: i32, end: i32) -> Result<(), CacheError> {
        if end != NO_LIMIT && end < begin {
            return Err(CacheError::InvalidConfig(
                "removal range is inverted".to_string(),
            ));
        }
        let shift = end != NO_LIMIT;
        if shift && self.shift_fn.is_none() {
            return Err(CacheError::NotSupported(
                "position shift requires a shift hook".to_string(),
            ));
        }

        // validate before mutating: re-rotating a shared cell would corrupt
        // the other owner's history
        if shift {
            for cell in &self.cells {
                if cell.has_seq(seq) && cell.position >= end && cell.sequences.len() > 1 {
                    return Err(CacheError::UnsupportedShare);
                }
            }
        }

        let offset = begin.wrapping_sub(end);
        let mut new_range = CellRange::empty();
        let mut shifted = Vec::new();
        for idx in 0..self.cells.len() {
            let cell = &mut self.cells[idx];
            if !cell.has_seq(seq) {
                continue;
            }
            if cell.position >= begin && cell.position < end {
                cell.remove_seq(seq);
            } else {
                if shift && cell.position >= end {
                    cell.position += offset;
                    shifted.push(idx);
                }
                new_range.add(idx);
            }
        }
        if new_range.is_empty() {
            self.cell_ranges.remove(&seq);
        } else {
            self.cell_ranges.insert(seq, new_range);
        }

        if shift && !shifted.is_empty() {
            self.shift_cells(&shifted, offset)?;
        }
        Ok(())
    }
}

impl std::fmt::Debug for CausalCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CausalCache")
            .field("window_size", &self.window_size)
            .field("memory_size", &self.memory_size)
            .field("chunk_size", &self.chunk_size)
            .field("pool_size", &self.pool_size)
            .field("layers", &self.layers.len())
            .field("sequences", &self.cell_ranges.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::Device;
    use std::cell::RefCell;
    use std::rc::Rc;

    fn backend() -> Backend {
        Backend::new(Device::Cpu)
    }

    fn forward(cache: &mut CausalCache, positions: &[i32], sequences: &[i32]) {
        let batch = Batch::new(positions.to_vec(), sequences.to_vec()).unwrap();
        cache.start_forward(&batch, false).unwrap();
    }

    fn mask_rows(cache: &CausalCache) -> Vec<Vec<f32>> {
        cache.cur_mask.as_ref().unwrap().to_vec2::<f32>().unwrap()
    }

    #[test]
    fn test_plain_causal_fill() {
        let inf = f32::NEG_INFINITY;
        let mut cache = CausalCache::new(None);
        cache.init(backend(), DType::F32, 1, 8, 4).unwrap();

        forward(&mut cache, &[0, 1, 2, 3], &[0, 0, 0, 0]);
        assert_eq!(cache.cur_loc, vec![0, 1, 2, 3]);
        assert_eq!((cache.cur_range.min, cache.cur_range.max), (0, 3));
        assert_eq!(
            mask_rows(&cache),
            vec![
                vec![0.0, inf, inf, inf],
                vec![0.0, 0.0, inf, inf],
                vec![0.0, 0.0, 0.0, inf],
                vec![0.0, 0.0, 0.0, 0.0],
            ]
        );

        forward(&mut cache, &[4], &[0]);
        assert_eq!(cache.cur_loc, vec![4]);
        assert_eq!((cache.cur_range.min, cache.cur_range.max), (0, 4));
        assert_eq!(mask_rows(&cache), vec![vec![0.0; 5]]);
    }

    #[test]
    fn test_batch_claims_exactly_free_cells() {
        let mut cache = CausalCache::new(None);
        cache.init(backend(), DType::F32, 1, 8, 4).unwrap();
        assert_eq!(cache.num_free_cells(), 8);

        forward(&mut cache, &[0, 1, 2], &[0, 0, 0]);
        assert_eq!(cache.num_free_cells(), 5);
        for &loc in &cache.cur_loc {
            assert!(!cache.cells[loc].is_free());
            assert!(loc >= cache.cur_range.min && loc <= cache.cur_range.max);
        }
    }

    #[test]
    fn test_cache_full() {
        let mut cache = CausalCache::new(None);
        cache.init(backend(), DType::F32, 1, 2, 2).unwrap();
        let batch = Batch::new(vec![0, 1, 2, 3], vec![0, 0, 0, 0]).unwrap();
        let err = cache.start_forward(&batch, false).unwrap_err();
        assert_eq!(err, CacheError::CacheFull { needed: 4, free: 2 });
        // a failed pass leaves every cell free
        assert_eq!(cache.num_free_cells(), 2);
    }

    #[test]
    fn test_sliding_window_prune() {
        let mut cache = CausalCache::sliding_window(2, None).unwrap();
        cache.init(backend(), DType::F32, 1, 0, 6).unwrap();
        assert_eq!(cache.pool_size, 8);

        for pos in 0..4 {
            forward(&mut cache, &[pos], &[0]);
        }
        assert_eq!(cache.seq_positions(0), vec![1, 2, 3]);
        // the evicted cell no longer claims seq 0
        let owners: usize = cache.cells.iter().filter(|c| c.has_seq(0)).count();
        assert_eq!(owners, 3);
    }

    #[test]
    fn test_sliding_window_masks_outside_window() {
        let inf = f32::NEG_INFINITY;
        let mut cache = CausalCache::sliding_window(2, None).unwrap();
        cache.init(backend(), DType::F32, 1, 0, 6).unwrap();

        forward(&mut cache, &[0, 1, 2, 3], &[0, 0, 0, 0]);
        let rows = mask_rows(&cache);
        // token at position 3 no longer sees position 0
        assert_eq!(rows[3], vec![inf, 0.0, 0.0, 0.0]);
        assert_eq!(rows[2], vec![0.0, 0.0, 0.0, inf]);
    }

    #[test]
    fn test_sliding_window_retained_positions() {
        let mut cache = CausalCache::sliding_window(2, None).unwrap();
        cache.init(backend(), DType::F32, 1, 0, 6).unwrap();

        for pos in 0..4 {
            forward(&mut cache, &[pos], &[0]);
        }
        // position 0 was evicted and its cell recycled for position 3
        assert_eq!(cache.seq_positions(0), vec![1, 2, 3]);
        assert_eq!(cache.cells[0].position, 3);
        let rows = mask_rows(&cache);
        let visible = rows[0].iter().filter(|&&m| m == 0.0).count();
        assert_eq!(visible, 3);
    }

    #[test]
    fn test_chunked_attention() {
        let inf = f32::NEG_INFINITY;
        let mut cache = CausalCache::chunked(4, None).unwrap();
        cache.init(backend(), DType::F32, 1, 8, 2).unwrap();

        forward(&mut cache, &[0, 1, 2, 3, 4], &[0, 0, 0, 0, 0]);
        forward(&mut cache, &[5, 6], &[0, 0]);

        let rows = mask_rows(&cache);
        // token at position 5 sees its chunk [4, 5]; token at 6 sees [4, 6]
        assert_eq!(rows[0], vec![inf, inf, inf, inf, 0.0, 0.0, inf]);
        assert_eq!(rows[1], vec![inf, inf, inf, inf, 0.0, 0.0, 0.0]);
    }

    #[test]
    fn test_cache_padding_aligns_window() {
        let mut cache = CausalCache::new(None);
        let config = CacheConfig {
            cache_padding: 4,
            ..CacheConfig::default()
        };
        cache.set_config(config).unwrap();
        cache.init(backend(), DType::F32, 1, 10, 2).unwrap();
        assert_eq!(cache.pool_size % 4, 0);

        forward(&mut cache, &[0, 1], &[0, 0]);
        assert_eq!(cache.padded_min % 4, 0);
        assert_eq!(cache.padded_len % 4, 0);
        assert!(cache.padded_min <= cache.cur_range.min);
        assert!(cache.padded_min + cache.padded_len > cache.cur_range.max);
        let rows = mask_rows(&cache);
        assert_eq!(rows[0].len(), cache.padded_len);
    }

    #[test]
    fn test_reserve_mode_idempotent() {
        let mut cache = CausalCache::new(None);
        cache.init(backend(), DType::F32, 2, 8, 4).unwrap();

        let batch = Batch::new(vec![0, 1, 2, 3], vec![0, 0, 0, 0]).unwrap();
        cache.start_forward(&batch, true).unwrap();
        let loc1 = cache.cur_loc.clone();
        let range1 = cache.cur_range;
        cache.start_forward(&batch, true).unwrap();
        assert_eq!(cache.cur_loc, loc1);
        assert_eq!(cache.cur_range, range1);
        assert_eq!(loc1, vec![0, 1, 2, 3]);
        assert_eq!((range1.min, range1.max), (0, 15));
        // metadata untouched
        assert_eq!(cache.num_free_cells(), 16);
    }

    #[test]
    fn test_copy_prefix_metadata_only() {
        let mut cache = CausalCache::new(None);
        cache.init(backend(), DType::F32, 2, 4, 4).unwrap();

        forward(&mut cache, &[0, 1, 2, 3], &[0, 0, 0, 0]);
        cache.copy_prefix(0, 1, 2).unwrap();

        assert_eq!(cache.cells[0].sequences, vec![0, 1]);
        assert_eq!(cache.cells[1].sequences, vec![0, 1]);
        assert_eq!(cache.cells[2].sequences, vec![0]);
        assert_eq!(cache.cells[3].sequences, vec![0]);
        let range = cache.cell_ranges[&1];
        assert_eq!((range.min, range.max), (0, 1));
    }

    #[test]
    fn test_copy_prefix_releases_old_history() {
        let mut cache = CausalCache::new(None);
        cache.init(backend(), DType::F32, 2, 4, 4).unwrap();

        forward(&mut cache, &[0, 1], &[0, 0]);
        forward(&mut cache, &[0, 1, 2], &[1, 1, 1]);
        cache.copy_prefix(0, 1, 1).unwrap();

        assert_eq!(cache.seq_positions(1), vec![0]);
        assert_eq!(cache.cells[0].sequences, vec![0, 1]);
        // seq 1's previous cells went back to the free pool
        assert!(cache.cells[2].is_free());
        assert!(cache.cells[3].is_free());
        assert!(cache.cells[4].is_free());
    }

    #[test]
    fn test_remove_with_shift() {
        let counts: Rc<RefCell<Vec<(usize, Vec<i64>, usize)>>> = Rc::new(RefCell::new(Vec::new()));
        let log = counts.clone();
        let shift_fn: ShiftFn = Box::new(move |layer, keys, offsets| {
            log.borrow_mut().push((
                layer,
                offsets.to_vec1::<i64>().unwrap(),
                keys.dim(2).unwrap(),
            ));
            Ok(keys.clone())
        });

        let mut cache = CausalCache::new(Some(shift_fn));
        cache.init(backend(), DType::F32, 1, 8, 8).unwrap();
        forward(&mut cache, &[0, 1, 2, 3, 4], &[0, 0, 0, 0, 0]);
        let k = Tensor::zeros((2, 1, 5), DType::F32, &Device::Cpu).unwrap();
        cache.put(&k, &k).unwrap();

        cache.remove(0, 1, 3).unwrap();
        assert_eq!(cache.seq_positions(0), vec![0, 1, 2]);

        let calls = counts.borrow();
        assert_eq!(calls.len(), 1);
        let (layer, offsets, cols) = &calls[0];
        assert_eq!(*layer, 0);
        assert_eq!(offsets, &vec![-2, -2]);
        assert_eq!(*cols, 2);
    }

    #[test]
    fn test_remove_tail_needs_no_shift() {
        let mut cache = CausalCache::new(None);
        cache.init(backend(), DType::F32, 1, 8, 4).unwrap();
        forward(&mut cache, &[0, 1, 2, 3], &[0, 0, 0, 0]);

        cache.remove(0, 2, NO_LIMIT).unwrap();
        assert_eq!(cache.seq_positions(0), vec![0, 1]);
    }

    #[test]
    fn test_remove_without_hook_fails() {
        let mut cache = CausalCache::new(None);
        cache.init(backend(), DType::F32, 1, 8, 4).unwrap();
        forward(&mut cache, &[0, 1, 2], &[0, 0, 0]);

        let err = cache.remove(0, 0, 1).unwrap_err();
        assert!(matches!(err, CacheError::NotSupported(_)));
        // nothing was removed
        assert_eq!(cache.seq_positions(0), vec![0, 1, 2]);
    }

    #[test]
    fn test_remove_shared_cell_fails() {
        let shift_fn: ShiftFn = Box::new(|_, keys, _| Ok(keys.clone()));
        let mut cache = CausalCache::new(Some(shift_fn));
        cache.init(backend(), DType::F32, 2, 4, 4).unwrap();
        forward(&mut cache, &[0, 1, 2], &[0, 0, 0]);
        cache.copy_prefix(0, 1, 3).unwrap();

        let err = cache.remove(0, 0, 1).unwrap_err();
        assert_eq!(err, CacheError::UnsupportedShare);
        // failed removal left both owners intact
        assert_eq!(cache.seq_positions(0), vec![0, 1, 2]);
        assert_eq!(cache.seq_positions(1), vec![0, 1, 2]);
    }

    #[test]
    fn test_remove_in_range_shared_cell_allowed() {
        let mut cache = CausalCache::new(None);
        cache.init(backend(), DType::F32, 2, 4, 4).unwrap();
        forward(&mut cache, &[0, 1], &[0, 0]);
        cache.copy_prefix(0, 1, 2).unwrap();

        // no tail survives, so no shift touches the shared cells
        cache.remove(0, 0, NO_LIMIT).unwrap();
        assert!(cache.seq_positions(0).is_empty());
        assert_eq!(cache.seq_positions(1), vec![0, 1]);
    }

    #[test]
    fn test_set_causal_rebuilds_mask() {
        let inf = f32::NEG_INFINITY;
        let mut cache = CausalCache::new(None);
        cache.init(backend(), DType::F32, 1, 4, 4).unwrap();
        forward(&mut cache, &[0, 1, 2], &[0, 0, 0]);

        cache.set_causal(&[0]).unwrap();
        let rows = mask_rows(&cache);
        // token 0 now attends everything in its sequence
        assert_eq!(rows[0], vec![0.0, 0.0, 0.0]);
        assert_eq!(rows[1], vec![0.0, 0.0, inf]);

        // restoring the default brings causality back
        cache.set_causal(&[]).unwrap();
        let rows = mask_rows(&cache);
        assert_eq!(rows[0], vec![0.0, inf, inf]);
    }

    #[test]
    fn test_batch_mismatch() {
        let mut cache = CausalCache::new(None);
        cache.init(backend(), DType::F32, 1, 8, 4).unwrap();
        forward(&mut cache, &[0, 1], &[0, 0]);

        let k = Tensor::zeros((2, 1, 3), DType::F32, &Device::Cpu).unwrap();
        let err = cache.put(&k, &k).unwrap_err();
        assert_eq!(
            err,
            CacheError::BatchMismatch {
                expected: 2,
                got: 3
            }
        );
    }

    #[test]
    fn test_put_get_roundtrip() {
        let mut cache = CausalCache::new(None);
        cache.init(backend(), DType::F32, 1, 4, 4).unwrap();
        forward(&mut cache, &[0, 1], &[0, 0]);

        let k = Tensor::from_vec(vec![1f32, 2., 3., 4.], (2, 1, 2), &Device::Cpu).unwrap();
        let v = Tensor::from_vec(vec![5f32, 6., 7., 8.], (2, 1, 2), &Device::Cpu).unwrap();
        cache.put(&k, &v).unwrap();

        let (ck, cv, mask) = cache.get().unwrap();
        assert_eq!(ck.dims(), &[2, 1, 2]);
        assert_eq!(cv.dims(), &[2, 1, 2]);
        assert_eq!(mask.dims(), &[2, 2]);
        assert_eq!(
            ck.to_vec3::<f32>().unwrap(),
            vec![vec![vec![1., 2.]], vec![vec![3., 4.]]]
        );
        assert_eq!(
            cv.to_vec3::<f32>().unwrap(),
            vec![vec![vec![5., 6.]], vec![vec![7., 8.]]]
        );
    }

    #[test]
    fn test_permuted_v_matches_plain_layout() {
        let k = Tensor::from_vec(vec![1f32, 2., 3., 4., 5., 6.], (3, 1, 2), &Device::Cpu).unwrap();
        let v = Tensor::from_vec(vec![7f32, 8., 9., 10., 11., 12.], (3, 1, 2), &Device::Cpu)
            .unwrap();

        let mut plain = CausalCache::new(None);
        plain.init(backend(), DType::F32, 1, 4, 4).unwrap();
        forward(&mut plain, &[0, 1], &[0, 0]);
        plain.put(&k, &v).unwrap();
        let (_, pv, _) = plain.get().unwrap();

        let mut permuted = CausalCache::new(None);
        permuted
            .set_config(CacheConfig {
                permuted_v: true,
                ..CacheConfig::default()
            })
            .unwrap();
        permuted.init(backend(), DType::F32, 1, 4, 4).unwrap();
        forward(&mut permuted, &[0, 1], &[0, 0]);
        permuted.put(&k, &v).unwrap();
        let (_, qv, _) = permuted.get().unwrap();

        assert_eq!(qv.dims(), pv.dims());
        assert_eq!(
            qv.contiguous().unwrap().to_vec3::<f32>().unwrap(),
            pv.to_vec3::<f32>().unwrap()
        );
    }

    #[test]
    fn test_mask_dtype_cast() {
        let mut cache = CausalCache::new(None);
        cache
            .set_config(CacheConfig {
                mask_dtype: DType::F16,
                ..CacheConfig::default()
            })
            .unwrap();
        cache.init(backend(), DType::F32, 1, 4, 4).unwrap();
        forward(&mut cache, &[0], &[0]);
        assert_eq!(cache.cur_mask.as_ref().unwrap().dtype(), DType::F16);
    }

    #[test]
    fn test_can_resume_within_window() {
        let mut cache = CausalCache::sliding_window(4, None).unwrap();
        cache.init(backend(), DType::F32, 1, 0, 4).unwrap();
        for pos in 0..7 {
            forward(&mut cache, &[pos], &[0]);
        }
        assert_eq!(cache.seq_positions(0), vec![2, 3, 4, 5, 6]);

        assert!(cache.can_resume(0, 7));
        assert!(cache.can_resume(0, 6));
        assert!(!cache.can_resume(0, 20));
        assert!(!cache.can_resume(0, 0));
        // unknown sequence can only start fresh
        assert!(cache.can_resume(9, 0));
        assert!(!cache.can_resume(9, 3));
    }

    #[test]
    fn test_can_resume_unbounded() {
        let mut cache = CausalCache::new(None);
        cache.init(backend(), DType::F32, 1, 4, 4).unwrap();
        assert!(cache.can_resume(0, 0));
        assert!(cache.can_resume(0, 100));
    }

    #[test]
    fn test_multi_sequence_membership_masking() {
        let inf = f32::NEG_INFINITY;
        let mut cache = CausalCache::new(None);
        cache.init(backend(), DType::F32, 2, 4, 4).unwrap();

        forward(&mut cache, &[0, 0], &[0, 1]);
        let rows = mask_rows(&cache);
        // each token only sees its own sequence's cell
        assert_eq!(rows[0], vec![0.0, inf]);
        assert_eq!(rows[1], vec![inf, 0.0]);
    }

    #[test]
    fn test_idle_sequence_pruned_by_window() {
        let mut cache = CausalCache::sliding_window(2, None).unwrap();
        cache.init(backend(), DType::F32, 2, 0, 4).unwrap();

        for pos in 0..3 {
            forward(&mut cache, &[pos], &[0]);
        }
        // seq 1 advances; seq 0 stays idle and is pruned relative to its own
        // last position, not seq 1's
        for pos in 0..5 {
            forward(&mut cache, &[pos], &[1]);
        }
        assert_eq!(cache.seq_positions(0), vec![0, 1, 2]);
        assert_eq!(cache.seq_positions(1), vec![1, 2, 3, 4]);
    }

    #[test]
    fn test_config_locked_after_init() {
        let mut cache = CausalCache::new(None);
        cache.init(backend(), DType::F32, 1, 4, 4).unwrap();
        let err = cache.set_config(CacheConfig::default()).unwrap_err();
        assert_eq!(err, CacheError::ConfigLocked);
    }
}
