//! Hybrid cache: causal attention plus per-sequence recurrent state
//!
//! Hybrid models interleave attention layers with short convolutions whose
//! state is one row per sequence rather than one cell per token. This cache
//! composes the causal engine with a slot table for that state, sharing
//! slots across sequences by refcount and going private on first write.

use std::collections::HashMap;

use candle_core::{DType, Tensor};
use log::trace;

use crate::backend::Backend;
use crate::batch::Batch;
use crate::cache::causal::CausalCache;
use crate::cache::Cache;
use crate::error::CacheError;

#[derive(Debug, Clone)]
enum WritableState {
    Unchecked,
    Ready,
    Failed(CacheError),
}

/// Causal KV cache paired with slot-based recurrent conv state
pub struct HybridCache {
    attn: CausalCache,
    d_conv: usize,
    hidden: usize,

    backend: Option<Backend>,
    max_slots: usize,
    slot_for_seq: HashMap<i32, usize>,
    ref_count: Vec<u32>,
    free_slots: Vec<usize>,
    // per layer: [d_conv * hidden, max_slots] f32, allocated on first use
    conv_layers: HashMap<usize, Tensor>,
    active_layer: usize,

    // state of the current forward pass
    reserve_pass: bool,
    cur_seqs: Vec<i32>,
    cur_seq_tokens: usize,
    cur_slots: Vec<usize>,
    cur_slots_tensor: Option<Tensor>,
    writable: WritableState,
}

impl HybridCache {
    /// Wrap a causal cache with recurrent state of `d_conv * hidden` floats
    /// per sequence
    pub fn new(attn: CausalCache, d_conv: usize, hidden: usize) -> Self {
        Self {
            attn,
            d_conv,
            hidden,
            backend: None,
            max_slots: 0,
            slot_for_seq: HashMap::new(),
            ref_count: Vec::new(),
            free_slots: Vec::new(),
            conv_layers: HashMap::new(),
            active_layer: 0,
            reserve_pass: false,
            cur_seqs: Vec::new(),
            cur_seq_tokens: 0,
            cur_slots: Vec::new(),
            cur_slots_tensor: None,
            writable: WritableState::Unchecked,
        }
    }

    /// Number of tokens each batch sequence contributes to the current pass
    pub fn seq_tokens(&self) -> usize {
        self.cur_seq_tokens
    }

    /// Slot ids of the current pass as a `[|seqs|]` u32 tensor
    pub fn slot_ids(&self) -> Result<Tensor, CacheError> {
        self.cur_slots_tensor
            .clone()
            .ok_or_else(|| CacheError::NotSupported("no active forward pass".to_string()))
    }

    /// Disable causality for the given batch indices; delegates to the
    /// attention cache
    pub fn set_causal(&mut self, except: &[usize]) -> Result<(), CacheError> {
        self.attn.set_causal(except)
    }

    fn require_backend(&self) -> Result<Backend, CacheError> {
        self.backend
            .clone()
            .ok_or_else(|| CacheError::NotSupported("cache is not initialized".to_string()))
    }

    fn alloc_slot(&mut self) -> Result<usize, CacheError> {
        self.free_slots.pop().ok_or(CacheError::CacheFull {
            needed: 1,
            free: 0,
        })
    }

    fn release_slot(&mut self, slot: usize) {
        if slot >= self.ref_count.len() {
            return;
        }
        if self.ref_count[slot] > 0 {
            self.ref_count[slot] -= 1;
        }
        if self.ref_count[slot] == 0 {
            self.free_slots.push(slot);
        }
    }

    /// Recurrent state buffer for the active layer, allocated zeroed on
    /// first use
    fn conv_buf(&mut self, backend: &Backend) -> Result<Tensor, CacheError> {
        let layer = self.active_layer;
        if !self.conv_layers.contains_key(&layer) {
            let buf = backend.zeros(DType::F32, (self.d_conv * self.hidden, self.max_slots))?;
            trace!("allocated conv state for layer {layer}");
            self.conv_layers.insert(layer, buf);
        }
        let Some(buf) = self.conv_layers.get(&layer) else {
            return Err(CacheError::Backend(
                "conv state allocation failed".to_string(),
            ));
        };
        Ok(buf.clone())
    }

    fn zero_slots(&self, backend: &Backend, slots: &[usize]) -> Result<(), CacheError> {
        for buf in self.conv_layers.values() {
            let (rows, _) = buf.dims2()?;
            for &slot in slots {
                let zeros = backend.zeros(DType::F32, (rows, 1))?;
                buf.slice_set(&zeros, 1, slot)?;
            }
        }
        Ok(())
    }

    /// Give every current sequence a privately owned slot, copying shared
    /// rows. Memoized per pass: a failure poisons later state accesses.
    fn ensure_writable(&mut self) -> Result<(), CacheError> {
        match &self.writable {
            WritableState::Ready => return Ok(()),
            WritableState::Failed(err) => return Err(err.clone()),
            WritableState::Unchecked => {}
        }
        if self.reserve_pass {
            self.writable = WritableState::Ready;
            return Ok(());
        }
        match self.make_writable() {
            Ok(()) => {
                self.writable = WritableState::Ready;
                Ok(())
            }
            Err(err) => {
                self.writable = WritableState::Failed(err.clone());
                Err(err)
            }
        }
    }

    fn make_writable(&mut self) -> Result<(), CacheError> {
        let shared: Vec<usize> = (0..self.cur_slots.len())
            .filter(|&i| self.ref_count[self.cur_slots[i]] > 1)
            .collect();
        if shared.is_empty() {
            return Ok(());
        }
        let backend = self.require_backend()?;
        // capacity check up front so a failure leaves the slot table intact
        if shared.len() > self.free_slots.len() {
            return Err(CacheError::CacheFull {
                needed: shared.len(),
                free: self.free_slots.len(),
            });
        }

        for i in shared {
            let seq = self.cur_seqs[i];
            let old = self.cur_slots[i];
            let new = self.alloc_slot()?;
            self.ref_count[old] -= 1;
            self.ref_count[new] = 1;
            self.slot_for_seq.insert(seq, new);
            self.cur_slots[i] = new;
            for buf in self.conv_layers.values() {
                let row = buf.narrow(1, old, 1)?.contiguous()?;
                buf.slice_set(&row, 1, new)?;
            }
            trace!("copy-on-write: seq {seq} moved from slot {old} to {new}");
        }

        let slots: Vec<u32> = self.cur_slots.iter().map(|&s| s as u32).collect();
        self.cur_slots_tensor = Some(backend.ints_u32(&slots)?);
        Ok(())
    }

    /// Recurrent state of the current batch sequences, shaped
    /// `[d_conv, hidden, |seqs|]`
    pub fn conv_state(&mut self) -> Result<Tensor, CacheError> {
        if self.cur_slots.is_empty() {
            return Err(CacheError::NotSupported(
                "no active forward pass".to_string(),
            ));
        }
        self.ensure_writable()?;
        let backend = self.require_backend()?;
        let buf = self.conv_buf(&backend)?;
        let slots = self.slot_ids()?;
        let gathered = buf.index_select(&slots, 1)?;
        Ok(gathered.reshape((self.d_conv, self.hidden, self.cur_seqs.len()))?)
    }

    /// Overwrite the recurrent state of the current batch sequences
    ///
    /// `state` is `[d_conv, hidden, |seqs|]`; it is cast to f32 if needed.
    pub fn update_conv_state(&mut self, state: &Tensor) -> Result<(), CacheError> {
        if self.cur_slots.is_empty() {
            return Err(CacheError::NotSupported(
                "no active forward pass".to_string(),
            ));
        }
        self.ensure_writable()?;
        let backend = self.require_backend()?;

        let n = self.cur_seqs.len();
        let (d, h, got) = state.dims3()?;
        if got != n {
            return Err(CacheError::BatchMismatch {
                expected: n,
                got,
            });
        }
        if (d, h) != (self.d_conv, self.hidden) {
            return Err(CacheError::Backend(format!(
                "conv state shape mismatch: got [{d}, {h}], cache holds [{}, {}]",
                self.d_conv, self.hidden
            )));
        }

        let buf = self.conv_buf(&backend)?;
        if self.reserve_pass {
            // size the graph without touching live rows
            return Ok(());
        }

        let src = state.contiguous()?.reshape((self.d_conv * self.hidden, n))?;
        let src = if src.dtype() != DType::F32 {
            src.to_dtype(DType::F32)?
        } else {
            src
        };
        let slots = self.slot_ids()?;
        let idx = slots.reshape((1, n))?.broadcast_as(src.shape())?.contiguous()?;
        buf.scatter_set(&idx, &src, 1)?;
        Ok(())
    }
}

impl Cache for HybridCache {
    fn init(
        &mut self,
        backend: Backend,
        dtype: DType,
        max_sequences: usize,
        capacity: usize,
        max_batch: usize,
    ) -> Result<(), CacheError> {
        self.attn
            .init(backend.clone(), dtype, max_sequences, capacity, max_batch)?;
        self.backend = Some(backend);
        self.max_slots = max_sequences;
        self.slot_for_seq.clear();
        self.ref_count = vec![0; max_sequences];
        self.free_slots = (0..max_sequences).rev().collect();
        self.conv_layers.clear();
        self.cur_slots.clear();
        self.cur_slots_tensor = None;
        Ok(())
    }

    fn close(&mut self) {
        self.attn.close();
        self.conv_layers.clear();
        self.cur_slots_tensor = None;
    }

    fn set_layer(&mut self, layer: usize) {
        self.active_layer = layer;
        self.attn.set_layer(layer);
    }

    fn start_forward(&mut self, batch: &Batch, reserve: bool) -> Result<(), CacheError> {
        let cur_seqs = batch.seqs_in_order();
        let b = batch.len();

        // the conv state update assumes a [seq_tokens, seqs] grid
        let per = b / cur_seqs.len();
        if b % cur_seqs.len() != 0
            || cur_seqs.iter().any(|&s| {
                batch.sequences().iter().filter(|&&x| x == s).count() != per
            })
        {
            return Err(CacheError::NotSupported(
                "recurrent state requires an equal number of tokens per sequence".to_string(),
            ));
        }

        // reserve slot capacity before committing anything
        if !reserve {
            let missing = cur_seqs
                .iter()
                .filter(|&&s| !self.slot_for_seq.contains_key(&s))
                .count();
            if missing > self.free_slots.len() {
                return Err(CacheError::CacheFull {
                    needed: missing,
                    free: self.free_slots.len(),
                });
            }
        }

        self.attn.start_forward(batch, reserve)?;

        self.reserve_pass = reserve;
        self.cur_seq_tokens = per;
        self.writable = WritableState::Unchecked;
        let backend = self.require_backend()?;

        if reserve {
            self.cur_slots = (0..cur_seqs.len()).collect();
        } else {
            let mut slots = Vec::with_capacity(cur_seqs.len());
            let mut new_slots = Vec::new();
            for &seq in &cur_seqs {
                match self.slot_for_seq.get(&seq) {
                    Some(&slot) => slots.push(slot),
                    None => {
                        let slot = self.alloc_slot()?;
                        self.ref_count[slot] = 1;
                        self.slot_for_seq.insert(seq, slot);
                        new_slots.push(slot);
                        slots.push(slot);
                    }
                }
            }
            self.cur_slots = slots;
            if !new_slots.is_empty() {
                self.zero_slots(&backend, &new_slots)?;
            }
        }
        self.cur_seqs = cur_seqs;

        let slots: Vec<u32> = self.cur_slots.iter().map(|&s| s as u32).collect();
        self.cur_slots_tensor = Some(backend.ints_u32(&slots)?);
        Ok(())
    }

    fn get(&self) -> Result<(Tensor, Tensor, Tensor), CacheError> {
        self.attn.get()
    }

    fn put(&mut self, k: &Tensor, v: &Tensor) -> Result<(), CacheError> {
        self.attn.put(k, v)
    }

    fn copy_prefix(
        &mut self,
        src_seq: i32,
        dst_seq: i32,
        prefix_len: i32,
    ) -> Result<(), CacheError> {
        self.attn.copy_prefix(src_seq, dst_seq, prefix_len)?;

        // the recurrent slot is shared whole; the first write to the
        // destination goes private via copy-on-write
        if let Some(slot) = self.slot_for_seq.remove(&dst_seq) {
            self.release_slot(slot);
        }
        if let Some(&src_slot) = self.slot_for_seq.get(&src_seq) {
            self.slot_for_seq.insert(dst_seq, src_slot);
            self.ref_count[src_slot] += 1;
        }
        Ok(())
    }

    fn can_resume(&self, seq: i32, pos: i32) -> bool {
        self.attn.can_resume(seq, pos)
    }

    fn remove(&mut self, seq: i32, begin: i32, end: i32) -> Result<(), CacheError> {
        self.attn.remove(seq, begin, end)?;

        // recurrent state at position n depends on every prior position, so
        // any removal invalidates it
        if let Some(slot) = self.slot_for_seq.remove(&seq) {
            self.release_slot(slot);
        }
        Ok(())
    }
}

impl std::fmt::Debug for HybridCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HybridCache")
            .field("attn", &self.attn)
            .field("d_conv", &self.d_conv)
            .field("hidden", &self.hidden)
            .field("slots", &self.slot_for_seq.len())
            .field("free_slots", &self.free_slots.len())
            .finish()
    }
}
