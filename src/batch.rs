//! Forward-pass batch descriptor

use crate::error::CacheError;

/// Token positions and sequence ids for one forward pass
///
/// Entry `i` says that the `i`-th token of the batch sits at `positions[i]`
/// within sequence `sequences[i]`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Batch {
    positions: Vec<i32>,
    sequences: Vec<i32>,
}

impl Batch {
    pub fn new(positions: Vec<i32>, sequences: Vec<i32>) -> Result<Self, CacheError> {
        if positions.is_empty() {
            return Err(CacheError::InvalidConfig(
                "batch must contain at least one token".to_string(),
            ));
        }
        if positions.len() != sequences.len() {
            return Err(CacheError::InvalidConfig(format!(
                "positions ({}) and sequences ({}) must have equal length",
                positions.len(),
                sequences.len()
            )));
        }
        Ok(Self {
            positions,
            sequences,
        })
    }

    pub fn len(&self) -> usize {
        self.positions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.positions.is_empty()
    }

    pub fn positions(&self) -> &[i32] {
        &self.positions
    }

    pub fn sequences(&self) -> &[i32] {
        &self.sequences
    }

    /// Distinct sequence ids in order of first appearance
    pub fn seqs_in_order(&self) -> Vec<i32> {
        let mut seqs: Vec<i32> = Vec::new();
        for &s in &self.sequences {
            if !seqs.contains(&s) {
                seqs.push(s);
            }
        }
        seqs
    }
}
