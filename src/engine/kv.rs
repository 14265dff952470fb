//! Per-layer key/value cache for incremental decoding.
//!
//! One row of K and V per token per layer. All layers advance in lockstep,
//! so the cache length always equals the visible token-sequence length.

use crate::error::{EngineError, Result};

/// K/V rows for a single transformer layer.
#[derive(Debug, Clone)]
pub struct LayerKv {
    k: Vec<f32>,
    v: Vec<f32>,
    row_len: usize,
    len: usize,
}

impl LayerKv {
    fn new(capacity: usize, row_len: usize) -> Self {
        LayerKv {
            k: vec![0.0; capacity * row_len],
            v: vec![0.0; capacity * row_len],
            row_len,
            len: 0,
        }
    }

    fn append(&mut self, k_row: &[f32], v_row: &[f32]) {
        debug_assert_eq!(k_row.len(), self.row_len);
        debug_assert_eq!(v_row.len(), self.row_len);
        let offset = self.len * self.row_len;
        self.k[offset..offset + self.row_len].copy_from_slice(k_row);
        self.v[offset..offset + self.row_len].copy_from_slice(v_row);
        self.len += 1;
    }

    /// All K rows written so far, flattened.
    pub fn k_history(&self) -> &[f32] {
        &self.k[..self.len * self.row_len]
    }

    /// All V rows written so far, flattened.
    pub fn v_history(&self) -> &[f32] {
        &self.v[..self.len * self.row_len]
    }

    /// Width of one K or V row in floats.
    pub fn row_len(&self) -> usize {
        self.row_len
    }
}

/// The full cache for one session: one [`LayerKv`] per transformer layer,
/// kept at identical lengths.
#[derive(Debug)]
pub struct SessionKvCache {
    layers: Vec<LayerKv>,
    capacity: usize,
    len: usize,
}

impl SessionKvCache {
    /// Allocate a cache of `capacity` positions across `n_layers` layers.
    pub fn new(n_layers: usize, capacity: usize, row_len: usize) -> Self {
        SessionKvCache {
            layers: (0..n_layers).map(|_| LayerKv::new(capacity, row_len)).collect(),
            capacity,
            len: 0,
        }
    }

    /// Tokens currently cached. Equals the token-sequence length.
    pub fn len(&self) -> usize {
        self.len
    }

    /// Whether any position is cached.
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Maximum cacheable positions.
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Positions still free.
    pub fn remaining(&self) -> usize {
        self.capacity - self.len
    }

    /// Reserve one position for the token being decoded. Fails with
    /// [`EngineError::ContextFull`] before any layer is touched, keeping the
    /// cache consistent on rejection.
    pub fn push_position(&mut self) -> Result<()> {
        if self.len >= self.capacity {
            return Err(EngineError::ContextFull {
                needed: self.len + 1,
                capacity: self.capacity,
            });
        }
        self.len += 1;
        Ok(())
    }

    /// Append this token's K/V rows for one layer. Must follow
    /// [`push_position`](Self::push_position) within the same decode step.
    pub fn append(&mut self, layer: usize, k_row: &[f32], v_row: &[f32]) -> Result<()> {
        let target = self
            .layers
            .get_mut(layer)
            .ok_or_else(|| EngineError::InvalidArgument(format!("layer {layer} out of range")))?;
        if target.len + 1 != self.len {
            return Err(EngineError::InvalidState(format!(
                "layer {layer} cache out of step (layer len {}, position {})",
                target.len, self.len
            )));
        }
        target.append(k_row, v_row);
        Ok(())
    }

    pub fn layer(&self, layer: usize) -> Result<&LayerKv> {
        self.layers
            .get(layer)
            .ok_or_else(|| EngineError::InvalidArgument(format!("layer {layer} out of range")))
    }

    /// Drop all cached rows, keeping the allocation.
    pub fn clear(&mut self) {
        for layer in &mut self.layers {
            layer.len = 0;
        }
        self.len = 0;
    }

    /// Bytes allocated for K and V across all layers.
    pub fn memory_bytes(&self) -> usize {
        self.layers
            .iter()
            .map(|l| (l.k.len() + l.v.len()) * std::mem::size_of::<f32>())
            .sum()
    }
}
