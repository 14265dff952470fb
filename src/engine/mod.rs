//! The incremental inference engine: prefill and single-token decode.
//!
//! [`InferenceEngine`] owns the mutable decode state (the KV cache) and a
//! shared handle on the immutable model. Each call produces the logits for
//! the next position, so the session layer can sample, append, and call
//! again — one token per step, suspendable indefinitely between steps.

pub mod kv;
pub mod math;

use std::sync::Arc;

use tracing::trace;

use crate::error::{EngineError, Result};
use crate::model::{LayerWeights, Model};
use kv::SessionKvCache;
use math::{matmul_vec, rms_norm, rope_rotate, silu, softmax};

/// Forward-pass state for one session.
pub struct InferenceEngine {
    model: Arc<Model>,
    cache: SessionKvCache,
    n_ctx: usize,
}

impl InferenceEngine {
    /// Build an engine over `model` with a KV cache of `n_ctx` positions.
    pub fn new(model: Arc<Model>, n_ctx: usize) -> Self {
        let hp = model.hyperparams();
        let kv_dim = hp.embedding_length / hp.head_count * hp.head_count_kv;
        let cache = SessionKvCache::new(hp.block_count, n_ctx, kv_dim);
        InferenceEngine {
            model,
            cache,
            n_ctx,
        }
    }

    /// Shared handle on the loaded model.
    pub fn model(&self) -> &Arc<Model> {
        &self.model
    }

    /// Context capacity in tokens.
    pub fn context_size(&self) -> usize {
        self.n_ctx
    }

    /// Tokens currently conditioning the cache.
    pub fn seq_len(&self) -> usize {
        self.cache.len()
    }

    /// Cache positions still free.
    pub fn remaining(&self) -> usize {
        self.cache.remaining()
    }

    /// Drop all cached state, ready for a fresh prompt.
    pub fn reset(&mut self) {
        self.cache.clear();
    }

    /// Prime the cache with an entire prompt and return the logits for the
    /// first generated position.
    ///
    /// Capacity is checked up front so an oversized prompt leaves the cache
    /// exactly as it was.
    pub fn prefill(&mut self, tokens: &[u32]) -> Result<Vec<f32>> {
        if tokens.is_empty() {
            return Err(EngineError::InvalidArgument("empty prompt".into()));
        }
        if tokens.len() > self.cache.remaining() {
            return Err(EngineError::ContextFull {
                needed: self.cache.len() + tokens.len(),
                capacity: self.n_ctx,
            });
        }

        let mut logits = Vec::new();
        for &token in tokens {
            logits = self.forward(token)?;
        }
        trace!(prompt_tokens = tokens.len(), "prefill complete");
        Ok(logits)
    }

    /// Run one decode step for `token`, returning the next-position logits.
    pub fn decode(&mut self, token: u32) -> Result<Vec<f32>> {
        self.forward(token)
    }

    /// Single-token forward pass: embed, run every block against the KV
    /// cache, project to vocabulary logits.
    fn forward(&mut self, token: u32) -> Result<Vec<f32>> {
        let hp = self.model.hyperparams().clone();
        if (token as usize) >= hp.vocab_size {
            return Err(EngineError::InvalidArgument(format!(
                "token id {token} out of range (vocab {})",
                hp.vocab_size
            )));
        }

        let position = self.cache.len();
        self.cache.push_position()?;

        let embd = hp.embedding_length;
        let head_dim = embd / hp.head_count;
        let model = Arc::clone(&self.model);

        let mut hidden =
            model.token_embedding.data[token as usize * embd..(token as usize + 1) * embd].to_vec();

        for (layer_idx, layer) in model.layers.iter().enumerate() {
            let normed = rms_norm(&hidden, &layer.attn_norm, hp.rms_norm_eps);
            let attn_out = self.attention(layer, layer_idx, &normed, position, head_dim, &hp)?;
            for (h, a) in hidden.iter_mut().zip(&attn_out) {
                *h += a;
            }

            let normed = rms_norm(&hidden, &layer.ffn_norm, hp.rms_norm_eps);
            let ffn_out = feed_forward(layer, &normed);
            for (h, f) in hidden.iter_mut().zip(&ffn_out) {
                *h += f;
            }
        }

        let normed = rms_norm(&hidden, &model.output_norm, hp.rms_norm_eps);
        Ok(matmul_vec(&model.output, &normed))
    }

    fn attention(
        &mut self,
        layer: &LayerWeights,
        layer_idx: usize,
        input: &[f32],
        position: usize,
        head_dim: usize,
        hp: &crate::model::Hyperparams,
    ) -> Result<Vec<f32>> {
        let mut q = matmul_vec(&layer.attn_q, input);
        let mut k = matmul_vec(&layer.attn_k, input);
        let v = matmul_vec(&layer.attn_v, input);

        for head in q.chunks_mut(head_dim) {
            rope_rotate(head, position, hp.rope_freq_base);
        }
        for head in k.chunks_mut(head_dim) {
            rope_rotate(head, position, hp.rope_freq_base);
        }

        self.cache.append(layer_idx, &k, &v)?;

        let kv_dim = k.len();
        let group = hp.head_count / hp.head_count_kv;
        let history_len = position + 1;
        let layer_cache = self.cache.layer(layer_idx)?;
        let k_history = layer_cache.k_history();
        let v_history = layer_cache.v_history();

        let scale = 1.0 / (head_dim as f32).sqrt();
        let mut context = vec![0.0f32; input.len()];

        for h in 0..hp.head_count {
            let kv_h = h / group;
            let q_head = &q[h * head_dim..(h + 1) * head_dim];

            let mut scores = Vec::with_capacity(history_len);
            for t in 0..history_len {
                let k_head = &k_history[t * kv_dim + kv_h * head_dim..][..head_dim];
                let dot: f32 = q_head.iter().zip(k_head).map(|(a, b)| a * b).sum();
                scores.push(dot * scale);
            }
            softmax(&mut scores);

            let out = &mut context[h * head_dim..(h + 1) * head_dim];
            for (t, score) in scores.iter().enumerate() {
                let v_head = &v_history[t * kv_dim + kv_h * head_dim..][..head_dim];
                for (o, value) in out.iter_mut().zip(v_head) {
                    *o += score * value;
                }
            }
        }

        Ok(matmul_vec(&layer.attn_output, &context))
    }
}

/// SwiGLU feed-forward: `down(silu(gate(x)) * up(x))`.
fn feed_forward(layer: &LayerWeights, input: &[f32]) -> Vec<f32> {
    let gate = matmul_vec(&layer.ffn_gate, input);
    let up = matmul_vec(&layer.ffn_up, input);
    let activated: Vec<f32> = gate.iter().zip(&up).map(|(g, u)| silu(*g) * u).collect();
    matmul_vec(&layer.ffn_down, &activated)
}
