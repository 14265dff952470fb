//! Immutable model artifacts and the process-wide model registry.
//!
//! A [`Model`] is built once from a GGUF container and never mutated; all
//! sessions opened against the same path share one `Arc<Model>` through the
//! registry. The registry holds weak references, so dropping the last
//! session releases the weights.

use std::path::{Path, PathBuf};
use std::sync::{Arc, Weak};

use dashmap::DashMap;
use lazy_static::lazy_static;
use tracing::info;

use crate::error::{EngineError, Result};
use crate::model::gguf::{GgufFile, Tensor};
use crate::tokenizer::Tokenizer;

/// Architecture hyperparameters read from container metadata.
#[derive(Debug, Clone)]
pub struct Hyperparams {
    /// Architecture tag from `general.architecture`, e.g. `llama`.
    pub architecture: String,
    /// Maximum context length the model supports; also the default capacity.
    pub context_length: usize,
    /// Hidden-state width.
    pub embedding_length: usize,
    /// Number of transformer blocks.
    pub block_count: usize,
    /// Query attention heads per block.
    pub head_count: usize,
    /// Key/value heads per block; smaller than `head_count` under GQA.
    pub head_count_kv: usize,
    /// Epsilon for RMS normalization.
    pub rms_norm_eps: f32,
    /// Rotary position embedding frequency base.
    pub rope_freq_base: f32,
    /// Vocabulary entry count, which is also the logit width.
    pub vocab_size: usize,
}

/// Weights of one transformer block.
#[derive(Debug)]
pub struct LayerWeights {
    /// Pre-attention RMS norm gain.
    pub attn_norm: Vec<f32>,
    /// Query projection.
    pub attn_q: Tensor,
    /// Key projection.
    pub attn_k: Tensor,
    /// Value projection.
    pub attn_v: Tensor,
    /// Attention output projection.
    pub attn_output: Tensor,
    /// Pre-FFN RMS norm gain.
    pub ffn_norm: Vec<f32>,
    /// SwiGLU gate projection.
    pub ffn_gate: Tensor,
    /// SwiGLU up projection.
    pub ffn_up: Tensor,
    /// SwiGLU down projection.
    pub ffn_down: Tensor,
}

/// An immutable loaded model: hyperparameters, vocabulary, weights.
pub struct Model {
    hyperparams: Hyperparams,
    tokenizer: Tokenizer,
    pub(crate) token_embedding: Tensor,
    pub(crate) layers: Vec<LayerWeights>,
    pub(crate) output_norm: Vec<f32>,
    pub(crate) output: Tensor,
}

impl Model {
    /// Load a model through the registry, deduplicating concurrent opens of
    /// the same path.
    pub fn open(path: impl AsRef<Path>) -> Result<Arc<Model>> {
        let path = path.as_ref();
        let canonical = std::fs::canonicalize(path).map_err(|source| EngineError::FileAccess {
            path: path.to_path_buf(),
            source,
        })?;

        if let Some(entry) = REGISTRY.get(&canonical) {
            if let Some(model) = entry.upgrade() {
                return Ok(model);
            }
        }

        let model = Arc::new(Self::load(&canonical)?);
        REGISTRY.retain(|_, weak| weak.upgrade().is_some());
        REGISTRY.insert(canonical, Arc::downgrade(&model));
        Ok(model)
    }

    fn load(path: &Path) -> Result<Model> {
        let gguf = GgufFile::read(path)?;
        let hyperparams = read_hyperparams(&gguf)?;
        let tokenizer = Tokenizer::from_gguf(&gguf)?;

        if tokenizer.vocab_size() != hyperparams.vocab_size {
            return Err(EngineError::Broken(format!(
                "vocabulary has {} entries but output projection expects {}",
                tokenizer.vocab_size(),
                hyperparams.vocab_size
            )));
        }

        let token_embedding = require_matrix(
            &gguf,
            "token_embd.weight",
            hyperparams.embedding_length,
            hyperparams.vocab_size,
        )?;

        let mut layers = Vec::with_capacity(hyperparams.block_count);
        for i in 0..hyperparams.block_count {
            layers.push(read_layer(&gguf, i, &hyperparams)?);
        }

        let output_norm = require_vector(&gguf, "output_norm.weight", hyperparams.embedding_length)?;
        let output = require_matrix(
            &gguf,
            "output.weight",
            hyperparams.embedding_length,
            hyperparams.vocab_size,
        )?;

        info!(
            path = %path.display(),
            architecture = %hyperparams.architecture,
            blocks = hyperparams.block_count,
            vocab = hyperparams.vocab_size,
            n_ctx = hyperparams.context_length,
            "model loaded"
        );

        Ok(Model {
            hyperparams,
            tokenizer,
            token_embedding,
            layers,
            output_norm,
            output,
        })
    }

    /// Architecture hyperparameters read at load time.
    pub fn hyperparams(&self) -> &Hyperparams {
        &self.hyperparams
    }

    /// Tokenizer built from the container vocabulary.
    pub fn tokenizer(&self) -> &Tokenizer {
        &self.tokenizer
    }

    /// Context capacity used when a session requests the default (0).
    pub fn default_context_length(&self) -> usize {
        self.hyperparams.context_length
    }

    /// Resolve a requested capacity against the model limits: 0 selects the
    /// default, larger requests are clamped to the model maximum.
    pub fn resolve_context_length(&self, requested: u32) -> usize {
        if requested == 0 {
            self.hyperparams.context_length
        } else {
            (requested as usize).min(self.hyperparams.context_length)
        }
    }
}

impl std::fmt::Debug for Model {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Model")
            .field("hyperparams", &self.hyperparams)
            .field("layers", &self.layers.len())
            .finish()
    }
}

lazy_static! {
    static ref REGISTRY: DashMap<PathBuf, Weak<Model>> = DashMap::new();
}

fn read_hyperparams(gguf: &GgufFile) -> Result<Hyperparams> {
    let architecture = gguf.require_str("general.architecture")?.to_string();
    let prefix = architecture.clone();

    let context_length = gguf.require_u64(&format!("{prefix}.context_length"))? as usize;
    let embedding_length = gguf.require_u64(&format!("{prefix}.embedding_length"))? as usize;
    let block_count = gguf.require_u64(&format!("{prefix}.block_count"))? as usize;
    let head_count = gguf.require_u64(&format!("{prefix}.attention.head_count"))? as usize;
    let head_count_kv = gguf
        .get(&format!("{prefix}.attention.head_count_kv"))
        .and_then(|v| v.as_u64())
        .map(|v| v as usize)
        .unwrap_or(head_count);
    let rms_norm_eps = gguf
        .get(&format!("{prefix}.attention.layer_norm_rms_epsilon"))
        .and_then(|v| v.as_f32())
        .unwrap_or(1e-5);
    let rope_freq_base = gguf
        .get(&format!("{prefix}.rope.freq_base"))
        .and_then(|v| v.as_f32())
        .unwrap_or(10_000.0);
    let vocab_size = gguf
        .get("tokenizer.ggml.tokens")
        .and_then(|v| v.as_array())
        .map(|a| a.len())
        .ok_or_else(|| EngineError::Broken("missing tokenizer.ggml.tokens array".into()))?;

    if context_length == 0 || block_count == 0 {
        return Err(EngineError::Broken(
            "context_length and block_count must be nonzero".into(),
        ));
    }
    if head_count == 0 || embedding_length % head_count != 0 {
        return Err(EngineError::Broken(format!(
            "embedding length {embedding_length} not divisible by head count {head_count}"
        )));
    }
    if head_count_kv == 0 || head_count % head_count_kv != 0 {
        return Err(EngineError::Broken(format!(
            "head count {head_count} not divisible by kv head count {head_count_kv}"
        )));
    }

    Ok(Hyperparams {
        architecture,
        context_length,
        embedding_length,
        block_count,
        head_count,
        head_count_kv,
        rms_norm_eps,
        rope_freq_base,
        vocab_size,
    })
}

fn read_layer(gguf: &GgufFile, index: usize, hp: &Hyperparams) -> Result<LayerWeights> {
    let embd = hp.embedding_length;
    let kv_dim = embd / hp.head_count * hp.head_count_kv;
    let name = |suffix: &str| format!("blk.{index}.{suffix}.weight");

    // The FFN inner width comes from the tensor itself rather than metadata;
    // gate/up/down must agree.
    let ffn_gate = gguf.require_tensor(&name("ffn_gate"))?.clone();
    let inner = matrix_rows(&ffn_gate, &name("ffn_gate"), embd)?;

    Ok(LayerWeights {
        attn_norm: require_vector(gguf, &name("attn_norm"), embd)?,
        attn_q: require_matrix(gguf, &name("attn_q"), embd, embd)?,
        attn_k: require_matrix(gguf, &name("attn_k"), embd, kv_dim)?,
        attn_v: require_matrix(gguf, &name("attn_v"), embd, kv_dim)?,
        attn_output: require_matrix(gguf, &name("attn_output"), embd, embd)?,
        ffn_norm: require_vector(gguf, &name("ffn_norm"), embd)?,
        ffn_gate,
        ffn_up: require_matrix(gguf, &name("ffn_up"), embd, inner)?,
        ffn_down: require_matrix(gguf, &name("ffn_down"), inner, embd)?,
    })
}

fn matrix_rows(tensor: &Tensor, name: &str, expect_cols: usize) -> Result<usize> {
    match tensor.dims.as_slice() {
        [cols, rows] if *cols == expect_cols => Ok(*rows),
        dims => Err(EngineError::Broken(format!(
            "tensor {name:?} has shape {dims:?}, expected [{expect_cols}, _]"
        ))),
    }
}

/// Fetch a 2-D tensor with shape `[in_dim, out_dim]` (GGUF stores the
/// innermost dimension first).
fn require_matrix(gguf: &GgufFile, name: &str, in_dim: usize, out_dim: usize) -> Result<Tensor> {
    let tensor = gguf.require_tensor(name)?;
    if tensor.dims != [in_dim, out_dim] {
        return Err(EngineError::Broken(format!(
            "tensor {name:?} has shape {:?}, expected [{in_dim}, {out_dim}]",
            tensor.dims
        )));
    }
    Ok(tensor.clone())
}

/// Fetch a 1-D tensor of the given length.
fn require_vector(gguf: &GgufFile, name: &str, len: usize) -> Result<Vec<f32>> {
    let tensor = gguf.require_tensor(name)?;
    if tensor.dims != [len] {
        return Err(EngineError::Broken(format!(
            "tensor {name:?} has shape {:?}, expected [{len}]",
            tensor.dims
        )));
    }
    Ok(tensor.data.clone())
}
