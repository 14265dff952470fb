//! The stateful session handle.
//!
//! A [`LlmSession`] walks a fixed state machine:
//! `Uninitialized -> Configured -> Prompted -> Generating -> Done`, where
//! `set_prompt` restarts a finished (or in-flight) round. All mutation goes
//! through `&mut self`, so a handle is exclusive by construction; sessions
//! sharing a model share only the immutable `Arc<Model>` behind it.

use std::path::Path;
use std::time::Instant;

use tracing::{debug, info};

use crate::config::{SamplingParams, SessionConfig};
use crate::engine::InferenceEngine;
use crate::error::{EngineError, Result};
use crate::metrics::{MetricsCollector, MetricsSnapshot};
use crate::model::Model;
use crate::sampling::Sampler;
use crate::tokenizer::ChatMessage;

/// Observable lifecycle state of a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// Handle exists, no model loaded.
    Uninitialized,
    /// Model loaded, no prompt set.
    Configured,
    /// Prompt primed, no token generated yet this round.
    Prompted,
    /// At least one token generated, round still open.
    Generating,
    /// Round finished (end-of-sequence or context capacity).
    Done,
}

/// Mutable state of one generation round.
struct Round {
    sampler: Sampler,
    /// Logits for the next position, produced by the previous forward pass.
    pending_logits: Vec<f32>,
    prompt_tokens: usize,
    generated_tokens: usize,
    /// Delta of the most recent `generate` call. `None` until the first
    /// call of the round.
    delta: Option<String>,
    /// Bytes of an incomplete UTF-8 sequence held back across steps.
    pending_bytes: Vec<u8>,
    done: bool,
}

/// An incremental text-generation session over one loaded model.
pub struct LlmSession {
    config: SessionConfig,
    engine: Option<InferenceEngine>,
    round: Option<Round>,
    /// Sampling parameters freeze at the first `set_prompt`.
    sampling_locked: bool,
    metrics: MetricsCollector,
}

impl LlmSession {
    /// Create a handle. `n_ctx = 0` selects the model default context
    /// length at open time; nonzero requests are clamped to the model
    /// maximum. The context capacity is fixed for the handle's lifetime.
    pub fn create(n_ctx: u32) -> Self {
        LlmSession {
            config: SessionConfig {
                n_ctx,
                ..SessionConfig::default()
            },
            engine: None,
            round: None,
            sampling_locked: false,
            metrics: MetricsCollector::new(),
        }
    }

    /// Create a handle from a full configuration.
    pub fn with_config(config: SessionConfig) -> Result<Self> {
        config.validate()?;
        Ok(LlmSession {
            config,
            engine: None,
            round: None,
            sampling_locked: false,
            metrics: MetricsCollector::new(),
        })
    }

    /// Load a GGUF model into the session.
    ///
    /// Loads are deduplicated process-wide: a second session opening the
    /// same path shares the already-resident weights.
    pub fn open_model_file(&mut self, path: impl AsRef<Path>) -> Result<()> {
        if self.engine.is_some() {
            return Err(EngineError::InvalidState(
                "a model is already loaded in this session".into(),
            ));
        }
        let model = Model::open(path.as_ref())?;
        let n_ctx = model.resolve_context_length(self.config.n_ctx);
        info!(
            requested = self.config.n_ctx,
            effective = n_ctx,
            "session configured"
        );
        self.engine = Some(InferenceEngine::new(model, n_ctx));
        Ok(())
    }

    /// Current lifecycle state.
    pub fn state(&self) -> SessionState {
        match (&self.engine, &self.round) {
            (None, _) => SessionState::Uninitialized,
            (Some(_), None) => SessionState::Configured,
            (Some(_), Some(round)) if round.done => SessionState::Done,
            (Some(_), Some(round)) if round.generated_tokens == 0 => SessionState::Prompted,
            (Some(_), Some(_)) => SessionState::Generating,
        }
    }

    fn engine(&self) -> Result<&InferenceEngine> {
        self.engine
            .as_ref()
            .ok_or_else(|| EngineError::InvalidState("no model loaded".into()))
    }

    fn round(&self) -> Result<&Round> {
        self.round
            .as_ref()
            .ok_or_else(|| EngineError::InvalidState("no prompt set".into()))
    }

    /// Effective context capacity in tokens.
    pub fn context_size(&self) -> Result<usize> {
        Ok(self.engine()?.context_size())
    }

    /// Override sampling parameters. Only permitted before the first
    /// `set_prompt` on this handle.
    pub fn set_sampling_params(&mut self, params: SamplingParams) -> Result<()> {
        if self.sampling_locked {
            return Err(EngineError::InvalidState(
                "sampling parameters must be set before the first prompt".into(),
            ));
        }
        params.validate()?;
        self.config.sampling = params;
        Ok(())
    }

    /// Render the chat template over `messages`, tokenize, and prime the
    /// KV cache. Replaces any prior round on success; on failure the
    /// previous round (or its absence) is left untouched.
    pub fn set_prompt(&mut self, messages: &[ChatMessage]) -> Result<()> {
        let engine = self
            .engine
            .as_mut()
            .ok_or_else(|| EngineError::InvalidState("no model loaded".into()))?;

        // Tokenize and validate capacity before mutating anything.
        let tokens = engine.model().tokenizer().encode_chat(messages)?;
        let capacity = engine.context_size();
        if tokens.len() > capacity {
            return Err(EngineError::ContextFull {
                needed: tokens.len(),
                capacity,
            });
        }

        let started = Instant::now();
        engine.reset();
        let pending_logits = engine.prefill(&tokens)?;
        self.metrics.record_prefill(tokens.len(), started);

        debug!(
            messages = messages.len(),
            prompt_tokens = tokens.len(),
            capacity,
            "prompt primed"
        );

        self.round = Some(Round {
            sampler: Sampler::new(self.config.sampling),
            pending_logits,
            prompt_tokens: tokens.len(),
            generated_tokens: 0,
            delta: None,
            pending_bytes: Vec::new(),
            done: false,
        });
        self.sampling_locked = true;
        Ok(())
    }

    /// Decode exactly one token. Returns the done flag: `true` once an
    /// end-of-sequence token was produced or the context is full, after
    /// which further calls fail with `InvalidState` until a new
    /// `set_prompt`.
    pub fn generate(&mut self) -> Result<bool> {
        let engine = self
            .engine
            .as_mut()
            .ok_or_else(|| EngineError::InvalidState("no model loaded".into()))?;
        let round = self
            .round
            .as_mut()
            .ok_or_else(|| EngineError::InvalidState("no prompt set".into()))?;
        if round.done {
            return Err(EngineError::InvalidState(
                "generation already finished; set a new prompt".into(),
            ));
        }

        let started = Instant::now();
        let tokenizer = engine.model().tokenizer();
        let stop_tokens = tokenizer.stop_tokens();

        let token = round.sampler.sample(&round.pending_logits)?;

        if stop_tokens.contains(&token) {
            // End of sequence carries no visible text; any held-back bytes
            // belong to a sequence that never completed.
            round.pending_bytes.clear();
            round.delta = Some(String::new());
            round.done = true;
        } else {
            round
                .pending_bytes
                .extend_from_slice(&tokenizer.token_bytes(token)?);
            round.delta = Some(drain_valid_utf8(&mut round.pending_bytes));

            if engine.remaining() == 0 {
                // The prompt already filled the window; the sampled token
                // cannot be appended, so the round ends here.
                round.done = true;
            } else {
                round.pending_logits = engine.decode(token)?;
                if engine.remaining() == 0 {
                    round.done = true;
                }
            }
        }

        round.generated_tokens += 1;
        self.metrics
            .record_decode_step(started, self.config.step_budget);
        Ok(round.done)
    }

    /// Text produced by the most recent `generate` call only.
    pub fn delta_text(&self) -> Result<&str> {
        self.round()?
            .delta
            .as_deref()
            .ok_or_else(|| EngineError::InvalidState("generate has not been called".into()))
    }

    /// Byte length of the current delta plus one for a NUL terminator.
    pub fn delta_text_size(&self) -> Result<usize> {
        Ok(self.delta_text()?.len() + 1)
    }

    /// Copy the current delta into `buf` as NUL-terminated UTF-8.
    ///
    /// Fails with `InvalidArgument` when `buf` is smaller than
    /// [`delta_text_size`](Self::delta_text_size), leaving `buf` untouched.
    pub fn read_delta_text(&self, buf: &mut [u8]) -> Result<()> {
        let delta = self.delta_text()?;
        let needed = delta.len() + 1;
        if buf.len() < needed {
            return Err(EngineError::InvalidArgument(format!(
                "buffer of {} bytes is too small for delta of {needed} bytes",
                buf.len()
            )));
        }
        buf[..delta.len()].copy_from_slice(delta.as_bytes());
        buf[delta.len()] = 0;
        Ok(())
    }

    /// Number of tokens `text` encodes to under the loaded vocabulary.
    pub fn token_count(&self, text: &str) -> Result<usize> {
        self.engine()?.model().tokenizer().count_tokens(text)
    }

    /// Rendered token count of the current round's prompt.
    pub fn prompt_token_count(&self) -> Result<usize> {
        Ok(self.round()?.prompt_tokens)
    }

    /// Tokens generated so far in the current round.
    pub fn generated_token_count(&self) -> Result<usize> {
        Ok(self.round()?.generated_tokens)
    }

    /// Timing metrics for this session.
    pub fn metrics(&self) -> MetricsSnapshot {
        self.metrics.snapshot()
    }
}

/// Split the longest decodable UTF-8 prefix out of `bytes`.
///
/// A trailing incomplete multi-byte sequence stays in `bytes` for the next
/// step; byte runs that can never form valid UTF-8 are replaced with
/// U+FFFD so one bad token cannot wedge the stream.
fn drain_valid_utf8(bytes: &mut Vec<u8>) -> String {
    let mut out = String::new();
    let mut rest: &[u8] = bytes;

    loop {
        match std::str::from_utf8(rest) {
            Ok(s) => {
                out.push_str(s);
                rest = &[];
                break;
            }
            Err(e) => {
                let valid = e.valid_up_to();
                // Safe: from_utf8 just validated this prefix.
                out.push_str(std::str::from_utf8(&rest[..valid]).unwrap_or(""));
                match e.error_len() {
                    Some(bad) => {
                        out.push('\u{FFFD}');
                        rest = &rest[valid + bad..];
                    }
                    None => {
                        // Incomplete tail; keep it for the next token.
                        rest = &rest[valid..];
                        break;
                    }
                }
            }
        }
    }

    *bytes = rest.to_vec();
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fresh_session_is_uninitialized() {
        let session = LlmSession::create(0);
        assert_eq!(session.state(), SessionState::Uninitialized);
    }

    #[test]
    fn operations_before_open_are_invalid_state() {
        let mut session = LlmSession::create(0);
        assert_eq!(session.context_size().unwrap_err().status_code(), -7);
        assert_eq!(
            session
                .set_prompt(&[ChatMessage::user("hi")])
                .unwrap_err()
                .status_code(),
            -7
        );
        assert_eq!(session.generate().unwrap_err().status_code(), -7);
        assert_eq!(session.delta_text().unwrap_err().status_code(), -7);
        assert_eq!(session.prompt_token_count().unwrap_err().status_code(), -7);
    }

    #[test]
    fn sampling_params_settable_before_prompt() {
        let mut session = LlmSession::create(0);
        assert!(session.set_sampling_params(SamplingParams::greedy()).is_ok());
        assert!(session
            .set_sampling_params(SamplingParams {
                top_p: 2.0,
                ..Default::default()
            })
            .is_err());
    }

    #[test]
    fn invalid_config_rejected() {
        let config = SessionConfig {
            sampling: SamplingParams {
                temperature: f32::NAN,
                ..Default::default()
            },
            ..Default::default()
        };
        assert!(LlmSession::with_config(config).is_err());
    }

    #[test]
    fn drain_keeps_incomplete_tail() {
        // "é" is 0xC3 0xA9.
        let mut bytes = vec![b'a', 0xC3];
        let out = drain_valid_utf8(&mut bytes);
        assert_eq!(out, "a");
        assert_eq!(bytes, vec![0xC3]);

        bytes.push(0xA9);
        let out = drain_valid_utf8(&mut bytes);
        assert_eq!(out, "é");
        assert!(bytes.is_empty());
    }

    #[test]
    fn drain_replaces_unrecoverable_bytes() {
        // 0xC3 followed by an ASCII byte can never complete a sequence.
        let mut bytes = vec![0xC3, b'x'];
        let out = drain_valid_utf8(&mut bytes);
        assert_eq!(out, "\u{FFFD}x");
        assert!(bytes.is_empty());
    }

    #[test]
    fn drain_handles_four_byte_scalar_split_three_ways() {
        // U+1F600 is F0 9F 98 80.
        let mut bytes = vec![0xF0];
        assert_eq!(drain_valid_utf8(&mut bytes), "");
        bytes.extend_from_slice(&[0x9F, 0x98]);
        assert_eq!(drain_valid_utf8(&mut bytes), "");
        bytes.push(0x80);
        assert_eq!(drain_valid_utf8(&mut bytes), "😀");
        assert!(bytes.is_empty());
    }
}
