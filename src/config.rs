//! Session and sampling configuration.

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{EngineError, Result};

/// Sampling controls applied at every decode step.
///
/// The filter order is fixed: top-k truncation, then top-p nucleus cut, then
/// a temperature-scaled draw from the surviving distribution.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SamplingParams {
    /// Keep only the `top_k` most probable tokens. 0 disables the filter.
    #[serde(default = "default_top_k")]
    pub top_k: u32,

    /// Keep the smallest descending-probability prefix whose cumulative mass
    /// reaches `top_p`. 1.0 disables the filter.
    #[serde(default = "default_top_p")]
    pub top_p: f32,

    /// Softmax temperature. 0.0 selects greedy argmax.
    #[serde(default = "default_temperature")]
    pub temperature: f32,

    /// Seed for the deterministic sampling RNG.
    #[serde(default = "default_seed")]
    pub seed: u64,
}

fn default_top_k() -> u32 {
    40
}
fn default_top_p() -> f32 {
    0.9
}
fn default_temperature() -> f32 {
    0.4
}
fn default_seed() -> u64 {
    1234
}

impl Default for SamplingParams {
    fn default() -> Self {
        SamplingParams {
            top_k: default_top_k(),
            top_p: default_top_p(),
            temperature: default_temperature(),
            seed: default_seed(),
        }
    }
}

impl SamplingParams {
    /// Greedy decoding: always pick the highest-probability token.
    pub fn greedy() -> Self {
        SamplingParams {
            top_k: 0,
            top_p: 1.0,
            temperature: 0.0,
            seed: default_seed(),
        }
    }

    /// Reject out-of-range parameter combinations.
    pub fn validate(&self) -> Result<()> {
        if !(0.0..=1.0).contains(&self.top_p) {
            return Err(EngineError::InvalidArgument(format!(
                "top_p must be within [0, 1], got {}",
                self.top_p
            )));
        }
        if self.temperature < 0.0 || !self.temperature.is_finite() {
            return Err(EngineError::InvalidArgument(format!(
                "temperature must be finite and non-negative, got {}",
                self.temperature
            )));
        }
        Ok(())
    }
}

/// Configuration fixed at session creation time.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionConfig {
    /// Requested context capacity in tokens. 0 selects the model default;
    /// larger requests are clamped to the model maximum at open time.
    #[serde(default)]
    pub n_ctx: u32,

    /// Initial sampling parameters.
    #[serde(default)]
    pub sampling: SamplingParams,

    /// Soft budget for a single decode step. Steps that overrun it are
    /// counted in the session metrics; the engine never interrupts a step.
    #[serde(default = "default_step_budget", with = "duration_millis")]
    pub step_budget: Duration,
}

fn default_step_budget() -> Duration {
    Duration::from_secs(30)
}

mod duration_millis {
    use super::*;
    use serde::{Deserializer, Serializer};

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> std::result::Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(
        d: D,
    ) -> std::result::Result<Duration, D::Error> {
        let ms = u64::deserialize(d)?;
        Ok(Duration::from_millis(ms))
    }
}

impl Default for SessionConfig {
    fn default() -> Self {
        SessionConfig {
            n_ctx: 0,
            sampling: SamplingParams::default(),
            step_budget: default_step_budget(),
        }
    }
}

impl SessionConfig {
    /// Load a configuration from a JSON file.
    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let data = std::fs::read_to_string(path).map_err(|source| EngineError::FileAccess {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_json_str(&data)
    }

    /// Parse a configuration from a JSON string.
    pub fn from_json_str(data: &str) -> Result<Self> {
        let config: SessionConfig = serde_json::from_str(data)
            .map_err(|e| EngineError::InvalidArgument(format!("config parse failed: {e}")))?;
        config.validate()?;
        Ok(config)
    }

    /// Validate every nested parameter block.
    pub fn validate(&self) -> Result<()> {
        self.sampling.validate()
    }
}
