//! Next-token sampling.
//!
//! The filter pipeline is fixed: top-k truncation, then top-p nucleus cut
//! over the untempered cumulative probability mass (tokens sorted by
//! descending probability, ties broken by lowest token id), then a
//! temperature-scaled draw from a deterministic seeded RNG. Temperature
//! never changes which tokens survive the cuts, only how the draw weighs
//! the survivors. Given the same seed and the same
//! sequence of logit vectors, the sampler always picks the same tokens.

use std::cmp::Ordering;

use crate::config::SamplingParams;
use crate::error::{EngineError, Result};

/// Deterministic xorshift64 RNG.
#[derive(Debug, Clone)]
pub struct SeededRng {
    state: u64,
}

impl SeededRng {
    /// Seed the generator. All draws are determined by the seed alone.
    pub fn new(seed: u64) -> Self {
        // Zero state would be a fixed point.
        SeededRng {
            state: if seed == 0 { 0x9e37_79b9_7f4a_7c15 } else { seed },
        }
    }

    /// Next value in `[0, 1)`.
    pub fn next_f32(&mut self) -> f32 {
        self.state ^= self.state << 13;
        self.state ^= self.state >> 7;
        self.state ^= self.state << 17;
        (self.state >> 40) as f32 / (1u64 << 24) as f32
    }
}

/// Stateful sampler for one generation round.
#[derive(Debug, Clone)]
pub struct Sampler {
    params: SamplingParams,
    rng: SeededRng,
    calls: u64,
}

impl Sampler {
    /// Build a sampler seeded from `params.seed`. Each generation round
    /// starts from a fresh sampler so identical rounds draw identically.
    pub fn new(params: SamplingParams) -> Self {
        Sampler {
            rng: SeededRng::new(params.seed),
            params,
            calls: 0,
        }
    }

    /// The parameters this sampler was built with.
    pub fn params(&self) -> &SamplingParams {
        &self.params
    }

    /// Decode-step draws taken so far this round.
    pub fn calls(&self) -> u64 {
        self.calls
    }

    /// Select the next token id from raw logits.
    pub fn sample(&mut self, logits: &[f32]) -> Result<u32> {
        if logits.is_empty() {
            return Err(EngineError::InvalidArgument("empty logits".into()));
        }
        self.calls += 1;

        // Temperature zero short-circuits to argmax, lowest id on ties.
        if self.params.temperature == 0.0 {
            return Ok(argmax(logits));
        }

        // Descending probability order with ties broken by lowest token id,
        // applied to logits (monotone with probabilities).
        let mut ranked: Vec<(u32, f32)> = logits
            .iter()
            .enumerate()
            .map(|(id, &logit)| (id as u32, logit))
            .collect();
        ranked.sort_by(|a, b| {
            b.1.partial_cmp(&a.1)
                .unwrap_or(Ordering::Equal)
                .then_with(|| a.0.cmp(&b.0))
        });

        // Top-k truncation before the nucleus cut.
        if self.params.top_k > 0 {
            ranked.truncate(self.params.top_k as usize);
        }

        // Plain softmax over the survivors: the nucleus cut works on the
        // untempered probability mass.
        let max_logit = ranked[0].1;
        let mut probs: Vec<f32> = ranked
            .iter()
            .map(|&(_, logit)| (logit - max_logit).exp())
            .collect();
        let sum: f32 = probs.iter().sum();
        for p in &mut probs {
            *p /= sum;
        }

        // Nucleus cut: keep the smallest prefix of cumulative mass >= top_p,
        // always including the boundary token.
        if self.params.top_p < 1.0 {
            let mut cumulative = 0.0;
            let mut keep = probs.len();
            for (i, &p) in probs.iter().enumerate() {
                cumulative += p;
                if cumulative >= self.params.top_p {
                    keep = i + 1;
                    break;
                }
            }
            ranked.truncate(keep);
        }

        // Temperature reshapes only the draw distribution, after both cuts.
        let inv_temp = 1.0 / self.params.temperature;
        let mut draw: Vec<f32> = ranked
            .iter()
            .map(|&(_, logit)| ((logit - max_logit) * inv_temp).exp())
            .collect();
        let sum: f32 = draw.iter().sum();
        for p in &mut draw {
            *p /= sum;
        }

        // Seeded draw from the remaining distribution.
        let r = self.rng.next_f32();
        let mut cumulative = 0.0;
        for (&(id, _), &p) in ranked.iter().zip(&draw) {
            cumulative += p;
            if r < cumulative {
                return Ok(id);
            }
        }
        // Rounding left a sliver beyond the last bucket.
        Ok(ranked[ranked.len() - 1].0)
    }
}

/// Highest logit, lowest token id on ties.
fn argmax(logits: &[f32]) -> u32 {
    let mut best = 0;
    let mut best_score = f32::NEG_INFINITY;
    for (id, &score) in logits.iter().enumerate() {
        if score > best_score {
            best_score = score;
            best = id;
        }
    }
    best as u32
}

#[cfg(test)]
mod tests {
    use super::*;

    fn params(top_k: u32, top_p: f32, temperature: f32, seed: u64) -> SamplingParams {
        SamplingParams {
            top_k,
            top_p,
            temperature,
            seed,
        }
    }

    #[test]
    fn rng_reproducible() {
        let mut a = SeededRng::new(1234);
        let mut b = SeededRng::new(1234);
        for _ in 0..100 {
            let (x, y) = (a.next_f32(), b.next_f32());
            assert_eq!(x, y);
            assert!((0.0..1.0).contains(&x));
        }
    }

    #[test]
    fn zero_seed_does_not_stick() {
        let mut rng = SeededRng::new(0);
        let first = rng.next_f32();
        let second = rng.next_f32();
        assert_ne!(first, second);
    }

    #[test]
    fn greedy_at_zero_temperature() {
        let mut sampler = Sampler::new(params(0, 1.0, 0.0, 1));
        assert_eq!(sampler.sample(&[1.0, 9.0, 2.0]).unwrap(), 1);
    }

    #[test]
    fn greedy_tie_prefers_lowest_id() {
        let mut sampler = Sampler::new(params(0, 1.0, 0.0, 1));
        assert_eq!(sampler.sample(&[5.0, 5.0, 5.0]).unwrap(), 0);
    }

    #[test]
    fn top_k_one_is_greedy_regardless_of_seed() {
        for seed in [1, 7, 99] {
            let mut sampler = Sampler::new(params(1, 1.0, 0.8, seed));
            for _ in 0..10 {
                assert_eq!(sampler.sample(&[0.1, 3.0, 0.2]).unwrap(), 1);
            }
        }
    }

    #[test]
    fn nucleus_excludes_tail() {
        // Probabilities roughly 0.84 / 0.11 / 0.04 / ...: top_p = 0.5 keeps
        // only the first-ranked token.
        let logits = [8.0, 6.0, 5.0, 1.0];
        let mut sampler = Sampler::new(params(0, 0.5, 1.0, 42));
        for _ in 0..50 {
            assert_eq!(sampler.sample(&logits).unwrap(), 0);
        }
    }

    #[test]
    fn nucleus_cut_uses_untempered_distribution() {
        // Raw mass for [1.0, 0.0] is about [0.73, 0.27], so top_p = 0.8
        // keeps both tokens. A sharp temperature must not shrink the
        // nucleus; it only biases the draw, leaving token 1 reachable.
        let logits = [1.0, 0.0];
        let mut saw_runner_up = false;
        for seed in 1..=500 {
            let mut sampler = Sampler::new(params(0, 0.8, 0.4, seed));
            if sampler.sample(&logits).unwrap() == 1 {
                saw_runner_up = true;
                break;
            }
        }
        assert!(
            saw_runner_up,
            "token 1 is inside the top_p nucleus and must remain sampleable"
        );
    }

    #[test]
    fn identical_seeds_draw_identical_sequences() {
        let logits = [1.0, 1.1, 0.9, 1.05, 0.7];
        let mut a = Sampler::new(params(4, 0.9, 0.8, 1234));
        let mut b = Sampler::new(params(4, 0.9, 0.8, 1234));
        for _ in 0..64 {
            assert_eq!(a.sample(&logits).unwrap(), b.sample(&logits).unwrap());
        }
    }

    #[test]
    fn different_seeds_diverge() {
        let logits = [1.0; 16];
        let mut a = Sampler::new(params(0, 1.0, 1.0, 1));
        let mut b = Sampler::new(params(0, 1.0, 1.0, 2));
        let seq_a: Vec<u32> = (0..32).map(|_| a.sample(&logits).unwrap()).collect();
        let seq_b: Vec<u32> = (0..32).map(|_| b.sample(&logits).unwrap()).collect();
        assert_ne!(seq_a, seq_b);
    }

    #[test]
    fn sampled_ids_stay_in_filtered_set() {
        // top_k = 2 restricts draws to the two best ids (1 and 3).
        let logits = [0.1, 4.0, 0.2, 3.5, 0.3];
        let mut sampler = Sampler::new(params(2, 1.0, 1.5, 7));
        for _ in 0..100 {
            let id = sampler.sample(&logits).unwrap();
            assert!(id == 1 || id == 3);
        }
    }

    #[test]
    fn empty_logits_rejected() {
        let mut sampler = Sampler::new(SamplingParams::default());
        assert_eq!(sampler.sample(&[]).unwrap_err().status_code(), -1);
    }

    #[test]
    fn call_counter_advances() {
        let mut sampler = Sampler::new(SamplingParams::default());
        sampler.sample(&[1.0, 2.0]).unwrap();
        sampler.sample(&[1.0, 2.0]).unwrap();
        assert_eq!(sampler.calls(), 2);
    }
}
