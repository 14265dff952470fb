//! Per-session generation metrics.

use std::time::{Duration, Instant};

/// Collects timing data for one session. Updated by the session on every
/// prefill and decode step; cheap enough to keep always-on.
#[derive(Debug, Default)]
pub struct MetricsCollector {
    prefill_tokens: usize,
    prefill_time: Duration,
    decode_steps: usize,
    decode_time: Duration,
    over_budget_steps: usize,
    rounds: usize,
}

/// A point-in-time view of collected metrics.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MetricsSnapshot {
    /// Prompt tokens prefilled across all rounds.
    pub prefill_tokens: usize,
    /// Total wall time spent in prefill.
    pub prefill_time: Duration,
    /// Decode steps taken across all rounds.
    pub decode_steps: usize,
    /// Total wall time spent in decode steps.
    pub decode_time: Duration,
    /// Decode steps that overran the configured step budget.
    pub over_budget_steps: usize,
    /// Completed `set_prompt` rounds.
    pub rounds: usize,
    /// Decode throughput over the session lifetime.
    pub tokens_per_second: f32,
}

impl MetricsCollector {
    /// Fresh collector with all counters at zero.
    pub fn new() -> Self {
        Self::default()
    }

    /// Record one completed prompt prefill.
    pub fn record_prefill(&mut self, tokens: usize, started: Instant) {
        self.prefill_tokens += tokens;
        self.prefill_time += started.elapsed();
        self.rounds += 1;
    }

    /// Record one completed decode step against the session's step budget.
    pub fn record_decode_step(&mut self, started: Instant, budget: Duration) {
        let elapsed = started.elapsed();
        self.decode_steps += 1;
        self.decode_time += elapsed;
        if elapsed > budget {
            self.over_budget_steps += 1;
        }
    }

    /// Point-in-time copy of all counters.
    pub fn snapshot(&self) -> MetricsSnapshot {
        let secs = self.decode_time.as_secs_f32();
        MetricsSnapshot {
            prefill_tokens: self.prefill_tokens,
            prefill_time: self.prefill_time,
            decode_steps: self.decode_steps,
            decode_time: self.decode_time,
            over_budget_steps: self.over_budget_steps,
            rounds: self.rounds,
            tokens_per_second: if secs > 0.0 {
                self.decode_steps as f32 / secs
            } else {
                0.0
            },
        }
    }
}
