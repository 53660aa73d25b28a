//! Linear blackbox latency model.
//!
//! Step time grows linearly with the prefill and decode tokens scheduled in a
//! batch. Queueing delay between routing and instance enqueue grows with the
//! prompt length, and a fixed output-processing cost is added to completion.
//! All coefficients are in microseconds.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LatencyModel {
    /// `[base, per_prefill_token, per_decode_token]` for one batch step.
    pub beta: [f64; 3],
    /// `[base, per_input_token, output_processing]`.
    pub alpha: [f64; 3],
}

impl Default for LatencyModel {
    fn default() -> Self {
        Self {
            beta: [5_000.0, 20.0, 200.0],
            alpha: [500.0, 1.0, 100.0],
        }
    }
}

impl LatencyModel {
    pub fn new(beta: [f64; 3], alpha: [f64; 3]) -> Self {
        Self { beta, alpha }
    }

    /// Duration of one batch step. Never zero, so the clock always advances
    /// between consecutive steps of the same instance.
    pub fn step_time_us(&self, prefill_tokens: usize, decode_tokens: usize) -> u64 {
        let t = self.beta[0]
            + self.beta[1] * prefill_tokens as f64
            + self.beta[2] * decode_tokens as f64;
        to_us(t).max(1)
    }

    /// Delay between the routing decision and enqueue on the instance.
    pub fn queueing_delay_us(&self, input_len: usize) -> u64 {
        to_us(self.alpha[0] + self.alpha[1] * input_len as f64)
    }

    /// Delay between the last token and the completion timestamp.
    pub fn output_processing_us(&self) -> u64 {
        to_us(self.alpha[2])
    }
}

fn to_us(v: f64) -> u64 {
    if v.is_finite() && v > 0.0 {
        v as u64
    } else {
        0
    }
}
