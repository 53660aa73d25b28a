//! Admission policies.
//!
//! Admission runs before routing. A rejected request never reaches an
//! instance; the cluster counts every rejection.

use crate::traits::*;

/// Admit everything.
pub struct AlwaysAdmit;

impl AdmissionPolicy for AlwaysAdmit {
    fn admit(&mut self, _request: &RequestInfo<'_>, _state: &RouterState<'_>) -> AdmissionDecision {
        AdmissionDecision::Admit
    }

    fn name(&self) -> &str {
        "always-admit"
    }
}

/// Reject everything. Useful for exercising the rejection accounting.
pub struct RejectAll;

impl AdmissionPolicy for RejectAll {
    fn admit(&mut self, _request: &RequestInfo<'_>, _state: &RouterState<'_>) -> AdmissionDecision {
        AdmissionDecision::Reject {
            reason: "reject-all".to_string(),
        }
    }

    fn name(&self) -> &str {
        "reject-all"
    }
}

/// Token bucket rate limiter charging one token per input token.
///
/// The bucket starts full and refills continuously at `refill_rate` tokens
/// per simulated second, capped at `capacity`.
pub struct TokenBucket {
    capacity: f64,
    refill_rate: f64,
    current: f64,
    last_refill_us: u64,
}

impl TokenBucket {
    pub fn new(capacity: f64, refill_rate: f64) -> Self {
        Self {
            capacity,
            refill_rate,
            current: capacity,
            last_refill_us: 0,
        }
    }

    /// Tokens currently available.
    pub fn available(&self) -> f64 {
        self.current
    }
}

impl AdmissionPolicy for TokenBucket {
    fn admit(&mut self, request: &RequestInfo<'_>, state: &RouterState<'_>) -> AdmissionDecision {
        if state.clock_us > self.last_refill_us {
            let elapsed = (state.clock_us - self.last_refill_us) as f64;
            self.current = (self.current + elapsed * self.refill_rate / 1e6).min(self.capacity);
            self.last_refill_us = state.clock_us;
        }
        let cost = request.input_len() as f64;
        if self.current >= cost {
            self.current -= cost;
            AdmissionDecision::Admit
        } else {
            AdmissionDecision::Reject {
                reason: format!(
                    "token-bucket: insufficient tokens ({:.1} < {:.0})",
                    self.current, cost
                ),
            }
        }
    }

    fn name(&self) -> &str {
        "token-bucket"
    }
}

/// Thresholds for [`SloGated`].
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SloGatedThresholds {
    /// Reject `standard` (or unlabeled) requests at or above this max queue depth.
    pub standard_queue_threshold: u32,
    /// Reject every other non-critical class at or above this max queue depth.
    pub sheddable_queue_threshold: u32,
}

impl Default for SloGatedThresholds {
    fn default() -> Self {
        Self {
            standard_queue_threshold: 10,
            sheddable_queue_threshold: 5,
        }
    }
}

/// Load shedding by SLO class.
///
/// `critical` is always admitted. Other classes are rejected once the
/// deepest wait queue in the cluster reaches their class threshold.
pub struct SloGated {
    thresholds: SloGatedThresholds,
}

impl SloGated {
    pub fn new(thresholds: SloGatedThresholds) -> Self {
        Self { thresholds }
    }
}

impl AdmissionPolicy for SloGated {
    fn admit(&mut self, request: &RequestInfo<'_>, state: &RouterState<'_>) -> AdmissionDecision {
        if request.slo_class == "critical" {
            return AdmissionDecision::Admit;
        }
        let max_queue = state
            .snapshots
            .iter()
            .map(|s| s.queue_depth)
            .max()
            .unwrap_or(0);

        let (class, threshold) = match request.slo_class {
            "" | "standard" => ("standard", self.thresholds.standard_queue_threshold),
            other => (other, self.thresholds.sheddable_queue_threshold),
        };
        if max_queue >= threshold {
            AdmissionDecision::Reject {
                reason: format!(
                    "slo-gated: {} rejected (max queue {} >= {})",
                    class, max_queue, threshold
                ),
            }
        } else {
            AdmissionDecision::Admit
        }
    }

    fn name(&self) -> &str {
        "slo-gated"
    }
}
