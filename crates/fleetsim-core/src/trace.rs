//! Decision trace for admission and routing.
//!
//! With `trace_level = "decisions"` the cluster records every admission
//! verdict and every routing choice together with the per-instance scores
//! the policy saw. [`TraceSummary`] condenses the records; `regret` is how far
//! the chosen instance's score fell short of the best score available.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AdmissionRecord {
    pub request_id: u64,
    pub clock_us: u64,
    pub admitted: bool,
    pub reason: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RoutingRecord {
    pub request_id: u64,
    pub clock_us: u64,
    pub chosen: u32,
    pub reason: String,
    /// Scores aligned with instance order. Empty for unscored policies.
    pub scores: Vec<f64>,
    pub regret: f64,
}

impl RoutingRecord {
    pub fn new(
        request_id: u64,
        clock_us: u64,
        chosen: u32,
        reason: String,
        scores: Vec<f64>,
    ) -> Self {
        let regret = scores
            .get(chosen as usize)
            .map(|chosen_score| {
                let best = scores.iter().copied().fold(f64::NEG_INFINITY, f64::max);
                (best - chosen_score).max(0.0)
            })
            .unwrap_or(0.0);
        Self {
            request_id,
            clock_us,
            chosen,
            reason,
            scores,
            regret,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DecisionTrace {
    pub admissions: Vec<AdmissionRecord>,
    pub routings: Vec<RoutingRecord>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TraceSummary {
    pub admitted: u64,
    pub rejected: u64,
    pub routed: u64,
    /// Routed requests per instance id.
    pub target_distribution: BTreeMap<u32, u64>,
    pub unique_targets: usize,
    pub mean_regret: f64,
    pub max_regret: f64,
}

impl DecisionTrace {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_admission(&mut self, record: AdmissionRecord) {
        self.admissions.push(record);
    }

    pub fn record_routing(&mut self, record: RoutingRecord) {
        self.routings.push(record);
    }

    pub fn summarize(&self) -> TraceSummary {
        let admitted = self.admissions.iter().filter(|a| a.admitted).count() as u64;
        let mut target_distribution = BTreeMap::new();
        for r in &self.routings {
            *target_distribution.entry(r.chosen).or_insert(0) += 1;
        }
        let regrets: Vec<f64> = self.routings.iter().map(|r| r.regret).collect();
        let mean_regret = if regrets.is_empty() {
            0.0
        } else {
            regrets.iter().sum::<f64>() / regrets.len() as f64
        };
        TraceSummary {
            admitted,
            rejected: self.admissions.len() as u64 - admitted,
            routed: self.routings.len() as u64,
            unique_targets: target_distribution.len(),
            target_distribution,
            mean_regret,
            max_regret: regrets.iter().copied().fold(0.0, f64::max),
        }
    }
}
