//! Scorers for the weighted routing pipeline.
//!
//! Each scorer maps the snapshot set to one score per instance in `[0, 1]`,
//! aligned with snapshot order. Scoring is a pure function of the request and
//! the snapshots; stateful scorers update themselves only through
//! [`Scorer::observe`], which the pipeline calls after each decision.

use crate::prefix_index::{PrefixIndex, DEFAULT_INDEX_CAPACITY};
use crate::traits::{InstanceSnapshot, RequestInfo};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use thiserror::Error;

/// Pipeline used when no scorer list is configured.
pub const DEFAULT_SCORERS: &str = "prefix-affinity:3,queue-depth:2,kv-utilization:2";

#[derive(Error, Debug, Clone, PartialEq)]
pub enum ScorerSpecError {
    #[error("scorer list is empty")]
    Empty,
    #[error("malformed scorer entry '{0}', expected name:weight")]
    Malformed(String),
    #[error("unknown scorer '{name}'; valid scorers: {valid}")]
    Unknown { name: String, valid: String },
    #[error("duplicate scorer '{0}'")]
    Duplicate(String),
    #[error("scorer '{name}' has invalid weight {weight}; weights must be finite and > 0")]
    InvalidWeight { name: String, weight: f64 },
}

/// One `(name, weight)` entry of a scorer pipeline.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScorerConfig {
    pub name: String,
    pub weight: f64,
}

/// A per-instance scoring function.
pub trait Scorer: Send {
    fn name(&self) -> &str;

    fn score(&self, request: &RequestInfo<'_>, snapshots: &[InstanceSnapshot]) -> Vec<f64>;

    /// Called with the chosen instance after every routing decision.
    fn observe(&mut self, _request: &RequestInfo<'_>, _target: u32) {}
}

/// Min-max normalized inverse of effective load. Lowest load scores 1.0; when
/// every instance has the same load all score 1.0.
pub struct QueueDepthScorer;

impl Scorer for QueueDepthScorer {
    fn name(&self) -> &str {
        "queue-depth"
    }

    fn score(&self, _request: &RequestInfo<'_>, snapshots: &[InstanceSnapshot]) -> Vec<f64> {
        let loads: Vec<u32> = snapshots.iter().map(|s| s.effective_load()).collect();
        let min = loads.iter().copied().min().unwrap_or(0);
        let max = loads.iter().copied().max().unwrap_or(0);
        if max == min {
            return vec![1.0; loads.len()];
        }
        let range = (max - min) as f64;
        loads
            .iter()
            .map(|&l| (max - l) as f64 / range)
            .collect()
    }
}

/// Free KV capacity: `1 - utilization`.
pub struct KvUtilizationScorer;

impl Scorer for KvUtilizationScorer {
    fn name(&self) -> &str {
        "kv-utilization"
    }

    fn score(&self, _request: &RequestInfo<'_>, snapshots: &[InstanceSnapshot]) -> Vec<f64> {
        snapshots.iter().map(|s| 1.0 - s.kv_utilization).collect()
    }
}

/// Inverse load transform `1 / (1 + effective_load)`.
pub struct LoadBalanceScorer;

impl Scorer for LoadBalanceScorer {
    fn name(&self) -> &str {
        "load-balance"
    }

    fn score(&self, _request: &RequestInfo<'_>, snapshots: &[InstanceSnapshot]) -> Vec<f64> {
        snapshots
            .iter()
            .map(|s| 1.0 / (1.0 + s.effective_load() as f64))
            .collect()
    }
}

/// Fraction of the request's full input blocks the router believes are
/// already cached on each instance.
pub struct PrefixAffinityScorer {
    index: PrefixIndex,
}

impl PrefixAffinityScorer {
    pub fn new(block_size: usize) -> Self {
        Self {
            index: PrefixIndex::new(block_size, DEFAULT_INDEX_CAPACITY),
        }
    }
}

impl Scorer for PrefixAffinityScorer {
    fn name(&self) -> &str {
        "prefix-affinity"
    }

    fn score(&self, request: &RequestInfo<'_>, snapshots: &[InstanceSnapshot]) -> Vec<f64> {
        let hashes = self.index.hashes_for(request.input_tokens);
        if hashes.is_empty() {
            return vec![0.0; snapshots.len()];
        }
        let total = hashes.len() as f64;
        snapshots
            .iter()
            .map(|s| self.index.matched_blocks(&hashes, s.id) as f64 / total)
            .collect()
    }

    fn observe(&mut self, request: &RequestInfo<'_>, target: u32) {
        let hashes = self.index.hashes_for(request.input_tokens);
        self.index.record(&hashes, target);
    }
}

/// Names accepted by [`scorer_by_name`].
pub fn available_scorers() -> Vec<&'static str> {
    vec!["queue-depth", "kv-utilization", "load-balance", "prefix-affinity"]
}

pub fn is_valid_scorer(name: &str) -> bool {
    available_scorers().contains(&name)
}

/// Create a scorer by name. `block_size` is used by prefix-aware scorers.
pub fn scorer_by_name(name: &str, block_size: usize) -> Option<Box<dyn Scorer>> {
    match name {
        "queue-depth" => Some(Box::new(QueueDepthScorer)),
        "kv-utilization" => Some(Box::new(KvUtilizationScorer)),
        "load-balance" => Some(Box::new(LoadBalanceScorer)),
        "prefix-affinity" => Some(Box::new(PrefixAffinityScorer::new(block_size))),
        _ => None,
    }
}

/// Parse a `"name:weight,name:weight"` scorer list.
///
/// Rejects unknown names, duplicates, and weights that are not finite and
/// strictly positive.
pub fn parse_scorer_configs(spec: &str) -> Result<Vec<ScorerConfig>, ScorerSpecError> {
    let mut configs = Vec::new();
    let mut seen = HashSet::new();
    for entry in spec.split(',').map(str::trim).filter(|e| !e.is_empty()) {
        let (name, weight) = entry
            .split_once(':')
            .ok_or_else(|| ScorerSpecError::Malformed(entry.to_string()))?;
        let name = name.trim();
        let weight: f64 = weight
            .trim()
            .parse()
            .map_err(|_| ScorerSpecError::Malformed(entry.to_string()))?;
        if !is_valid_scorer(name) {
            return Err(ScorerSpecError::Unknown {
                name: name.to_string(),
                valid: available_scorers().join(", "),
            });
        }
        if !weight.is_finite() || weight <= 0.0 {
            return Err(ScorerSpecError::InvalidWeight {
                name: name.to_string(),
                weight,
            });
        }
        if !seen.insert(name.to_string()) {
            return Err(ScorerSpecError::Duplicate(name.to_string()));
        }
        configs.push(ScorerConfig {
            name: name.to_string(),
            weight,
        });
    }
    if configs.is_empty() {
        return Err(ScorerSpecError::Empty);
    }
    Ok(configs)
}

/// Scale weights so they sum to 1.
pub fn normalize_weights(configs: &[ScorerConfig]) -> Vec<f64> {
    let total: f64 = configs.iter().map(|c| c.weight).sum();
    if total <= 0.0 {
        return vec![0.0; configs.len()];
    }
    configs.iter().map(|c| c.weight / total).collect()
}
