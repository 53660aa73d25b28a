//! Weighted scorer pipeline.
//!
//! Combines an ordered list of `(scorer, weight)` pairs. Weights are
//! normalized to sum to 1 at construction, so proportional weight vectors
//! make identical decisions. The decision is the instance with the strictly
//! greatest weighted sum; ties go to the first instance in snapshot order.

use crate::scorers::{normalize_weights, scorer_by_name, Scorer, ScorerConfig, ScorerSpecError};
use crate::traits::*;
use rand::RngCore;
use tracing::trace;

pub struct WeightedScoring {
    scorers: Vec<Box<dyn Scorer>>,
    weights: Vec<f64>,
}

impl WeightedScoring {
    /// Build a pipeline from validated configs.
    pub fn new(configs: &[ScorerConfig], block_size: usize) -> Result<Self, ScorerSpecError> {
        if configs.is_empty() {
            return Err(ScorerSpecError::Empty);
        }
        let mut scorers = Vec::with_capacity(configs.len());
        for cfg in configs {
            if !cfg.weight.is_finite() || cfg.weight <= 0.0 {
                return Err(ScorerSpecError::InvalidWeight {
                    name: cfg.name.clone(),
                    weight: cfg.weight,
                });
            }
            let scorer =
                scorer_by_name(&cfg.name, block_size).ok_or_else(|| ScorerSpecError::Unknown {
                    name: cfg.name.clone(),
                    valid: crate::scorers::available_scorers().join(", "),
                })?;
            scorers.push(scorer);
        }
        Ok(Self {
            scorers,
            weights: normalize_weights(configs),
        })
    }

    /// Normalized weights in pipeline order.
    pub fn weights(&self) -> &[f64] {
        &self.weights
    }

    /// Weighted per-instance totals, each scorer's output clamped to [0, 1].
    pub fn combined_scores(
        &self,
        request: &RequestInfo<'_>,
        snapshots: &[InstanceSnapshot],
    ) -> Vec<f64> {
        let mut totals = vec![0.0; snapshots.len()];
        for (scorer, &weight) in self.scorers.iter().zip(&self.weights) {
            let scores = scorer.score(request, snapshots);
            for (total, s) in totals.iter_mut().zip(scores) {
                *total += s.clamp(0.0, 1.0) * weight;
            }
        }
        totals
    }
}

/// Index of the strictly greatest score; the first occurrence wins ties.
pub fn argmax_first(scores: &[f64]) -> usize {
    let mut best_idx = 0;
    let mut best_score = -1.0;
    for (i, &s) in scores.iter().enumerate() {
        if s > best_score {
            best_score = s;
            best_idx = i;
        }
    }
    best_idx
}

impl RoutingAlgorithm for WeightedScoring {
    fn route(
        &mut self,
        request: &RequestInfo<'_>,
        state: &RouterState<'_>,
        _rng: &mut dyn RngCore,
    ) -> RoutingDecision {
        let scores = self.combined_scores(request, state.snapshots);
        let idx = argmax_first(&scores);
        let target = state.snapshots.get(idx).map_or(0, |s| s.id);

        for scorer in &mut self.scorers {
            scorer.observe(request, target);
        }
        trace!(request = request.id, instance = target, "weighted routing decision");

        RoutingDecision {
            target,
            reason: format!("weighted (score={:.3})", scores.get(idx).copied().unwrap_or(0.0)),
            scores,
        }
    }

    fn name(&self) -> &str {
        "weighted"
    }
}
