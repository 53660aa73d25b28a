//! Built-in routing, scoring and admission policies for fleetsim.
//!
//! This crate provides the [`RoutingAlgorithm`] and [`AdmissionPolicy`]
//! traits and the built-in implementations the cluster layer selects by name:
//!
//! | Routing policy | Strategy |
//! |----------------|----------|
//! | [`RoundRobin`] | Cycle through instances |
//! | [`LeastLoaded`] | Fewest queued + running + pending requests |
//! | [`WeightedScoring`] | Weighted sum of pluggable [`Scorer`]s |
//! | [`PrefixAffinity`] | Longest router-side cached prefix |
//! | [`RandomChoice`] | Uniform draw from the router stream |
//!
//! | Admission policy | Strategy |
//! |------------------|----------|
//! | [`AlwaysAdmit`] | Admit everything |
//! | [`TokenBucket`] | Rate limit by input tokens |
//! | [`SloGated`] | Shed non-critical classes under load |
//! | [`RejectAll`] | Reject everything |

pub mod admission;
pub mod least_loaded;
pub mod prefix_affinity;
pub mod prefix_index;
pub mod random;
pub mod round_robin;
pub mod scorers;
pub mod traits;
pub mod weighted;

pub use admission::{AlwaysAdmit, RejectAll, SloGated, SloGatedThresholds, TokenBucket};
pub use least_loaded::LeastLoaded;
pub use prefix_affinity::PrefixAffinity;
pub use prefix_index::{block_hashes, PrefixIndex};
pub use random::RandomChoice;
pub use round_robin::RoundRobin;
pub use scorers::{
    available_scorers, is_valid_scorer, parse_scorer_configs, Scorer, ScorerConfig,
    ScorerSpecError, DEFAULT_SCORERS,
};
pub use traits::*;
pub use weighted::WeightedScoring;

/// Construction parameters shared by the routing registry.
#[derive(Debug, Clone)]
pub struct RoutingParams {
    /// KV block size in tokens, used by prefix-aware policies.
    pub block_size: usize,
    /// Scorer pipeline for the `weighted` policy.
    pub scorers: Vec<ScorerConfig>,
}

/// Construction parameters shared by the admission registry.
#[derive(Debug, Clone)]
pub struct AdmissionParams {
    pub token_bucket_capacity: f64,
    pub token_bucket_refill_rate: f64,
    pub slo_thresholds: SloGatedThresholds,
}

/// Create a routing algorithm by name.
pub fn algorithm_by_name(name: &str, params: &RoutingParams) -> Option<Box<dyn RoutingAlgorithm>> {
    match name {
        "round-robin" => Some(Box::new(RoundRobin::new())),
        "least-loaded" => Some(Box::new(LeastLoaded::new())),
        "weighted" => WeightedScoring::new(&params.scorers, params.block_size)
            .ok()
            .map(|w| Box::new(w) as Box<dyn RoutingAlgorithm>),
        "prefix-affinity" => Some(Box::new(PrefixAffinity::new(params.block_size))),
        "random" => Some(Box::new(RandomChoice::new())),
        _ => None,
    }
}

/// List all available routing policy names.
pub fn available_algorithms() -> Vec<&'static str> {
    vec![
        "round-robin",
        "least-loaded",
        "weighted",
        "prefix-affinity",
        "random",
    ]
}

pub fn is_valid_algorithm(name: &str) -> bool {
    available_algorithms().contains(&name)
}

/// Create an admission policy by name.
pub fn admission_by_name(name: &str, params: &AdmissionParams) -> Option<Box<dyn AdmissionPolicy>> {
    match name {
        "always-admit" => Some(Box::new(AlwaysAdmit)),
        "token-bucket" => Some(Box::new(TokenBucket::new(
            params.token_bucket_capacity,
            params.token_bucket_refill_rate,
        ))),
        "slo-gated" => Some(Box::new(SloGated::new(params.slo_thresholds))),
        "reject-all" => Some(Box::new(RejectAll)),
        _ => None,
    }
}

/// List all available admission policy names.
pub fn available_admission_policies() -> Vec<&'static str> {
    vec!["always-admit", "token-bucket", "slo-gated", "reject-all"]
}

pub fn is_valid_admission_policy(name: &str) -> bool {
    available_admission_policies().contains(&name)
}
