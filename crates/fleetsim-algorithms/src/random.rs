//! Uniform random routing.
//!
//! Draws from the caller-supplied stream, which the cluster derives from the
//! `router` subsystem of its partitioned random source.

use crate::traits::*;
use rand::{Rng, RngCore};

pub struct RandomChoice;

impl RandomChoice {
    pub fn new() -> Self {
        Self
    }
}

impl Default for RandomChoice {
    fn default() -> Self {
        Self::new()
    }
}

impl RoutingAlgorithm for RandomChoice {
    fn route(
        &mut self,
        _request: &RequestInfo<'_>,
        state: &RouterState<'_>,
        rng: &mut dyn RngCore,
    ) -> RoutingDecision {
        let idx = rng.gen_range(0..state.snapshots.len().max(1));
        let target = state.snapshots.get(idx).map_or(0, |s| s.id);
        RoutingDecision::unscored(target, "random")
    }

    fn name(&self) -> &str {
        "random"
    }
}
