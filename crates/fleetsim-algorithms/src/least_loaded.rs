//! Least-loaded routing algorithm.
//!
//! Routes each request to the instance with the smallest effective load
//! (queued + running + routed-but-not-yet-queued). This is a simple
//! load-aware strategy that avoids hot spots.

use crate::traits::*;
use rand::RngCore;

/// Least effective load router.
pub struct LeastLoaded;

impl LeastLoaded {
    pub fn new() -> Self {
        Self
    }
}

impl Default for LeastLoaded {
    fn default() -> Self {
        Self::new()
    }
}

impl RoutingAlgorithm for LeastLoaded {
    fn route(
        &mut self,
        _request: &RequestInfo<'_>,
        state: &RouterState<'_>,
        _rng: &mut dyn RngCore,
    ) -> RoutingDecision {
        let idx = least_loaded_index(state.snapshots);
        let best = &state.snapshots[idx];
        RoutingDecision::unscored(best.id, format!("least-loaded (load={})", best.effective_load()))
    }

    fn name(&self) -> &str {
        "least-loaded"
    }
}
