//! Round-robin routing algorithm.
//!
//! The simplest routing strategy: distributes requests evenly across
//! instances in a circular fashion. Provides good fairness but ignores
//! instance state (queue depth, cache contents, etc.).

use crate::traits::*;
use rand::RngCore;

/// Round-robin router.
///
/// Uses a monotonically increasing counter taken modulo the number of
/// instances, so the rotation only depends on how many requests were routed.
pub struct RoundRobin {
    counter: u64,
}

impl RoundRobin {
    pub fn new() -> Self {
        Self { counter: 0 }
    }
}

impl Default for RoundRobin {
    fn default() -> Self {
        Self::new()
    }
}

impl RoutingAlgorithm for RoundRobin {
    fn route(
        &mut self,
        _request: &RequestInfo<'_>,
        state: &RouterState<'_>,
        _rng: &mut dyn RngCore,
    ) -> RoutingDecision {
        let n = state.snapshots.len().max(1) as u64;
        let idx = (self.counter % n) as usize;
        self.counter += 1;
        let target = state.snapshots.get(idx).map_or(0, |s| s.id);
        RoutingDecision::unscored(target, format!("round-robin[{}]", idx))
    }

    fn name(&self) -> &str {
        "round-robin"
    }
}
