//! Prefix-cache-aware routing algorithm.
//!
//! Maximizes KV cache reuse by routing requests to the instance the router
//! believes holds the longest cached prefix of the request's input. Falls
//! back to least-loaded when no instance holds any of it.

use crate::prefix_index::{PrefixIndex, DEFAULT_INDEX_CAPACITY};
use crate::traits::*;
use rand::RngCore;

/// Prefix-cache-aware router.
///
/// Strategy:
/// 1. Among instances with at least one matching leading block, pick the
///    longest match; break ties by lower effective load, then snapshot order.
/// 2. If nothing matches, route to the least loaded instance.
pub struct PrefixAffinity {
    index: PrefixIndex,
}

impl PrefixAffinity {
    pub fn new(block_size: usize) -> Self {
        Self {
            index: PrefixIndex::new(block_size, DEFAULT_INDEX_CAPACITY),
        }
    }
}

impl RoutingAlgorithm for PrefixAffinity {
    fn route(
        &mut self,
        request: &RequestInfo<'_>,
        state: &RouterState<'_>,
        _rng: &mut dyn RngCore,
    ) -> RoutingDecision {
        let hashes = self.index.hashes_for(request.input_tokens);

        let mut best: Option<(usize, usize)> = None;
        for (i, snap) in state.snapshots.iter().enumerate() {
            let matched = self.index.matched_blocks(&hashes, snap.id);
            if matched == 0 {
                continue;
            }
            let better = match best {
                None => true,
                Some((best_i, best_matched)) => {
                    matched > best_matched
                        || (matched == best_matched
                            && snap.effective_load() < state.snapshots[best_i].effective_load())
                }
            };
            if better {
                best = Some((i, matched));
            }
        }

        let (idx, reason) = match best {
            Some((i, matched)) => (i, format!("prefix-affinity ({} blocks)", matched)),
            None => (
                least_loaded_index(state.snapshots),
                "prefix-affinity fallback least-loaded".to_string(),
            ),
        };
        let target = state.snapshots.get(idx).map_or(0, |s| s.id);
        self.index.record(&hashes, target);
        RoutingDecision::unscored(target, reason)
    }

    fn name(&self) -> &str {
        "prefix-affinity"
    }
}
