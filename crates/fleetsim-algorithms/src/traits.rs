//! Routing and admission trait definitions.
//!
//! Routing algorithms receive a read-only view of the incoming request and a
//! freshly built snapshot of every instance. Snapshots are produced by the
//! cluster layer immediately before each decision and are never mutated by a
//! policy.

use rand::RngCore;
use serde::{Deserialize, Serialize};

/// Read-only, point-in-time view of one instance, provided to policies.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InstanceSnapshot {
    /// Position of the instance in the cluster (stable across the run).
    pub id: u32,
    /// Requests waiting in the instance's wait queue.
    pub queue_depth: u32,
    /// Requests in the instance's running batch.
    pub batch_size: u32,
    /// Requests routed to the instance that have not reached its queue yet.
    pub pending_requests: u32,
    /// Fraction of KV blocks in use (0.0 - 1.0).
    pub kv_utilization: f64,
    /// KV blocks currently on the free list.
    pub free_kv_blocks: u64,
    /// Committed prefix-cache hit rate so far.
    pub cache_hit_rate: f64,
}

impl InstanceSnapshot {
    /// Load used by every load-aware policy: queued + running + in-flight.
    pub fn effective_load(&self) -> u32 {
        self.queue_depth + self.batch_size + self.pending_requests
    }
}

/// Information about an incoming request, provided to policies.
#[derive(Debug, Clone, Copy)]
pub struct RequestInfo<'a> {
    pub id: u64,
    pub input_tokens: &'a [u32],
    pub output_len: u32,
    pub slo_class: &'a str,
}

impl RequestInfo<'_> {
    pub fn input_len(&self) -> usize {
        self.input_tokens.len()
    }
}

/// Cluster view handed to policies for one decision.
#[derive(Debug, Clone, Copy)]
pub struct RouterState<'a> {
    /// One snapshot per instance, in instance order.
    pub snapshots: &'a [InstanceSnapshot],
    /// Current simulation time in microseconds.
    pub clock_us: u64,
}

/// Decision returned by a routing algorithm.
#[derive(Debug, Clone, PartialEq)]
pub struct RoutingDecision {
    /// Index of the chosen instance.
    pub target: u32,
    /// Short human-readable explanation, recorded in the decision trace.
    pub reason: String,
    /// Per-instance scores aligned with the snapshot order. Empty for
    /// policies that do not score.
    pub scores: Vec<f64>,
}

impl RoutingDecision {
    pub fn unscored(target: u32, reason: impl Into<String>) -> Self {
        Self {
            target,
            reason: reason.into(),
            scores: Vec::new(),
        }
    }
}

/// The core routing algorithm trait.
///
/// The cluster calls [`route`](RoutingAlgorithm::route) once per admitted
/// request, at the request's routing time. `state.snapshots` is never empty.
pub trait RoutingAlgorithm: Send {
    fn route(
        &mut self,
        request: &RequestInfo<'_>,
        state: &RouterState<'_>,
        rng: &mut dyn RngCore,
    ) -> RoutingDecision;

    /// Human-readable name for reports.
    fn name(&self) -> &str;
}

/// Outcome of an admission check.
#[derive(Debug, Clone, PartialEq)]
pub enum AdmissionDecision {
    Admit,
    Reject { reason: String },
}

impl AdmissionDecision {
    pub fn is_admitted(&self) -> bool {
        matches!(self, AdmissionDecision::Admit)
    }
}

/// Predicate over (request, cluster state) deciding whether a request enters
/// the routing pipeline.
pub trait AdmissionPolicy: Send {
    fn admit(&mut self, request: &RequestInfo<'_>, state: &RouterState<'_>) -> AdmissionDecision;

    fn name(&self) -> &str;
}

/// Index of the snapshot with the smallest effective load. Ties go to the
/// first occurrence in snapshot order.
pub fn least_loaded_index(snapshots: &[InstanceSnapshot]) -> usize {
    let mut best = 0;
    for (i, snap) in snapshots.iter().enumerate().skip(1) {
        if snap.effective_load() < snapshots[best].effective_load() {
            best = i;
        }
    }
    best
}

/// Largest effective load across the cluster.
pub fn max_effective_load(snapshots: &[InstanceSnapshot]) -> u32 {
    snapshots
        .iter()
        .map(InstanceSnapshot::effective_load)
        .max()
        .unwrap_or(0)
}
