//! fleetsim: discrete-event simulator for LLM inference fleets.
//!
//! This crate models a fleet of inference server replicas: per-instance wait
//! queues, continuous batching with chunked prefill and preemption, and a
//! content-addressed KV cache with prefix reuse. A cluster layer admits and
//! routes each request using policies from `fleetsim-algorithms`, evaluated
//! against fresh instance snapshots at the moment of each decision.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────┐     ┌───────────┐     ┌────────────┐     ┌──────────────┐
//! │ Workload │────▶│ Admission │────▶│  Routing   │────▶│   Metrics    │
//! │ (JSONL / │     │  Policy   │     │  (scorer   │     │   + ledger   │
//! │ Poisson) │     └───────────┘     │  pipeline) │     └──────────────┘
//! └──────────┘                       └─────┬──────┘
//!                                          │
//!                    ┌─────────────────────┼─────────────────────┐
//!                    ▼                     ▼                     ▼
//!              ┌──────────┐          ┌──────────┐          ┌──────────┐
//!              │Instance 0│          │Instance 1│          │Instance N│
//!              │ KV cache │          │ KV cache │          │ KV cache │
//!              │ Batching │          │ Batching │          │ Batching │
//!              └──────────┘          └──────────┘          └──────────┘
//! ```
//!
//! Every component shares one event queue and one logical clock. Runs are
//! deterministic: the same configuration and seed produce byte-identical
//! serialized reports.

pub mod batch;
pub mod clock;
pub mod cluster;
pub mod config;
pub mod engine;
pub mod error;
pub mod instance;
pub mod kv_cache;
pub mod latency;
pub mod metrics;
pub mod queue;
pub mod request;
pub mod rng;
pub mod scheduler;
pub mod trace;
pub mod workload;

// Re-export key types for convenience.
pub use clock::SimClock;
pub use cluster::{ClusterEvent, ClusterSimulator, SimulationReport};
pub use config::{ConfigError, SimConfig};
pub use engine::EventQueue;
pub use error::{InvariantViolation, SimError};
pub use instance::{InstanceEvent, InstanceSettings, InstanceSimulator, InstanceStats};
pub use kv_cache::{KvCacheSimulator, KvCacheStats, KvStore, TieredKvCache};
pub use metrics::{MetricsCollector, Percentiles, RequestOutcome, RequestRecord, SimulationMetrics};
pub use request::{Request, Stage};
pub use rng::PartitionedRng;
pub use trace::{DecisionTrace, TraceSummary};
pub use workload::WorkloadError;

/// Run a complete simulation of `requests` under `config`.
pub fn run_simulation(
    config: SimConfig,
    requests: Vec<Request>,
) -> Result<SimulationReport, SimError> {
    ClusterSimulator::new(config, requests)?.run()
}

/// Run the same config and requests once per routing policy.
///
/// Each run gets a fresh cluster, so one policy's state never leaks into the
/// next. Fails on the first unknown policy name.
pub fn compare_policies(
    config: &SimConfig,
    requests: &[Request],
    policy_names: &[&str],
) -> Result<Vec<SimulationReport>, SimError> {
    policy_names
        .iter()
        .map(|name| {
            let cfg = config.with_routing_policy(name)?;
            run_simulation(cfg, requests.to_vec())
        })
        .collect()
}
