//! Error taxonomy for simulation construction and execution.
//!
//! Configuration problems surface as [`ConfigError`](crate::config::ConfigError)
//! before anything runs. Invariant violations indicate a simulator bug and
//! stop the run with the offending state attached. Allocation failure is not
//! an error and never appears here.

use crate::config::ConfigError;
use thiserror::Error;

/// An internal accounting law was broken. The run cannot continue.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum InvariantViolation {
    #[error("clock regression: current={current}us, target={target}us")]
    ClockRegression { current: u64, target: u64 },

    #[error(
        "conservation violated: injected={injected} != completed={completed} + queued={queued} \
         + running={running} + rejected={rejected} + dropped={dropped}"
    )]
    Conservation {
        injected: u64,
        completed: u64,
        queued: u64,
        running: u64,
        rejected: u64,
        dropped: u64,
    },

    #[error("causality violated for request {request_id}: {stage} at {later}us precedes {earlier}us")]
    Causality {
        request_id: u64,
        stage: &'static str,
        earlier: u64,
        later: u64,
    },

    #[error("request {request_id}: {stage} timestamp written twice")]
    TimestampRewritten {
        request_id: u64,
        stage: &'static str,
    },

    #[error("request {request_id}: negative inter-token gap")]
    NegativeInterTokenGap { request_id: u64 },

    #[error("instance {instance}: KV accounting broken, used={used} + free={free} != total={total}")]
    KvAccounting {
        instance: u32,
        used: u64,
        free: u64,
        total: u64,
    },

    #[error("instance {instance}: request {request_id} not found in {location}")]
    MissingRequest {
        instance: u32,
        request_id: u64,
        location: &'static str,
    },

    #[error("request {request_id} not tracked by the cluster ({location})")]
    UntrackedRequest {
        request_id: u64,
        location: &'static str,
    },

    #[error("request {request_id} routed to instance {target}, but only {instances} exist")]
    RouteOutOfRange {
        request_id: u64,
        target: u32,
        instances: u32,
    },
}

/// Failure returned by cluster construction or a simulation run.
#[derive(Error, Debug)]
pub enum SimError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("unknown {kind} '{name}'; available: {available}")]
    UnknownPolicy {
        kind: &'static str,
        name: String,
        available: String,
    },

    #[error("invariant violation: {0}")]
    Invariant(#[from] InvariantViolation),
}
