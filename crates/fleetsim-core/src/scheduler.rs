//! Instance-level queue ordering and priority assignment.
//!
//! Both are closed sets selected by name from configuration. Ordering only
//! changes which request batch formation sees first; the concurrency and
//! token budgets are enforced the same way under every ordering.

use crate::queue::WaitQueue;
use crate::request::Request;
use std::cmp::Ordering;

/// Age bonus per microsecond of waiting for `slo-based` priority.
pub const SLO_AGE_WEIGHT_PER_US: f64 = 1e-6;

/// Wait-queue ordering applied before each batch formation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InstanceScheduler {
    /// Arrival order, untouched.
    Fcfs,
    /// Highest priority first, then arrival, then id.
    PriorityFcfs,
    /// Shortest input first, then arrival, then id.
    Sjf,
}

impl InstanceScheduler {
    pub fn by_name(name: &str) -> Option<Self> {
        match name {
            "fcfs" => Some(Self::Fcfs),
            "priority-fcfs" => Some(Self::PriorityFcfs),
            "sjf" => Some(Self::Sjf),
            _ => None,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            Self::Fcfs => "fcfs",
            Self::PriorityFcfs => "priority-fcfs",
            Self::Sjf => "sjf",
        }
    }

    /// Reorder `queue` in place with a stable sort.
    pub fn order(self, queue: &mut WaitQueue) {
        match self {
            Self::Fcfs => {}
            Self::PriorityFcfs => queue.sort_by(|a, b| {
                b.priority
                    .partial_cmp(&a.priority)
                    .unwrap_or(Ordering::Equal)
                    .then(a.arrival_us().cmp(&b.arrival_us()))
                    .then(a.id.cmp(&b.id))
            }),
            Self::Sjf => queue.sort_by(|a, b| {
                a.input_len()
                    .cmp(&b.input_len())
                    .then(a.arrival_us().cmp(&b.arrival_us()))
                    .then(a.id.cmp(&b.id))
            }),
        }
    }
}

pub fn available_schedulers() -> Vec<&'static str> {
    vec!["fcfs", "priority-fcfs", "sjf"]
}

pub fn is_valid_scheduler(name: &str) -> bool {
    InstanceScheduler::by_name(name).is_some()
}

/// Assigns `Request::priority` before each ordering pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PriorityPolicy {
    Constant,
    /// Class base priority plus an aging bonus.
    SloBased,
    /// Negated `SloBased`: newest and least critical first.
    InvertedSlo,
}

impl PriorityPolicy {
    pub fn by_name(name: &str) -> Option<Self> {
        match name {
            "constant" => Some(Self::Constant),
            "slo-based" => Some(Self::SloBased),
            "inverted-slo" => Some(Self::InvertedSlo),
            _ => None,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            Self::Constant => "constant",
            Self::SloBased => "slo-based",
            Self::InvertedSlo => "inverted-slo",
        }
    }

    pub fn compute(self, request: &Request, now_us: u64) -> f64 {
        match self {
            Self::Constant => 0.0,
            Self::SloBased => slo_priority(request, now_us),
            Self::InvertedSlo => -slo_priority(request, now_us),
        }
    }
}

fn slo_priority(request: &Request, now_us: u64) -> f64 {
    let age = now_us.saturating_sub(request.arrival_us()) as f64;
    class_base_priority(&request.slo_class) + SLO_AGE_WEIGHT_PER_US * age
}

/// Base priority of an SLO class. Unlabeled requests rank as `standard`.
pub fn class_base_priority(class: &str) -> f64 {
    match class {
        "critical" => 2.0,
        "" | "standard" => 1.0,
        _ => 0.0,
    }
}

pub fn available_priority_policies() -> Vec<&'static str> {
    vec!["constant", "slo-based", "inverted-slo"]
}

pub fn is_valid_priority_policy(name: &str) -> bool {
    PriorityPolicy::by_name(name).is_some()
}
