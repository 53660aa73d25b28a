//! Metrics collection and aggregation for simulation runs.
//!
//! Tracks per-request lifecycle records, latency distributions (TTFT,
//! end-to-end, inter-token, scheduling delay), throughput, cache and
//! preemption counters, and the conservation ledger. Everything here is a
//! pure function of simulated time; wall-clock measurements live in
//! [`RunDiagnostics`] and never enter the comparable output.

use crate::error::InvariantViolation;
use crate::instance::InstanceStats;
use crate::request::{Request, Stage};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Where a request ended up when the run stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RequestOutcome {
    Completed,
    Rejected,
    DroppedUnservable,
    /// Admitted but not yet on an instance queue when the horizon hit.
    InPipeline,
    Queued,
    Running,
}

/// Per-request record, written once the request leaves active tracking.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RequestRecord {
    pub id: u64,
    pub instance: Option<u32>,
    pub slo_class: String,
    pub input_len: u32,
    pub output_len: u32,
    pub outcome: RequestOutcome,
    pub arrival_us: u64,
    pub admission_us: Option<u64>,
    pub route_us: Option<u64>,
    pub enqueue_us: Option<u64>,
    pub schedule_us: Option<u64>,
    pub first_token_us: Option<u64>,
    pub completion_us: Option<u64>,
    pub output_tokens_emitted: u32,
    pub preemptions: u32,
}

impl RequestRecord {
    pub fn from_request(request: &Request, instance: Option<u32>, outcome: RequestOutcome) -> Self {
        let lc = &request.lifecycle;
        Self {
            id: request.id,
            instance,
            slo_class: request.slo_class.clone(),
            input_len: request.input_len() as u32,
            output_len: request.output_len() as u32,
            outcome,
            arrival_us: request.arrival_us(),
            admission_us: lc.get(Stage::Admission),
            route_us: lc.get(Stage::Route),
            enqueue_us: lc.get(Stage::Enqueue),
            schedule_us: lc.get(Stage::Schedule),
            first_token_us: lc.get(Stage::FirstToken),
            completion_us: lc.get(Stage::Completion),
            output_tokens_emitted: request.emitted_tokens as u32,
            preemptions: request.preemptions,
        }
    }

    pub fn ttft_us(&self) -> Option<u64> {
        self.first_token_us.map(|t| t - self.arrival_us)
    }

    pub fn e2e_us(&self) -> Option<u64> {
        self.completion_us.map(|t| t - self.arrival_us)
    }

    /// Time from instance enqueue to first scheduling.
    pub fn scheduling_delay_us(&self) -> Option<u64> {
        match (self.enqueue_us, self.schedule_us) {
            (Some(e), Some(s)) => Some(s - e),
            _ => None,
        }
    }
}

/// Percentile values for a distribution.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Percentiles {
    pub p50: f64,
    pub p90: f64,
    pub p95: f64,
    pub p99: f64,
    pub min: f64,
    pub max: f64,
    pub mean: f64,
    pub count: usize,
}

impl Percentiles {
    /// Compute percentiles from a slice of values.
    pub fn from_values(values: &[f64]) -> Self {
        if values.is_empty() {
            return Self::default();
        }
        let mut sorted = values.to_vec();
        sorted.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));
        let n = sorted.len();
        let mean = sorted.iter().sum::<f64>() / n as f64;

        Self {
            p50: percentile_sorted(&sorted, 50.0),
            p90: percentile_sorted(&sorted, 90.0),
            p95: percentile_sorted(&sorted, 95.0),
            p99: percentile_sorted(&sorted, 99.0),
            min: sorted[0],
            max: sorted[n - 1],
            mean,
            count: n,
        }
    }

    /// Percentiles in milliseconds from microsecond samples.
    pub fn from_us(values_us: &[u64]) -> Self {
        let ms: Vec<f64> = values_us.iter().map(|&v| v as f64 / 1000.0).collect();
        Self::from_values(&ms)
    }
}

fn percentile_sorted(sorted: &[f64], p: f64) -> f64 {
    if sorted.is_empty() {
        return 0.0;
    }
    let idx = (p / 100.0 * (sorted.len() - 1) as f64).round() as usize;
    sorted[idx.min(sorted.len() - 1)]
}

/// Latency breakdown for one SLO class.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClassMetrics {
    pub completed: u64,
    pub rejected: u64,
    pub ttft: Percentiles,
    pub e2e: Percentiles,
}

/// Aggregated, deterministic metrics for one run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SimulationMetrics {
    pub name: String,
    /// Routing policy name.
    pub policy: String,
    pub admission_policy: String,
    pub num_instances: u32,

    // Conservation ledger
    pub injected: u64,
    pub completed: u64,
    pub still_queued: u64,
    pub still_running: u64,
    pub rejected: u64,
    pub dropped_unservable: u64,
    pub rejection_reasons: BTreeMap<String, u64>,

    /// Simulated time of the last processed event.
    pub sim_duration_us: u64,

    // Latency (ms)
    pub ttft: Percentiles,
    pub e2e: Percentiles,
    pub itl: Percentiles,
    pub scheduling_delay: Percentiles,

    // Throughput
    pub requests_per_sec: f64,
    pub output_tokens_per_sec: f64,

    // Cache and preemption
    pub kv_cache_hit_rate: f64,
    pub kv_allocation_failures: u64,
    pub peak_kv_blocks: u64,
    pub preemptions: u64,
    /// Preemptions per completed request.
    pub preemption_rate: f64,

    pub per_instance: Vec<InstanceStats>,
    /// Present only when more than one class was injected.
    pub per_slo_class: Option<BTreeMap<String, ClassMetrics>>,
    pub warnings: Vec<String>,
}

/// Non-deterministic run facts, reported apart from [`SimulationMetrics`].
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RunDiagnostics {
    pub wall_clock_ms: u64,
    pub events_processed: u64,
}

/// Conservation counts at one observation point.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Ledger {
    pub injected: u64,
    pub completed: u64,
    pub queued: u64,
    pub running: u64,
    pub rejected: u64,
    pub dropped: u64,
}

impl Ledger {
    /// `injected == completed + queued + running + rejected + dropped`.
    pub fn check(&self) -> Result<(), InvariantViolation> {
        let accounted = self.completed + self.queued + self.running + self.rejected + self.dropped;
        if accounted == self.injected {
            return Ok(());
        }
        Err(InvariantViolation::Conservation {
            injected: self.injected,
            completed: self.completed,
            queued: self.queued,
            running: self.running,
            rejected: self.rejected,
            dropped: self.dropped,
        })
    }
}

/// Collector that accumulates request records during simulation.
#[derive(Debug, Clone, Default)]
pub struct MetricsCollector {
    records: Vec<RequestRecord>,
    /// Every inter-token gap of completed requests, in µs.
    itl_samples_us: Vec<u64>,
    rejection_reasons: BTreeMap<String, u64>,
    completed: u64,
    rejected: u64,
    dropped: u64,
}

impl MetricsCollector {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_completion(&mut self, request: &Request, instance: u32) {
        self.itl_samples_us
            .extend(request.lifecycle.inter_token_gaps_us());
        self.records.push(RequestRecord::from_request(
            request,
            Some(instance),
            RequestOutcome::Completed,
        ));
        self.completed += 1;
    }

    pub fn record_rejection(&mut self, request: &Request, reason: &str) {
        *self.rejection_reasons.entry(reason_key(reason)).or_insert(0) += 1;
        self.records.push(RequestRecord::from_request(
            request,
            None,
            RequestOutcome::Rejected,
        ));
        self.rejected += 1;
    }

    pub fn record_dropped(&mut self, request: &Request, instance: u32) {
        self.records.push(RequestRecord::from_request(
            request,
            Some(instance),
            RequestOutcome::DroppedUnservable,
        ));
        self.dropped += 1;
    }

    /// Record a request that was still in flight when the run stopped.
    pub fn record_in_flight(&mut self, request: &Request, instance: Option<u32>, outcome: RequestOutcome) {
        self.records
            .push(RequestRecord::from_request(request, instance, outcome));
    }

    pub fn completed(&self) -> u64 {
        self.completed
    }

    pub fn rejected(&self) -> u64 {
        self.rejected
    }

    pub fn dropped(&self) -> u64 {
        self.dropped
    }

    /// Records sorted by request id.
    pub fn into_records(mut self) -> Vec<RequestRecord> {
        self.records.sort_by_key(|r| r.id);
        self.records
    }

    pub fn records(&self) -> &[RequestRecord] {
        &self.records
    }

    /// Aggregate everything recorded so far.
    pub fn aggregate(&self, header: MetricsHeader, ledger: Ledger, per_instance: Vec<InstanceStats>) -> SimulationMetrics {
        let completed: Vec<&RequestRecord> = self
            .records
            .iter()
            .filter(|r| r.outcome == RequestOutcome::Completed)
            .collect();

        let ttft: Vec<u64> = completed.iter().filter_map(|r| r.ttft_us()).collect();
        let e2e: Vec<u64> = completed.iter().filter_map(|r| r.e2e_us()).collect();
        let sched: Vec<u64> = completed
            .iter()
            .filter_map(|r| r.scheduling_delay_us())
            .collect();

        let duration_s = header.sim_duration_us as f64 / 1e6;
        let output_tokens: u64 = completed
            .iter()
            .map(|r| r.output_tokens_emitted as u64)
            .sum();

        let hits: u64 = per_instance.iter().map(|s| s.kv_cache.hits).sum();
        let misses: u64 = per_instance.iter().map(|s| s.kv_cache.misses).sum();
        let preemptions: u64 = per_instance.iter().map(|s| s.preemptions).sum();

        SimulationMetrics {
            name: header.name,
            policy: header.policy,
            admission_policy: header.admission_policy,
            num_instances: per_instance.len() as u32,
            injected: ledger.injected,
            completed: ledger.completed,
            still_queued: ledger.queued,
            still_running: ledger.running,
            rejected: ledger.rejected,
            dropped_unservable: ledger.dropped,
            rejection_reasons: self.rejection_reasons.clone(),
            sim_duration_us: header.sim_duration_us,
            ttft: Percentiles::from_us(&ttft),
            e2e: Percentiles::from_us(&e2e),
            itl: Percentiles::from_us(&self.itl_samples_us),
            scheduling_delay: Percentiles::from_us(&sched),
            requests_per_sec: rate(completed.len() as f64, duration_s),
            output_tokens_per_sec: rate(output_tokens as f64, duration_s),
            kv_cache_hit_rate: rate(hits as f64, (hits + misses) as f64),
            kv_allocation_failures: per_instance
                .iter()
                .map(|s| s.kv_cache.allocation_failures)
                .sum(),
            peak_kv_blocks: per_instance
                .iter()
                .map(|s| s.kv_cache.peak_used_blocks)
                .max()
                .unwrap_or(0),
            preemptions,
            preemption_rate: rate(preemptions as f64, completed.len() as f64),
            per_slo_class: self.per_class(),
            per_instance,
            warnings: header.warnings,
        }
    }

    fn per_class(&self) -> Option<BTreeMap<String, ClassMetrics>> {
        let mut by_class: BTreeMap<String, Vec<&RequestRecord>> = BTreeMap::new();
        for r in &self.records {
            by_class.entry(r.slo_class.clone()).or_default().push(r);
        }
        if by_class.len() <= 1 {
            return None;
        }
        Some(
            by_class
                .into_iter()
                .map(|(class, records)| {
                    let done: Vec<&&RequestRecord> = records
                        .iter()
                        .filter(|r| r.outcome == RequestOutcome::Completed)
                        .collect();
                    let ttft: Vec<u64> = done.iter().filter_map(|r| r.ttft_us()).collect();
                    let e2e: Vec<u64> = done.iter().filter_map(|r| r.e2e_us()).collect();
                    let metrics = ClassMetrics {
                        completed: done.len() as u64,
                        rejected: records
                            .iter()
                            .filter(|r| r.outcome == RequestOutcome::Rejected)
                            .count() as u64,
                        ttft: Percentiles::from_us(&ttft),
                        e2e: Percentiles::from_us(&e2e),
                    };
                    (class, metrics)
                })
                .collect(),
        )
    }
}

/// Run-level labels passed into aggregation.
#[derive(Debug, Clone, Default)]
pub struct MetricsHeader {
    pub name: String,
    pub policy: String,
    pub admission_policy: String,
    pub sim_duration_us: u64,
    pub warnings: Vec<String>,
}

fn rate(numerator: f64, denominator: f64) -> f64 {
    if denominator > 0.0 {
        numerator / denominator
    } else {
        0.0
    }
}

/// Collapse a rejection reason to its policy prefix (`token-bucket: ...`).
fn reason_key(reason: &str) -> String {
    reason
        .split_once(':')
        .map_or(reason, |(head, _)| head)
        .trim()
        .to_string()
}

/// Format metrics as a pretty-printed table string.
pub fn format_table(metrics: &SimulationMetrics) -> String {
    let mut out = String::new();
    out.push_str(&format!(
        "\n{:=<70}\n",
        format!("  {} / {} Results  ", metrics.name, metrics.policy)
    ));
    out.push_str(&format!(
        "  Sim time: {:.3}s | Injected: {} | Completed: {} | Rejected: {}\n",
        metrics.sim_duration_us as f64 / 1e6,
        metrics.injected,
        metrics.completed,
        metrics.rejected
    ));
    out.push_str(&format!(
        "  Still queued: {} | Still running: {} | Dropped (unservable): {}\n",
        metrics.still_queued, metrics.still_running, metrics.dropped_unservable
    ));
    out.push_str(&format!("{:-<70}\n", "  Latency  "));
    for (label, p) in [
        ("TTFT (ms)      ", &metrics.ttft),
        ("E2E (ms)       ", &metrics.e2e),
        ("ITL (ms)       ", &metrics.itl),
        ("Sched delay(ms)", &metrics.scheduling_delay),
    ] {
        out.push_str(&format!(
            "  {} P50={:>9.2}  P90={:>9.2}  P99={:>9.2}\n",
            label, p.p50, p.p90, p.p99
        ));
    }
    out.push_str(&format!("{:-<70}\n", "  Throughput  "));
    out.push_str(&format!(
        "  Requests/sec: {:.2}  Output tokens/sec: {:.1}\n",
        metrics.requests_per_sec, metrics.output_tokens_per_sec
    ));
    out.push_str(&format!("{:-<70}\n", "  KV cache  "));
    out.push_str(&format!(
        "  Hit rate: {:.1}%  Alloc failures: {}  Peak blocks: {}  Preemptions: {} ({:.3}/req)\n",
        metrics.kv_cache_hit_rate * 100.0,
        metrics.kv_allocation_failures,
        metrics.peak_kv_blocks,
        metrics.preemptions,
        metrics.preemption_rate
    ));
    out.push_str(&format!("{:-<70}\n", "  Instances  "));
    for inst in &metrics.per_instance {
        out.push_str(&format!(
            "  #{:<3} completed={:<6} preempted={:<5} busy={:.3}s hit={:.1}%\n",
            inst.id,
            inst.completed,
            inst.preemptions,
            inst.busy_time_us as f64 / 1e6,
            inst.kv_cache.hit_rate * 100.0
        ));
    }
    if let Some(classes) = &metrics.per_slo_class {
        out.push_str(&format!("{:-<70}\n", "  SLO classes  "));
        for (class, m) in classes {
            out.push_str(&format!(
                "  {:<12} completed={:<6} rejected={:<5} TTFT p99={:.2}ms\n",
                class, m.completed, m.rejected, m.ttft.p99
            ));
        }
    }
    if !metrics.warnings.is_empty() {
        out.push_str(&format!("{:-<70}\n", "  Warnings  "));
        for w in &metrics.warnings {
            out.push_str(&format!("  ! {}\n", w));
        }
    }
    out.push_str(&format!("{:=<70}\n", ""));
    out
}

/// Format a comparison table of multiple policy results.
pub fn format_comparison_table(results: &[SimulationMetrics]) -> String {
    if results.is_empty() {
        return String::from("No results to compare.\n");
    }

    let mut out = String::new();
    out.push_str(&format!("\n{:=<90}\n", "  Policy Comparison  "));
    out.push_str(&format!(
        "{:<18} {:>9} {:>9} {:>9} {:>9} {:>8} {:>7} {:>8}\n",
        "Policy", "TTFT p50", "TTFT p99", "E2E p50", "E2E p99", "Req/s", "Cache%", "Preempt"
    ));
    out.push_str(&format!("{:-<90}\n", ""));

    for m in results {
        out.push_str(&format!(
            "{:<18} {:>9.2} {:>9.2} {:>9.2} {:>9.2} {:>8.2} {:>6.1}% {:>8}\n",
            m.policy,
            m.ttft.p50,
            m.ttft.p99,
            m.e2e.p50,
            m.e2e.p99,
            m.requests_per_sec,
            m.kv_cache_hit_rate * 100.0,
            m.preemptions,
        ));
    }
    out.push_str(&format!("{:=<90}\n", ""));
    out
}
