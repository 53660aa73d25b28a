//! Cluster orchestration: admission, routing and injection over a shared
//! event queue.
//!
//! Every request flows through the same pipeline:
//!
//! ```text
//! Arrival --admission_latency--> Admission --routing_latency--> Routing
//!         --queueing delay(input_len)--> instance Arrival -> Step/Completion
//! ```
//!
//! Admission and routing are evaluated when their event fires, against
//! snapshots built at that moment, so load-aware policies see the load that
//! earlier decisions created. Routed requests count toward the target's
//! `pending_requests` until they reach its wait queue.
//!
//! All instances share one [`EventQueue`] and therefore one clock. After
//! every processed event the conservation ledger is re-checked.

use crate::config::SimConfig;
use crate::engine::EventQueue;
use crate::error::{InvariantViolation, SimError};
use crate::instance::{InstanceEvent, InstanceSettings, InstanceSimulator};
use crate::metrics::{
    Ledger, MetricsCollector, MetricsHeader, RequestOutcome, RequestRecord, RunDiagnostics,
    SimulationMetrics,
};
use crate::request::{Request, Stage};
use crate::rng::{PartitionedRng, SUBSYSTEM_ROUTER};
use crate::scheduler::{available_priority_policies, available_schedulers};
use crate::trace::{AdmissionRecord, DecisionTrace, RoutingRecord, TraceSummary};
use fleetsim_algorithms::{
    admission_by_name, algorithm_by_name, available_admission_policies, available_algorithms,
    AdmissionDecision, AdmissionPolicy, InstanceSnapshot, RouterState, RoutingAlgorithm,
};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::time::Instant;
use tracing::{debug, info, warn};

/// Events on the shared cluster queue.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClusterEvent {
    /// A request reaches the cluster front door.
    Arrival { request_id: u64 },
    Admission { request_id: u64 },
    Routing { request_id: u64 },
    /// A routed request reaches its instance's wait queue.
    InstanceArrival { instance: u32, request_id: u64 },
    Instance { instance: u32, event: InstanceEvent },
}

/// Everything a run produces.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SimulationReport {
    pub metrics: SimulationMetrics,
    /// Every injected request, sorted by id.
    pub requests: Vec<RequestRecord>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub trace: Option<DecisionTrace>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub trace_summary: Option<TraceSummary>,
    /// Wall-clock facts. Never serialized with the comparable output.
    #[serde(skip)]
    pub diagnostics: RunDiagnostics,
}

impl SimulationReport {
    /// Deterministic JSON for this report.
    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string_pretty(self)
    }
}

/// A request that has arrived but has not reached an instance yet.
#[derive(Debug)]
struct PipelineEntry {
    request: Request,
    target: Option<u32>,
}

pub struct ClusterSimulator {
    config: SimConfig,
    events: EventQueue<ClusterEvent>,
    instances: Vec<InstanceSimulator>,
    /// Routed but not yet enqueued, per instance.
    pending: Vec<u32>,
    router: Box<dyn RoutingAlgorithm>,
    admission: Box<dyn AdmissionPolicy>,
    rng: PartitionedRng,
    /// Requests whose arrival event has not fired.
    upcoming: BTreeMap<u64, Request>,
    pipeline: BTreeMap<u64, PipelineEntry>,
    injected: u64,
    total_requests: u64,
    metrics: MetricsCollector,
    trace: Option<DecisionTrace>,
    warnings: Vec<String>,
}

impl ClusterSimulator {
    /// Build a cluster and preload one arrival event per request.
    ///
    /// Requests with equal arrival times are injected in the order given.
    pub fn new(config: SimConfig, requests: Vec<Request>) -> Result<Self, SimError> {
        config.validate()?;

        let settings =
            InstanceSettings::from_config(&config).ok_or_else(|| SimError::UnknownPolicy {
                kind: "scheduler/priority policy",
                name: format!(
                    "{}/{}",
                    config.instance.scheduler, config.instance.priority_policy
                ),
                available: format!(
                    "{} / {}",
                    available_schedulers().join(", "),
                    available_priority_policies().join(", ")
                ),
            })?;

        let router = algorithm_by_name(&config.cluster.routing_policy, &config.routing_params()?)
            .ok_or_else(|| SimError::UnknownPolicy {
                kind: "routing policy",
                name: config.cluster.routing_policy.clone(),
                available: available_algorithms().join(", "),
            })?;
        let admission = admission_by_name(&config.cluster.admission_policy, &config.admission_params())
            .ok_or_else(|| SimError::UnknownPolicy {
                kind: "admission policy",
                name: config.cluster.admission_policy.clone(),
                available: available_admission_policies().join(", "),
            })?;

        let n = config.cluster.num_instances;
        let instances: Vec<InstanceSimulator> =
            (0..n).map(|id| InstanceSimulator::new(id, &settings)).collect();

        let mut events = EventQueue::new();
        let mut upcoming = BTreeMap::new();
        let total_requests = requests.len() as u64;
        for request in requests {
            let id = request.id;
            events.schedule(request.arrival_us(), ClusterEvent::Arrival { request_id: id });
            if upcoming.insert(id, request).is_some() {
                return Err(SimError::Config(crate::config::ConfigError::Validation(
                    format!("duplicate request id {}", id),
                )));
            }
        }

        info!(
            instances = n,
            routing = %config.cluster.routing_policy,
            admission = %config.cluster.admission_policy,
            requests = total_requests,
            seed = config.simulation.seed,
            "cluster created"
        );

        Ok(Self {
            trace: config.trace_decisions().then(DecisionTrace::new),
            rng: PartitionedRng::new(config.simulation.seed),
            pending: vec![0; n as usize],
            config,
            events,
            instances,
            router,
            admission,
            upcoming,
            pipeline: BTreeMap::new(),
            injected: 0,
            total_requests,
            metrics: MetricsCollector::new(),
            warnings: Vec::new(),
        })
    }

    pub fn instances(&self) -> &[InstanceSimulator] {
        &self.instances
    }

    pub fn now_us(&self) -> u64 {
        self.events.now_us()
    }

    /// Fresh snapshot of every instance, in instance order.
    pub fn snapshots(&self) -> Vec<InstanceSnapshot> {
        self.instances
            .iter()
            .zip(&self.pending)
            .map(|(inst, &pending)| inst.snapshot(pending))
            .collect()
    }

    /// Current conservation counts.
    pub fn ledger(&self) -> Ledger {
        Ledger {
            injected: self.injected,
            completed: self.metrics.completed(),
            queued: self.pipeline.len() as u64
                + self
                    .instances
                    .iter()
                    .map(|i| i.queue_depth() as u64)
                    .sum::<u64>(),
            running: self.instances.iter().map(|i| i.in_service() as u64).sum(),
            rejected: self.metrics.rejected(),
            dropped: self.metrics.dropped(),
        }
    }

    fn warn_run(&mut self, message: String) {
        warn!("{}", message);
        self.warnings.push(message);
    }

    fn horizon_label(&self) -> String {
        match self.config.simulation.horizon_us {
            Some(h) => format!("{}us", h),
            None => "unbounded".to_string(),
        }
    }

    /// Run until the event queue drains or the horizon is reached.
    pub fn run(mut self) -> Result<SimulationReport, SimError> {
        let started = Instant::now();
        let horizon = self.config.horizon_us();
        let pipeline_us =
            self.config.cluster.admission_latency_us + self.config.cluster.routing_latency_us;
        if horizon < pipeline_us {
            let message = format!(
                "horizon {} is shorter than admission + routing latency ({}us); no request can complete",
                self.horizon_label(),
                pipeline_us
            );
            self.warn_run(message);
        }

        while let Some((now, event)) = self.events.pop_until(horizon)? {
            self.process(now, event)?;
            self.ledger().check()?;
        }

        if self.metrics.completed() == 0 && self.total_requests > 0 {
            let message = format!(
                "zero requests completed ({} injected, {} rejected, horizon {})",
                self.injected,
                self.metrics.rejected(),
                self.horizon_label()
            );
            self.warn_run(message);
        }

        let report = self.finish(started);
        info!(
            completed = report.metrics.completed,
            rejected = report.metrics.rejected,
            events = report.diagnostics.events_processed,
            wall_ms = report.diagnostics.wall_clock_ms,
            "simulation finished"
        );
        Ok(report)
    }

    fn process(&mut self, now: u64, event: ClusterEvent) -> Result<(), InvariantViolation> {
        match event {
            ClusterEvent::Arrival { request_id } => self.on_arrival(now, request_id),
            ClusterEvent::Admission { request_id } => self.on_admission(now, request_id),
            ClusterEvent::Routing { request_id } => self.on_routing(now, request_id),
            ClusterEvent::InstanceArrival {
                instance,
                request_id,
            } => self.on_instance_arrival(now, instance, request_id),
            ClusterEvent::Instance { instance, event } => {
                self.on_instance_event(now, instance, event)
            }
        }
    }

    fn on_arrival(&mut self, now: u64, request_id: u64) -> Result<(), InvariantViolation> {
        let request = self
            .upcoming
            .remove(&request_id)
            .ok_or(InvariantViolation::UntrackedRequest {
                request_id,
                location: "arrival",
            })?;
        self.injected += 1;
        self.pipeline.insert(
            request_id,
            PipelineEntry {
                request,
                target: None,
            },
        );
        self.events.schedule(
            now + self.config.cluster.admission_latency_us,
            ClusterEvent::Admission { request_id },
        );
        Ok(())
    }

    fn on_admission(&mut self, now: u64, request_id: u64) -> Result<(), InvariantViolation> {
        let snapshots = self.snapshots();
        let state = RouterState {
            snapshots: &snapshots,
            clock_us: now,
        };
        let entry = self
            .pipeline
            .get_mut(&request_id)
            .ok_or(InvariantViolation::UntrackedRequest {
                request_id,
                location: "admission",
            })?;
        let decision = self.admission.admit(&entry.request.info(), &state);

        match decision {
            AdmissionDecision::Admit => {
                entry.request.lifecycle.stamp(request_id, Stage::Admission, now)?;
                debug!(request = request_id, "admitted");
                if let Some(trace) = self.trace.as_mut() {
                    trace.record_admission(AdmissionRecord {
                        request_id,
                        clock_us: now,
                        admitted: true,
                        reason: String::new(),
                    });
                }
                self.events.schedule(
                    now + self.config.cluster.routing_latency_us,
                    ClusterEvent::Routing { request_id },
                );
            }
            AdmissionDecision::Reject { reason } => {
                debug!(request = request_id, %reason, "rejected");
                if let Some(trace) = self.trace.as_mut() {
                    trace.record_admission(AdmissionRecord {
                        request_id,
                        clock_us: now,
                        admitted: false,
                        reason: reason.clone(),
                    });
                }
                if let Some(entry) = self.pipeline.remove(&request_id) {
                    self.metrics.record_rejection(&entry.request, &reason);
                }
            }
        }
        Ok(())
    }

    fn on_routing(&mut self, now: u64, request_id: u64) -> Result<(), InvariantViolation> {
        let snapshots = self.snapshots();
        let state = RouterState {
            snapshots: &snapshots,
            clock_us: now,
        };
        let entry = self
            .pipeline
            .get_mut(&request_id)
            .ok_or(InvariantViolation::UntrackedRequest {
                request_id,
                location: "routing",
            })?;
        let rng = self.rng.for_subsystem(SUBSYSTEM_ROUTER);
        let decision = self.router.route(&entry.request.info(), &state, rng);

        let target = decision.target;
        let Some(instance) = self.instances.get(target as usize) else {
            return Err(InvariantViolation::RouteOutOfRange {
                request_id,
                target,
                instances: self.instances.len() as u32,
            });
        };
        entry.request.lifecycle.stamp(request_id, Stage::Route, now)?;
        entry.target = Some(target);
        self.pending[target as usize] += 1;

        let arrive_at = now + instance.latency().queueing_delay_us(entry.request.input_len());
        debug!(
            request = request_id,
            instance = target,
            reason = %decision.reason,
            arrive_at,
            "routed"
        );
        if let Some(trace) = self.trace.as_mut() {
            trace.record_routing(RoutingRecord::new(
                request_id,
                now,
                target,
                decision.reason,
                decision.scores,
            ));
        }
        self.events.schedule(
            arrive_at,
            ClusterEvent::InstanceArrival {
                instance: target,
                request_id,
            },
        );
        Ok(())
    }

    fn on_instance_arrival(
        &mut self,
        now: u64,
        instance: u32,
        request_id: u64,
    ) -> Result<(), InvariantViolation> {
        let entry = self
            .pipeline
            .remove(&request_id)
            .ok_or(InvariantViolation::UntrackedRequest {
                request_id,
                location: "instance arrival",
            })?;
        let idx = instance as usize;
        self.pending[idx] = self.pending[idx].saturating_sub(1);

        let mut out = Vec::new();
        let accepted = self.instances[idx].on_arrival(entry.request, now, &mut out)?;
        if !accepted {
            for dropped in self.instances[idx].take_dropped() {
                self.metrics.record_dropped(&dropped, instance);
            }
        }
        self.schedule_instance_events(instance, out);
        Ok(())
    }

    fn on_instance_event(
        &mut self,
        now: u64,
        instance: u32,
        event: InstanceEvent,
    ) -> Result<(), InvariantViolation> {
        let mut out = Vec::new();
        let inst = &mut self.instances[instance as usize];
        match event {
            InstanceEvent::Step => inst.on_step(now, &mut out)?,
            InstanceEvent::Completion { request_id } => {
                let request = inst.on_completion(request_id, now, &mut out)?;
                self.metrics.record_completion(&request, instance);
            }
        }
        self.schedule_instance_events(instance, out);
        Ok(())
    }

    fn schedule_instance_events(&mut self, instance: u32, out: Vec<(u64, InstanceEvent)>) {
        for (time_us, event) in out {
            self.events
                .schedule(time_us, ClusterEvent::Instance { instance, event });
        }
    }

    fn finish(mut self, started: Instant) -> SimulationReport {
        for entry in self.pipeline.values() {
            self.metrics
                .record_in_flight(&entry.request, entry.target, RequestOutcome::InPipeline);
        }
        for inst in &self.instances {
            let queued = inst.queue_depth();
            for (k, request) in inst.in_flight().enumerate() {
                let outcome = if k < queued {
                    RequestOutcome::Queued
                } else {
                    RequestOutcome::Running
                };
                self.metrics
                    .record_in_flight(request, Some(inst.id()), outcome);
            }
        }

        let header = MetricsHeader {
            name: self.config.simulation.name.clone(),
            policy: self.router.name().to_string(),
            admission_policy: self.admission.name().to_string(),
            sim_duration_us: self.events.now_us(),
            warnings: std::mem::take(&mut self.warnings),
        };
        let per_instance = self.instances.iter().map(InstanceSimulator::stats).collect();
        let metrics = self.metrics.aggregate(header, self.ledger(), per_instance);
        let trace_summary = self.trace.as_ref().map(DecisionTrace::summarize);

        SimulationReport {
            metrics,
            requests: self.metrics.into_records(),
            trace: self.trace,
            trace_summary,
            diagnostics: RunDiagnostics {
                wall_clock_ms: started.elapsed().as_millis() as u64,
                events_processed: self.events.processed(),
            },
        }
    }
}
