//! One simulated inference server replica.
//!
//! An [`InstanceSimulator`] owns its wait queue, running batch and KV cache,
//! but no clock or event queue: the cluster drives every instance from one
//! shared [`EventQueue`](crate::engine::EventQueue). Each handler returns the
//! follow-up events it needs as `(time_us, InstanceEvent)` pairs.
//!
//! Request lifecycle on an instance:
//!
//! ```text
//! Arrival -> wait queue -> Step (prefill chunks) -> first token
//!         -> Step (one decode token each) -> last token
//!         -> Completion after output processing -> KV released
//! ```
//!
//! Work-conserving rule: when a completion leaves the running batch empty and
//! requests are waiting, a new step is scheduled at the current time instead
//! of waiting for the next arrival.

use crate::batch::{form_batch, BatchLimits};
use crate::config::SimConfig;
use crate::error::InvariantViolation;
use crate::kv_cache::{KvCacheSimulator, KvCacheStats, KvStore, TieredKvCache};
use crate::latency::LatencyModel;
use crate::queue::WaitQueue;
use crate::request::{Request, RequestState, Stage};
use crate::scheduler::{InstanceScheduler, PriorityPolicy};
use fleetsim_algorithms::InstanceSnapshot;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use tracing::{debug, trace};

/// Events an instance schedules for itself.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InstanceEvent {
    Step,
    Completion { request_id: u64 },
}

/// Everything needed to build an instance.
#[derive(Debug, Clone)]
pub struct InstanceSettings {
    pub total_kv_blocks: usize,
    pub block_size: usize,
    pub limits: BatchLimits,
    pub scheduler: InstanceScheduler,
    pub priority: PriorityPolicy,
    pub latency: LatencyModel,
    pub overflow_kv_blocks: usize,
    pub transfer_base_latency_us: u64,
    pub transfer_latency_per_block_us: u64,
}

impl InstanceSettings {
    /// Settings from a validated config.
    pub fn from_config(config: &SimConfig) -> Option<Self> {
        let inst = &config.instance;
        Some(Self {
            total_kv_blocks: inst.total_kv_blocks as usize,
            block_size: inst.block_size as usize,
            limits: BatchLimits {
                max_running_requests: inst.max_running_requests as usize,
                max_scheduled_tokens: inst.max_scheduled_tokens as usize,
                long_prefill_token_threshold: inst.long_prefill_token_threshold as usize,
            },
            scheduler: InstanceScheduler::by_name(&inst.scheduler)?,
            priority: PriorityPolicy::by_name(&inst.priority_policy)?,
            latency: config.latency_model(),
            overflow_kv_blocks: inst.overflow_kv_blocks as usize,
            transfer_base_latency_us: inst.transfer_base_latency_us,
            transfer_latency_per_block_us: inst.transfer_latency_per_block_us,
        })
    }
}

/// Per-instance counters reported after a run.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct InstanceStats {
    pub id: u32,
    pub enqueued: u64,
    pub completed: u64,
    pub dropped_unservable: u64,
    pub preemptions: u64,
    pub steps: u64,
    pub busy_time_us: u64,
    pub prefill_tokens: u64,
    pub decode_tokens: u64,
    pub output_tokens: u64,
    pub still_queued: u64,
    pub still_running: u64,
    pub kv_cache: KvCacheStats,
}

pub struct InstanceSimulator {
    id: u32,
    kv: Box<dyn KvStore>,
    queue: WaitQueue,
    running: Vec<Request>,
    /// Finished generating; waiting for their completion event.
    completing: BTreeMap<u64, Request>,
    /// Rejected at enqueue because they can never fit in the cache.
    dropped: Vec<Request>,
    step_pending: bool,
    limits: BatchLimits,
    scheduler: InstanceScheduler,
    priority: PriorityPolicy,
    latency: LatencyModel,
    stats: InstanceStats,
}

impl InstanceSimulator {
    pub fn new(id: u32, settings: &InstanceSettings) -> Self {
        let kv: Box<dyn KvStore> = if settings.overflow_kv_blocks > 0 {
            Box::new(TieredKvCache::new(
                settings.total_kv_blocks,
                settings.block_size,
                settings.overflow_kv_blocks,
                settings.transfer_base_latency_us,
                settings.transfer_latency_per_block_us,
            ))
        } else {
            Box::new(KvCacheSimulator::new(
                settings.total_kv_blocks,
                settings.block_size,
            ))
        };
        Self {
            id,
            kv,
            queue: WaitQueue::new(),
            running: Vec::new(),
            completing: BTreeMap::new(),
            dropped: Vec::new(),
            step_pending: false,
            limits: settings.limits,
            scheduler: settings.scheduler,
            priority: settings.priority,
            latency: settings.latency.clone(),
            stats: InstanceStats {
                id,
                ..InstanceStats::default()
            },
        }
    }

    pub fn id(&self) -> u32 {
        self.id
    }

    pub fn queue_depth(&self) -> usize {
        self.queue.len()
    }

    pub fn batch_size(&self) -> usize {
        self.running.len()
    }

    pub fn completing_len(&self) -> usize {
        self.completing.len()
    }

    /// Requests holding a running slot or awaiting completion.
    pub fn in_service(&self) -> usize {
        self.running.len() + self.completing.len()
    }

    pub fn dropped_unservable(&self) -> u64 {
        self.stats.dropped_unservable
    }

    pub fn kv(&self) -> &dyn KvStore {
        self.kv.as_ref()
    }

    pub fn latency(&self) -> &LatencyModel {
        &self.latency
    }

    pub fn is_step_pending(&self) -> bool {
        self.step_pending
    }

    /// Point-in-time routing view. `pending_requests` is owned by the cluster.
    pub fn snapshot(&self, pending_requests: u32) -> InstanceSnapshot {
        let kv = self.kv.stats();
        InstanceSnapshot {
            id: self.id,
            queue_depth: self.queue.len() as u32,
            batch_size: self.running.len() as u32,
            pending_requests,
            kv_utilization: kv.utilization,
            free_kv_blocks: kv.free_blocks,
            cache_hit_rate: kv.hit_rate,
        }
    }

    fn blocks_needed(&self, request: &Request) -> usize {
        (request.input_len() + request.output_len()).div_ceil(self.kv.block_size())
    }

    fn schedule_step(&mut self, at_us: u64, out: &mut Vec<(u64, InstanceEvent)>) {
        self.step_pending = true;
        out.push((at_us, InstanceEvent::Step));
    }

    /// A routed request reaches this instance.
    ///
    /// Returns `false` if the request was dropped as unservable.
    pub fn on_arrival(
        &mut self,
        mut request: Request,
        now_us: u64,
        out: &mut Vec<(u64, InstanceEvent)>,
    ) -> Result<bool, InvariantViolation> {
        request.lifecycle.stamp(request.id, Stage::Enqueue, now_us)?;
        let needed = self.blocks_needed(&request);
        if needed > self.kv.total_blocks() {
            debug!(
                instance = self.id,
                request = request.id,
                needed,
                total = self.kv.total_blocks(),
                "dropping unservable request"
            );
            self.stats.dropped_unservable += 1;
            self.dropped.push(request);
            return Ok(false);
        }
        self.queue.push_back(request);
        self.stats.enqueued += 1;
        if !self.step_pending && self.running.is_empty() {
            self.schedule_step(now_us, out);
        }
        Ok(true)
    }

    /// Run one batch step starting at `now_us`.
    pub fn on_step(
        &mut self,
        now_us: u64,
        out: &mut Vec<(u64, InstanceEvent)>,
    ) -> Result<(), InvariantViolation> {
        self.step_pending = false;

        for req in self.queue.iter_mut() {
            req.priority = self.priority.compute(req, now_us);
        }
        self.scheduler.order(&mut self.queue);

        let outcome = form_batch(
            &self.limits,
            &mut self.queue,
            &mut self.running,
            self.kv.as_mut(),
            now_us,
        )?;
        self.stats.preemptions += outcome.preempted as u64;
        self.check_kv()?;

        if self.running.is_empty() {
            // Nothing fits. A pending completion frees blocks and restarts us.
            trace!(instance = self.id, queued = self.queue.len(), "idle step");
            return Ok(());
        }

        let transfer_us = self.kv.take_transfer_latency();
        let dt = self
            .latency
            .step_time_us(outcome.prefill_tokens, outcome.decode_tokens)
            + transfer_us;
        let end_us = now_us + dt;

        for req in self.running.iter_mut() {
            let target = req.prefill_target();
            let did_work = req.computed_target > req.progress;
            let newly = outcome.newly_scheduled.contains(&req.id);
            req.progress = req.computed_target;
            if req.progress >= target && (did_work || newly) {
                if req.emitted_tokens == 0 {
                    req.lifecycle.stamp(req.id, Stage::FirstToken, end_us)?;
                }
                req.lifecycle.record_token(req.id, end_us)?;
                req.emitted_tokens += 1;
                self.stats.output_tokens += 1;
            }
        }

        let (finished, still_running): (Vec<_>, Vec<_>) = self
            .running
            .drain(..)
            .partition(Request::is_finished);
        self.running = still_running;

        let completion_us = end_us + self.latency.output_processing_us();
        for req in finished {
            out.push((completion_us, InstanceEvent::Completion { request_id: req.id }));
            self.completing.insert(req.id, req);
        }

        self.stats.steps += 1;
        self.stats.busy_time_us += dt;
        self.stats.prefill_tokens += outcome.prefill_tokens as u64;
        self.stats.decode_tokens += outcome.decode_tokens as u64;

        if !self.running.is_empty() || (!self.queue.is_empty() && self.completing.is_empty()) {
            self.schedule_step(end_us, out);
        }
        Ok(())
    }

    /// Finalize a request whose output processing is done.
    pub fn on_completion(
        &mut self,
        request_id: u64,
        now_us: u64,
        out: &mut Vec<(u64, InstanceEvent)>,
    ) -> Result<Request, InvariantViolation> {
        let mut req =
            self.completing
                .remove(&request_id)
                .ok_or(InvariantViolation::MissingRequest {
                    instance: self.id,
                    request_id,
                    location: "completing set",
                })?;
        req.lifecycle.stamp(req.id, Stage::Completion, now_us)?;
        req.lifecycle.verify(req.id)?;
        req.state = RequestState::Completed;
        self.kv.release(req.id);
        self.check_kv()?;
        self.stats.completed += 1;

        if self.running.is_empty() && !self.queue.is_empty() && !self.step_pending {
            self.schedule_step(now_us, out);
        }
        Ok(req)
    }

    fn check_kv(&self) -> Result<(), InvariantViolation> {
        if self.kv.is_conserved() {
            return Ok(());
        }
        Err(InvariantViolation::KvAccounting {
            instance: self.id,
            used: self.kv.used_blocks() as u64,
            free: self.kv.free_blocks() as u64,
            total: self.kv.total_blocks() as u64,
        })
    }

    /// Requests dropped at enqueue, in drop order.
    pub fn take_dropped(&mut self) -> Vec<Request> {
        std::mem::take(&mut self.dropped)
    }

    /// Requests still on this instance: queued, then running, then completing.
    pub fn in_flight(&self) -> impl Iterator<Item = &Request> {
        self.queue
            .iter()
            .chain(self.running.iter())
            .chain(self.completing.values())
    }

    pub fn stats(&self) -> InstanceStats {
        InstanceStats {
            still_queued: self.queue.len() as u64,
            still_running: self.in_service() as u64,
            kv_cache: self.kv.stats(),
            ..self.stats.clone()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn settings(max_running: usize, total_blocks: usize) -> InstanceSettings {
        InstanceSettings {
            total_kv_blocks: total_blocks,
            block_size: 16,
            limits: BatchLimits {
                max_running_requests: max_running,
                max_scheduled_tokens: 2048,
                long_prefill_token_threshold: 0,
            },
            scheduler: InstanceScheduler::Fcfs,
            priority: PriorityPolicy::Constant,
            latency: LatencyModel::new([1000.0, 1.0, 10.0], [0.0, 0.0, 50.0]),
            overflow_kv_blocks: 0,
            transfer_base_latency_us: 0,
            transfer_latency_per_block_us: 0,
        }
    }

    fn req(id: u64, input_len: usize, output_len: usize) -> Request {
        Request::new(id, 0, vec![id as u32; input_len], vec![1; output_len], "")
    }

    /// Drive one instance with its own queue until no events remain.
    fn drain(
        inst: &mut InstanceSimulator,
        mut events: Vec<(u64, InstanceEvent)>,
    ) -> Vec<(u64, Request)> {
        let mut done = Vec::new();
        while !events.is_empty() {
            events.sort_by_key(|(t, _)| *t);
            let (t, ev) = events.remove(0);
            let mut out = Vec::new();
            match ev {
                InstanceEvent::Step => inst.on_step(t, &mut out).unwrap(),
                InstanceEvent::Completion { request_id } => {
                    done.push((t, inst.on_completion(request_id, t, &mut out).unwrap()));
                }
            }
            events.extend(out);
        }
        done
    }

    #[test]
    fn test_arrival_schedules_step_once() {
        let mut inst = InstanceSimulator::new(0, &settings(4, 64));
        let mut out = Vec::new();
        assert!(inst.on_arrival(req(1, 32, 4), 0, &mut out).unwrap());
        assert!(inst.on_arrival(req(2, 32, 4), 0, &mut out).unwrap());
        assert_eq!(out, vec![(0, InstanceEvent::Step)]);
        assert_eq!(inst.queue_depth(), 2);
    }

    #[test]
    fn test_single_request_timeline() {
        let mut inst = InstanceSimulator::new(0, &settings(4, 64));
        let mut out = Vec::new();
        inst.on_arrival(req(1, 32, 3), 0, &mut out).unwrap();
        let done = drain(&mut inst, out);
        assert_eq!(done.len(), 1);
        let (t, r) = &done[0];
        // prefill: 1000 + 32, then two decode steps of 1000 + 10.
        assert_eq!(r.lifecycle.get(Stage::FirstToken), Some(1032));
        assert_eq!(r.lifecycle.token_times_us(), &[1032, 2042, 3052]);
        assert_eq!(*t, 3052 + 50);
        assert_eq!(inst.kv().used_blocks(), 0);
    }

    #[test]
    fn test_zero_output_completes_after_prefill() {
        let mut inst = InstanceSimulator::new(0, &settings(4, 64));
        let mut out = Vec::new();
        inst.on_arrival(req(1, 16, 0), 0, &mut out).unwrap();
        let done = drain(&mut inst, out);
        assert_eq!(done[0].1.emitted_tokens, 1);
    }

    #[test]
    fn test_unservable_dropped() {
        let mut inst = InstanceSimulator::new(0, &settings(4, 2));
        let mut out = Vec::new();
        assert!(!inst.on_arrival(req(1, 40, 0), 0, &mut out).unwrap());
        assert!(out.is_empty());
        assert_eq!(inst.dropped_unservable(), 1);
        assert_eq!(inst.take_dropped().len(), 1);
    }

    #[test]
    fn test_work_conserving_after_completion() {
        let mut inst = InstanceSimulator::new(0, &settings(1, 64));
        let mut out = Vec::new();
        inst.on_arrival(req(1, 16, 2), 0, &mut out).unwrap();
        let mut out2 = Vec::new();
        inst.on_arrival(req(2, 16, 2), 1, &mut out2).unwrap();
        assert!(out2.is_empty(), "step already pending");
        let done = drain(&mut inst, out);
        assert_eq!(done.len(), 2);
        assert_eq!(inst.stats().completed, 2);
    }

    #[test]
    fn test_snapshot_reports_load() {
        let mut inst = InstanceSimulator::new(3, &settings(4, 64));
        let mut out = Vec::new();
        inst.on_arrival(req(1, 32, 4), 0, &mut out).unwrap();
        let snap = inst.snapshot(2);
        assert_eq!(snap.id, 3);
        assert_eq!(snap.queue_depth, 1);
        assert_eq!(snap.effective_load(), 3);
    }
}
