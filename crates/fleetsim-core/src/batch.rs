//! Batch formation for one scheduling step.
//!
//! Continuous batching with chunked prefill, in two phases:
//!
//! 1. Every running request asks for its next chunk of work: a prefill chunk
//!    capped by the long-prefill threshold and the remaining token budget,
//!    or a single decode token. If its KV blocks cannot be allocated, the
//!    newest running request is preempted until the allocation fits or the
//!    request itself is the victim.
//! 2. New requests are pulled from the wait-queue head while there are free
//!    running slots and token budget, and only if nothing was preempted in
//!    phase 1. The first request that does not fit stops the pull so queue
//!    order is preserved.

use crate::error::InvariantViolation;
use crate::kv_cache::KvStore;
use crate::queue::WaitQueue;
use crate::request::{Request, RequestState, Stage};
use tracing::debug;

/// Hard limits for one step.
#[derive(Debug, Clone, Copy)]
pub struct BatchLimits {
    pub max_running_requests: usize,
    pub max_scheduled_tokens: usize,
    /// Largest prefill chunk per step. 0 disables chunking.
    pub long_prefill_token_threshold: usize,
}

/// What one call to [`form_batch`] scheduled.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct BatchOutcome {
    pub prefill_tokens: usize,
    pub decode_tokens: usize,
    pub preempted: u32,
    /// Requests moved from the wait queue into the batch this step.
    pub newly_scheduled: Vec<u64>,
}

impl BatchOutcome {
    pub fn scheduled_tokens(&self) -> usize {
        self.prefill_tokens + self.decode_tokens
    }
}

fn prefill_chunk(request: &Request, limits: &BatchLimits, budget: usize) -> usize {
    let mut chunk = request.prefill_target().saturating_sub(request.progress);
    if limits.long_prefill_token_threshold > 0 {
        chunk = chunk.min(limits.long_prefill_token_threshold);
    }
    chunk.min(budget)
}

fn preempt(
    victim: Request,
    queue: &mut WaitQueue,
    kv: &mut dyn KvStore,
    outcome: &mut BatchOutcome,
) {
    let mut victim = victim;
    kv.release(victim.id);
    victim.reset_progress();
    debug!(request = victim.id, preemptions = victim.preemptions, "preempted");
    queue.push_front(victim);
    outcome.preempted += 1;
}

/// Build the next batch in place: `running` gains new requests and loses
/// preempted ones, which go back to the front of `queue`. Each request's
/// `computed_target` is set to the progress it reaches when the step ends.
pub fn form_batch(
    limits: &BatchLimits,
    queue: &mut WaitQueue,
    running: &mut Vec<Request>,
    kv: &mut dyn KvStore,
    now_us: u64,
) -> Result<BatchOutcome, InvariantViolation> {
    let mut outcome = BatchOutcome::default();
    let mut budget = limits.max_scheduled_tokens;

    // Phase 1: continue running requests.
    let mut i = 0;
    while i < running.len() {
        let req = &running[i];
        let decode = req.in_decode();
        let tokens = if decode {
            1.min(budget)
        } else {
            prefill_chunk(req, limits, budget)
        };
        if tokens == 0 {
            running[i].computed_target = running[i].progress;
            i += 1;
            continue;
        }

        let start = running[i].progress;
        let end = start + tokens;
        let mut self_preempted = false;
        while !kv.allocate(&running[i], start, end, &[]) {
            if let Some(victim) = running.pop() {
                let was_self = running.len() == i;
                preempt(victim, queue, kv, &mut outcome);
                if was_self {
                    self_preempted = true;
                    break;
                }
            } else {
                break;
            }
        }
        if self_preempted {
            break;
        }

        running[i].computed_target = end;
        budget -= tokens;
        if decode {
            outcome.decode_tokens += tokens;
        } else {
            outcome.prefill_tokens += tokens;
        }
        i += 1;
    }

    // Phase 2: admit from the wait queue.
    while running.len() < limits.max_running_requests
        && budget > 0
        && outcome.preempted == 0
    {
        let Some(next) = queue.front() else {
            break;
        };
        let target = next.prefill_target();
        let prefix = next.tokens_in(0, target);
        kv.promote_prefix(&prefix);
        let mut cached = kv.lookup_cached_prefix(&prefix);
        // Keep at least one token to compute so the step emits a token.
        let max_cached = target.saturating_sub(1) / kv.block_size();
        cached.truncate(max_cached);

        let start = cached.len() * kv.block_size();
        let mut chunk = target - start;
        if limits.long_prefill_token_threshold > 0 {
            chunk = chunk.min(limits.long_prefill_token_threshold);
        }
        chunk = chunk.min(budget);

        if !kv.allocate(next, start, start + chunk, &cached) {
            break;
        }
        let Some(mut req) = queue.pop_front() else {
            break;
        };
        req.progress = start;
        req.computed_target = start + chunk;
        req.state = RequestState::Running;
        if !req.lifecycle.is_set(Stage::Schedule) {
            req.lifecycle.stamp(req.id, Stage::Schedule, now_us)?;
        }
        budget -= chunk;
        outcome.prefill_tokens += chunk;
        outcome.newly_scheduled.push(req.id);
        running.push(req);
    }

    Ok(outcome)
}
