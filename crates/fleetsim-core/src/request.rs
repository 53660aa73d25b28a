//! Request model for LLM inference simulation.
//!
//! Each [`Request`] carries its identity token sequence (input and output
//! token ids), a tenant/SLO class, and a [`Lifecycle`] of timestamps that are
//! written exactly once, in causal order, by the stage that produces them.

use crate::error::InvariantViolation;
use fleetsim_algorithms::RequestInfo;
use serde::{Deserialize, Serialize};

/// Scheduling state of a request on an instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RequestState {
    Queued,
    Running,
    Completed,
}

/// Pipeline stages that stamp a lifecycle timestamp, in causal order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Stage {
    Arrival,
    Admission,
    Route,
    Enqueue,
    Schedule,
    FirstToken,
    Completion,
}

impl Stage {
    pub fn name(self) -> &'static str {
        match self {
            Stage::Arrival => "arrival",
            Stage::Admission => "admission",
            Stage::Route => "route",
            Stage::Enqueue => "enqueue",
            Stage::Schedule => "schedule",
            Stage::FirstToken => "first_token",
            Stage::Completion => "completion",
        }
    }

    const ALL: [Stage; 7] = [
        Stage::Arrival,
        Stage::Admission,
        Stage::Route,
        Stage::Enqueue,
        Stage::Schedule,
        Stage::FirstToken,
        Stage::Completion,
    ];
}

/// Write-once lifecycle timestamps, in simulation microseconds.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Lifecycle {
    stamps: [Option<u64>; 7],
    /// Emission time of every output token, first token included.
    token_times_us: Vec<u64>,
}

impl Lifecycle {
    pub fn get(&self, stage: Stage) -> Option<u64> {
        self.stamps[stage as usize]
    }

    pub fn is_set(&self, stage: Stage) -> bool {
        self.get(stage).is_some()
    }

    /// Write `stage` at `time_us`. Fails if the stage was already written or
    /// if `time_us` precedes any earlier stage.
    pub fn stamp(
        &mut self,
        request_id: u64,
        stage: Stage,
        time_us: u64,
    ) -> Result<(), InvariantViolation> {
        if self.is_set(stage) {
            return Err(InvariantViolation::TimestampRewritten {
                request_id,
                stage: stage.name(),
            });
        }
        if let Some(earlier) = Stage::ALL
            .iter()
            .take_while(|s| **s < stage)
            .filter_map(|s| self.get(*s))
            .max()
        {
            if time_us < earlier {
                return Err(InvariantViolation::Causality {
                    request_id,
                    stage: stage.name(),
                    earlier,
                    later: time_us,
                });
            }
        }
        self.stamps[stage as usize] = Some(time_us);
        Ok(())
    }

    /// Record one output token emitted at `time_us`.
    pub fn record_token(&mut self, request_id: u64, time_us: u64) -> Result<(), InvariantViolation> {
        if let Some(&last) = self.token_times_us.last() {
            if time_us < last {
                return Err(InvariantViolation::NegativeInterTokenGap { request_id });
            }
        }
        self.token_times_us.push(time_us);
        Ok(())
    }

    /// Re-check causal order over every written stamp and the token times.
    pub fn verify(&self, request_id: u64) -> Result<(), InvariantViolation> {
        let mut prev: Option<(u64, Stage)> = None;
        for stage in Stage::ALL {
            if let Some(t) = self.get(stage) {
                if let Some((earlier, _)) = prev {
                    if t < earlier {
                        return Err(InvariantViolation::Causality {
                            request_id,
                            stage: stage.name(),
                            earlier,
                            later: t,
                        });
                    }
                }
                prev = Some((t, stage));
            }
        }
        if self.token_times_us.windows(2).any(|w| w[1] < w[0]) {
            return Err(InvariantViolation::NegativeInterTokenGap { request_id });
        }
        Ok(())
    }

    pub fn token_times_us(&self) -> &[u64] {
        &self.token_times_us
    }

    /// Gaps between consecutive output tokens (excludes the first token).
    pub fn inter_token_gaps_us(&self) -> Vec<u64> {
        self.token_times_us
            .windows(2)
            .map(|w| w[1] - w[0])
            .collect()
    }
}

/// A single LLM inference request flowing through the simulated fleet.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Request {
    /// Unique request identifier.
    pub id: u64,
    /// Prompt token ids.
    pub input_tokens: Vec<u32>,
    /// Output token ids the request will generate.
    pub output_tokens: Vec<u32>,
    /// Tenant / SLO class label. Empty means unlabeled.
    pub slo_class: String,
    /// Scheduling priority assigned by the instance's priority policy.
    pub priority: f64,
    pub state: RequestState,
    /// Tokens whose KV entries have been computed.
    pub progress: usize,
    /// Value `progress` takes when the current step finishes.
    pub computed_target: usize,
    /// Output tokens emitted so far; survives preemption.
    pub emitted_tokens: usize,
    /// Times this request was preempted.
    pub preemptions: u32,
    pub lifecycle: Lifecycle,
}

impl Request {
    /// Create a request arriving at `arrival_us`.
    pub fn new(
        id: u64,
        arrival_us: u64,
        input_tokens: Vec<u32>,
        output_tokens: Vec<u32>,
        slo_class: impl Into<String>,
    ) -> Self {
        let mut lifecycle = Lifecycle::default();
        lifecycle.stamps[Stage::Arrival as usize] = Some(arrival_us);
        Self {
            id,
            input_tokens,
            output_tokens,
            slo_class: slo_class.into(),
            priority: 0.0,
            state: RequestState::Queued,
            progress: 0,
            computed_target: 0,
            emitted_tokens: 0,
            preemptions: 0,
            lifecycle,
        }
    }

    pub fn arrival_us(&self) -> u64 {
        self.lifecycle.get(Stage::Arrival).unwrap_or(0)
    }

    pub fn input_len(&self) -> usize {
        self.input_tokens.len()
    }

    pub fn output_len(&self) -> usize {
        self.output_tokens.len()
    }

    /// Output tokens that must be emitted before completion (at least one).
    pub fn target_output_tokens(&self) -> usize {
        self.output_len().max(1)
    }

    /// `progress` value at which the request has emitted its last token.
    pub fn final_progress(&self) -> usize {
        self.input_len() + self.target_output_tokens() - 1
    }

    /// Token ids in `[start, end)` of the combined input+output sequence.
    pub fn tokens_in(&self, start: usize, end: usize) -> Vec<u32> {
        (start..end)
            .filter_map(|i| {
                if i < self.input_len() {
                    self.input_tokens.get(i).copied()
                } else {
                    self.output_tokens.get(i - self.input_len()).copied()
                }
            })
            .collect()
    }

    /// `progress` the request must reach before it can emit its next token.
    /// After a preemption this covers the prompt plus every output token
    /// emitted so far except the last, which is recomputed from scratch.
    pub fn prefill_target(&self) -> usize {
        self.input_len() + self.emitted_tokens.saturating_sub(1)
    }

    /// Whether prefill (or post-preemption recompute) is complete.
    pub fn in_decode(&self) -> bool {
        self.progress >= self.prefill_target()
    }

    /// All output tokens have been emitted.
    pub fn is_finished(&self) -> bool {
        self.emitted_tokens >= self.target_output_tokens()
    }

    /// Reset compute progress after preemption. Lifecycle stamps and emitted
    /// tokens are kept.
    pub fn reset_progress(&mut self) {
        self.progress = 0;
        self.computed_target = 0;
        self.state = RequestState::Queued;
        self.preemptions += 1;
    }

    /// Policy-facing view of this request.
    pub fn info(&self) -> RequestInfo<'_> {
        RequestInfo {
            id: self.id,
            input_tokens: &self.input_tokens,
            output_len: self.output_len() as u32,
            slo_class: &self.slo_class,
        }
    }
}
