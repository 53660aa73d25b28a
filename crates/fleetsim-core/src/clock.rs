//! Logical clock shared by the event queue.
//!
//! Time is an integer count of microseconds. It only moves when an event is
//! popped and never moves backwards.

use crate::error::InvariantViolation;
use serde::{Deserialize, Serialize};

/// Virtual simulation clock, in microseconds.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SimClock {
    current_us: u64,
}

impl SimClock {
    /// Create a new clock starting at time zero.
    pub fn new() -> Self {
        Self { current_us: 0 }
    }

    /// Current time in microseconds.
    pub fn now_us(&self) -> u64 {
        self.current_us
    }

    /// Advance the clock to `us`.
    ///
    /// Moving backwards is an invariant violation; the clock is left
    /// unchanged and the caller must stop the run.
    pub fn advance_to_us(&mut self, us: u64) -> Result<(), InvariantViolation> {
        if us < self.current_us {
            return Err(InvariantViolation::ClockRegression {
                current: self.current_us,
                target: us,
            });
        }
        self.current_us = us;
        Ok(())
    }
}
