//! Discrete-event core: a min-heap of timestamped events.
//!
//! Events are totally ordered by `(time_us, ordinal)`. The ordinal is a
//! counter owned by each [`EventQueue`] and starts at zero on construction,
//! so two simulations built from the same inputs pop events in the same
//! order no matter what else ran in the process.

use crate::clock::SimClock;
use crate::error::InvariantViolation;
use std::collections::BinaryHeap;

/// A timestamped event for the priority queue.
#[derive(Debug, Clone)]
struct TimedEvent<E> {
    time_us: u64,
    ordinal: u64,
    event: E,
}

impl<E> PartialEq for TimedEvent<E> {
    fn eq(&self, other: &Self) -> bool {
        self.time_us == other.time_us && self.ordinal == other.ordinal
    }
}

impl<E> Eq for TimedEvent<E> {}

impl<E> PartialOrd for TimedEvent<E> {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl<E> Ord for TimedEvent<E> {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        // BinaryHeap is a max-heap; we want min-heap
        other
            .time_us
            .cmp(&self.time_us)
            .then(other.ordinal.cmp(&self.ordinal))
    }
}

/// Event queue plus the clock it drives.
#[derive(Debug)]
pub struct EventQueue<E> {
    heap: BinaryHeap<TimedEvent<E>>,
    next_ordinal: u64,
    clock: SimClock,
    processed: u64,
}

impl<E> Default for EventQueue<E> {
    fn default() -> Self {
        Self::new()
    }
}

impl<E> EventQueue<E> {
    pub fn new() -> Self {
        Self {
            heap: BinaryHeap::new(),
            next_ordinal: 0,
            clock: SimClock::new(),
            processed: 0,
        }
    }

    /// Schedule `event` at `time_us`.
    pub fn schedule(&mut self, time_us: u64, event: E) {
        self.heap.push(TimedEvent {
            time_us,
            ordinal: self.next_ordinal,
            event,
        });
        self.next_ordinal += 1;
    }

    /// Timestamp of the next event without removing it.
    pub fn peek_time(&self) -> Option<u64> {
        self.heap.peek().map(|e| e.time_us)
    }

    /// Pop the earliest event and advance the clock to it.
    ///
    /// Returns `Ok(None)` when the queue is empty or the next event lies
    /// beyond `horizon_us`; such events stay queued and are never processed.
    pub fn pop_until(&mut self, horizon_us: u64) -> Result<Option<(u64, E)>, InvariantViolation> {
        match self.peek_time() {
            Some(t) if t <= horizon_us => {}
            _ => return Ok(None),
        }
        let Some(next) = self.heap.pop() else {
            return Ok(None);
        };
        self.clock.advance_to_us(next.time_us)?;
        self.processed += 1;
        Ok(Some((next.time_us, next.event)))
    }

    pub fn now_us(&self) -> u64 {
        self.clock.now_us()
    }

    pub fn len(&self) -> usize {
        self.heap.len()
    }

    pub fn is_empty(&self) -> bool {
        self.heap.is_empty()
    }

    /// Events popped so far.
    pub fn processed(&self) -> u64 {
        self.processed
    }

    /// Ordinal the next scheduled event will receive.
    pub fn next_ordinal(&self) -> u64 {
        self.next_ordinal
    }
}
