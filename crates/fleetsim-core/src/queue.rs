//! Per-instance wait queue.
//!
//! Holds admitted requests that are not running. Depth is O(1); reordering is
//! left to [`InstanceScheduler`](crate::scheduler::InstanceScheduler), which
//! sorts the queue in place before each batch formation.

use crate::request::Request;
use std::collections::VecDeque;

#[derive(Debug, Clone, Default)]
pub struct WaitQueue {
    requests: VecDeque<Request>,
}

impl WaitQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.requests.len()
    }

    pub fn is_empty(&self) -> bool {
        self.requests.is_empty()
    }

    pub fn push_back(&mut self, request: Request) {
        self.requests.push_back(request);
    }

    /// Re-queue a preempted request ahead of everything waiting.
    pub fn push_front(&mut self, request: Request) {
        self.requests.push_front(request);
    }

    pub fn front(&self) -> Option<&Request> {
        self.requests.front()
    }

    pub fn pop_front(&mut self) -> Option<Request> {
        self.requests.pop_front()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Request> {
        self.requests.iter()
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut Request> {
        self.requests.iter_mut()
    }

    /// Stable sort of the waiting requests.
    pub fn sort_by<F>(&mut self, compare: F)
    where
        F: FnMut(&Request, &Request) -> std::cmp::Ordering,
    {
        self.requests.make_contiguous().sort_by(compare);
    }
}
