//! Indexed min-heap of connection deadlines.
//!
//! One node per id. A side table maps each id to its slot in the heap so a
//! deadline can be moved or cancelled in O(log n) without scanning. The table
//! is updated inside every swap, never as a separate pass.
//!
//! # Complexity
//!
//! - `add` / `adjust` / `cancel` / `do_work`: O(log n)
//! - `tick`: O(k log n) for k expired nodes
//! - next deadline: O(1)

use std::collections::HashMap;
use std::hash::Hash;
use std::time::{Duration, Instant};

pub type TimeoutCallback = Box<dyn FnOnce() + Send>;

struct TimerNode<Id> {
    id: Id,
    expires: Instant,
    cb: TimeoutCallback,
}

pub struct HeapTimer<Id> {
    heap: Vec<TimerNode<Id>>,
    index: HashMap<Id, usize>,
}

impl<Id: Copy + Eq + Hash> HeapTimer<Id> {
    pub fn new() -> Self {
        Self::with_capacity(64)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            heap: Vec::with_capacity(capacity),
            index: HashMap::with_capacity(capacity),
        }
    }

    pub fn len(&self) -> usize {
        self.heap.len()
    }

    pub fn is_empty(&self) -> bool {
        self.heap.is_empty()
    }

    pub fn contains(&self, id: Id) -> bool {
        self.index.contains_key(&id)
    }

    /// Arm `id` to fire `cb` after `timeout`. An id that is already tracked
    /// gets its deadline and callback replaced in place.
    pub fn add(&mut self, id: Id, timeout: Duration, cb: TimeoutCallback) {
        let expires = Instant::now() + timeout;
        match self.index.get(&id).copied() {
            Some(i) => {
                self.heap[i].expires = expires;
                self.heap[i].cb = cb;
                if !self.sift_down(i, self.heap.len()) {
                    self.sift_up(i);
                }
            }
            None => {
                let i = self.heap.len();
                self.index.insert(id, i);
                self.heap.push(TimerNode { id, expires, cb });
                self.sift_up(i);
            }
        }
    }

    /// Push the deadline of a tracked id to `timeout` from now.
    /// Returns false if `id` is not tracked.
    pub fn adjust(&mut self, id: Id, timeout: Duration) -> bool {
        let Some(i) = self.index.get(&id).copied() else {
            return false;
        };
        self.heap[i].expires = Instant::now() + timeout;
        if !self.sift_down(i, self.heap.len()) {
            self.sift_up(i);
        }
        true
    }

    /// Fire the callback for `id` immediately and drop the node.
    pub fn do_work(&mut self, id: Id) {
        if let Some(node) = self.index.get(&id).copied().and_then(|i| self.remove_at(i)) {
            (node.cb)();
        }
    }

    /// Drop the node for `id` without firing it.
    pub fn cancel(&mut self, id: Id) -> bool {
        match self.index.get(&id).copied() {
            Some(i) => {
                self.remove_at(i);
                true
            }
            None => false,
        }
    }

    /// Remove the earliest node without firing it.
    pub fn pop(&mut self) {
        debug_assert!(!self.heap.is_empty(), "pop on empty timer heap");
        self.remove_at(0);
    }

    /// Fire and remove every node whose deadline has passed.
    pub fn tick(&mut self) {
        let now = Instant::now();
        while let Some(root) = self.heap.first() {
            if root.expires > now {
                break;
            }
            let Some(node) = self.remove_at(0) else {
                break;
            };
            (node.cb)();
        }
    }

    /// Run `tick`, then report how long until the next deadline.
    /// `None` means nothing is armed.
    pub fn next_tick(&mut self) -> Option<Duration> {
        self.tick();
        self.heap
            .first()
            .map(|root| root.expires.saturating_duration_since(Instant::now()))
    }

    /// `next_tick` in epoll terms: milliseconds, -1 for "no timeout".
    pub fn next_tick_ms(&mut self) -> i32 {
        match self.next_tick() {
            // Round up so we never wake a hair before the deadline and spin.
            Some(d) => d.as_micros().div_ceil(1000).min(i32::MAX as u128) as i32,
            None => -1,
        }
    }

    pub fn clear(&mut self) {
        self.heap.clear();
        self.index.clear();
    }

    fn remove_at(&mut self, i: usize) -> Option<TimerNode<Id>> {
        let last = self.heap.len().checked_sub(1)?;
        if i < last {
            self.swap_nodes(i, last);
        }
        let node = self.heap.pop()?;
        self.index.remove(&node.id);
        if i < self.heap.len() && !self.sift_down(i, self.heap.len()) {
            self.sift_up(i);
        }
        Some(node)
    }

    fn swap_nodes(&mut self, i: usize, j: usize) {
        self.heap.swap(i, j);
        self.index.insert(self.heap[i].id, i);
        self.index.insert(self.heap[j].id, j);
    }

    fn sift_up(&mut self, mut i: usize) {
        while i > 0 {
            let parent = (i - 1) / 2;
            if self.heap[parent].expires <= self.heap[i].expires {
                break;
            }
            self.swap_nodes(parent, i);
            i = parent;
        }
    }

    /// Returns true if the node moved.
    fn sift_down(&mut self, start: usize, n: usize) -> bool {
        let mut i = start;
        let mut child = 2 * i + 1;
        while child < n {
            if child + 1 < n && self.heap[child + 1].expires < self.heap[child].expires {
                child += 1;
            }
            if self.heap[i].expires <= self.heap[child].expires {
                break;
            }
            self.swap_nodes(i, child);
            i = child;
            child = 2 * i + 1;
        }
        i > start
    }

    #[cfg(test)]
    fn check_invariants(&self) {
        assert_eq!(self.heap.len(), self.index.len());
        for (i, node) in self.heap.iter().enumerate() {
            assert_eq!(self.index[&node.id], i);
            if i > 0 {
                assert!(self.heap[(i - 1) / 2].expires <= node.expires);
            }
        }
    }
}

impl<Id: Copy + Eq + Hash> Default for HeapTimer<Id> {
    fn default() -> Self {
        Self::new()
    }
}
