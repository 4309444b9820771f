//! A min-heap keyed by priority.
//!
//! Entries with equal priority come out in insertion order, so timers
//! registered for the same instant fire in the order they were set.

use std::cmp::{Ordering, Reverse};
use std::collections::BinaryHeap;

struct Entry<P, T> {
    priority: P,
    order: u64,
    item: T,
}

impl<P: Ord, T> PartialEq for Entry<P, T> {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl<P: Ord, T> Eq for Entry<P, T> {}

impl<P: Ord, T> PartialOrd for Entry<P, T> {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl<P: Ord, T> Ord for Entry<P, T> {
    fn cmp(&self, other: &Self) -> Ordering {
        self.priority
            .cmp(&other.priority)
            .then(self.order.cmp(&other.order))
    }
}

/// Min-priority queue.
pub struct PriorityQueue<P, T> {
    heap: BinaryHeap<Reverse<Entry<P, T>>>,
    next_order: u64,
}

impl<P: Ord + Copy, T> Default for PriorityQueue<P, T> {
    fn default() -> Self {
        Self {
            heap: BinaryHeap::new(),
            next_order: 0,
        }
    }
}

impl<P: Ord + Copy, T> PriorityQueue<P, T> {
    /// Number of entries.
    pub fn len(&self) -> usize {
        self.heap.len()
    }

    /// True if there are no entries.
    pub fn is_empty(&self) -> bool {
        self.heap.is_empty()
    }

    /// Add `item` at `priority`.
    pub fn push(&mut self, priority: P, item: T) {
        let order = self.next_order;
        self.next_order = self.next_order.wrapping_add(1);
        self.heap.push(Reverse(Entry {
            priority,
            order,
            item,
        }));
    }

    /// The lowest priority in the queue.
    pub fn first_priority(&self) -> Option<P> {
        self.heap.peek().map(|Reverse(e)| e.priority)
    }

    /// Remove the entry with the lowest priority.
    pub fn pop(&mut self) -> Option<(P, T)> {
        self.heap.pop().map(|Reverse(e)| (e.priority, e.item))
    }

    /// Remove the lowest entry if its priority is at or below `limit`.
    pub fn pop_due(&mut self, limit: P) -> Option<(P, T)> {
        match self.first_priority() {
            Some(p) if p <= limit => self.pop(),
            _ => None,
        }
    }
}

impl<P: std::fmt::Debug, T> std::fmt::Debug for PriorityQueue<P, T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PriorityQueue")
            .field("len", &self.heap.len())
            .field("first", &self.heap.peek().map(|Reverse(e)| &e.priority))
            .finish()
    }
}
