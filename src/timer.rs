//! Timer queue for the event loop.
//!
//! Timeouts are data, not callbacks: each scheduled entry carries the
//! generation it was armed in, and the monitor ignores entries whose
//! generation has moved on. Cancellation is therefore free — state resets
//! just bump the generation.

use std::cmp::Ordering;
use std::collections::BinaryHeap;

struct Entry<T> {
    at_ms: u64,
    seq: u64,
    generation: u64,
    event: T,
}

impl<T> PartialEq for Entry<T> {
    fn eq(&self, other: &Self) -> bool {
        self.at_ms == other.at_ms && self.seq == other.seq
    }
}

impl<T> Eq for Entry<T> {}

impl<T> PartialOrd for Entry<T> {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl<T> Ord for Entry<T> {
    // Reversed so the BinaryHeap pops the earliest deadline first.
    fn cmp(&self, other: &Self) -> Ordering {
        (other.at_ms, other.seq).cmp(&(self.at_ms, self.seq))
    }
}

pub struct TimerQueue<T> {
    heap: BinaryHeap<Entry<T>>,
    seq: u64,
}

impl<T> Default for TimerQueue<T> {
    fn default() -> Self {
        TimerQueue {
            heap: BinaryHeap::new(),
            seq: 0,
        }
    }
}

impl<T> TimerQueue<T> {
    pub fn new() -> TimerQueue<T> {
        TimerQueue::default()
    }

    pub fn schedule(&mut self, at_ms: u64, generation: u64, event: T) {
        self.seq += 1;
        self.heap.push(Entry {
            at_ms,
            seq: self.seq,
            generation,
            event,
        });
    }

    /// Pops every entry due at or before `now`, in deadline order.
    pub fn due(&mut self, now_ms: u64) -> Vec<(u64, T)> {
        let mut fired = Vec::new();
        while let Some(head) = self.heap.peek() {
            if head.at_ms > now_ms {
                break;
            }
            let e = self.heap.pop().unwrap();
            fired.push((e.generation, e.event));
        }
        fired
    }

    pub fn next_deadline(&self) -> Option<u64> {
        self.heap.peek().map(|e| e.at_ms)
    }

    pub fn clear(&mut self) {
        self.heap.clear();
    }

    pub fn len(&self) -> usize {
        self.heap.len()
    }

    pub fn is_empty(&self) -> bool {
        self.heap.is_empty()
    }
}
