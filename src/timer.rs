//! Oneshot timer wheel.
//!
//! A binary min-heap of pending callbacks keyed by `(deadline, seq)`. The
//! sequence counter gives equal-deadline entries a stable FIFO order.
//! Expiration is driven with an explicit `now` so the wheel stays testable
//! without sleeping.

use std::cmp::Reverse;
use std::collections::BinaryHeap;
use std::time::Instant;

use crate::types::SocketId;

/// Callback fired when a timer expires.
pub(crate) type TimerCallback = Box<dyn FnOnce() + Send>;

struct TimerEntry {
    deadline: Instant,
    seq: u64,
    owner: SocketId,
    callback: TimerCallback,
}

impl PartialEq for TimerEntry {
    fn eq(&self, other: &Self) -> bool {
        self.deadline == other.deadline && self.seq == other.seq
    }
}

impl Eq for TimerEntry {}

impl PartialOrd for TimerEntry {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for TimerEntry {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.deadline
            .cmp(&other.deadline)
            .then(self.seq.cmp(&other.seq))
    }
}

/// Pending oneshot timers, ordered by deadline then insertion.
pub(crate) struct TimerWheel {
    heap: BinaryHeap<Reverse<TimerEntry>>,
    next_seq: u64,
}

impl TimerWheel {
    pub(crate) fn new() -> Self {
        Self {
            heap: BinaryHeap::new(),
            next_seq: 0,
        }
    }

    /// Insert a timer owned by `owner` that fires once `deadline` is reached.
    pub(crate) fn schedule(&mut self, owner: SocketId, deadline: Instant, callback: TimerCallback) {
        let seq = self.next_seq;
        self.next_seq = self.next_seq.wrapping_add(1);
        self.heap.push(Reverse(TimerEntry {
            deadline,
            seq,
            owner,
            callback,
        }));
    }

    /// Remove every pending entry owned by `owner`.
    ///
    /// Entries are removed from the heap, not tombstoned, so a cancelled
    /// callback can never be returned by a later [`pop_expired`] call.
    ///
    /// [`pop_expired`]: TimerWheel::pop_expired
    pub(crate) fn cancel_all(&mut self, owner: SocketId) {
        self.heap.retain(|e| e.0.owner != owner);
    }

    /// Remove and return the callbacks of every entry with `deadline <= now`,
    /// in deadline order with ties in insertion order.
    pub(crate) fn pop_expired(&mut self, now: Instant) -> Vec<TimerCallback> {
        let mut due = Vec::new();
        while let Some(Reverse(entry)) = self.heap.peek() {
            if entry.deadline > now {
                break;
            }
            if let Some(Reverse(entry)) = self.heap.pop() {
                due.push(entry.callback);
            }
        }
        due
    }

    /// Deadline of the soonest pending entry, if any.
    pub(crate) fn next_deadline(&self) -> Option<Instant> {
        self.heap.peek().map(|e| e.0.deadline)
    }

    pub(crate) fn clear(&mut self) {
        self.heap.clear();
    }

    #[cfg(test)]
    pub(crate) fn len(&self) -> usize {
        self.heap.len()
    }
}
