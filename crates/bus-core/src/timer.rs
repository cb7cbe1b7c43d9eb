//! Per-thread timer queue: `(deadline, callback-id)` ordered by deadline,
//! drained once per tick right after the poller returns. Used for address
//! TTL expiry and reconnect/resolve retry cadences.

use std::{cmp::Reverse, collections::BinaryHeap};

use bus_timing::Nanos;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct TimerId(pub u64);

struct Entry {
    deadline: Nanos,
    id: TimerId,
}

impl PartialEq for Entry {
    fn eq(&self, other: &Self) -> bool {
        self.deadline == other.deadline
    }
}
impl Eq for Entry {}
impl PartialOrd for Entry {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}
impl Ord for Entry {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.deadline.cmp(&other.deadline)
    }
}

#[derive(Default)]
pub struct TimerQueue {
    heap: BinaryHeap<Reverse<Entry>>,
    next_id: u64,
    cancelled: std::collections::HashSet<TimerId>,
}

impl TimerQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn schedule(&mut self, deadline: Nanos) -> TimerId {
        let id = TimerId(self.next_id);
        self.next_id += 1;
        self.heap.push(Reverse(Entry { deadline, id }));
        id
    }

    pub fn cancel(&mut self, id: TimerId) {
        self.cancelled.insert(id);
    }

    /// Pops and returns every timer id whose deadline is `<= now`.
    pub fn expired(&mut self, now: Nanos) -> Vec<TimerId> {
        let mut fired = Vec::new();
        while let Some(Reverse(entry)) = self.heap.peek() {
            if entry.deadline > now {
                break;
            }
            let Reverse(entry) = self.heap.pop().unwrap();
            if !self.cancelled.remove(&entry.id) {
                fired.push(entry.id);
            }
        }
        fired
    }

    /// Nanos until the next deadline, for computing the poll timeout.
    pub fn next_deadline(&self) -> Option<Nanos> {
        self.heap.peek().map(|Reverse(e)| e.deadline)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fires_in_deadline_order() {
        let mut q = TimerQueue::new();
        let a = q.schedule(Nanos(20));
        let b = q.schedule(Nanos(10));
        let fired = q.expired(Nanos(15));
        assert_eq!(fired, vec![b]);
        let fired = q.expired(Nanos(20));
        assert_eq!(fired, vec![a]);
    }

    #[test]
    fn cancelled_timer_does_not_fire() {
        let mut q = TimerQueue::new();
        let a = q.schedule(Nanos(5));
        q.cancel(a);
        assert!(q.expired(Nanos(10)).is_empty());
    }
}
