use std::cmp::Ordering;
use std::collections::BinaryHeap;
use std::time::Duration;

use tokio::time::{Instant, sleep_until};

struct DueEvent<T> {
    due: Instant,
    seq: u64,
    payload: T,
}

impl<T> PartialEq for DueEvent<T> {
    fn eq(&self, other: &Self) -> bool {
        self.due == other.due && self.seq == other.seq
    }
}

impl<T> Eq for DueEvent<T> {}

impl<T> PartialOrd for DueEvent<T> {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl<T> Ord for DueEvent<T> {
    // Reversed so the max-heap pops the earliest due event first.
    fn cmp(&self, other: &Self) -> Ordering {
        other
            .due
            .cmp(&self.due)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

/// Min-heap of timed events driven by tokio's clock.
///
/// Because waits go through `tokio::time`, tests can run the queue on a paused
/// clock. `wait_next` is cancel-safe: an event is only removed once it is due.
pub struct EventQueue<T> {
    heap: BinaryHeap<DueEvent<T>>,
    next_seq: u64,
}

impl<T> Default for EventQueue<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> EventQueue<T> {
    pub fn new() -> Self {
        Self {
            heap: BinaryHeap::new(),
            next_seq: 0,
        }
    }

    pub fn schedule_in(&mut self, delay: Duration, payload: T) {
        self.schedule_at(Instant::now() + delay, payload);
    }

    pub fn schedule_at(&mut self, due: Instant, payload: T) {
        let seq = self.next_seq;
        self.next_seq += 1;
        self.heap.push(DueEvent { due, seq, payload });
    }

    pub fn len(&self) -> usize {
        self.heap.len()
    }

    pub fn is_empty(&self) -> bool {
        self.heap.is_empty()
    }

    pub fn next_due(&self) -> Option<Instant> {
        self.heap.peek().map(|e| e.due)
    }

    /// Pop the earliest event if it is already due.
    pub fn pop_due(&mut self) -> Option<T> {
        let now = Instant::now();
        match self.heap.peek() {
            Some(head) if head.due <= now => self.heap.pop().map(|e| e.payload),
            _ => None,
        }
    }

    /// Sleep until the earliest event is due and return it.
    /// Pends forever on an empty queue; guard the call with `is_empty`.
    pub async fn wait_next(&mut self) -> T {
        loop {
            match self.next_due() {
                Some(due) => {
                    sleep_until(due).await;
                    if let Some(payload) = self.pop_due() {
                        return payload;
                    }
                }
                None => std::future::pending::<()>().await,
            }
        }
    }

    /// Remove every pending event, earliest first.
    pub fn drain(&mut self) -> Vec<T> {
        let mut events = Vec::with_capacity(self.heap.len());
        while let Some(event) = self.heap.pop() {
            events.push(event.payload);
        }
        events
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn test_events_pop_in_due_order() {
        let mut queue = EventQueue::new();
        queue.schedule_in(Duration::from_secs(30), "c");
        queue.schedule_in(Duration::from_secs(10), "a");
        queue.schedule_in(Duration::from_secs(20), "b");

        let start = Instant::now();
        assert_eq!(queue.wait_next().await, "a");
        assert_eq!(queue.wait_next().await, "b");
        assert_eq!(queue.wait_next().await, "c");
        assert!(queue.is_empty());
        assert!(start.elapsed() >= Duration::from_secs(30));
    }

    #[tokio::test(start_paused = true)]
    async fn test_equal_due_times_keep_insertion_order() {
        let mut queue = EventQueue::new();
        let due = Instant::now() + Duration::from_secs(5);
        queue.schedule_at(due, 1);
        queue.schedule_at(due, 2);
        queue.schedule_at(due, 3);

        assert_eq!(queue.wait_next().await, 1);
        assert_eq!(queue.wait_next().await, 2);
        assert_eq!(queue.wait_next().await, 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_pop_due_ignores_future_events() {
        let mut queue = EventQueue::new();
        queue.schedule_in(Duration::from_secs(60), ());
        assert!(queue.pop_due().is_none());
        assert_eq!(queue.len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_dropped_wait_keeps_event() {
        let mut queue = EventQueue::new();
        queue.schedule_in(Duration::from_secs(60), 42);

        let timed_out =
            tokio::time::timeout(Duration::from_secs(1), queue.wait_next()).await;
        assert!(timed_out.is_err());
        assert_eq!(queue.len(), 1);
        assert_eq!(queue.drain(), vec![42]);
    }
}
