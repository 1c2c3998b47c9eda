//! Unbounded, thread-safe FIFO shared by every producer/consumer pair.
//!
//! The queue itself enforces no capacity. Producers that want a bounded
//! depth call [`ConcurrentQueue::push_bounded`], which discards the oldest
//! items before enqueueing so the consumer always sees the freshest data.

use std::collections::VecDeque;
use std::sync::{Condvar, Mutex, MutexGuard};
use std::time::Duration;

/// A mutex-protected FIFO with a condition variable for blocking consumers.
///
/// Share it between threads behind an `Arc`. Every pushed item is returned
/// by exactly one pop, in push order.
pub struct ConcurrentQueue<T> {
    items: Mutex<VecDeque<T>>,
    available: Condvar,
}

impl<T> ConcurrentQueue<T> {
    /// Create an empty queue.
    pub fn new() -> Self {
        Self {
            items: Mutex::new(VecDeque::new()),
            available: Condvar::new(),
        }
    }

    /// Enqueue at the tail and wake one blocked waiter.
    pub fn push(&self, item: T) {
        let mut items = self.lock();
        items.push_back(item);
        self.available.notify_one();
    }

    /// Enqueue after discarding the oldest items so that at most `cap`
    /// items remain queued. Returns how many items were discarded.
    ///
    /// The trim and the push happen under one lock, so a concurrent
    /// consumer never observes more than `cap` items.
    pub fn push_bounded(&self, item: T, cap: usize) -> usize {
        let cap = cap.max(1);
        let mut items = self.lock();
        let mut dropped = 0;
        while items.len() >= cap {
            items.pop_front();
            dropped += 1;
        }
        items.push_back(item);
        self.available.notify_one();
        dropped
    }

    /// Pop the head without blocking. `None` when the queue is empty.
    pub fn try_pop(&self) -> Option<T> {
        self.lock().pop_front()
    }

    /// Block until an item is available, then pop it.
    pub fn wait_and_pop(&self) -> T {
        let mut items = self.lock();
        loop {
            if let Some(item) = items.pop_front() {
                return item;
            }
            items = self
                .available
                .wait(items)
                .unwrap_or_else(|poisoned| poisoned.into_inner());
        }
    }

    /// Like [`wait_and_pop`](Self::wait_and_pop) but gives up after
    /// `timeout`.
    pub fn wait_and_pop_timeout(&self, timeout: Duration) -> Option<T> {
        let items = self.lock();
        let (mut items, _) = self
            .available
            .wait_timeout_while(items, timeout, |q| q.is_empty())
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        items.pop_front()
    }

    /// Pop everything currently queued and return the newest item, if any.
    pub fn pop_latest(&self) -> Option<T> {
        let mut items = self.lock();
        let latest = items.pop_back();
        items.clear();
        latest
    }

    /// Remove every queued item. Returns how many were removed.
    pub fn clear(&self) -> usize {
        let mut items = self.lock();
        let n = items.len();
        items.clear();
        n
    }

    /// Number of queued items.
    pub fn len(&self) -> usize {
        self.lock().len()
    }

    /// Whether the queue is empty.
    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    // A panicking producer must not take the consumer down with it; the
    // VecDeque is never left half-modified by any method above.
    fn lock(&self) -> MutexGuard<'_, VecDeque<T>> {
        self.items
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl<T> Default for ConcurrentQueue<T> {
    fn default() -> Self {
        Self::new()
    }
}

// ── Tests ────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;
    use std::time::Instant;

    #[test]
    fn fifo_order() {
        let q = ConcurrentQueue::new();
        for i in 0..5 {
            q.push(i);
        }
        assert_eq!(q.len(), 5);
        let popped: Vec<_> = std::iter::from_fn(|| q.try_pop()).collect();
        assert_eq!(popped, vec![0, 1, 2, 3, 4]);
        assert!(q.is_empty());
    }

    #[test]
    fn try_pop_empty_returns_none_immediately() {
        let q: ConcurrentQueue<u32> = ConcurrentQueue::new();
        let start = Instant::now();
        assert!(q.try_pop().is_none());
        assert!(start.elapsed() < Duration::from_millis(50));
    }

    #[test]
    fn wait_and_pop_blocks_until_push() {
        let q = Arc::new(ConcurrentQueue::new());
        let producer = {
            let q = Arc::clone(&q);
            thread::spawn(move || {
                thread::sleep(Duration::from_millis(50));
                q.push(42u32);
            })
        };

        let start = Instant::now();
        let value = q.wait_and_pop();
        assert_eq!(value, 42);
        assert!(start.elapsed() >= Duration::from_millis(40));
        producer.join().unwrap();
    }

    #[test]
    fn wait_timeout_on_empty() {
        let q: ConcurrentQueue<u8> = ConcurrentQueue::new();
        assert!(q.wait_and_pop_timeout(Duration::from_millis(20)).is_none());
        q.push(7);
        assert_eq!(q.wait_and_pop_timeout(Duration::from_millis(20)), Some(7));
    }

    #[test]
    fn push_bounded_keeps_newest() {
        let q = ConcurrentQueue::new();
        let mut dropped = 0;
        for i in 0..10 {
            dropped += q.push_bounded(i, 3);
        }
        assert_eq!(dropped, 7);
        assert_eq!(q.len(), 3);
        assert_eq!(q.try_pop(), Some(7));
        assert_eq!(q.try_pop(), Some(8));
        assert_eq!(q.try_pop(), Some(9));
    }

    #[test]
    fn pop_latest_discards_older() {
        let q = ConcurrentQueue::new();
        q.push(1);
        q.push(2);
        q.push(3);
        assert_eq!(q.pop_latest(), Some(3));
        assert!(q.is_empty());
        assert_eq!(q.pop_latest(), None::<i32>);
    }

    #[test]
    fn concurrent_producers_lose_nothing() {
        const PRODUCERS: usize = 4;
        const PER_PRODUCER: usize = 1000;

        let q = Arc::new(ConcurrentQueue::new());
        let handles: Vec<_> = (0..PRODUCERS)
            .map(|p| {
                let q = Arc::clone(&q);
                thread::spawn(move || {
                    for i in 0..PER_PRODUCER {
                        q.push((p, i));
                    }
                })
            })
            .collect();

        let mut seen = Vec::with_capacity(PRODUCERS * PER_PRODUCER);
        while seen.len() < PRODUCERS * PER_PRODUCER {
            seen.push(q.wait_and_pop());
        }
        for h in handles {
            h.join().unwrap();
        }
        assert!(q.is_empty());

        // Per-producer order is preserved and nothing is duplicated.
        for p in 0..PRODUCERS {
            let from_p: Vec<_> = seen.iter().filter(|(id, _)| *id == p).map(|(_, i)| *i).collect();
            assert_eq!(from_p, (0..PER_PRODUCER).collect::<Vec<_>>());
        }
    }
}
