// =============================================================================
// Bounded queues — the only shared mutable state between pipeline workers
// =============================================================================
//
// Every queue is its own concurrency boundary: producers push with an explicit
// overflow policy, consumers pop with a short poll so they can observe the
// shutdown flag. Nothing outside a queue may inspect its contents.
// =============================================================================

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use parking_lot::Mutex;

/// A fixed-capacity FIFO ring shared between one producer side and one
/// consumer side. Overflow behavior is chosen per call site: `try_push`
/// rejects the newest item, `push_drop_oldest` evicts the head.
pub struct BoundedQueue<T> {
    inner: Mutex<VecDeque<T>>,
    capacity: usize,
    dropped: AtomicU64,
}

impl<T> BoundedQueue<T> {
    pub fn new(capacity: usize) -> Self {
        Self {
            inner: Mutex::new(VecDeque::with_capacity(capacity)),
            capacity,
            dropped: AtomicU64::new(0),
        }
    }

    /// Push, rejecting the new item when the queue is full. Returns the
    /// rejected item so the caller can log what was lost.
    pub fn try_push(&self, item: T) -> Result<(), T> {
        let mut q = self.inner.lock();
        if q.len() >= self.capacity {
            self.dropped.fetch_add(1, Ordering::Relaxed);
            return Err(item);
        }
        q.push_back(item);
        Ok(())
    }

    /// Push, evicting the oldest item when the queue is full. Returns the
    /// evicted item, if any.
    pub fn push_drop_oldest(&self, item: T) -> Option<T> {
        let mut q = self.inner.lock();
        let evicted = if q.len() >= self.capacity {
            self.dropped.fetch_add(1, Ordering::Relaxed);
            q.pop_front()
        } else {
            None
        };
        q.push_back(item);
        evicted
    }

    /// Non-blocking pop of the oldest item.
    pub fn pop(&self) -> Option<T> {
        self.inner.lock().pop_front()
    }

    /// Pop, polling for up to `timeout` in 50 ms steps. Returns `None` on
    /// timeout so worker loops can re-check their shutdown flag at least once
    /// per second.
    pub async fn pop_timeout(&self, timeout: Duration) -> Option<T> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            if let Some(item) = self.pop() {
                return Some(item);
            }
            if tokio::time::Instant::now() >= deadline {
                return None;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
    }

    /// Take everything currently queued, oldest first.
    pub fn drain(&self) -> Vec<T> {
        self.inner.lock().drain(..).collect()
    }

    pub fn len(&self) -> usize {
        self.inner.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.lock().is_empty()
    }

    /// Total items lost to overflow since construction.
    pub fn dropped_count(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fifo_order() {
        let q = BoundedQueue::new(4);
        q.try_push(1).unwrap();
        q.try_push(2).unwrap();
        q.try_push(3).unwrap();
        assert_eq!(q.pop(), Some(1));
        assert_eq!(q.pop(), Some(2));
        assert_eq!(q.pop(), Some(3));
        assert_eq!(q.pop(), None);
    }

    #[test]
    fn try_push_rejects_newest_when_full() {
        let q = BoundedQueue::new(2);
        q.try_push("a").unwrap();
        q.try_push("b").unwrap();
        assert_eq!(q.try_push("c"), Err("c"));
        assert_eq!(q.len(), 2);
        assert_eq!(q.dropped_count(), 1);
        // Oldest is still at the head.
        assert_eq!(q.pop(), Some("a"));
    }

    #[test]
    fn push_drop_oldest_evicts_head() {
        let q = BoundedQueue::new(2);
        q.push_drop_oldest(1);
        q.push_drop_oldest(2);
        let evicted = q.push_drop_oldest(3);
        assert_eq!(evicted, Some(1));
        assert_eq!(q.len(), 2);
        assert_eq!(q.pop(), Some(2));
        assert_eq!(q.pop(), Some(3));
        assert_eq!(q.dropped_count(), 1);
    }

    #[test]
    fn drain_empties_in_order() {
        let q = BoundedQueue::new(8);
        for i in 0..5 {
            q.try_push(i).unwrap();
        }
        assert_eq!(q.drain(), vec![0, 1, 2, 3, 4]);
        assert!(q.is_empty());
    }

    #[tokio::test]
    async fn pop_timeout_returns_none_when_empty() {
        let q: BoundedQueue<u8> = BoundedQueue::new(2);
        let got = q.pop_timeout(Duration::from_millis(60)).await;
        assert_eq!(got, None);
    }

    #[tokio::test]
    async fn pop_timeout_returns_item_immediately() {
        let q = BoundedQueue::new(2);
        q.try_push(7u8).unwrap();
        let got = q.pop_timeout(Duration::from_millis(500)).await;
        assert_eq!(got, Some(7));
    }
}
