//! Bounded queue with an explicit drop policy.
//!
//! Every inter-component queue in the runtime is bounded. Back-pressure is
//! expressed through capacity plus a [`DropPolicy`], never by blocking the
//! producer: frame paths prefer freshness (drop oldest), event paths prefer
//! integrity (drop newest, surfaced through the drop counter).

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::Notify;

/// What to do when a bounded queue is full.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum DropPolicy {
    /// Evict the oldest queued item to make room for the new one.
    #[default]
    DropOldest,
    /// Reject the incoming item, keeping what is already queued.
    DropNew,
}

/// Outcome of a push against a bounded queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PushOutcome {
    /// Item enqueued without displacing anything.
    Queued,
    /// Item enqueued; the oldest queued item was evicted.
    Evicted,
    /// Item rejected (queue full, `DropNew` policy) or queue closed.
    Rejected,
}

impl PushOutcome {
    /// Whether the pushed item is now in the queue.
    #[must_use]
    pub fn accepted(self) -> bool {
        !matches!(self, Self::Rejected)
    }
}

/// Single-consumer bounded queue with drop-policy back-pressure.
///
/// Producers push synchronously and never block; the consumer awaits items
/// via [`pop`](Self::pop). Dropped items (either evicted or rejected) are
/// counted and exposed as a metric.
pub struct BoundedQueue<T> {
    items: Mutex<VecDeque<T>>,
    capacity: usize,
    policy: DropPolicy,
    dropped: AtomicU64,
    closed: AtomicBool,
    notify: Notify,
}

impl<T> BoundedQueue<T> {
    /// Creates a queue with the given capacity and drop policy.
    ///
    /// Capacity 0 is clamped to 1 so a push can always be represented.
    pub fn new(capacity: usize, policy: DropPolicy) -> Self {
        Self {
            items: Mutex::new(VecDeque::with_capacity(capacity.max(1))),
            capacity: capacity.max(1),
            policy,
            dropped: AtomicU64::new(0),
            closed: AtomicBool::new(false),
            notify: Notify::new(),
        }
    }

    /// Pushes an item, applying the drop policy when full.
    pub fn push(&self, item: T) -> PushOutcome {
        if self.closed.load(Ordering::Acquire) {
            return PushOutcome::Rejected;
        }

        let outcome = {
            let mut items = self.items.lock();
            if items.len() < self.capacity {
                items.push_back(item);
                PushOutcome::Queued
            } else {
                match self.policy {
                    DropPolicy::DropOldest => {
                        items.pop_front();
                        items.push_back(item);
                        self.dropped.fetch_add(1, Ordering::Relaxed);
                        PushOutcome::Evicted
                    }
                    DropPolicy::DropNew => {
                        self.dropped.fetch_add(1, Ordering::Relaxed);
                        PushOutcome::Rejected
                    }
                }
            }
        };

        if outcome.accepted() {
            self.notify.notify_one();
        }
        outcome
    }

    /// Removes the front item without waiting.
    pub fn try_pop(&self) -> Option<T> {
        self.items.lock().pop_front()
    }

    /// Awaits the next item.
    ///
    /// Returns `None` once the queue is closed and fully drained.
    pub async fn pop(&self) -> Option<T> {
        loop {
            // Register for wakeup before checking, so a push between the check
            // and the await is not lost.
            let notified = self.notify.notified();
            if let Some(item) = self.try_pop() {
                return Some(item);
            }
            if self.closed.load(Ordering::Acquire) {
                return None;
            }
            notified.await;
        }
    }

    /// Closes the queue. Remaining items stay poppable; new pushes are rejected.
    pub fn close(&self) {
        self.closed.store(true, Ordering::Release);
        self.notify.notify_waiters();
        self.notify.notify_one();
    }

    /// Whether the queue has been closed.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Current number of queued items.
    #[must_use]
    pub fn len(&self) -> usize {
        self.items.lock().len()
    }

    /// Whether the queue is currently empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.items.lock().is_empty()
    }

    /// Total items dropped due to capacity, under either policy.
    #[must_use]
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    /// Configured capacity.
    #[must_use]
    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn drop_oldest_evicts_front() {
        let queue = BoundedQueue::new(2, DropPolicy::DropOldest);
        assert_eq!(queue.push(1), PushOutcome::Queued);
        assert_eq!(queue.push(2), PushOutcome::Queued);
        assert_eq!(queue.push(3), PushOutcome::Evicted);
        assert_eq!(queue.try_pop(), Some(2));
        assert_eq!(queue.try_pop(), Some(3));
        assert_eq!(queue.dropped(), 1);
    }

    #[test]
    fn drop_new_rejects_incoming() {
        let queue = BoundedQueue::new(2, DropPolicy::DropNew);
        queue.push(1);
        queue.push(2);
        assert_eq!(queue.push(3), PushOutcome::Rejected);
        assert_eq!(queue.try_pop(), Some(1));
        assert_eq!(queue.dropped(), 1);
    }

    #[test]
    fn ring_of_n_with_n_plus_one_writes_loses_exactly_the_oldest() {
        let n = 5;
        let queue = BoundedQueue::new(n, DropPolicy::DropOldest);
        for i in 0..=n {
            queue.push(i);
        }
        assert_eq!(queue.dropped(), 1);
        assert_eq!(queue.try_pop(), Some(1));
    }

    #[tokio::test]
    async fn pop_waits_for_push() {
        let queue = Arc::new(BoundedQueue::new(4, DropPolicy::DropOldest));
        let consumer = {
            let queue = Arc::clone(&queue);
            tokio::spawn(async move { queue.pop().await })
        };

        tokio::task::yield_now().await;
        queue.push(42u32);
        assert_eq!(consumer.await.unwrap(), Some(42));
    }

    #[tokio::test]
    async fn close_drains_then_ends() {
        let queue = BoundedQueue::new(4, DropPolicy::DropOldest);
        queue.push(1);
        queue.close();
        assert_eq!(queue.push(2), PushOutcome::Rejected);
        assert_eq!(queue.pop().await, Some(1));
        assert_eq!(queue.pop().await, None);
    }
}
