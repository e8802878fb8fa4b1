//! Bounded FIFO queue with drop-oldest overflow.
//!
//! Backs the in-process bus subscriptions and the audit buffer. A producer
//! never blocks: when the queue is full the oldest element is discarded and
//! a shared drop counter is incremented. Consumers await new elements.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::Notify;

/// Shared bounded queue. Cloning produces another handle to the same queue.
#[derive(Clone)]
pub struct BoundedQueue<T> {
    inner: Arc<Inner<T>>,
}

struct Inner<T> {
    items: Mutex<VecDeque<T>>,
    notify: Notify,
    capacity: usize,
    dropped: AtomicU64,
    closed: AtomicU64,
}

impl<T> BoundedQueue<T> {
    pub fn new(capacity: usize) -> Self {
        Self {
            inner: Arc::new(Inner {
                items: Mutex::new(VecDeque::with_capacity(capacity.min(1024))),
                notify: Notify::new(),
                capacity: capacity.max(1),
                dropped: AtomicU64::new(0),
                closed: AtomicU64::new(0),
            }),
        }
    }

    /// Enqueue an element. Never blocks; evicts the oldest element when the
    /// queue is at capacity and counts the eviction.
    pub fn push(&self, item: T) {
        {
            let mut items = self.inner.items.lock().expect("queue lock poisoned");
            if items.len() >= self.inner.capacity {
                items.pop_front();
                self.inner.dropped.fetch_add(1, Ordering::Relaxed);
            }
            items.push_back(item);
        }
        self.inner.notify.notify_one();
    }

    /// Dequeue the next element, waiting if the queue is empty. Returns
    /// `None` once the queue is closed and drained.
    pub async fn recv(&self) -> Option<T> {
        loop {
            // Register for notification before checking, so a push or close
            // landing between the check and the await still wakes us.
            let notified = self.inner.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            {
                let mut items = self.inner.items.lock().expect("queue lock poisoned");
                if let Some(item) = items.pop_front() {
                    return Some(item);
                }
                if self.inner.closed.load(Ordering::Acquire) != 0 {
                    return None;
                }
            }
            notified.await;
        }
    }

    /// Drain everything currently queued without waiting.
    pub fn drain(&self) -> Vec<T> {
        let mut items = self.inner.items.lock().expect("queue lock poisoned");
        items.drain(..).collect()
    }

    /// Close the queue. Pending elements remain receivable; `recv` returns
    /// `None` once they are gone.
    pub fn close(&self) {
        self.inner.closed.store(1, Ordering::Release);
        self.inner.notify.notify_waiters();
    }

    pub fn len(&self) -> usize {
        self.inner.items.lock().expect("queue lock poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Total elements discarded to overflow since creation.
    pub fn dropped(&self) -> u64 {
        self.inner.dropped.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn fifo_order_preserved() {
        let q = BoundedQueue::new(8);
        for i in 0..5 {
            q.push(i);
        }
        for i in 0..5 {
            assert_eq!(q.recv().await, Some(i));
        }
    }

    #[tokio::test]
    async fn overflow_drops_oldest_and_counts() {
        let q = BoundedQueue::new(3);
        for i in 0..5 {
            q.push(i);
        }
        assert_eq!(q.dropped(), 2);
        assert_eq!(q.recv().await, Some(2));
        assert_eq!(q.recv().await, Some(3));
        assert_eq!(q.recv().await, Some(4));
    }

    #[tokio::test]
    async fn close_wakes_waiters() {
        let q: BoundedQueue<u8> = BoundedQueue::new(2);
        let q2 = q.clone();
        let waiter = tokio::spawn(async move { q2.recv().await });
        tokio::task::yield_now().await;
        q.close();
        assert_eq!(waiter.await.unwrap(), None);
    }

    #[tokio::test]
    async fn recv_sees_pushes_from_other_handle() {
        let q = BoundedQueue::new(2);
        let q2 = q.clone();
        let waiter = tokio::spawn(async move { q2.recv().await });
        tokio::task::yield_now().await;
        q.push(7u8);
        assert_eq!(waiter.await.unwrap(), Some(7));
    }
}
