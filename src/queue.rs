// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Unbounded multi-producer, multi-consumer work queue with one-shot stop.
//!
//! The write-behind commit pipeline posts from caller context and drains from
//! a fixed pool of workers. `post` never blocks; `get` awaits until an item
//! is available or [`stop`](CommitQueue::stop) has been called, after which
//! every pending and future `get` resolves to `None` immediately.
//!
//! Delivery order is the total insertion order across all producers: there is
//! a single receiver guarded by a lock, and workers take turns on it.

use std::sync::atomic::{AtomicUsize, Ordering};

use tokio::sync::mpsc;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;

pub struct CommitQueue<T> {
    tx: mpsc::UnboundedSender<T>,
    rx: Mutex<mpsc::UnboundedReceiver<T>>,
    stop: CancellationToken,
    depth: AtomicUsize,
}

impl<T> CommitQueue<T> {
    pub fn new() -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        Self {
            tx,
            rx: Mutex::new(rx),
            stop: CancellationToken::new(),
            depth: AtomicUsize::new(0),
        }
    }

    /// Enqueue an item. Never blocks. Items posted after `stop` are dropped.
    pub fn post(&self, item: T) {
        if self.stop.is_cancelled() {
            return;
        }
        if self.tx.send(item).is_ok() {
            self.depth.fetch_add(1, Ordering::Relaxed);
        }
    }

    /// Await the next item in insertion order.
    ///
    /// Returns `None` once the queue has been stopped. Items still buffered
    /// at stop time are not delivered; stop means "shut down now", not
    /// "drain first".
    pub async fn get(&self) -> Option<T> {
        if self.stop.is_cancelled() {
            return None;
        }
        let mut rx = tokio::select! {
            guard = self.rx.lock() => guard,
            _ = self.stop.cancelled() => return None,
        };
        tokio::select! {
            biased;
            _ = self.stop.cancelled() => None,
            item = rx.recv() => {
                if item.is_some() {
                    self.depth.fetch_sub(1, Ordering::Relaxed);
                }
                item
            }
        }
    }

    /// Wake every waiter. Idempotent.
    pub fn stop(&self) {
        self.stop.cancel();
    }

    pub fn is_stopped(&self) -> bool {
        self.stop.is_cancelled()
    }

    /// Current number of undelivered items.
    pub fn len(&self) -> usize {
        self.depth.load(Ordering::Relaxed)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl<T> Default for CommitQueue<T> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Duration;

    #[tokio::test]
    async fn test_post_then_get_fifo() {
        let q = CommitQueue::new();
        q.post(1);
        q.post(2);
        q.post(3);
        assert_eq!(q.len(), 3);

        assert_eq!(q.get().await, Some(1));
        assert_eq!(q.get().await, Some(2));
        assert_eq!(q.get().await, Some(3));
        assert!(q.is_empty());
    }

    #[tokio::test]
    async fn test_get_blocks_until_post() {
        let q = Arc::new(CommitQueue::new());

        let q2 = q.clone();
        let waiter = tokio::spawn(async move { q2.get().await });

        tokio::time::sleep(Duration::from_millis(20)).await;
        q.post(42);

        assert_eq!(waiter.await.unwrap(), Some(42));
    }

    #[tokio::test]
    async fn test_stop_wakes_all_waiters() {
        let q: Arc<CommitQueue<u32>> = Arc::new(CommitQueue::new());

        let mut waiters = Vec::new();
        for _ in 0..8 {
            let q2 = q.clone();
            waiters.push(tokio::spawn(async move { q2.get().await }));
        }

        tokio::time::sleep(Duration::from_millis(20)).await;
        q.stop();

        for w in waiters {
            assert_eq!(w.await.unwrap(), None);
        }
    }

    #[tokio::test]
    async fn test_get_after_stop_returns_none_immediately() {
        let q: CommitQueue<u32> = CommitQueue::new();
        q.stop();
        assert_eq!(q.get().await, None);
        assert!(q.is_stopped());
    }

    #[tokio::test]
    async fn test_post_after_stop_is_dropped() {
        let q = CommitQueue::new();
        q.stop();
        q.post(1);
        assert_eq!(q.get().await, None);
    }

    #[tokio::test]
    async fn test_multi_producer_total_order_is_consumed_once() {
        let q = Arc::new(CommitQueue::new());

        let mut producers = Vec::new();
        for p in 0..4u64 {
            let q2 = q.clone();
            producers.push(tokio::spawn(async move {
                for i in 0..100u64 {
                    q2.post(p * 1000 + i);
                }
            }));
        }
        for p in producers {
            p.await.unwrap();
        }

        let mut seen = std::collections::HashSet::new();
        let mut per_producer_last: std::collections::HashMap<u64, u64> = Default::default();
        for _ in 0..400 {
            let v = q.get().await.unwrap();
            assert!(seen.insert(v), "item delivered twice: {v}");
            // Per-producer order must be preserved even when interleaved.
            let producer = v / 1000;
            if let Some(prev) = per_producer_last.insert(producer, v % 1000) {
                assert!(prev < v % 1000);
            }
        }
        assert!(q.is_empty());
    }
}
