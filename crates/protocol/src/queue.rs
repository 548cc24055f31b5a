use std::collections::VecDeque;
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};

use tokio::sync::Notify;
use tracing::trace;

use crate::error::{ProtocolError, ProtocolResult};
use crate::limits::{QUEUE_CAPACITY, QUEUE_HIGH_WATERMARK, QUEUE_LOW_WATERMARK};

/// What a full queue does with a new message.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum OverflowPolicy {
    /// Producer waits for space.
    #[default]
    Block,
    /// Producer gets [`ProtocolError::QueueFull`] immediately.
    Drop,
    /// Oldest queued message is discarded to make room.
    OverwriteOldest,
}

/// Send-queue tunables.
#[derive(Clone, Copy, Debug)]
pub struct QueueConfig {
    /// Maximum queued messages.
    pub capacity: usize,
    /// Behaviour when full.
    pub policy: OverflowPolicy,
    /// Length at which producers are asked to back off.
    pub high_watermark: usize,
    /// Length at which producers may resume.
    pub low_watermark: usize,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            capacity: QUEUE_CAPACITY,
            policy: OverflowPolicy::Block,
            high_watermark: QUEUE_HIGH_WATERMARK,
            low_watermark: QUEUE_LOW_WATERMARK,
        }
    }
}

struct Inner<T> {
    items: VecDeque<T>,
    closed: bool,
    overwritten: u64,
}

/// Bounded FIFO between message producers and a connection's single writer.
///
/// Backpressure is advisory: crossing the high watermark raises a flag that
/// producers can poll ([`is_backpressured`](Self::is_backpressured));
/// dropping back to the low watermark clears it. The queue itself keeps
/// enforcing `capacity` regardless.
pub struct SendQueue<T> {
    config: QueueConfig,
    inner: Mutex<Inner<T>>,
    space: Notify,
    arrivals: Notify,
    backpressured: AtomicBool,
}

impl<T> SendQueue<T> {
    /// Queue with the given tunables.
    #[must_use]
    pub fn new(config: QueueConfig) -> Self {
        assert!(config.capacity > 0, "queue capacity must be positive");
        Self {
            config,
            inner: Mutex::new(Inner {
                items: VecDeque::with_capacity(config.capacity.min(1024)),
                closed: false,
                overwritten: 0,
            }),
            space: Notify::new(),
            arrivals: Notify::new(),
            backpressured: AtomicBool::new(false),
        }
    }

    /// Enqueues a message, honouring the overflow policy.
    pub async fn push(&self, item: T) -> ProtocolResult<()> {
        loop {
            {
                let mut inner = self.inner.lock().expect("queue lock poisoned");
                if inner.closed {
                    return Err(ProtocolError::Connection("send queue closed".into()));
                }
                if inner.items.len() < self.config.capacity {
                    inner.items.push_back(item);
                    self.after_push(&inner);
                    return Ok(());
                }
                match self.config.policy {
                    OverflowPolicy::Drop => return Err(ProtocolError::QueueFull),
                    OverflowPolicy::OverwriteOldest => {
                        inner.items.pop_front();
                        inner.overwritten += 1;
                        inner.items.push_back(item);
                        self.after_push(&inner);
                        return Ok(());
                    }
                    OverflowPolicy::Block => {}
                }
            }
            // Re-check after the wakeup: another producer may have taken
            // the slot.
            self.space.notified().await;
        }
    }

    fn after_push(&self, inner: &Inner<T>) {
        if inner.items.len() >= self.config.high_watermark {
            if !self.backpressured.swap(true, Ordering::AcqRel) {
                trace!(len = inner.items.len(), "send queue entered backpressure");
            }
        }
        self.arrivals.notify_one();
    }

    /// Dequeues the next message; `None` once the queue is closed and
    /// drained.
    pub async fn pop(&self) -> Option<T> {
        loop {
            {
                let mut inner = self.inner.lock().expect("queue lock poisoned");
                if let Some(item) = inner.items.pop_front() {
                    if inner.items.len() <= self.config.low_watermark {
                        self.backpressured.store(false, Ordering::Release);
                    }
                    self.space.notify_one();
                    return Some(item);
                }
                if inner.closed {
                    return None;
                }
            }
            self.arrivals.notified().await;
        }
    }

    /// Closes the queue; queued messages remain poppable.
    pub fn close(&self) {
        let mut inner = self.inner.lock().expect("queue lock poisoned");
        inner.closed = true;
        drop(inner);
        self.arrivals.notify_waiters();
        self.space.notify_waiters();
    }

    /// Current queue length.
    #[must_use]
    pub fn len(&self) -> usize {
        self.inner.lock().expect("queue lock poisoned").items.len()
    }

    /// Whether the queue is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Whether producers are currently asked to back off.
    #[must_use]
    pub fn is_backpressured(&self) -> bool {
        self.backpressured.load(Ordering::Acquire)
    }

    /// Messages discarded by the overwrite policy so far.
    #[must_use]
    pub fn overwritten(&self) -> u64 {
        self.inner.lock().expect("queue lock poisoned").overwritten
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Duration;

    fn queue(capacity: usize, policy: OverflowPolicy) -> SendQueue<u32> {
        SendQueue::new(QueueConfig {
            capacity,
            policy,
            high_watermark: capacity,
            low_watermark: capacity / 2,
        })
    }

    #[tokio::test]
    async fn fifo_order_is_preserved() {
        let q = queue(8, OverflowPolicy::Block);
        for n in 0..5 {
            q.push(n).await.expect("space");
        }
        for n in 0..5 {
            assert_eq!(q.pop().await, Some(n));
        }
    }

    #[tokio::test]
    async fn drop_policy_rejects_when_full() {
        let q = queue(2, OverflowPolicy::Drop);
        q.push(1).await.expect("space");
        q.push(2).await.expect("space");

        let mut accepted = 2;
        let mut rejected = 0;
        for n in 3..6 {
            match q.push(n).await {
                Ok(()) => accepted += 1,
                Err(ProtocolError::QueueFull) => rejected += 1,
                Err(other) => panic!("unexpected error: {other}"),
            }
        }
        assert_eq!(accepted, 2);
        assert_eq!(rejected, 3);
    }

    #[tokio::test]
    async fn overwrite_policy_discards_oldest() {
        let q = queue(2, OverflowPolicy::OverwriteOldest);
        q.push(1).await.expect("space");
        q.push(2).await.expect("space");
        q.push(3).await.expect("overwrites");

        assert_eq!(q.pop().await, Some(2));
        assert_eq!(q.pop().await, Some(3));
        assert_eq!(q.overwritten(), 1);
    }

    #[tokio::test]
    async fn block_policy_waits_for_consumer() {
        let q = Arc::new(queue(1, OverflowPolicy::Block));
        q.push(1).await.expect("space");

        let producer = {
            let q = Arc::clone(&q);
            tokio::spawn(async move { q.push(2).await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!producer.is_finished(), "push must block while full");

        assert_eq!(q.pop().await, Some(1));
        producer.await.expect("join").expect("push completes");
        assert_eq!(q.pop().await, Some(2));
    }

    #[tokio::test]
    async fn close_drains_then_ends() {
        let q = queue(4, OverflowPolicy::Block);
        q.push(7).await.expect("space");
        q.close();

        assert_eq!(q.pop().await, Some(7));
        assert_eq!(q.pop().await, None);
        assert!(q.push(8).await.is_err());
    }

    #[tokio::test]
    async fn watermarks_toggle_backpressure() {
        let q = SendQueue::new(QueueConfig {
            capacity: 10,
            policy: OverflowPolicy::Block,
            high_watermark: 3,
            low_watermark: 1,
        });
        assert!(!q.is_backpressured());

        for n in 0..3 {
            q.push(n).await.expect("space");
        }
        assert!(q.is_backpressured());

        q.pop().await;
        assert!(q.is_backpressured(), "still above low watermark");
        q.pop().await;
        assert!(!q.is_backpressured(), "drained to low watermark");
    }
}
