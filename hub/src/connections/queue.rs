//! The bounded per-connection outbound queue.
//!
//! Neither a plain `tokio::sync::mpsc` nor a `kanal` channel gives a producer
//! the ability to evict a specific *older* element when the channel is full
//! (they only support back-pressuring or dropping the newest send), but the
//! backpressure policy here calls for dropping the oldest non-critical frame
//! on overflow. So this is a small hand-rolled ring buffer guarded by a mutex
//! and a `Notify`, built directly on the same `tokio::sync` primitives the
//! rest of this workspace already depends on.

use axum::extract::ws::Message;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;
use std::time::Instant;
use tokio::sync::Notify;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Priority {
    /// Call state, chat messages, transaction confirmations: never dropped
    /// silently. If the queue stays saturated for too long the connection is
    /// closed with a flow-error code instead.
    Critical,
    /// Quote updates, typing indicators, redundant presence: the first thing
    /// dropped when the queue is full.
    NonCritical,
}

pub enum PushOutcome {
    Enqueued,
    DroppedOldest,
    /// The queue is full of frames that cannot be dropped. Caller should
    /// check `saturated_for` and close the connection past the grace period.
    SaturatedCritical,
}

struct Inner {
    items: VecDeque<(Message, Priority)>,
    saturated_since: Option<Instant>,
}

pub struct OutboundQueue {
    capacity: usize,
    inner: Mutex<Inner>,
    notify: Notify,
    closed: AtomicBool,
}

impl OutboundQueue {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            inner: Mutex::new(Inner {
                items: VecDeque::with_capacity(capacity.min(1024)),
                saturated_since: None,
            }),
            notify: Notify::new(),
            closed: AtomicBool::new(false),
        }
    }

    pub fn push(&self, message: Message, priority: Priority) -> PushOutcome {
        let mut inner = self.inner.lock().expect("outbound queue mutex poisoned");
        if inner.items.len() < self.capacity {
            inner.items.push_back((message, priority));
            inner.saturated_since = None;
            drop(inner);
            self.notify.notify_one();
            return PushOutcome::Enqueued;
        }

        // Queue is full: find the oldest non-critical frame and evict it.
        if let Some(pos) = inner
            .items
            .iter()
            .position(|(_, p)| *p == Priority::NonCritical)
        {
            inner.items.remove(pos);
            inner.items.push_back((message, priority));
            drop(inner);
            self.notify.notify_one();
            return PushOutcome::DroppedOldest;
        }

        // Every queued frame is critical; we cannot drop anything.
        if inner.saturated_since.is_none() {
            inner.saturated_since = Some(Instant::now());
        }
        PushOutcome::SaturatedCritical
    }

    /// Duration the queue has been continuously saturated with
    /// non-droppable (critical) frames, if any. The writer loop closes the
    /// connection once this exceeds the 2s grace period.
    pub fn saturated_for(&self) -> Option<std::time::Duration> {
        let inner = self.inner.lock().expect("outbound queue mutex poisoned");
        inner.saturated_since.map(|t| t.elapsed())
    }

    pub async fn pop(&self) -> Option<Message> {
        loop {
            if self.closed.load(Ordering::Relaxed) {
                return None;
            }
            {
                let mut inner = self.inner.lock().expect("outbound queue mutex poisoned");
                if let Some((message, _)) = inner.items.pop_front() {
                    if inner.items.len() < self.capacity {
                        inner.saturated_since = None;
                    }
                    return Some(message);
                }
            }
            self.notify.notified().await;
        }
    }

    pub fn close(&self) {
        self.closed.store(true, Ordering::Relaxed);
        self.notify.notify_waiters();
    }

    pub fn len(&self) -> usize {
        self.inner.lock().expect("outbound queue mutex poisoned").items.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn text(s: &str) -> Message {
        Message::Text(s.to_string())
    }

    #[test]
    fn drops_oldest_non_critical_frame_when_full() {
        let q = OutboundQueue::new(2);
        assert!(matches!(q.push(text("a"), Priority::NonCritical), PushOutcome::Enqueued));
        assert!(matches!(q.push(text("b"), Priority::NonCritical), PushOutcome::Enqueued));
        // Full; pushing a third non-critical frame evicts "a".
        assert!(matches!(q.push(text("c"), Priority::NonCritical), PushOutcome::DroppedOldest));
        assert_eq!(q.len(), 2);
    }

    #[test]
    fn critical_frames_saturate_instead_of_being_dropped() {
        let q = OutboundQueue::new(1);
        assert!(matches!(q.push(text("call_state"), Priority::Critical), PushOutcome::Enqueued));
        assert!(matches!(
            q.push(text("another_call_state"), Priority::Critical),
            PushOutcome::SaturatedCritical
        ));
        assert!(q.saturated_for().is_some());
    }

    #[tokio::test]
    async fn pop_returns_items_in_fifo_order() {
        let q = OutboundQueue::new(4);
        q.push(text("first"), Priority::NonCritical);
        q.push(text("second"), Priority::NonCritical);
        assert_eq!(q.pop().await, Some(text("first")));
        assert_eq!(q.pop().await, Some(text("second")));
    }
}
