//! Bounded outbound packet queue
//!
//! # Backpressure policy
//!
//! Every queued packet has a [`Priority`]. When the queue is full:
//!
//! - a new packet evicts the oldest queued `Droppable` packet if there is one
//! - otherwise a new `Droppable` packet is discarded
//! - otherwise a new `Essential` packet waits for space ([`OutboundQueue::push`])
//!   or fails with [`QueueError::Full`] ([`OutboundQueue::try_push`])
//!
//! Chat performances are always `Essential`; pings, pongs and status answers
//! are `Droppable`.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use parking_lot::Mutex;
use thiserror::Error;
use tokio::sync::Notify;

use crate::protocol::Packet;

/// Delivery priority of an outbound packet
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Priority {
    /// May be dropped under pressure
    Droppable,
    /// Never dropped
    Essential,
}

/// A queued packet
#[derive(Clone, Debug)]
pub struct Outbound {
    /// Packet to send
    pub packet: Packet,
    /// Its priority
    pub priority: Priority,
}

/// Result of a successful push
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PushOutcome {
    /// Queued without loss
    Queued,
    /// Queued after dropping an older droppable packet
    QueuedAfterEviction,
    /// The new droppable packet was discarded
    Discarded,
}

/// Reasons a push failed
#[derive(Clone, Copy, Debug, Error, PartialEq, Eq)]
pub enum QueueError {
    /// No room and nothing droppable to evict
    #[error("outbound queue is full")]
    Full,
    /// Session is closing
    #[error("outbound queue is closed")]
    Closed,
}

/// Queue between packet producers and the session's writer task
#[derive(Debug)]
pub struct OutboundQueue {
    items: Mutex<VecDeque<Outbound>>,
    capacity: usize,
    closed: AtomicBool,
    dropped: AtomicU64,
    readable: Notify,
    writable: Notify,
}

impl OutboundQueue {
    /// Create a queue holding at most `capacity` packets (minimum 1)
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            items: Mutex::new(VecDeque::with_capacity(capacity)),
            capacity,
            closed: AtomicBool::new(false),
            dropped: AtomicU64::new(0),
            readable: Notify::new(),
            writable: Notify::new(),
        }
    }

    /// Push without waiting
    ///
    /// # Errors
    ///
    /// [`QueueError::Closed`] after [`OutboundQueue::close`];
    /// [`QueueError::Full`] for an essential packet with no room.
    pub fn try_push(&self, packet: Packet, priority: Priority) -> Result<PushOutcome, QueueError> {
        self.offer(Outbound { packet, priority })
            .map_err(|(err, _)| err)
    }

    /// Push, waiting for space when an essential packet finds the queue full
    ///
    /// # Errors
    ///
    /// [`QueueError::Closed`] if the queue is or becomes closed.
    pub async fn push(&self, packet: Packet, priority: Priority) -> Result<PushOutcome, QueueError> {
        let mut item = Outbound { packet, priority };
        loop {
            let notified = self.writable.notified();
            match self.offer(item) {
                Ok(outcome) => return Ok(outcome),
                Err((QueueError::Closed, _)) => return Err(QueueError::Closed),
                Err((QueueError::Full, returned)) => item = returned,
            }
            notified.await;
        }
    }

    /// Take the next packet, waiting if the queue is empty
    ///
    /// Returns `None` once the queue is closed and drained.
    pub async fn pop(&self) -> Option<Outbound> {
        loop {
            let notified = self.readable.notified();
            {
                let mut items = self.items.lock();
                if let Some(item) = items.pop_front() {
                    drop(items);
                    self.writable.notify_one();
                    return Some(item);
                }
                if self.closed.load(Ordering::Acquire) {
                    return None;
                }
            }
            notified.await;
        }
    }

    /// Stop accepting packets; queued packets can still be popped
    pub fn close(&self) {
        self.closed.store(true, Ordering::Release);
        self.readable.notify_waiters();
        self.writable.notify_waiters();
    }

    /// Queue a last packet past capacity, then close
    ///
    /// Used for the `sys.close` notice, which must not be lost to a queue
    /// full of essential packets.
    ///
    /// # Errors
    ///
    /// [`QueueError::Closed`] if the queue was already closed; it stays closed.
    pub fn close_with(&self, packet: Packet) -> Result<(), QueueError> {
        let result = {
            let mut items = self.items.lock();
            if self.closed.swap(true, Ordering::AcqRel) {
                Err(QueueError::Closed)
            } else {
                items.push_back(Outbound {
                    packet,
                    priority: Priority::Essential,
                });
                Ok(())
            }
        };
        self.readable.notify_waiters();
        self.writable.notify_waiters();
        result
    }

    /// Whether [`OutboundQueue::close`] was called
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Packets waiting to be written
    #[must_use]
    pub fn len(&self) -> usize {
        self.items.lock().len()
    }

    /// Whether nothing is waiting
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.items.lock().is_empty()
    }

    /// Maximum queued packets
    #[must_use]
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Packets lost to the backpressure policy so far
    #[must_use]
    pub fn dropped_count(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    fn offer(&self, item: Outbound) -> Result<PushOutcome, (QueueError, Outbound)> {
        let mut items = self.items.lock();
        if self.closed.load(Ordering::Acquire) {
            return Err((QueueError::Closed, item));
        }

        let outcome = if items.len() < self.capacity {
            items.push_back(item);
            PushOutcome::Queued
        } else if let Some(pos) = items
            .iter()
            .position(|queued| queued.priority == Priority::Droppable)
        {
            items.remove(pos);
            items.push_back(item);
            self.dropped.fetch_add(1, Ordering::Relaxed);
            PushOutcome::QueuedAfterEviction
        } else if item.priority == Priority::Droppable {
            self.dropped.fetch_add(1, Ordering::Relaxed);
            return Ok(PushOutcome::Discarded);
        } else {
            return Err((QueueError::Full, item));
        };

        drop(items);
        self.readable.notify_one();
        Ok(outcome)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Duration;

    fn packet(id: &str) -> Packet {
        Packet::new("chat.perform", id)
    }

    #[tokio::test]
    async fn test_fifo_order() {
        let queue = OutboundQueue::new(4);
        queue.try_push(packet("a"), Priority::Essential).unwrap();
        queue.try_push(packet("b"), Priority::Droppable).unwrap();

        assert_eq!(queue.pop().await.unwrap().packet.id, "a");
        assert_eq!(queue.pop().await.unwrap().packet.id, "b");
        assert!(queue.is_empty());
    }

    #[test]
    fn test_full_evicts_oldest_droppable() {
        let queue = OutboundQueue::new(2);
        queue.try_push(packet("ping"), Priority::Droppable).unwrap();
        queue.try_push(packet("reply-1"), Priority::Essential).unwrap();

        let outcome = queue.try_push(packet("reply-2"), Priority::Essential).unwrap();
        assert_eq!(outcome, PushOutcome::QueuedAfterEviction);
        assert_eq!(queue.len(), 2);
        assert_eq!(queue.dropped_count(), 1);
    }

    #[test]
    fn test_full_of_essentials() {
        let queue = OutboundQueue::new(1);
        queue.try_push(packet("reply-1"), Priority::Essential).unwrap();

        assert_eq!(
            queue.try_push(packet("ping"), Priority::Droppable),
            Ok(PushOutcome::Discarded)
        );
        assert_eq!(
            queue.try_push(packet("reply-2"), Priority::Essential),
            Err(QueueError::Full)
        );
        assert_eq!(queue.len(), 1);
    }

    #[tokio::test]
    async fn test_push_waits_for_space() {
        let queue = Arc::new(OutboundQueue::new(1));
        queue.try_push(packet("first"), Priority::Essential).unwrap();

        let producer = {
            let queue = Arc::clone(&queue);
            tokio::spawn(async move { queue.push(packet("second"), Priority::Essential).await })
        };

        assert_eq!(queue.pop().await.unwrap().packet.id, "first");
        let outcome = tokio::time::timeout(Duration::from_secs(1), producer)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(outcome, Ok(PushOutcome::Queued));
        assert_eq!(queue.pop().await.unwrap().packet.id, "second");
    }

    #[test]
    fn test_pop_wakes_blocked_push() {
        let queue = OutboundQueue::new(1);
        queue.try_push(packet("first"), Priority::Essential).unwrap();

        let mut push = tokio_test::task::spawn(queue.push(packet("second"), Priority::Essential));
        tokio_test::assert_pending!(push.poll());

        let mut pop = tokio_test::task::spawn(queue.pop());
        let popped = tokio_test::assert_ready!(pop.poll());
        assert_eq!(popped.unwrap().packet.id, "first");

        assert!(push.is_woken());
        tokio_test::assert_ready_eq!(push.poll(), Ok(PushOutcome::Queued));
    }

    #[tokio::test]
    async fn test_close_drains_then_ends() {
        let queue = OutboundQueue::new(4);
        queue.try_push(packet("last"), Priority::Essential).unwrap();
        queue.close();

        assert_eq!(
            queue.try_push(packet("late"), Priority::Essential),
            Err(QueueError::Closed)
        );
        assert_eq!(queue.pop().await.unwrap().packet.id, "last");
        assert!(queue.pop().await.is_none());
    }

    #[tokio::test]
    async fn test_close_with_overflows_full_queue() {
        let queue = OutboundQueue::new(1);
        queue.try_push(packet("reply-1"), Priority::Essential).unwrap();

        queue.close_with(Packet::new("sys.close", "bye")).unwrap();
        assert!(queue.is_closed());
        assert_eq!(queue.len(), 2);
        assert_eq!(
            queue.close_with(Packet::new("sys.close", "again")),
            Err(QueueError::Closed)
        );

        assert_eq!(queue.pop().await.unwrap().packet.id, "reply-1");
        assert_eq!(queue.pop().await.unwrap().packet.id, "bye");
        assert!(queue.pop().await.is_none());
    }

    #[tokio::test]
    async fn test_close_wakes_waiting_pop() {
        let queue = Arc::new(OutboundQueue::new(4));
        let consumer = {
            let queue = Arc::clone(&queue);
            tokio::spawn(async move { queue.pop().await })
        };
        tokio::task::yield_now().await;
        queue.close();

        let popped = tokio::time::timeout(Duration::from_secs(1), consumer)
            .await
            .unwrap()
            .unwrap();
        assert!(popped.is_none());
    }
}
