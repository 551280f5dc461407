//! Fixed-capacity pool of reusable messages
//!
//! The pool owns a fixed number of [`Message`] slots allocated once at
//! startup. A reader checks one out with [`MessagePool::acquire`], fills it and
//! pushes the resulting [`PooledMessage`] to the downstream queue. The slot
//! returns to the free list when the consumer calls
//! [`PooledMessage::release`] or drops it, or when the producer does so on a
//! suppressed frame or a failed push.
//!
//! Slots move by value between the free list and their holder, so a slot can
//! never be both queued and free at the same time.

use std::ops::{Deref, DerefMut};
use std::sync::{Arc, Mutex};

use crate::message::{Message, Payload};

/// Default number of messages in flight per device class
pub const MAX_MESSAGES_IN_FLIGHT: usize = 32;

struct PoolInner {
    free: Mutex<Vec<Message>>,
    capacity: usize,
}

impl PoolInner {
    fn give_back(&self, message: Message) {
        // A poisoned lock only means another holder panicked mid-push; the
        // free list itself is still a valid Vec.
        let mut free = match self.free.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        debug_assert!(free.len() < self.capacity, "slot returned twice");
        free.push(message);
    }
}

/// Shared handle to a fixed set of message slots
#[derive(Clone)]
pub struct MessagePool {
    inner: Arc<PoolInner>,
}

impl std::fmt::Debug for MessagePool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MessagePool")
            .field("capacity", &self.inner.capacity)
            .field("available", &self.available())
            .finish()
    }
}

impl MessagePool {
    /// Allocate `capacity` slots, each initialized by `init`
    pub fn new(capacity: usize, mut init: impl FnMut() -> Payload) -> Self {
        let capacity = capacity.max(1);
        let free = (0..capacity).map(|_| Message::new(init())).collect();
        Self {
            inner: Arc::new(PoolInner {
                free: Mutex::new(free),
                capacity,
            }),
        }
    }

    /// Check out a free slot, or `None` when every slot is in flight
    ///
    /// Never blocks beyond the short free-list critical section.
    pub fn acquire(&self) -> Option<PooledMessage> {
        let message = match self.inner.free.lock() {
            Ok(mut free) => free.pop(),
            Err(poisoned) => poisoned.into_inner().pop(),
        }?;

        Some(PooledMessage {
            message: Some(message),
            pool: Arc::clone(&self.inner),
        })
    }

    /// Total number of slots
    pub fn capacity(&self) -> usize {
        self.inner.capacity
    }

    /// Number of slots currently marked reusable
    pub fn available(&self) -> usize {
        match self.inner.free.lock() {
            Ok(free) => free.len(),
            Err(poisoned) => poisoned.into_inner().len(),
        }
    }

    /// Number of slots checked out by a producer or held by the consumer
    pub fn in_flight(&self) -> usize {
        self.inner.capacity - self.available()
    }
}

/// A slot checked out of a [`MessagePool`]
///
/// Dereferences to the [`Message`] it carries. Dropping it marks the slot
/// reusable.
pub struct PooledMessage {
    message: Option<Message>,
    pool: Arc<PoolInner>,
}

impl PooledMessage {
    /// Return the slot to its pool
    pub fn release(self) {
        drop(self);
    }
}

impl std::fmt::Debug for PooledMessage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_tuple("PooledMessage").field(&self.message).finish()
    }
}

impl Deref for PooledMessage {
    type Target = Message;

    fn deref(&self) -> &Message {
        // Only `Drop` takes the message out.
        self.message.as_ref().unwrap_or_else(|| unreachable!())
    }
}

impl DerefMut for PooledMessage {
    fn deref_mut(&mut self) -> &mut Message {
        self.message.as_mut().unwrap_or_else(|| unreachable!())
    }
}

impl Drop for PooledMessage {
    fn drop(&mut self) {
        if let Some(message) = self.message.take() {
            self.pool.give_back(message);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::{EventBatch, RawEvent};

    fn event_pool(capacity: usize) -> MessagePool {
        MessagePool::new(capacity, || Payload::Events(EventBatch::new()))
    }

    #[test]
    fn test_acquire_until_exhausted() {
        let pool = event_pool(4);
        let held: Vec<_> = (0..4).map(|_| pool.acquire().unwrap()).collect();
        assert_eq!(pool.in_flight(), 4);
        assert!(pool.acquire().is_none());
        assert_eq!(pool.in_flight(), 4);
        drop(held);
        assert_eq!(pool.available(), 4);
    }

    #[test]
    fn test_release_makes_slot_reusable() {
        let pool = event_pool(1);
        let msg = pool.acquire().unwrap();
        assert!(pool.acquire().is_none());
        msg.release();
        assert!(pool.acquire().is_some());
    }

    #[test]
    fn test_in_flight_never_exceeds_capacity() {
        let pool = event_pool(MAX_MESSAGES_IN_FLIGHT);
        let mut held = Vec::new();
        for round in 0..200usize {
            if round % 3 == 2 {
                held.pop();
            } else if let Some(msg) = pool.acquire() {
                held.push(msg);
            }
            assert!(pool.in_flight() <= pool.capacity());
            assert_eq!(pool.in_flight(), held.len());
        }
    }

    #[test]
    fn test_slot_keeps_grown_buffer() {
        let pool = event_pool(1);
        {
            let mut msg = pool.acquire().unwrap();
            let batch = msg.events_mut();
            for i in 0..20 {
                batch.push(RawEvent::new(1, 30, i));
            }
        }
        let mut msg = pool.acquire().unwrap();
        assert_eq!(msg.events_mut().capacity(), 32);
    }

    #[test]
    fn test_release_from_other_thread() {
        let pool = event_pool(2);
        let a = pool.acquire().unwrap();
        let b = pool.acquire().unwrap();
        assert!(pool.acquire().is_none());

        std::thread::spawn(move || {
            a.release();
            b.release();
        })
        .join()
        .unwrap();

        assert_eq!(pool.available(), 2);
    }
}
