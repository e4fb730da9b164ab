//! Bounded message queue
//!
//! A fixed-capacity FIFO shared between threads and the network task. Push
//! never blocks: a full queue drops the message on the spot. Pop can block a
//! thread (with an optional timeout) or be awaited from async code through
//! [`MessageQueue::ready`].

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use crossbeam_queue::ArrayQueue;
use parking_lot::{Condvar, Mutex};
use tokio::sync::Notify;
use tracing::warn;

use super::Message;
use crate::error::Error;

pub struct MessageQueue {
    name: &'static str,
    slots: ArrayQueue<Message>,
    /// Guards the condvar handshake only; the slots are lock-free
    lock: Mutex<()>,
    available: Condvar,
    ready: Notify,
    pushed: AtomicU64,
    dropped: AtomicU64,
}

impl MessageQueue {
    pub fn new(name: &'static str, capacity: usize) -> Self {
        Self {
            name,
            slots: ArrayQueue::new(capacity.max(1)),
            lock: Mutex::new(()),
            available: Condvar::new(),
            ready: Notify::new(),
            pushed: AtomicU64::new(0),
            dropped: AtomicU64::new(0),
        }
    }

    /// Enqueue without blocking.
    ///
    /// When the queue is full the message is released immediately and
    /// [`Error::Capacity`] is returned; the caller is expected to move on.
    pub fn try_push(&self, message: Message) -> Result<(), Error> {
        if let Err(rejected) = self.slots.push(message) {
            let dropped = self.dropped.fetch_add(1, Ordering::Relaxed) + 1;
            warn!(
                queue = self.name,
                topic = rejected.topic(),
                dropped,
                "Queue full, dropping message"
            );
            return Err(Error::Capacity("message queue full"));
        }

        self.pushed.fetch_add(1, Ordering::Relaxed);

        // Taking the lock orders this wake-up after a waiter's final emptiness check
        drop(self.lock.lock());
        self.available.notify_one();
        self.ready.notify_one();
        Ok(())
    }

    /// Dequeue without blocking
    pub fn try_pop(&self) -> Option<Message> {
        self.slots.pop()
    }

    /// Dequeue, blocking the calling thread until a message arrives or
    /// `timeout` elapses. `None` waits forever.
    pub fn pop_blocking(&self, timeout: Option<Duration>) -> Option<Message> {
        let deadline = timeout.map(|t| Instant::now() + t);

        loop {
            if let Some(message) = self.slots.pop() {
                return Some(message);
            }

            let mut guard = self.lock.lock();
            if let Some(message) = self.slots.pop() {
                return Some(message);
            }

            match deadline {
                None => self.available.wait(&mut guard),
                Some(deadline) => {
                    if self.available.wait_until(&mut guard, deadline).timed_out() {
                        return self.slots.pop();
                    }
                }
            }
        }
    }

    /// Resolve once the queue holds at least one message. Cancel-safe.
    pub async fn ready(&self) {
        while self.slots.is_empty() {
            self.ready.notified().await;
        }
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.slots.capacity()
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Messages accepted since creation
    pub fn pushed(&self) -> u64 {
        self.pushed.load(Ordering::Relaxed)
    }

    /// Messages dropped because the queue was full
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

impl std::fmt::Debug for MessageQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MessageQueue")
            .field("name", &self.name)
            .field("len", &self.len())
            .field("capacity", &self.capacity())
            .field("dropped", &self.dropped())
            .finish()
    }
}
