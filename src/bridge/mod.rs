//! Message Bridge
//!
//! Two bounded FIFO queues connecting the network task to the rest of the
//! process:
//!
//! - **inbound**: broker -> application, filled by the session's handlers and
//!   drained by a single consumer thread
//! - **outbound**: application -> broker, filled by the sensor producer and
//!   drained by the network event loop
//!
//! A message is owned by exactly one of producer, queue or consumer at any
//! time. Producers never block; a full queue drops the message and counts it.

mod message;
mod queue;


pub use message::{Message, MAX_PAYLOAD_LEN, MAX_TOPIC_LEN};
pub use queue::MessageQueue;

use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, info};

use crate::session::MessageHandler;

/// Default slots per queue
pub const DEFAULT_QUEUE_CAPACITY: usize = 5;

/// The pair of queues shared by the network, producer and consumer threads
#[derive(Debug, Clone)]
pub struct Bridge {
    inbound: Arc<MessageQueue>,
    outbound: Arc<MessageQueue>,
}

impl Bridge {
    pub fn new(inbound_capacity: usize, outbound_capacity: usize) -> Self {
        Self {
            inbound: Arc::new(MessageQueue::new("inbound", inbound_capacity)),
            outbound: Arc::new(MessageQueue::new("outbound", outbound_capacity)),
        }
    }

    /// Broker -> application
    pub fn inbound(&self) -> &Arc<MessageQueue> {
        &self.inbound
    }

    /// Application -> broker
    pub fn outbound(&self) -> &Arc<MessageQueue> {
        &self.outbound
    }
}

impl Default for Bridge {
    fn default() -> Self {
        Self::new(DEFAULT_QUEUE_CAPACITY, DEFAULT_QUEUE_CAPACITY)
    }
}

/// Subscription handler that hands every delivery to a queue
#[derive(Debug, Clone)]
pub struct InboundForwarder {
    queue: Arc<MessageQueue>,
}

impl InboundForwarder {
    pub fn new(queue: Arc<MessageQueue>) -> Self {
        Self { queue }
    }
}

impl MessageHandler for InboundForwarder {
    fn on_message(&self, message: Message) {
        debug!(topic = message.topic(), len = message.len(), "Forwarding inbound message");
        // A full queue already logged and released the message
        let _ = self.queue.try_push(message);
    }
}

/// Drains a queue one message at a time on the calling thread
pub struct Consumer<F> {
    queue: Arc<MessageQueue>,
    handler: F,
}

impl<F> Consumer<F>
where
    F: FnMut(Message),
{
    pub fn new(queue: Arc<MessageQueue>, handler: F) -> Self {
        Self { queue, handler }
    }

    /// Wait up to `timeout` (forever if `None`) for one message and process
    /// it. Returns whether a message was handled.
    pub fn process_next(&mut self, timeout: Option<Duration>) -> bool {
        match self.queue.pop_blocking(timeout) {
            Some(message) => {
                (self.handler)(message);
                true
            }
            None => false,
        }
    }

    /// Process messages strictly in order, forever
    pub fn run(mut self) {
        info!(queue = self.queue.name(), "Consumer started");
        loop {
            self.process_next(None);
        }
    }
}
