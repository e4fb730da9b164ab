//! Subscription handler table
//!
//! Maps topic filters to message handlers. The table is bounded; when several
//! filters match a topic the most specific one wins.

use std::sync::Arc;

use crate::bridge::Message;
use crate::error::Error;
use crate::topic::{topic_matches_filter, Specificity};

/// Receives messages delivered on a subscription.
///
/// Called from the network task, so implementations must not block; hand the
/// message off and return.
pub trait MessageHandler: Send + Sync {
    fn on_message(&self, message: Message);
}

impl<F> MessageHandler for F
where
    F: Fn(Message) + Send + Sync,
{
    fn on_message(&self, message: Message) {
        self(message)
    }
}

struct Entry {
    filter: String,
    specificity: Specificity,
    handler: Arc<dyn MessageHandler>,
}

pub struct HandlerTable {
    entries: Vec<Entry>,
    capacity: usize,
}

impl HandlerTable {
    pub fn new(capacity: usize) -> Self {
        Self {
            entries: Vec::with_capacity(capacity),
            capacity,
        }
    }

    /// Whether `filter` could be inserted right now
    pub fn has_room_for(&self, filter: &str) -> bool {
        self.entries.len() < self.capacity || self.contains(filter)
    }

    pub fn contains(&self, filter: &str) -> bool {
        self.entries.iter().any(|e| e.filter == filter)
    }

    /// Install `handler` for `filter`, replacing any handler already bound to
    /// the same filter.
    pub fn insert(&mut self, filter: &str, handler: Arc<dyn MessageHandler>) -> Result<(), Error> {
        if let Some(entry) = self.entries.iter_mut().find(|e| e.filter == filter) {
            entry.handler = handler;
            return Ok(());
        }
        if self.entries.len() >= self.capacity {
            return Err(Error::Capacity("subscription handler table full"));
        }
        self.entries.push(Entry {
            filter: filter.to_string(),
            specificity: Specificity::of(filter),
            handler,
        });
        Ok(())
    }

    pub fn remove(&mut self, filter: &str) -> bool {
        let before = self.entries.len();
        self.entries.retain(|e| e.filter != filter);
        self.entries.len() != before
    }

    /// Handler of the most specific filter matching `topic`
    pub fn lookup(&self, topic: &str) -> Option<&Arc<dyn MessageHandler>> {
        self.entries
            .iter()
            .filter(|e| topic_matches_filter(topic, &e.filter))
            .max_by_key(|e| e.specificity)
            .map(|e| &e.handler)
    }

    pub fn filters(&self) -> impl Iterator<Item = &str> {
        self.entries.iter().map(|e| e.filter.as_str())
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

impl std::fmt::Debug for HandlerTable {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HandlerTable")
            .field("filters", &self.filters().collect::<Vec<_>>())
            .field("capacity", &self.capacity)
            .finish()
    }
}
