//! Subscription Table: the set of live subscriptions.
//!
//! Entries are immutable once inserted. Handlers and predicates are held in
//! `Rc` so the dispatcher can clone a subscription out of the table and call
//! it without holding any borrow of the multiplexer state.

// Rust guideline compliant 2026-02

use std::collections::HashMap;
use std::rc::Rc;

use crate::error::ChannelOpenError;
use crate::message::{ChannelName, Message};

/// Process-unique subscription id (monotonic, never reused).
#[derive(Debug, Clone, Copy, Hash, Eq, PartialEq, Ord, PartialOrd)]
pub struct SubscriptionId(u64);

impl SubscriptionId {
    /// Numeric value, for logging.
    #[must_use]
    pub fn get(self) -> u64 {
        self.0
    }
}

impl std::fmt::Display for SubscriptionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "sub-{}", self.0)
    }
}

/// Message callback. Returning `Err` is logged and counted, never propagated.
pub type Handler = Rc<dyn Fn(&Message) -> anyhow::Result<()>>;

/// Channel-failure callback.
pub type ErrorHandler = Rc<dyn Fn(&ChannelOpenError)>;

/// One `(channel, predicate, handler)` registration.
#[derive(Clone)]
pub struct Subscription {
    /// Unique id.
    pub id: SubscriptionId,
    /// Channel this subscription listens on.
    pub channel: ChannelName,
    /// Decides whether a message is delivered.
    pub predicate: Rc<dyn Fn(&Message) -> bool>,
    /// Receives matching messages.
    pub handler: Handler,
    /// Receives channel-open failures, if the subscriber cares.
    pub on_error: Option<ErrorHandler>,
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription")
            .field("id", &self.id)
            .field("channel", &self.channel)
            .field("on_error", &self.on_error.is_some())
            .finish_non_exhaustive()
    }
}

/// Live subscriptions keyed by id.
#[derive(Debug, Default)]
pub struct SubscriptionTable {
    entries: HashMap<SubscriptionId, Subscription>,
    next_id: u64,
}

impl SubscriptionTable {
    /// Empty table.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Allocate the next id. Ids start at 1.
    pub fn next_id(&mut self) -> SubscriptionId {
        self.next_id += 1;
        SubscriptionId(self.next_id)
    }

    /// Store a subscription under its id.
    pub fn insert(&mut self, subscription: Subscription) {
        self.entries.insert(subscription.id, subscription);
    }

    /// Remove and return a subscription; `None` if already gone.
    pub fn remove(&mut self, id: SubscriptionId) -> Option<Subscription> {
        self.entries.remove(&id)
    }

    /// Look up a live subscription.
    #[must_use]
    pub fn get(&self, id: SubscriptionId) -> Option<&Subscription> {
        self.entries.get(&id)
    }

    /// Whether `id` is still live.
    #[must_use]
    pub fn contains(&self, id: SubscriptionId) -> bool {
        self.entries.contains_key(&id)
    }

    /// Number of live subscriptions.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// True when nothing is subscribed.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sub(table: &mut SubscriptionTable, channel: &str) -> SubscriptionId {
        let id = table.next_id();
        table.insert(Subscription {
            id,
            channel: ChannelName::from(channel),
            predicate: Rc::new(|_| true),
            handler: Rc::new(|_| Ok(())),
            on_error: None,
        });
        id
    }

    #[test]
    fn test_ids_are_monotonic() {
        let mut table = SubscriptionTable::new();
        let a = sub(&mut table, "class-42");
        let b = sub(&mut table, "class-42");
        assert!(b > a);
        assert_eq!(a.get(), 1);
        assert_eq!(b.to_string(), "sub-2");
    }

    #[test]
    fn test_ids_not_reused_after_remove() {
        let mut table = SubscriptionTable::new();
        let a = sub(&mut table, "class-42");
        table.remove(a);
        let b = sub(&mut table, "class-42");
        assert_ne!(a, b);
    }

    #[test]
    fn test_remove_twice_returns_none() {
        let mut table = SubscriptionTable::new();
        let a = sub(&mut table, "class-42");
        assert!(table.remove(a).is_some());
        assert!(table.remove(a).is_none());
        assert!(table.is_empty());
    }

    #[test]
    fn test_get_and_contains() {
        let mut table = SubscriptionTable::new();
        let a = sub(&mut table, "class-7");
        assert!(table.contains(a));
        assert_eq!(table.get(a).map(|s| s.channel.as_str()), Some("class-7"));
        assert_eq!(table.len(), 1);
    }
}
