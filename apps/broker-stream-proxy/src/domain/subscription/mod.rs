//! Subscription Bookkeeping
//!
//! Refcounted topic table. Each [`SubscriptionEntry`] records which clients
//! want a topic; the first client in triggers an upstream subscribe and the
//! last client out triggers an upstream unsubscribe.
//!
//! # Design
//!
//! [`SubscriptionBook`] is plain data with no locking. The application
//! layer wraps it in a lock and turns the returned [`SubscriptionChanges`]
//! into adapter commands. Two indexes are kept:
//! - topic → entry (refcount and client set)
//! - client → topics, so a disconnect can release everything at once
//!
//! ```rust
//! use broker_stream_proxy::domain::subscription::{ClientId, SubscriptionBook};
//! use broker_stream_proxy::domain::tick::Topic;
//!
//! let mut book = SubscriptionBook::default();
//! let topic = Topic::parse("NSE:INFY:LTP").unwrap();
//! let (a, b) = (ClientId::new(), ClientId::new());
//!
//! assert!(book.add(a, &topic).subscribe.contains(&topic));
//! assert!(book.add(b, &topic).is_empty());
//! assert!(book.remove_client(a).is_empty());
//! assert!(book.remove_client(b).unsubscribe.contains(&topic));
//! ```

use std::collections::{BTreeSet, HashMap, HashSet};
use std::fmt;

use serde::Serialize;
use uuid::Uuid;

use super::tick::Topic;

// =============================================================================
// Client Identity
// =============================================================================

/// Identifier of one downstream client connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct ClientId(Uuid);

impl ClientId {
    /// Fresh random identifier.
    #[must_use]
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Deterministic identifier, mostly for tests.
    #[must_use]
    pub const fn from_u128(value: u128) -> Self {
        Self(Uuid::from_u128(value))
    }
}

impl Default for ClientId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ClientId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

// =============================================================================
// Subscription Changes
// =============================================================================

/// Upstream work produced by a bookkeeping mutation.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SubscriptionChanges {
    /// Topics whose refcount went 0 → 1.
    pub subscribe: BTreeSet<Topic>,
    /// Topics whose refcount went 1 → 0.
    pub unsubscribe: BTreeSet<Topic>,
}

impl SubscriptionChanges {
    /// No upstream work needed.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.subscribe.is_empty() && self.unsubscribe.is_empty()
    }

    fn subscribe_one(topic: &Topic) -> Self {
        Self {
            subscribe: BTreeSet::from([topic.clone()]),
            unsubscribe: BTreeSet::new(),
        }
    }

    fn unsubscribe_one(topic: &Topic) -> Self {
        Self {
            subscribe: BTreeSet::new(),
            unsubscribe: BTreeSet::from([topic.clone()]),
        }
    }
}

// =============================================================================
// Subscription Entry
// =============================================================================

/// Live demand for one topic.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SubscriptionEntry {
    topic: Topic,
    refcount: usize,
    clients: HashSet<ClientId>,
}

impl SubscriptionEntry {
    fn new(topic: Topic) -> Self {
        Self {
            topic,
            refcount: 0,
            clients: HashSet::new(),
        }
    }

    /// Topic key.
    #[must_use]
    pub const fn topic(&self) -> &Topic {
        &self.topic
    }

    /// Number of distinct clients holding the topic.
    #[must_use]
    pub const fn refcount(&self) -> usize {
        self.refcount
    }

    /// Clients holding the topic.
    #[must_use]
    pub const fn clients(&self) -> &HashSet<ClientId> {
        &self.clients
    }

    /// Whether `client` holds this topic.
    #[must_use]
    pub fn contains(&self, client: ClientId) -> bool {
        self.clients.contains(&client)
    }

    /// Refcount and client set agree.
    #[must_use]
    pub fn is_consistent(&self) -> bool {
        self.refcount == self.clients.len()
    }
}

// =============================================================================
// Subscription Book
// =============================================================================

/// Topic table with per-client reverse index.
#[derive(Debug, Default)]
pub struct SubscriptionBook {
    entries: HashMap<Topic, SubscriptionEntry>,
    client_topics: HashMap<ClientId, HashSet<Topic>>,
}

impl SubscriptionBook {
    /// Add `client` to `topic`.
    ///
    /// Returns the topic in `subscribe` when this is the first client.
    /// Adding the same pair twice is a no-op.
    pub fn add(&mut self, client: ClientId, topic: &Topic) -> SubscriptionChanges {
        let held = self.client_topics.entry(client).or_default();
        if !held.insert(topic.clone()) {
            return SubscriptionChanges::default();
        }

        let entry = self
            .entries
            .entry(topic.clone())
            .or_insert_with(|| SubscriptionEntry::new(topic.clone()));
        entry.clients.insert(client);
        entry.refcount += 1;
        let first = entry.refcount == 1;
        assert_consistent(entry);

        if first {
            SubscriptionChanges::subscribe_one(topic)
        } else {
            SubscriptionChanges::default()
        }
    }

    /// Remove `client` from `topic`.
    ///
    /// Returns the topic in `unsubscribe` when this was the last client.
    /// Removing a pair that does not exist is a no-op.
    pub fn remove(&mut self, client: ClientId, topic: &Topic) -> SubscriptionChanges {
        let Some(held) = self.client_topics.get_mut(&client) else {
            return SubscriptionChanges::default();
        };
        if !held.remove(topic) {
            return SubscriptionChanges::default();
        }
        if held.is_empty() {
            self.client_topics.remove(&client);
        }

        if self.release_entry(client, topic) {
            SubscriptionChanges::unsubscribe_one(topic)
        } else {
            SubscriptionChanges::default()
        }
    }

    /// Drop every topic held by `client`.
    ///
    /// Safe to call for a client that holds nothing.
    pub fn remove_client(&mut self, client: ClientId) -> SubscriptionChanges {
        let Some(held) = self.client_topics.remove(&client) else {
            return SubscriptionChanges::default();
        };

        let mut changes = SubscriptionChanges::default();
        for topic in held {
            if self.release_entry(client, &topic) {
                changes.unsubscribe.insert(topic);
            }
        }
        changes
    }

    /// Decrement `topic` for `client`; true when the entry was deleted.
    fn release_entry(&mut self, client: ClientId, topic: &Topic) -> bool {
        let Some(entry) = self.entries.get_mut(topic) else {
            panic!(
                "registry invariant violated: client {client} held {topic} without an entry"
            );
        };
        assert!(
            entry.clients.remove(&client),
            "registry invariant violated: {topic} did not list client {client}"
        );
        entry.refcount = entry
            .refcount
            .checked_sub(1)
            .unwrap_or_else(|| panic!("registry invariant violated: {topic} refcount underflow"));
        assert_consistent(entry);

        if entry.refcount == 0 {
            self.entries.remove(topic);
            true
        } else {
            false
        }
    }

    /// Whether `client` holds `topic`.
    #[must_use]
    pub fn contains(&self, client: ClientId, topic: &Topic) -> bool {
        self.client_topics
            .get(&client)
            .is_some_and(|held| held.contains(topic))
    }

    /// Entry for a topic, if any client holds it.
    #[must_use]
    pub fn entry(&self, topic: &Topic) -> Option<&SubscriptionEntry> {
        self.entries.get(topic)
    }

    /// Topics held by a client.
    #[must_use]
    pub fn client_topics(&self, client: ClientId) -> Vec<Topic> {
        let mut topics: Vec<_> = self
            .client_topics
            .get(&client)
            .map(|held| held.iter().cloned().collect())
            .unwrap_or_default();
        topics.sort();
        topics
    }

    /// Every topic with a non-zero refcount.
    #[must_use]
    pub fn active_topics(&self) -> Vec<Topic> {
        let mut topics: Vec<_> = self.entries.keys().cloned().collect();
        topics.sort();
        topics
    }

    /// Clients holding at least one topic under `exchange`.
    #[must_use]
    pub fn clients_under_exchange(&self, exchange: &str) -> Vec<ClientId> {
        self.client_topics
            .iter()
            .filter(|(_, held)| held.iter().any(|t| t.exchange() == exchange))
            .map(|(client, _)| *client)
            .collect()
    }

    /// Aggregate counts.
    #[must_use]
    pub fn stats(&self) -> SubscriptionStats {
        SubscriptionStats {
            topic_count: self.entries.len(),
            client_count: self.client_topics.len(),
            subscription_count: self.entries.values().map(|e| e.refcount).sum(),
        }
    }

    /// Verify both indexes agree.
    ///
    /// # Panics
    ///
    /// Panics when the book is inconsistent; the condition is never
    /// recoverable.
    pub fn check_invariants(&self) {
        for entry in self.entries.values() {
            assert_consistent(entry);
            assert!(
                entry.refcount > 0,
                "registry invariant violated: empty entry for {} retained",
                entry.topic
            );
            for client in &entry.clients {
                assert!(
                    self.contains(*client, &entry.topic),
                    "registry invariant violated: {} lists {client} but the client index does not",
                    entry.topic
                );
            }
        }
        for (client, held) in &self.client_topics {
            for topic in held {
                assert!(
                    self.entries.get(topic).is_some_and(|e| e.contains(*client)),
                    "registry invariant violated: {client} holds {topic} without an entry"
                );
            }
        }
    }
}

fn assert_consistent(entry: &SubscriptionEntry) {
    assert!(
        entry.is_consistent(),
        "registry invariant violated: {} refcount {} != {} clients",
        entry.topic,
        entry.refcount,
        entry.clients.len()
    );
}

// =============================================================================
// Statistics
// =============================================================================

/// Aggregate subscription counts.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct SubscriptionStats {
    /// Topics with at least one client.
    pub topic_count: usize,
    /// Clients holding at least one topic.
    pub client_count: usize,
    /// Sum of all refcounts.
    pub subscription_count: usize,
}

// =============================================================================
// Tests
// =============================================================================
