//! Subscription Registry
//!
//! The one shared mutable table in the proxy. Client sessions call in to
//! subscribe and unsubscribe; the registry keeps the refcounts and pushes
//! 0→1 and 1→0 transitions to the owning adapter through
//! [`UpstreamControl`].
//!
//! Mutations are serialized by a single write lock. Adapter calls made
//! under that lock only enqueue a command, so the lock is never held
//! across I/O and the upstream sees subscribe/unsubscribe in the same
//! order the registry decided them.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;
use tokio::sync::mpsc;

use crate::application::ports::{UpstreamControl, UpstreamError};
use crate::domain::feed::FeedStatusEvent;
use crate::domain::subscription::{
    ClientId, SubscriptionBook, SubscriptionEntry, SubscriptionStats,
};
use crate::domain::tick::Topic;
use crate::infrastructure::metrics;

/// Channel that carries feed health events to one client session.
pub type StatusSink = mpsc::UnboundedSender<FeedStatusEvent>;

/// Registry errors surfaced to the caller.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RegistryError {
    /// The upstream side refused the subscription; nothing was recorded.
    #[error(transparent)]
    Upstream(#[from] UpstreamError),
}

/// Result of a subscribe call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubscribeOutcome {
    /// Client added; `upstream` is true when this opened the topic upstream.
    Subscribed {
        /// Refcount after the call.
        refcount: usize,
        /// Whether an upstream subscribe was issued.
        upstream: bool,
    },
    /// The client already held the topic.
    AlreadySubscribed,
}

/// Result of an unsubscribe call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnsubscribeOutcome {
    /// Client removed; `upstream` is true when this closed the topic upstream.
    Unsubscribed {
        /// Refcount after the call.
        refcount: usize,
        /// Whether an upstream unsubscribe was issued.
        upstream: bool,
    },
    /// The client did not hold the topic.
    NotSubscribed,
}

/// Refcounted topic registry shared by all client sessions.
pub struct SubscriptionRegistry {
    book: RwLock<SubscriptionBook>,
    sinks: RwLock<HashMap<ClientId, StatusSink>>,
    upstream: Arc<dyn UpstreamControl>,
}

impl std::fmt::Debug for SubscriptionRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SubscriptionRegistry")
            .field("stats", &self.stats())
            .finish_non_exhaustive()
    }
}

impl SubscriptionRegistry {
    /// Create a registry that drives `upstream`.
    #[must_use]
    pub fn new(upstream: Arc<dyn UpstreamControl>) -> Self {
        Self {
            book: RwLock::new(SubscriptionBook::default()),
            sinks: RwLock::new(HashMap::new()),
            upstream,
        }
    }

    /// Register the status channel for a newly connected client.
    pub fn attach_client(&self, client: ClientId, sink: StatusSink) {
        self.sinks.write().insert(client, sink);
    }

    /// Add `client` to `topic`, opening the topic upstream if it is new.
    ///
    /// # Errors
    ///
    /// Returns [`RegistryError::Upstream`] when no adapter can take the
    /// topic. The insertion is rolled back in that case.
    pub fn subscribe(
        &self,
        client: ClientId,
        topic: &Topic,
    ) -> Result<SubscribeOutcome, RegistryError> {
        let mut book = self.book.write();

        if book.contains(client, topic) {
            return Ok(SubscribeOutcome::AlreadySubscribed);
        }

        let changes = book.add(client, topic);
        let upstream = changes.subscribe.contains(topic);

        if upstream {
            if let Err(e) = self.upstream.subscribe(topic) {
                book.remove(client, topic);
                tracing::warn!(%client, %topic, error = %e, "Upstream subscribe rejected");
                return Err(e.into());
            }
            tracing::info!(%topic, "Opened upstream subscription");
        }

        let refcount = book.entry(topic).map_or(0, SubscriptionEntry::refcount);
        metrics::set_active_topics(book.stats().topic_count);
        tracing::debug!(%client, %topic, refcount, "Client subscribed");

        Ok(SubscribeOutcome::Subscribed { refcount, upstream })
    }

    /// Remove `client` from `topic`, closing the topic upstream if it was
    /// the last holder.
    pub fn unsubscribe(&self, client: ClientId, topic: &Topic) -> UnsubscribeOutcome {
        let mut book = self.book.write();

        if !book.contains(client, topic) {
            return UnsubscribeOutcome::NotSubscribed;
        }

        let changes = book.remove(client, topic);
        let upstream = changes.unsubscribe.contains(topic);
        if upstream {
            self.close_upstream(topic);
        }

        let refcount = book.entry(topic).map_or(0, SubscriptionEntry::refcount);
        metrics::set_active_topics(book.stats().topic_count);
        tracing::debug!(%client, %topic, refcount, "Client unsubscribed");

        UnsubscribeOutcome::Unsubscribed { refcount, upstream }
    }

    /// Drop every subscription held by a disconnecting client and detach
    /// its status channel. Returns the number of topics closed upstream.
    ///
    /// Completes without waiting on any adapter, even one that is
    /// mid-reconnect.
    pub fn release_client(&self, client: ClientId) -> usize {
        self.sinks.write().remove(&client);

        let mut book = self.book.write();
        let changes = book.remove_client(client);
        for topic in &changes.unsubscribe {
            self.close_upstream(topic);
        }
        metrics::set_active_topics(book.stats().topic_count);

        if !changes.is_empty() {
            tracing::info!(
                %client,
                closed = changes.unsubscribe.len(),
                "Released client subscriptions"
            );
        }
        changes.unsubscribe.len()
    }

    fn close_upstream(&self, topic: &Topic) {
        match self.upstream.unsubscribe(topic) {
            Ok(()) => tracing::info!(%topic, "Closed upstream subscription"),
            // The entry is gone either way; a missing adapter has nothing to close.
            Err(e) => tracing::warn!(%topic, error = %e, "Upstream unsubscribe failed"),
        }
    }

    /// Forward a feed health event to every client holding a topic under
    /// the event's exchange. Returns the number of clients notified.
    pub fn on_feed_status(&self, event: &FeedStatusEvent) -> usize {
        let clients = self.book.read().clients_under_exchange(&event.exchange);
        if clients.is_empty() {
            return 0;
        }

        let sinks = self.sinks.read();
        let mut notified = 0;
        for client in clients {
            if let Some(sink) = sinks.get(&client)
                && sink.send(event.clone()).is_ok()
            {
                notified += 1;
            }
        }

        tracing::debug!(
            exchange = %event.exchange,
            state = ?event.state,
            notified,
            "Delivered feed status"
        );
        notified
    }

    /// Broker that owns `exchange`.
    #[must_use]
    pub fn owner_of(&self, exchange: &str) -> Option<String> {
        self.upstream.owner_of(exchange)
    }

    /// Copy of the entry for `topic`.
    #[must_use]
    pub fn entry(&self, topic: &Topic) -> Option<SubscriptionEntry> {
        self.book.read().entry(topic).cloned()
    }

    /// Topics held by `client`, sorted.
    #[must_use]
    pub fn client_topics(&self, client: ClientId) -> Vec<Topic> {
        self.book.read().client_topics(client)
    }

    /// All topics with at least one client, sorted.
    #[must_use]
    pub fn active_topics(&self) -> Vec<Topic> {
        self.book.read().active_topics()
    }

    /// Aggregate counts.
    #[must_use]
    pub fn stats(&self) -> SubscriptionStats {
        self.book.read().stats()
    }

    /// Number of attached clients, subscribed or not.
    #[must_use]
    pub fn attached_clients(&self) -> usize {
        self.sinks.read().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::application::ports::MockUpstreamControl;
    use crate::domain::feed::FeedHealth;
    use mockall::predicate::eq;

    fn topic(key: &str) -> Topic {
        Topic::parse(key).unwrap()
    }

    fn status(exchange: &str, state: FeedHealth) -> FeedStatusEvent {
        FeedStatusEvent {
            exchange: exchange.to_string(),
            broker_id: "definedge".to_string(),
            state,
            reason: None,
        }
    }

    #[test]
    fn shared_topic_subscribes_upstream_once() {
        let infy = topic("NSE:INFY:LTP");
        let mut upstream = MockUpstreamControl::new();
        upstream
            .expect_subscribe()
            .with(eq(infy.clone()))
            .times(1)
            .returning(|_| Ok(()));
        upstream
            .expect_unsubscribe()
            .with(eq(infy.clone()))
            .times(1)
            .returning(|_| Ok(()));

        let registry = SubscriptionRegistry::new(Arc::new(upstream));
        let (a, b) = (ClientId::from_u128(1), ClientId::from_u128(2));

        assert_eq!(
            registry.subscribe(a, &infy).unwrap(),
            SubscribeOutcome::Subscribed {
                refcount: 1,
                upstream: true
            }
        );
        assert_eq!(
            registry.subscribe(b, &infy).unwrap(),
            SubscribeOutcome::Subscribed {
                refcount: 2,
                upstream: false
            }
        );

        assert_eq!(registry.release_client(a), 0);
        assert_eq!(registry.entry(&infy).unwrap().refcount(), 1);

        assert_eq!(registry.release_client(b), 1);
        assert!(registry.entry(&infy).is_none());
    }

    #[test]
    fn duplicate_subscribe_is_noop() {
        let infy = topic("NSE:INFY:LTP");
        let mut upstream = MockUpstreamControl::new();
        upstream.expect_subscribe().times(1).returning(|_| Ok(()));

        let registry = SubscriptionRegistry::new(Arc::new(upstream));
        let a = ClientId::from_u128(1);

        registry.subscribe(a, &infy).unwrap();
        assert_eq!(
            registry.subscribe(a, &infy).unwrap(),
            SubscribeOutcome::AlreadySubscribed
        );
        assert_eq!(registry.entry(&infy).unwrap().refcount(), 1);
    }

    #[test]
    fn rejected_subscribe_rolls_back() {
        let cds = topic("CDS:USDINR:LTP");
        let mut upstream = MockUpstreamControl::new();
        upstream.expect_subscribe().returning(|t| {
            Err(UpstreamError::NoAdapter {
                exchange: t.exchange().to_string(),
            })
        });
        upstream.expect_unsubscribe().never();

        let registry = SubscriptionRegistry::new(Arc::new(upstream));
        let a = ClientId::from_u128(1);

        let err = registry.subscribe(a, &cds).unwrap_err();
        assert!(matches!(
            err,
            RegistryError::Upstream(UpstreamError::NoAdapter { .. })
        ));
        assert!(registry.entry(&cds).is_none());
        assert!(registry.client_topics(a).is_empty());
        assert_eq!(registry.release_client(a), 0);
    }

    #[test]
    fn unsubscribe_last_holder_closes_upstream() {
        let infy = topic("NSE:INFY:Quote");
        let mut upstream = MockUpstreamControl::new();
        upstream.expect_subscribe().returning(|_| Ok(()));
        upstream
            .expect_unsubscribe()
            .with(eq(infy.clone()))
            .times(1)
            .returning(|_| Ok(()));

        let registry = SubscriptionRegistry::new(Arc::new(upstream));
        let a = ClientId::from_u128(1);

        registry.subscribe(a, &infy).unwrap();
        assert_eq!(
            registry.unsubscribe(a, &infy),
            UnsubscribeOutcome::Unsubscribed {
                refcount: 0,
                upstream: true
            }
        );
        assert_eq!(registry.unsubscribe(a, &infy), UnsubscribeOutcome::NotSubscribed);
    }

    #[test]
    fn release_without_subscriptions_is_noop() {
        let mut upstream = MockUpstreamControl::new();
        upstream.expect_unsubscribe().never();

        let registry = SubscriptionRegistry::new(Arc::new(upstream));
        let (tx, _rx) = mpsc::unbounded_channel();
        let a = ClientId::new();
        registry.attach_client(a, tx);

        assert_eq!(registry.release_client(a), 0);
        assert_eq!(registry.attached_clients(), 0);
    }

    #[test]
    fn upstream_unsubscribe_failure_still_removes_entry() {
        let infy = topic("NSE:INFY:LTP");
        let mut upstream = MockUpstreamControl::new();
        upstream.expect_subscribe().returning(|_| Ok(()));
        upstream.expect_unsubscribe().returning(|_| {
            Err(UpstreamError::Unavailable {
                broker_id: "definedge".to_string(),
                reason: "shut down".to_string(),
            })
        });

        let registry = SubscriptionRegistry::new(Arc::new(upstream));
        let a = ClientId::from_u128(1);
        registry.subscribe(a, &infy).unwrap();

        assert_eq!(registry.release_client(a), 1);
        assert!(registry.active_topics().is_empty());
    }

    #[test]
    fn feed_status_reaches_only_affected_clients() {
        let mut upstream = MockUpstreamControl::new();
        upstream.expect_subscribe().returning(|_| Ok(()));

        let registry = SubscriptionRegistry::new(Arc::new(upstream));
        let (a, b, c) = (
            ClientId::from_u128(1),
            ClientId::from_u128(2),
            ClientId::from_u128(3),
        );
        let (tx_a, mut rx_a) = mpsc::unbounded_channel();
        let (tx_b, mut rx_b) = mpsc::unbounded_channel();
        let (tx_c, mut rx_c) = mpsc::unbounded_channel();
        registry.attach_client(a, tx_a);
        registry.attach_client(b, tx_b);
        registry.attach_client(c, tx_c);

        registry.subscribe(a, &topic("NSE:INFY:LTP")).unwrap();
        registry.subscribe(b, &topic("MCX:CRUDEOIL:LTP")).unwrap();

        let notified = registry.on_feed_status(&status("NSE", FeedHealth::Down));

        assert_eq!(notified, 1);
        assert_eq!(rx_a.try_recv().unwrap().state, FeedHealth::Down);
        assert!(rx_b.try_recv().is_err());
        assert!(rx_c.try_recv().is_err());
    }

    #[test]
    fn concurrent_subscriptions_keep_refcounts() {
        use std::thread;

        let mut upstream = MockUpstreamControl::new();
        upstream.expect_subscribe().returning(|_| Ok(()));
        upstream.expect_unsubscribe().returning(|_| Ok(()));
        let registry = Arc::new(SubscriptionRegistry::new(Arc::new(upstream)));

        let handles: Vec<_> = (0..10u128)
            .map(|i| {
                let registry = Arc::clone(&registry);
                thread::spawn(move || {
                    let client = ClientId::from_u128(i);
                    registry.subscribe(client, &topic("NSE:INFY:LTP")).unwrap();
                    registry
                        .subscribe(client, &topic(&format!("NSE:SYM{i}:LTP")))
                        .unwrap();
                    if i % 2 == 0 {
                        registry.release_client(client);
                    }
                })
            })
            .collect();

        for handle in handles {
            handle.join().unwrap();
        }

        assert_eq!(registry.entry(&topic("NSE:INFY:LTP")).unwrap().refcount(), 5);
        let stats = registry.stats();
        assert_eq!(stats.client_count, 5);
        assert_eq!(stats.topic_count, 6);
    }
}
