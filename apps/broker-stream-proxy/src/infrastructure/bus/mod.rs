//! Internal Message Bus
//!
//! Topic-keyed fan-out between broker adapters and client sessions, built
//! on tokio broadcast channels.
//!
//! # Architecture
//!
//! - One channel per live topic (`NSE:INFY:LTP`) and one per live exchange
//!   wildcard (`NSE`), created on first subscribe.
//! - Publishing never blocks: a receiver that falls more than the channel
//!   capacity behind loses its oldest items and sees `Lagged(n)` on its
//!   next receive. Other receivers are unaffected.
//! - Channels whose receivers are all gone are pruned by [`MessageBus::release`].
//! - The last tick of each live topic is kept for snapshot requests.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use tokio::sync::broadcast;

use crate::domain::tick::{CanonicalTick, Topic};
use crate::infrastructure::metrics;

/// Default per-channel capacity.
pub const DEFAULT_BUS_CAPACITY: usize = 1024;

/// Bus shared between adapters and sessions.
pub type SharedMessageBus = Arc<MessageBus>;

// =============================================================================
// Envelope and Filter
// =============================================================================

/// A published tick with its routing key.
#[derive(Debug, Clone)]
pub struct BusEnvelope {
    /// Routing key.
    pub topic: Topic,
    /// Shared tick.
    pub tick: Arc<CanonicalTick>,
    /// Bus-wide publish sequence number.
    pub sequence: u64,
}

/// What a receiver listens to.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum BusFilter {
    /// Exactly one topic.
    Topic(Topic),
    /// Every topic under an exchange.
    Exchange(String),
}

impl BusFilter {
    /// Wildcard filter for an exchange (normalized to upper case).
    #[must_use]
    pub fn exchange(exchange: &str) -> Self {
        Self::Exchange(exchange.trim().to_ascii_uppercase())
    }

    /// Whether a topic matches.
    #[must_use]
    pub fn matches(&self, topic: &Topic) -> bool {
        match self {
            Self::Topic(t) => t == topic,
            Self::Exchange(e) => topic.exchange() == e,
        }
    }
}

// =============================================================================
// Message Bus
// =============================================================================

#[derive(Debug)]
struct TopicChannel {
    tx: broadcast::Sender<BusEnvelope>,
    last: Mutex<Option<Arc<CanonicalTick>>>,
}

/// Topic-keyed publish/subscribe hub.
///
/// ```rust
/// use broker_stream_proxy::infrastructure::bus::{BusFilter, MessageBus};
/// use broker_stream_proxy::domain::tick::Topic;
///
/// let bus = MessageBus::new(16);
/// let topic = Topic::parse("NSE:INFY:LTP").unwrap();
/// let rx = bus.subscribe(&BusFilter::Topic(topic.clone()));
/// assert_eq!(bus.stats().receivers, 1);
///
/// drop(rx);
/// bus.release(&BusFilter::Topic(topic));
/// assert_eq!(bus.stats().topic_channels, 0);
/// ```
#[derive(Debug)]
pub struct MessageBus {
    capacity: usize,
    topics: RwLock<HashMap<Topic, TopicChannel>>,
    exchanges: RwLock<HashMap<String, broadcast::Sender<BusEnvelope>>>,
    sequence: AtomicU64,
    published: AtomicU64,
    undelivered: AtomicU64,
    lagged: AtomicU64,
}

impl Default for MessageBus {
    fn default() -> Self {
        Self::new(DEFAULT_BUS_CAPACITY)
    }
}

impl MessageBus {
    /// Create a bus whose channels hold `capacity` items per receiver.
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            topics: RwLock::new(HashMap::new()),
            exchanges: RwLock::new(HashMap::new()),
            sequence: AtomicU64::new(0),
            published: AtomicU64::new(0),
            undelivered: AtomicU64::new(0),
            lagged: AtomicU64::new(0),
        }
    }

    /// Publish a tick to its topic channel and exchange wildcard.
    ///
    /// Never blocks. Returns the number of receivers reached.
    pub fn publish(&self, tick: Arc<CanonicalTick>) -> usize {
        let topic = tick.topic();
        let envelope = BusEnvelope {
            sequence: self.sequence.fetch_add(1, Ordering::Relaxed),
            topic,
            tick,
        };

        let mut delivered = 0;

        if let Some(channel) = self.topics.read().get(&envelope.topic) {
            *channel.last.lock() = Some(Arc::clone(&envelope.tick));
            delivered += channel.tx.send(envelope.clone()).unwrap_or(0);
        }

        if let Some(tx) = self.exchanges.read().get(envelope.topic.exchange()) {
            delivered += tx.send(envelope).unwrap_or(0);
        }

        self.published.fetch_add(1, Ordering::Relaxed);
        if delivered == 0 {
            self.undelivered.fetch_add(1, Ordering::Relaxed);
            metrics::record_bus_undelivered();
        }
        delivered
    }

    /// New receiver for `filter`, creating the channel if needed.
    #[must_use]
    pub fn subscribe(&self, filter: &BusFilter) -> broadcast::Receiver<BusEnvelope> {
        match filter {
            BusFilter::Topic(topic) => self
                .topics
                .write()
                .entry(topic.clone())
                .or_insert_with(|| TopicChannel {
                    tx: broadcast::channel(self.capacity).0,
                    last: Mutex::new(None),
                })
                .tx
                .subscribe(),
            BusFilter::Exchange(exchange) => self
                .exchanges
                .write()
                .entry(exchange.clone())
                .or_insert_with(|| broadcast::channel(self.capacity).0)
                .subscribe(),
        }
    }

    /// Prune the channel for `filter` if no receiver remains.
    ///
    /// Call after dropping a receiver. Returns true when the channel was
    /// removed.
    pub fn release(&self, filter: &BusFilter) -> bool {
        match filter {
            BusFilter::Topic(topic) => {
                let mut topics = self.topics.write();
                if topics
                    .get(topic)
                    .is_some_and(|c| c.tx.receiver_count() == 0)
                {
                    topics.remove(topic);
                    return true;
                }
            }
            BusFilter::Exchange(exchange) => {
                let mut exchanges = self.exchanges.write();
                if exchanges
                    .get(exchange)
                    .is_some_and(|tx| tx.receiver_count() == 0)
                {
                    exchanges.remove(exchange);
                    return true;
                }
            }
        }
        false
    }

    /// Most recent tick of a live topic.
    #[must_use]
    pub fn last_tick(&self, topic: &Topic) -> Option<Arc<CanonicalTick>> {
        self.topics
            .read()
            .get(topic)
            .and_then(|c| c.last.lock().clone())
    }

    /// Account for items a receiver lost to lag.
    pub fn record_lag(&self, skipped: u64) {
        self.lagged.fetch_add(skipped, Ordering::Relaxed);
        metrics::record_slow_consumer_drop("bus", skipped);
    }

    /// Channel and delivery counters.
    #[must_use]
    pub fn stats(&self) -> BusStats {
        let topics = self.topics.read();
        let exchanges = self.exchanges.read();
        BusStats {
            topic_channels: topics.len(),
            exchange_channels: exchanges.len(),
            receivers: topics.values().map(|c| c.tx.receiver_count()).sum::<usize>()
                + exchanges.values().map(broadcast::Sender::receiver_count).sum::<usize>(),
            published: self.published.load(Ordering::Relaxed),
            undelivered: self.undelivered.load(Ordering::Relaxed),
            lagged: self.lagged.load(Ordering::Relaxed),
        }
    }
}

/// Bus counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct BusStats {
    /// Live topic channels.
    pub topic_channels: usize,
    /// Live exchange wildcard channels.
    pub exchange_channels: usize,
    /// Receivers across all channels.
    pub receivers: usize,
    /// Ticks published.
    pub published: u64,
    /// Ticks published with no receiver.
    pub undelivered: u64,
    /// Items lost by lagging receivers.
    pub lagged: u64,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::tick::Mode;
    use chrono::Utc;
    use rust_decimal::Decimal;
    use tokio::sync::broadcast::error::RecvError;

    fn tick(exchange: &str, symbol: &str, ltp: i64) -> Arc<CanonicalTick> {
        Arc::new(
            CanonicalTick::builder(exchange, symbol, Mode::Ltp)
                .timestamp(Utc::now())
                .last_traded_price(Decimal::new(ltp, 2))
                .build()
                .unwrap(),
        )
    }

    fn topic(key: &str) -> Topic {
        Topic::parse(key).unwrap()
    }

    #[tokio::test]
    async fn topic_subscriber_receives_in_order() {
        let bus = MessageBus::new(16);
        let mut rx = bus.subscribe(&BusFilter::Topic(topic("NSE:INFY:LTP")));

        for ltp in 1..=5 {
            assert_eq!(bus.publish(tick("NSE", "INFY", ltp)), 1);
        }

        for ltp in 1..=5 {
            let env = rx.recv().await.unwrap();
            assert_eq!(env.tick.last_traded_price(), Decimal::new(ltp, 2));
        }
    }

    #[tokio::test]
    async fn exchange_wildcard_matches_all_symbols() {
        let bus = MessageBus::new(16);
        let mut rx = bus.subscribe(&BusFilter::exchange("nse"));

        bus.publish(tick("NSE", "INFY", 1));
        bus.publish(tick("BSE", "INFY", 2));
        bus.publish(tick("NSE", "TCS", 3));

        assert_eq!(rx.recv().await.unwrap().topic.symbol(), "INFY");
        assert_eq!(rx.recv().await.unwrap().topic.symbol(), "TCS");
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn publish_without_subscribers_is_counted() {
        let bus = MessageBus::new(16);
        assert_eq!(bus.publish(tick("NSE", "INFY", 1)), 0);

        let stats = bus.stats();
        assert_eq!(stats.published, 1);
        assert_eq!(stats.undelivered, 1);
        assert!(bus.last_tick(&topic("NSE:INFY:LTP")).is_none());
    }

    #[tokio::test]
    async fn slow_receiver_lags_without_blocking_others() {
        let bus = MessageBus::new(4);
        let filter = BusFilter::Topic(topic("NSE:INFY:LTP"));
        let mut slow = bus.subscribe(&filter);
        let mut fast = bus.subscribe(&filter);

        for ltp in 0..10 {
            bus.publish(tick("NSE", "INFY", ltp));
            assert_eq!(
                fast.recv().await.unwrap().tick.last_traded_price(),
                Decimal::new(ltp, 2)
            );
        }

        match slow.recv().await {
            Err(RecvError::Lagged(n)) => {
                assert_eq!(n, 6);
                bus.record_lag(n);
            }
            other => panic!("expected lag, got {other:?}"),
        }
        // Oldest surviving item is the first one still buffered.
        assert_eq!(
            slow.recv().await.unwrap().tick.last_traded_price(),
            Decimal::new(6, 2)
        );
        assert_eq!(bus.stats().lagged, 6);
    }

    #[test]
    fn last_tick_is_cached_per_topic() {
        let bus = MessageBus::new(16);
        let infy = topic("NSE:INFY:LTP");
        let _rx = bus.subscribe(&BusFilter::Topic(infy.clone()));

        bus.publish(tick("NSE", "INFY", 100));
        bus.publish(tick("NSE", "INFY", 101));

        assert_eq!(
            bus.last_tick(&infy).unwrap().last_traded_price(),
            Decimal::new(101, 2)
        );
    }

    #[test]
    fn release_keeps_channel_with_live_receivers() {
        let bus = MessageBus::new(16);
        let filter = BusFilter::Topic(topic("NSE:INFY:LTP"));
        let first = bus.subscribe(&filter);
        let second = bus.subscribe(&filter);

        drop(first);
        assert!(!bus.release(&filter));
        assert_eq!(bus.stats().topic_channels, 1);

        drop(second);
        assert!(bus.release(&filter));
        assert_eq!(bus.stats(), BusStats::default());
    }

    #[test]
    fn filter_matching() {
        let infy = topic("NSE:INFY:LTP");
        assert!(BusFilter::Topic(infy.clone()).matches(&infy));
        assert!(!BusFilter::Topic(infy.clone()).matches(&infy.with_mode(Mode::Depth)));
        assert!(BusFilter::exchange("nse").matches(&infy));
        assert!(!BusFilter::exchange("BSE").matches(&infy));
    }
}
