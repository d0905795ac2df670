//! Feed Monitor
//!
//! Consumes adapter status events, keeps the latest health per broker and
//! hands each event to the registry so affected clients hear about it.

use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::Serialize;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use super::registry::SubscriptionRegistry;
use crate::domain::feed::{AdapterStatusEvent, FeedHealth};

/// Last known health of one broker feed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FeedRecord {
    /// Broker identifier.
    pub broker_id: String,
    /// Exchanges served.
    pub exchanges: Vec<String>,
    /// Latest health.
    pub health: FeedHealth,
    /// Cause of the latest change.
    pub reason: Option<String>,
    /// When the latest event was received.
    pub changed_at: DateTime<Utc>,
    /// Number of events seen for this broker.
    pub transitions: u64,
}

/// Shared view of broker health, read by the health server.
#[derive(Debug, Default)]
pub struct FeedStateTable {
    feeds: RwLock<BTreeMap<String, FeedRecord>>,
}

impl FeedStateTable {
    fn record(&self, event: &AdapterStatusEvent) {
        let mut feeds = self.feeds.write();
        let transitions = feeds.get(&event.broker_id).map_or(0, |r| r.transitions) + 1;
        feeds.insert(
            event.broker_id.clone(),
            FeedRecord {
                broker_id: event.broker_id.clone(),
                exchanges: event.exchanges.clone(),
                health: event.health,
                reason: event.reason.clone(),
                changed_at: Utc::now(),
                transitions,
            },
        );
    }

    /// Record for one broker.
    #[must_use]
    pub fn get(&self, broker_id: &str) -> Option<FeedRecord> {
        self.feeds.read().get(broker_id).cloned()
    }

    /// All records, ordered by broker id.
    #[must_use]
    pub fn snapshot(&self) -> Vec<FeedRecord> {
        self.feeds.read().values().cloned().collect()
    }
}

/// Routes adapter status events to clients.
#[derive(Debug, Clone)]
pub struct FeedMonitor {
    registry: Arc<SubscriptionRegistry>,
    table: Arc<FeedStateTable>,
}

impl FeedMonitor {
    /// Create a monitor feeding `registry`.
    #[must_use]
    pub fn new(registry: Arc<SubscriptionRegistry>) -> Self {
        Self {
            registry,
            table: Arc::new(FeedStateTable::default()),
        }
    }

    /// Shared health table.
    #[must_use]
    pub fn table(&self) -> Arc<FeedStateTable> {
        Arc::clone(&self.table)
    }

    /// Record one event and notify affected clients.
    /// Returns the number of client notifications sent.
    pub fn handle(&self, event: &AdapterStatusEvent) -> usize {
        self.table.record(event);

        match event.health {
            FeedHealth::Up => tracing::info!(broker = %event.broker_id, "Feed up"),
            FeedHealth::Reconnecting => tracing::warn!(
                broker = %event.broker_id,
                reason = event.reason.as_deref().unwrap_or(""),
                "Feed reconnecting"
            ),
            FeedHealth::Down => tracing::error!(
                broker = %event.broker_id,
                reason = event.reason.as_deref().unwrap_or(""),
                "Feed down"
            ),
        }

        event
            .per_exchange()
            .filter(|e| self.owns(&event.broker_id, &e.exchange))
            .map(|e| self.registry.on_feed_status(&e))
            .sum()
    }

    /// Whether `broker_id` is the adapter routed for `exchange`. Clients
    /// only hear about the feed that actually serves them.
    fn owns(&self, broker_id: &str, exchange: &str) -> bool {
        let owned = self
            .registry
            .owner_of(exchange)
            .is_some_and(|owner| owner.eq_ignore_ascii_case(broker_id));
        if !owned {
            tracing::debug!(
                broker = %broker_id,
                %exchange,
                "Status for unrouted exchange ignored"
            );
        }
        owned
    }

    /// Drain `events` until cancelled or every sender is dropped.
    pub async fn run(
        self,
        mut events: mpsc::UnboundedReceiver<AdapterStatusEvent>,
        cancel: CancellationToken,
    ) {
        loop {
            tokio::select! {
                () = cancel.cancelled() => break,
                event = events.recv() => match event {
                    Some(event) => {
                        self.handle(&event);
                    }
                    None => break,
                },
            }
        }
        tracing::debug!("Feed monitor stopped");
    }
}
