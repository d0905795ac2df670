//! Exchange Router
//!
//! Owns the running adapters and routes subscription changes to the one
//! serving each topic's exchange. Implements [`UpstreamControl`] so the
//! subscription registry never sees concrete adapters.

use std::collections::HashMap;
use std::sync::Arc;

use crate::application::ports::{AdapterError, BrokerAdapter, UpstreamControl, UpstreamError};
use crate::domain::tick::Topic;

/// Exchange → adapter routing table.
pub struct AdapterRouter {
    adapters: Vec<Arc<dyn BrokerAdapter>>,
    by_exchange: HashMap<String, usize>,
}

impl std::fmt::Debug for AdapterRouter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AdapterRouter")
            .field(
                "adapters",
                &self.adapters.iter().map(|a| a.broker_id()).collect::<Vec<_>>(),
            )
            .field("exchanges", &self.by_exchange.len())
            .finish()
    }
}

impl AdapterRouter {
    /// Build the table. When two adapters claim one exchange the first
    /// one keeps it.
    #[must_use]
    pub fn new(adapters: Vec<Arc<dyn BrokerAdapter>>) -> Self {
        let mut by_exchange = HashMap::new();
        for (index, adapter) in adapters.iter().enumerate() {
            for exchange in adapter.exchanges() {
                let exchange = exchange.to_ascii_uppercase();
                if let Some(&owner) = by_exchange.get(&exchange) {
                    let owner: &Arc<dyn BrokerAdapter> = &adapters[owner];
                    tracing::warn!(
                        %exchange,
                        owner = %owner.broker_id(),
                        ignored = %adapter.broker_id(),
                        "Exchange claimed by more than one broker"
                    );
                    continue;
                }
                by_exchange.insert(exchange, index);
            }
        }
        Self {
            adapters,
            by_exchange,
        }
    }

    /// Every adapter, in configuration order.
    #[must_use]
    pub fn adapters(&self) -> &[Arc<dyn BrokerAdapter>] {
        &self.adapters
    }

    /// Adapter serving `exchange`.
    #[must_use]
    pub fn adapter_for(&self, exchange: &str) -> Option<&Arc<dyn BrokerAdapter>> {
        self.by_exchange
            .get(&exchange.to_ascii_uppercase())
            .map(|&index| &self.adapters[index])
    }

    /// Start every adapter.
    ///
    /// # Errors
    ///
    /// Returns the first adapter that refuses to start.
    pub async fn connect_all(&self) -> Result<(), AdapterError> {
        for adapter in &self.adapters {
            adapter.connect().await?;
        }
        Ok(())
    }

    /// Stop every adapter and wait for their tasks.
    pub async fn disconnect_all(&self) {
        for adapter in &self.adapters {
            adapter.disconnect().await;
        }
    }

    fn route(&self, topic: &Topic) -> Result<&Arc<dyn BrokerAdapter>, UpstreamError> {
        self.adapter_for(topic.exchange())
            .ok_or_else(|| UpstreamError::NoAdapter {
                exchange: topic.exchange().to_string(),
            })
    }
}

fn unavailable(adapter: &Arc<dyn BrokerAdapter>, err: &AdapterError) -> UpstreamError {
    UpstreamError::Unavailable {
        broker_id: adapter.broker_id().to_string(),
        reason: err.to_string(),
    }
}

impl UpstreamControl for AdapterRouter {
    fn subscribe(&self, topic: &Topic) -> Result<(), UpstreamError> {
        let adapter = self.route(topic)?;
        adapter.subscribe(topic).map_err(|e| unavailable(adapter, &e))
    }

    fn unsubscribe(&self, topic: &Topic) -> Result<(), UpstreamError> {
        let adapter = self.route(topic)?;
        adapter.unsubscribe(topic).map_err(|e| unavailable(adapter, &e))
    }

    fn owner_of(&self, exchange: &str) -> Option<String> {
        self.adapter_for(exchange).map(|a| a.broker_id().to_string())
    }
}
