//! Adapter Factory
//!
//! Maps broker identifiers to adapter constructors through a static table.
//! Adding a venue means adding one row; nothing else changes.

use std::sync::Arc;

use thiserror::Error;
use tokio_util::sync::CancellationToken;

use super::adapter::{AdapterSettings, StatusSender, StreamingAdapter};
use super::credentials::Credentials;
use super::instruments::InstrumentMap;
use super::noren::{DEFINEDGE_WS_URL, FLATTRADE_WS_URL, NorenVenue, SHOONYA_WS_URL};
use crate::application::ports::BrokerAdapter;
use crate::domain::ErrorKind;
use crate::infrastructure::bus::SharedMessageBus;

/// Exchanges served when a broker's configuration names none.
pub const DEFAULT_EXCHANGES: &[&str] = &[
    "NSE", "BSE", "NFO", "BFO", "CDS", "MCX", "NSE_INDEX", "BSE_INDEX",
];

/// Factory failures.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FactoryError {
    /// No table entry for this identifier.
    #[error("unsupported broker {broker_id:?} (supported: {})", supported_brokers().join(", "))]
    UnsupportedBroker {
        /// Requested identifier.
        broker_id: String,
    },
}

impl FactoryError {
    /// Taxonomy category.
    #[must_use]
    pub const fn kind(&self) -> ErrorKind {
        ErrorKind::UnsupportedBroker
    }
}

/// Everything an adapter shares with the rest of the process.
#[derive(Debug, Clone)]
pub struct AdapterContext {
    /// Destination for normalized ticks.
    pub bus: SharedMessageBus,
    /// Destination for feed health events.
    pub status_tx: StatusSender,
    /// Timing knobs.
    pub settings: AdapterSettings,
    /// Symbol → venue token lookup.
    pub instruments: Arc<InstrumentMap>,
    /// Process shutdown.
    pub shutdown: CancellationToken,
}

/// Per-broker construction input.
#[derive(Debug, Clone)]
pub struct AdapterSpec {
    /// Broker identifier (case-insensitive).
    pub broker_id: String,
    /// Streaming credentials.
    pub credentials: Credentials,
    /// Endpoint override; the venue default when `None`.
    pub url: Option<String>,
    /// Exchanges served; [`DEFAULT_EXCHANGES`] when empty.
    pub exchanges: Vec<String>,
}

impl AdapterSpec {
    /// Spec with default endpoint and exchanges.
    #[must_use]
    pub fn new(broker_id: impl Into<String>, credentials: Credentials) -> Self {
        Self {
            broker_id: broker_id.into(),
            credentials,
            url: None,
            exchanges: Vec::new(),
        }
    }
}

type Constructor = fn(&BrokerEntry, AdapterSpec, &AdapterContext) -> Arc<dyn BrokerAdapter>;

struct BrokerEntry {
    id: &'static str,
    default_url: &'static str,
    build: Constructor,
}

static BUILTIN_BROKERS: &[BrokerEntry] = &[
    BrokerEntry {
        id: "definedge",
        default_url: DEFINEDGE_WS_URL,
        build: noren_adapter,
    },
    BrokerEntry {
        id: "shoonya",
        default_url: SHOONYA_WS_URL,
        build: noren_adapter,
    },
    BrokerEntry {
        id: "flattrade",
        default_url: FLATTRADE_WS_URL,
        build: noren_adapter,
    },
];

fn noren_adapter(
    entry: &BrokerEntry,
    spec: AdapterSpec,
    context: &AdapterContext,
) -> Arc<dyn BrokerAdapter> {
    let exchanges = if spec.exchanges.is_empty() {
        DEFAULT_EXCHANGES.iter().map(ToString::to_string).collect()
    } else {
        spec.exchanges
    };
    let venue = NorenVenue::new(
        entry.id,
        spec.url.unwrap_or_else(|| entry.default_url.to_string()),
        exchanges,
        spec.credentials,
        Arc::clone(&context.instruments),
    );
    Arc::new(StreamingAdapter::new(
        venue,
        context.settings.clone(),
        Arc::clone(&context.bus),
        context.status_tx.clone(),
        context.shutdown.clone(),
    ))
}

/// Identifiers accepted by [`AdapterFactory::create`].
#[must_use]
pub fn supported_brokers() -> Vec<&'static str> {
    BUILTIN_BROKERS.iter().map(|entry| entry.id).collect()
}

/// Builds adapters wired to shared process state.
#[derive(Debug, Clone)]
pub struct AdapterFactory {
    context: AdapterContext,
}

impl AdapterFactory {
    /// Factory over a shared context.
    #[must_use]
    pub const fn new(context: AdapterContext) -> Self {
        Self { context }
    }

    /// Adapter for `broker_id` with default endpoint and exchanges.
    ///
    /// # Errors
    ///
    /// Returns [`FactoryError::UnsupportedBroker`] for unknown identifiers.
    pub fn create(
        &self,
        broker_id: &str,
        credentials: Credentials,
    ) -> Result<Arc<dyn BrokerAdapter>, FactoryError> {
        self.create_with(AdapterSpec::new(broker_id, credentials))
    }

    /// Adapter from a full spec.
    ///
    /// # Errors
    ///
    /// Returns [`FactoryError::UnsupportedBroker`] for unknown identifiers.
    pub fn create_with(&self, spec: AdapterSpec) -> Result<Arc<dyn BrokerAdapter>, FactoryError> {
        let wanted = spec.broker_id.trim();
        let entry = BUILTIN_BROKERS
            .iter()
            .find(|entry| entry.id.eq_ignore_ascii_case(wanted))
            .ok_or_else(|| FactoryError::UnsupportedBroker {
                broker_id: wanted.to_string(),
            })?;

        let adapter = (entry.build)(entry, spec, &self.context);
        tracing::info!(
            broker = entry.id,
            exchanges = ?adapter.exchanges(),
            "Created broker adapter"
        );
        Ok(adapter)
    }
}
