//! Feed State
//!
//! Connection state of an upstream adapter and the health events it
//! raises when that state changes in a way clients need to know about.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Lifecycle of one upstream streaming connection.
///
/// `Disconnected → Connecting → Authenticating → Streaming`, then
/// `Streaming → Reconnecting → Streaming | Disconnected`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AdapterState {
    /// No connection and no attempt in progress.
    #[default]
    Disconnected,
    /// Opening the transport for the first time.
    Connecting,
    /// Transport open, waiting for the venue to accept credentials.
    Authenticating,
    /// Authenticated and receiving data.
    Streaming,
    /// Lost the connection; retrying with backoff.
    Reconnecting,
}

impl AdapterState {
    /// Label for logs and metrics.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Disconnected => "disconnected",
            Self::Connecting => "connecting",
            Self::Authenticating => "authenticating",
            Self::Streaming => "streaming",
            Self::Reconnecting => "reconnecting",
        }
    }

    /// Gauge value exported to Prometheus.
    #[must_use]
    pub const fn gauge_value(self) -> f64 {
        match self {
            Self::Disconnected => 0.0,
            Self::Connecting => 1.0,
            Self::Authenticating => 2.0,
            Self::Streaming => 3.0,
            Self::Reconnecting => 4.0,
        }
    }

    /// Whether ticks can currently flow.
    #[must_use]
    pub const fn is_streaming(self) -> bool {
        matches!(self, Self::Streaming)
    }
}

impl std::fmt::Display for AdapterState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Read-only snapshot of an adapter's connection.
///
/// The adapter owns the live record; observers only ever get copies.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AdapterConnection {
    /// Broker identifier, e.g. `definedge`.
    pub broker_id: String,
    /// Current state.
    pub state: AdapterState,
    /// Last time any inbound frame arrived.
    pub last_heartbeat_at: Option<DateTime<Utc>>,
    /// Consecutive failed attempts in the current outage.
    pub retry_count: u32,
}

impl AdapterConnection {
    /// Fresh record for a never-connected adapter.
    #[must_use]
    pub fn new(broker_id: impl Into<String>) -> Self {
        Self {
            broker_id: broker_id.into(),
            state: AdapterState::Disconnected,
            last_heartbeat_at: None,
            retry_count: 0,
        }
    }
}

// =============================================================================
// Health Events
// =============================================================================

/// Client-visible feed health.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FeedHealth {
    /// Streaming normally.
    Up,
    /// Permanently failed until an operator intervenes.
    Down,
    /// Connection lost; retries in progress.
    Reconnecting,
}

/// Health change for one adapter, covering every exchange it serves.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AdapterStatusEvent {
    /// Broker identifier.
    pub broker_id: String,
    /// Exchanges routed to this adapter.
    pub exchanges: Vec<String>,
    /// New health.
    pub health: FeedHealth,
    /// Human-readable cause for `Down` and `Reconnecting`.
    pub reason: Option<String>,
}

impl AdapterStatusEvent {
    /// Split into one client-facing event per exchange.
    pub fn per_exchange(&self) -> impl Iterator<Item = FeedStatusEvent> + '_ {
        self.exchanges.iter().map(|exchange| FeedStatusEvent {
            exchange: exchange.clone(),
            broker_id: self.broker_id.clone(),
            state: self.health,
            reason: self.reason.clone(),
        })
    }
}

/// Health event delivered to clients subscribed under `exchange`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FeedStatusEvent {
    /// Affected exchange.
    pub exchange: String,
    /// Adapter that owns the exchange.
    pub broker_id: String,
    /// New health.
    pub state: FeedHealth,
    /// Cause, when known.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}
