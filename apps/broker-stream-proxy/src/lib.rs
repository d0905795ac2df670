#![cfg_attr(
    test,
    allow(
        clippy::unwrap_used,
        clippy::expect_used,
        clippy::significant_drop_tightening,
        clippy::too_many_lines,
        clippy::match_same_arms,
        clippy::needless_pass_by_value,
        clippy::items_after_statements,
        clippy::or_fun_call
    )
)]

//! Broker Stream Proxy - Multi-Broker Market Data Multiplexer
//!
//! Keeps one streaming connection per configured broker, normalizes each
//! venue's ticks into a canonical schema and fans them out to any number
//! of WebSocket clients. Upstream subscriptions are reference counted:
//! a topic is subscribed at the venue when its first client asks for it
//! and dropped when its last client leaves.
//!
//! # Layers (inside → outside)
//!
//! - **Domain**: canonical ticks, topics, feed state, subscription refcounts
//!   - `tick`: `CanonicalTick`, `Topic`, `Mode`
//!   - `feed`: adapter state machine and health events
//!   - `subscription`: per-topic client sets
//!
//! - **Application**: ports and services
//!   - `ports`: `BrokerAdapter`, `UpstreamControl`
//!   - `services`: subscription registry, feed monitor
//!
//! - **Infrastructure**: adapters and network surfaces
//!   - `broker`: streaming adapter, Noren venue, factory, router
//!   - `bus`: topic-keyed broadcast fan-out
//!   - `proxy`: downstream WebSocket server
//!   - `config`, `health`, `metrics`, `telemetry`
//!
//! # Data Flow
//!
//! ```text
//! Venue WS ──► Adapter ──┐
//!                        │    ┌─────────────┐    ┌─────────────┐
//! Venue WS ──► Adapter ──┼───►│ Message Bus │───►│ Proxy Server│──► Client 1
//!                        │    └─────────────┘    └─────────────┘──► Client N
//!                        │           ▲                  │
//!                        │           │     subscribe / unsubscribe
//!                        │           │                  ▼
//!                        └─── Router ◄──── Subscription Registry
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]
#![warn(clippy::pedantic)]

// =============================================================================
// Module Declarations
// =============================================================================

/// Domain layer - Core types with no I/O.
pub mod domain;

/// Application layer - Ports and services.
pub mod application;

/// Infrastructure layer - Adapters and external integrations.
pub mod infrastructure;

// =============================================================================
// Re-exports
// =============================================================================

// Domain types
pub use domain::ErrorKind;
pub use domain::feed::{AdapterConnection, AdapterState, FeedHealth, FeedStatusEvent};
pub use domain::subscription::{ClientId, SubscriptionStats};
pub use domain::tick::{CanonicalTick, DepthLevel, MarketDepth, Mode, QuoteFields, TickError, Topic};

// Application
pub use application::ports::{AdapterError, AdapterStats, BrokerAdapter, UpstreamControl};
pub use application::services::{FeedMonitor, FeedStateTable, SubscriptionRegistry};

// Broker adapters
pub use infrastructure::broker::{
    AdapterContext, AdapterFactory, AdapterRouter, AdapterSpec, FactoryError, InstrumentMap,
    StreamingAdapter, supported_brokers,
};

// Message bus
pub use infrastructure::bus::{MessageBus, SharedMessageBus};

// Config
pub use infrastructure::config::{ConfigError, ProxyConfig};

// Servers
pub use infrastructure::health::{HealthServer, HealthServerError, HealthServerState};
pub use infrastructure::proxy::{ProxyServer, ProxyServerError};

// Metrics
pub use infrastructure::metrics::init_metrics;

// Telemetry
pub use infrastructure::telemetry::{TelemetryConfig, TelemetryGuard, init as init_telemetry};
