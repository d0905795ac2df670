//! Infrastructure Layer - Adapters and external integrations.
//!
//! Concrete implementations of the application ports plus the network
//! surfaces of the proxy.

/// Broker adapters, venue protocols, factory and exchange router.
pub mod broker;

/// Topic-keyed tick fan-out.
pub mod bus;

/// Environment-driven configuration.
pub mod config;

/// Health check HTTP endpoint.
pub mod health;

/// Prometheus metrics instrumentation.
pub mod metrics;

/// Downstream WebSocket server.
pub mod proxy;

/// Logging and OpenTelemetry tracing setup.
pub mod telemetry;
