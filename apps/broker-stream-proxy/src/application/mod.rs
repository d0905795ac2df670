//! Application Layer - Use cases and port definitions.
//!
//! Services here coordinate the domain bookkeeping with the broker
//! adapters through the ports; they never touch sockets directly.

/// Port interfaces implemented by infrastructure.
pub mod ports;

/// Subscription registry and feed monitoring.
pub mod services;
