//! Port Interfaces
//!
//! Contracts between the application services and the infrastructure
//! that talks to brokers.
//!
//! ## Driven Ports (Outbound)
//!
//! - [`BrokerAdapter`]: lifecycle and subscription control of one upstream
//!   streaming connection
//! - [`UpstreamControl`]: exchange-routed subscribe/unsubscribe used by the
//!   subscription registry

use async_trait::async_trait;
use serde::Serialize;

use crate::domain::ErrorKind;
use crate::domain::feed::{AdapterConnection, AdapterState};
use crate::domain::tick::Topic;

// =============================================================================
// Errors
// =============================================================================

/// Failures of an upstream streaming connection.
#[derive(Debug, Clone, thiserror::Error)]
pub enum AdapterError {
    /// The venue refused the credentials.
    #[error("authentication rejected: {0}")]
    AuthRejected(String),

    /// The venue did not answer authentication in time.
    #[error("authentication timed out after {0:?}")]
    AuthTimeout(std::time::Duration),

    /// No inbound traffic within the heartbeat timeout.
    #[error("no upstream traffic for {0:?}")]
    UpstreamTimeout(std::time::Duration),

    /// Transport-level failure (connect, read or write).
    #[error("transport error: {0}")]
    Transport(String),

    /// The venue closed the connection.
    #[error("connection closed by venue")]
    ConnectionClosed,

    /// Credentials could not be encoded into a login frame.
    #[error("invalid credentials: {0}")]
    InvalidCredentials(String),

    /// The adapter's command loop is gone.
    #[error("adapter {broker_id} is shut down")]
    Closed {
        /// Broker identifier.
        broker_id: String,
    },
}

impl AdapterError {
    /// Taxonomy category, when the failure maps onto one.
    #[must_use]
    pub const fn kind(&self) -> Option<ErrorKind> {
        match self {
            Self::AuthRejected(_) | Self::InvalidCredentials(_) => Some(ErrorKind::AuthRejected),
            Self::AuthTimeout(_) | Self::UpstreamTimeout(_) => Some(ErrorKind::UpstreamTimeout),
            _ => None,
        }
    }

    /// Whether retrying can help.
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        !matches!(
            self,
            Self::AuthRejected(_) | Self::InvalidCredentials(_) | Self::Closed { .. }
        )
    }
}

/// Failures routing a subscription change to an adapter.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum UpstreamError {
    /// No adapter serves the topic's exchange.
    #[error("no broker adapter serves exchange {exchange}")]
    NoAdapter {
        /// Requested exchange.
        exchange: String,
    },

    /// The owning adapter refused the command.
    #[error("adapter {broker_id} unavailable: {reason}")]
    Unavailable {
        /// Owning broker.
        broker_id: String,
        /// Adapter error text.
        reason: String,
    },
}

// =============================================================================
// Broker Adapter Port
// =============================================================================

/// Per-adapter counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct AdapterStats {
    /// Frames read from the venue.
    pub frames_received: u64,
    /// Ticks handed to the bus.
    pub ticks_published: u64,
    /// Frames that failed to decode.
    pub malformed_frames: u64,
    /// Reconnect attempts since start.
    pub reconnect_attempts: u64,
    /// Topics the adapter is asked to keep subscribed.
    pub desired_topics: usize,
}

/// One upstream streaming connection.
///
/// Implementations own their connection task. `subscribe` and
/// `unsubscribe` only enqueue; the adapter applies them when it is
/// `Streaming` and replays the full desired set after every reconnect.
#[async_trait]
pub trait BrokerAdapter: Send + Sync {
    /// Broker identifier, e.g. `definedge`.
    fn broker_id(&self) -> &str;

    /// Canonical exchanges this adapter serves.
    fn exchanges(&self) -> &[String];

    /// Snapshot of the connection record.
    fn connection(&self) -> AdapterConnection;

    /// Current state.
    fn state(&self) -> AdapterState {
        self.connection().state
    }

    /// Start the connection task. A no-op while it is already running.
    async fn connect(&self) -> Result<(), AdapterError>;

    /// Ask for a topic. Idempotent; never waits on the network.
    fn subscribe(&self, topic: &Topic) -> Result<(), AdapterError>;

    /// Drop a topic. Idempotent; never waits on the network.
    fn unsubscribe(&self, topic: &Topic) -> Result<(), AdapterError>;

    /// Stop the connection task and close the socket.
    async fn disconnect(&self);

    /// Counters.
    fn stats(&self) -> AdapterStats;
}

// =============================================================================
// Upstream Control Port
// =============================================================================

/// Exchange-routed upstream subscription control.
#[cfg_attr(test, mockall::automock)]
pub trait UpstreamControl: Send + Sync {
    /// Start an upstream subscription for `topic`.
    fn subscribe(&self, topic: &Topic) -> Result<(), UpstreamError>;

    /// Stop the upstream subscription for `topic`.
    fn unsubscribe(&self, topic: &Topic) -> Result<(), UpstreamError>;

    /// Broker that owns `exchange`, if any.
    fn owner_of(&self, exchange: &str) -> Option<String>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn auth_rejection_is_not_retryable() {
        let err = AdapterError::AuthRejected("invalid session".to_string());
        assert!(!err.is_retryable());
        assert_eq!(err.kind(), Some(ErrorKind::AuthRejected));
    }

    #[test]
    fn timeouts_are_retryable() {
        let err = AdapterError::UpstreamTimeout(std::time::Duration::from_secs(45));
        assert!(err.is_retryable());
        assert_eq!(err.kind(), Some(ErrorKind::UpstreamTimeout));
        assert!(AdapterError::ConnectionClosed.is_retryable());
        assert_eq!(AdapterError::ConnectionClosed.kind(), None);
    }

    #[test]
    fn upstream_error_messages() {
        let err = UpstreamError::NoAdapter {
            exchange: "CDS".to_string(),
        };
        assert_eq!(err.to_string(), "no broker adapter serves exchange CDS");
    }
}
