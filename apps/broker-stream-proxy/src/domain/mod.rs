//! Domain Layer - Canonical market data types and subscription bookkeeping.
//!
//! This layer holds the venue-agnostic types every other layer speaks:
//! ticks and topics, feed health, and the refcounted subscription table.
//! Nothing here performs I/O.

use serde::Serialize;

/// Upstream feed state and health events.
pub mod feed;

/// Refcounted topic subscriptions.
pub mod subscription;

/// Canonical tick model and topic keys.
pub mod tick;

// =============================================================================
// Error Taxonomy
// =============================================================================

/// Error categories shared across layers.
///
/// Layer-specific error enums map onto one of these through their `kind()`
/// method, which keeps metrics labels and client-facing codes consistent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// An upstream frame or tick could not be decoded; dropped and counted.
    MalformedTick,
    /// The venue refused the streaming credentials.
    AuthRejected,
    /// No adapter is registered for the requested broker identifier.
    UnsupportedBroker,
    /// The upstream connection went silent past the heartbeat timeout.
    UpstreamTimeout,
    /// A consumer fell behind and lost its oldest queued ticks.
    SlowConsumerDrop,
    /// Subscription bookkeeping diverged. Always fatal.
    RegistryInvariantViolation,
}

impl ErrorKind {
    /// Stable snake_case label for metrics and error frames.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::MalformedTick => "malformed_tick",
            Self::AuthRejected => "auth_rejected",
            Self::UnsupportedBroker => "unsupported_broker",
            Self::UpstreamTimeout => "upstream_timeout",
            Self::SlowConsumerDrop => "slow_consumer_drop",
            Self::RegistryInvariantViolation => "registry_invariant_violation",
        }
    }
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}
