//! Application Services
//!
//! - [`SubscriptionRegistry`]: refcounted topic table driving upstream
//!   subscriptions
//! - [`FeedMonitor`]: turns adapter status events into client notifications

mod feed_monitor;
mod registry;

pub use feed_monitor::{FeedMonitor, FeedRecord, FeedStateTable};
pub use registry::{
    RegistryError, StatusSink, SubscribeOutcome, SubscriptionRegistry, UnsubscribeOutcome,
};
