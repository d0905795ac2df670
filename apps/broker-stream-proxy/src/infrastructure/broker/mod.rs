//! Broker Adapters
//!
//! Upstream side of the proxy: a generic streaming adapter driven by a
//! per-venue protocol, the Noren venue, the factory table and the
//! exchange router.

pub mod adapter;
pub mod credentials;
pub mod factory;
pub mod heartbeat;
pub mod instruments;
pub mod noren;
pub mod reconnect;
pub mod router;
pub mod venue;

pub use adapter::{AdapterSettings, StatusSender, StreamingAdapter};
pub use credentials::{Credentials, CredentialsError};
pub use factory::{
    AdapterContext, AdapterFactory, AdapterSpec, DEFAULT_EXCHANGES, FactoryError,
    supported_brokers,
};
pub use instruments::{InstrumentError, InstrumentMap};
pub use noren::NorenVenue;
pub use router::AdapterRouter;
pub use venue::{DecodeError, Venue, VenueEvent, VenueSession};
