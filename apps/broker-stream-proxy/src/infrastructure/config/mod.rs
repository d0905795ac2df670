//! Configuration Module
//!
//! Environment-driven configuration for the proxy service.

mod settings;

pub use settings::{
    BrokerSettings, ConfigError, DeliverySettings, ProxyConfig, ServerSettings, UpstreamSettings,
};
