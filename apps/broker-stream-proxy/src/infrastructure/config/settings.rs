//! Proxy Configuration Settings
//!
//! Configuration types for the stream proxy, loaded from environment variables.

use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use crate::infrastructure::broker::{AdapterSpec, Credentials, CredentialsError};

/// One upstream broker to start.
#[derive(Debug, Clone)]
pub struct BrokerSettings {
    /// Factory identifier, lowercase.
    pub broker_id: String,
    /// Streaming credentials.
    pub credentials: Credentials,
    /// Endpoint override.
    pub url: Option<String>,
    /// Exchanges served; empty means the factory default.
    pub exchanges: Vec<String>,
}

impl BrokerSettings {
    /// Factory input for this broker.
    #[must_use]
    pub fn to_spec(&self) -> AdapterSpec {
        AdapterSpec {
            broker_id: self.broker_id.clone(),
            credentials: self.credentials.clone(),
            url: self.url.clone(),
            exchanges: self.exchanges.clone(),
        }
    }
}

/// Listener settings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerSettings {
    /// Client WebSocket bind host.
    pub ws_host: String,
    /// Client WebSocket port.
    pub ws_port: u16,
    /// Health and metrics HTTP port.
    pub health_port: u16,
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            ws_host: "0.0.0.0".to_string(),
            ws_port: 8765,
            health_port: 8082,
        }
    }
}

impl ServerSettings {
    /// `host:port` for the client listener.
    #[must_use]
    pub fn ws_addr(&self) -> String {
        format!("{}:{}", self.ws_host, self.ws_port)
    }
}

/// Upstream connection timing.
#[derive(Debug, Clone, PartialEq)]
pub struct UpstreamSettings {
    /// Heartbeat frame interval.
    pub heartbeat_interval: Duration,
    /// Inbound silence before the connection is considered dead.
    pub heartbeat_timeout: Duration,
    /// Initial reconnection delay.
    pub reconnect_delay_initial: Duration,
    /// Maximum reconnection delay.
    pub reconnect_delay_max: Duration,
    /// Backoff multiplier.
    pub reconnect_delay_multiplier: f64,
    /// Fractional jitter applied to each delay.
    pub reconnect_jitter: f64,
    /// Retries per outage before giving up (0 = unlimited).
    pub max_reconnect_attempts: u32,
    /// Time allowed for the login reply.
    pub auth_timeout: Duration,
    /// Time allowed for the WebSocket handshake.
    pub connect_timeout: Duration,
}

impl Default for UpstreamSettings {
    fn default() -> Self {
        Self {
            heartbeat_interval: Duration::from_secs(15),
            heartbeat_timeout: Duration::from_secs(45),
            reconnect_delay_initial: Duration::from_millis(500),
            reconnect_delay_max: Duration::from_secs(60),
            reconnect_delay_multiplier: 2.0,
            reconnect_jitter: 0.1,
            max_reconnect_attempts: 10,
            auth_timeout: Duration::from_secs(10),
            connect_timeout: Duration::from_secs(10),
        }
    }
}

/// Queue bounds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeliverySettings {
    /// Per-topic bus channel capacity.
    pub bus_capacity: usize,
    /// Per-client outbound tick queue bound.
    pub client_queue_capacity: usize,
}

impl Default for DeliverySettings {
    fn default() -> Self {
        Self {
            bus_capacity: 1024,
            client_queue_capacity: 512,
        }
    }
}

/// Complete proxy configuration.
#[derive(Debug, Clone)]
pub struct ProxyConfig {
    /// Brokers to start, in priority order.
    pub brokers: Vec<BrokerSettings>,
    /// Listener settings.
    pub server: ServerSettings,
    /// Upstream timing.
    pub upstream: UpstreamSettings,
    /// Queue bounds.
    pub delivery: DeliverySettings,
    /// Optional JSON instrument map.
    pub instruments_file: Option<PathBuf>,
}

impl ProxyConfig {
    /// Create configuration from environment variables.
    ///
    /// # Errors
    ///
    /// Returns an error if required environment variables are missing.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Create configuration from any key/value source.
    ///
    /// # Errors
    ///
    /// Returns an error if no broker is configured or a broker's
    /// credentials are missing.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let broker_ids: Vec<String> = lookup("STREAM_PROXY_BROKERS")
            .unwrap_or_else(|| "definedge".to_string())
            .split(',')
            .map(|id| id.trim().to_ascii_lowercase())
            .filter(|id| !id.is_empty())
            .collect();
        if broker_ids.is_empty() {
            return Err(ConfigError::EmptyValue("STREAM_PROXY_BROKERS".to_string()));
        }

        let brokers = broker_ids
            .into_iter()
            .map(|broker_id| broker_settings(broker_id, &lookup))
            .collect::<Result<Vec<_>, _>>()?;

        let server_defaults = ServerSettings::default();
        let server = ServerSettings {
            ws_host: lookup("STREAM_PROXY_WS_HOST")
                .filter(|h| !h.trim().is_empty())
                .unwrap_or(server_defaults.ws_host),
            ws_port: parse_var(&lookup, "STREAM_PROXY_WS_PORT", server_defaults.ws_port),
            health_port: parse_var(&lookup, "STREAM_PROXY_HEALTH_PORT", server_defaults.health_port),
        };

        let defaults = UpstreamSettings::default();
        let upstream = UpstreamSettings {
            heartbeat_interval: parse_secs(
                &lookup,
                "STREAM_PROXY_HEARTBEAT_INTERVAL_SECS",
                defaults.heartbeat_interval,
            ),
            heartbeat_timeout: parse_secs(
                &lookup,
                "STREAM_PROXY_HEARTBEAT_TIMEOUT_SECS",
                defaults.heartbeat_timeout,
            ),
            reconnect_delay_initial: parse_millis(
                &lookup,
                "STREAM_PROXY_RECONNECT_DELAY_INITIAL_MS",
                defaults.reconnect_delay_initial,
            ),
            reconnect_delay_max: parse_secs(
                &lookup,
                "STREAM_PROXY_RECONNECT_DELAY_MAX_SECS",
                defaults.reconnect_delay_max,
            ),
            reconnect_delay_multiplier: parse_float(
                &lookup,
                "STREAM_PROXY_RECONNECT_DELAY_MULTIPLIER",
                defaults.reconnect_delay_multiplier,
            ),
            reconnect_jitter: parse_float(
                &lookup,
                "STREAM_PROXY_RECONNECT_JITTER",
                defaults.reconnect_jitter,
            )
            .clamp(0.0, 1.0),
            max_reconnect_attempts: parse_var(
                &lookup,
                "STREAM_PROXY_MAX_RECONNECT_ATTEMPTS",
                defaults.max_reconnect_attempts,
            ),
            auth_timeout: parse_secs(&lookup, "STREAM_PROXY_AUTH_TIMEOUT_SECS", defaults.auth_timeout),
            connect_timeout: parse_secs(
                &lookup,
                "STREAM_PROXY_CONNECT_TIMEOUT_SECS",
                defaults.connect_timeout,
            ),
        };

        let delivery_defaults = DeliverySettings::default();
        let delivery = DeliverySettings {
            bus_capacity: parse_var(&lookup, "STREAM_PROXY_BUS_CAPACITY", delivery_defaults.bus_capacity)
                .max(1),
            client_queue_capacity: parse_var(
                &lookup,
                "STREAM_PROXY_CLIENT_QUEUE_CAPACITY",
                delivery_defaults.client_queue_capacity,
            )
            .max(1),
        };

        Ok(Self {
            brokers,
            server,
            upstream,
            delivery,
            instruments_file: lookup("STREAM_PROXY_INSTRUMENTS_FILE")
                .filter(|p| !p.trim().is_empty())
                .map(PathBuf::from),
        })
    }
}

fn broker_settings(
    broker_id: String,
    lookup: &impl Fn(&str) -> Option<String>,
) -> Result<BrokerSettings, ConfigError> {
    let prefix = broker_id.to_ascii_uppercase();
    let credentials =
        Credentials::from_lookup(&prefix, lookup).map_err(|source| ConfigError::Credentials {
            broker_id: broker_id.clone(),
            source,
        })?;
    let exchanges = lookup(&format!("{prefix}_EXCHANGES"))
        .map(|list| {
            list.split(',')
                .map(|e| e.trim().to_ascii_uppercase())
                .filter(|e| !e.is_empty())
                .collect()
        })
        .unwrap_or_default();

    Ok(BrokerSettings {
        url: lookup(&format!("{prefix}_WS_URL")).filter(|u| !u.trim().is_empty()),
        broker_id,
        credentials,
        exchanges,
    })
}

/// Configuration error.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// Environment variable has empty value.
    #[error("environment variable {0} cannot be empty")]
    EmptyValue(String),
    /// A configured broker has unusable credentials.
    #[error("credentials for broker {broker_id}: {source}")]
    Credentials {
        /// Broker identifier.
        broker_id: String,
        /// Underlying problem.
        #[source]
        source: CredentialsError,
    },
}

fn parse_var<T: FromStr>(lookup: &impl Fn(&str) -> Option<String>, key: &str, default: T) -> T {
    lookup(key)
        .and_then(|v| v.trim().parse().ok())
        .unwrap_or(default)
}

/// Finite floats only; `NaN` and infinities fall back to `default`.
fn parse_float(lookup: &impl Fn(&str) -> Option<String>, key: &str, default: f64) -> f64 {
    lookup(key)
        .and_then(|v| v.trim().parse::<f64>().ok())
        .filter(|f| f.is_finite())
        .unwrap_or(default)
}

/// Durations must be non-zero; zero falls back to `default`.
fn parse_secs(lookup: &impl Fn(&str) -> Option<String>, key: &str, default: Duration) -> Duration {
    lookup(key)
        .and_then(|v| v.trim().parse::<u64>().ok())
        .filter(|&secs| secs > 0)
        .map_or(default, Duration::from_secs)
}

fn parse_millis(
    lookup: &impl Fn(&str) -> Option<String>,
    key: &str,
    default: Duration,
) -> Duration {
    lookup(key)
        .and_then(|v| v.trim().parse::<u64>().ok())
        .filter(|&millis| millis > 0)
        .map_or(default, Duration::from_millis)
}
