//! Broker Stream Proxy Binary
//!
//! Starts the multi-broker market data proxy.
//!
//! # Usage
//!
//! ```bash
//! cargo run --bin broker-stream-proxy
//! ```
//!
//! # Environment Variables
//!
//! ## Required (per broker in `STREAM_PROXY_BROKERS`)
//! - `<BROKER>_UID`: venue user id
//! - `<BROKER>_SUSERTOKEN`: streaming session token
//!
//! ## Optional
//! - `STREAM_PROXY_BROKERS`: comma-separated broker ids (default: definedge)
//! - `<BROKER>_ACTID`: account id (default: the user id)
//! - `<BROKER>_WS_URL`, `<BROKER>_EXCHANGES`: endpoint and exchange overrides
//! - `STREAM_PROXY_INSTRUMENTS_FILE`: JSON symbol → token map
//! - `STREAM_PROXY_WS_HOST` / `STREAM_PROXY_WS_PORT`: client listener (default: 0.0.0.0:8765)
//! - `STREAM_PROXY_HEALTH_PORT`: health and metrics HTTP port (default: 8082)
//! - `OTEL_ENABLED`, `OTEL_EXPORTER_OTLP_ENDPOINT`, `OTEL_SERVICE_NAME`: tracing export
//! - `RUST_LOG`: log filter

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use broker_stream_proxy::application::ports::{BrokerAdapter, UpstreamControl};
use broker_stream_proxy::infrastructure::broker::{
    AdapterContext, AdapterFactory, AdapterRouter, AdapterSettings, InstrumentMap,
};
use broker_stream_proxy::infrastructure::health::{HealthServer, HealthServerState};
use broker_stream_proxy::infrastructure::telemetry;
use broker_stream_proxy::{
    FeedMonitor, MessageBus, ProxyConfig, ProxyServer, SubscriptionRegistry, init_metrics,
};
use tokio::signal;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

/// Upper bound on waiting for adapters to close.
const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(30);

#[tokio::main]
#[allow(clippy::expect_used)]
async fn main() -> anyhow::Result<()> {
    rustls::crypto::ring::default_provider()
        .install_default()
        .expect("Failed to install rustls crypto provider");

    load_dotenv();

    let _telemetry_guard = telemetry::init();

    tracing::info!("Starting Broker Stream Proxy");

    let _metrics_handle = init_metrics();

    let config = ProxyConfig::from_env().context("invalid configuration")?;
    log_config(&config);

    let shutdown_token = CancellationToken::new();

    let instruments = match &config.instruments_file {
        Some(path) => InstrumentMap::from_file(path)?,
        None => InstrumentMap::new(),
    };

    let bus = Arc::new(MessageBus::new(config.delivery.bus_capacity));
    let (status_tx, status_rx) = mpsc::unbounded_channel();

    let factory = AdapterFactory::new(AdapterContext {
        bus: Arc::clone(&bus),
        status_tx,
        settings: AdapterSettings::from_settings(&config.upstream),
        instruments: Arc::new(instruments),
        shutdown: shutdown_token.clone(),
    });
    let adapters = config
        .brokers
        .iter()
        .map(|broker| factory.create_with(broker.to_spec()))
        .collect::<Result<Vec<Arc<dyn BrokerAdapter>>, _>>()?;
    let router = Arc::new(AdapterRouter::new(adapters));

    let upstream: Arc<dyn UpstreamControl> = Arc::clone(&router) as _;
    let registry = Arc::new(SubscriptionRegistry::new(upstream));

    let monitor = FeedMonitor::new(Arc::clone(&registry));
    let feed_table = monitor.table();
    tokio::spawn(monitor.run(status_rx, shutdown_token.clone()));

    let proxy = Arc::new(ProxyServer::new(
        Arc::clone(&registry),
        Arc::clone(&bus),
        config.delivery.client_queue_capacity,
        shutdown_token.clone(),
    ));
    let listener = ProxyServer::bind(&config.server.ws_addr()).await?;
    tokio::spawn(Arc::clone(&proxy).run(listener));

    let health_state = Arc::new(HealthServerState::new(
        env!("CARGO_PKG_VERSION").to_string(),
        Arc::clone(&router),
        feed_table,
        registry,
        bus,
        proxy,
    ));
    let health_server = HealthServer::new(
        config.server.health_port,
        health_state,
        shutdown_token.clone(),
    );
    tokio::spawn(async move {
        if let Err(e) = health_server.run().await {
            tracing::error!(error = %e, "Health server error");
        }
    });

    router.connect_all().await?;

    tracing::info!("Stream proxy ready");

    await_shutdown(shutdown_token).await;

    if tokio::time::timeout(SHUTDOWN_TIMEOUT, router.disconnect_all())
        .await
        .is_err()
    {
        tracing::warn!(
            timeout_secs = SHUTDOWN_TIMEOUT.as_secs(),
            "Adapters did not close in time"
        );
    }

    tracing::info!("Stream proxy stopped");
    Ok(())
}

/// Log the parsed configuration. Credentials are never logged.
fn log_config(config: &ProxyConfig) {
    let brokers: Vec<&str> = config.brokers.iter().map(|b| b.broker_id.as_str()).collect();
    tracing::info!(
        ?brokers,
        ws_addr = %config.server.ws_addr(),
        health_port = config.server.health_port,
        bus_capacity = config.delivery.bus_capacity,
        client_queue_capacity = config.delivery.client_queue_capacity,
        "Configuration loaded"
    );
    for broker in &config.brokers {
        tracing::debug!(
            broker = %broker.broker_id,
            url = broker.url.as_deref().unwrap_or("default"),
            exchanges = ?broker.exchanges,
            "Broker endpoint"
        );
    }
}

/// Load `.env` from the current directory or the nearest ancestor.
fn load_dotenv() {
    if dotenvy::dotenv().is_ok() {
        return;
    }

    if let Ok(cwd) = std::env::current_dir() {
        for dir in cwd.ancestors().skip(1) {
            let env_path = dir.join(".env");
            if env_path.exists() {
                let _ = dotenvy::from_path(&env_path);
                return;
            }
        }
    }
}

/// Wait for SIGINT or SIGTERM, then cancel `shutdown_token`.
#[allow(clippy::expect_used)]
async fn await_shutdown(shutdown_token: CancellationToken) {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("signal handler installation is critical for graceful shutdown");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("SIGTERM handler installation is critical for graceful shutdown")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {
            tracing::info!("Received Ctrl+C, initiating shutdown");
        }
        () = terminate => {
            tracing::info!("Received SIGTERM, initiating shutdown");
        }
    }

    shutdown_token.cancel();
}
