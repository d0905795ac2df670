//! Health Check and Metrics Endpoint
//!
//! HTTP endpoint reporting broker feed health, client load and Prometheus
//! metrics for orchestrators and monitoring.
//!
//! # Endpoints
//!
//! - `GET /health` - JSON health report
//! - `GET /healthz` - liveness probe (always OK while the process runs)
//! - `GET /readyz` - readiness probe (OK once any feed is streaming)
//! - `GET /metrics` - Prometheus metrics in text format

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;

use axum::{Json, Router, extract::State, http::StatusCode, response::IntoResponse, routing::get};
use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

use crate::application::ports::AdapterStats;
use crate::application::services::{FeedStateTable, SubscriptionRegistry};
use crate::domain::feed::{AdapterState, FeedHealth};
use crate::domain::subscription::SubscriptionStats;
use crate::infrastructure::broker::AdapterRouter;
use crate::infrastructure::bus::{BusStats, SharedMessageBus};
use crate::infrastructure::metrics::get_metrics_handle;
use crate::infrastructure::proxy::ProxyServer;

// =============================================================================
// Health Response Types
// =============================================================================

/// Health check response.
#[derive(Debug, Clone, Serialize)]
pub struct HealthResponse {
    /// Overall status.
    pub status: HealthStatus,
    /// Proxy version.
    pub version: String,
    /// Server uptime in seconds.
    pub uptime_secs: u64,
    /// Current time.
    pub current_time: DateTime<Utc>,
    /// One entry per configured broker.
    pub feeds: Vec<FeedInfo>,
    /// Connected downstream clients.
    pub clients: usize,
    /// Registry counts.
    pub subscriptions: SubscriptionStats,
    /// Message bus counts.
    pub bus: BusStats,
}

/// Overall health status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    /// Every feed is streaming.
    Healthy,
    /// Some feeds are streaming.
    Degraded,
    /// No feed is streaming.
    Unhealthy,
}

/// Status of one broker feed.
#[derive(Debug, Clone, Serialize)]
pub struct FeedInfo {
    /// Broker identifier.
    pub broker_id: String,
    /// Exchanges routed to this broker.
    pub exchanges: Vec<String>,
    /// Live adapter state.
    pub state: AdapterState,
    /// Last health event raised by the adapter.
    pub health: Option<FeedHealth>,
    /// Cause attached to that event.
    pub reason: Option<String>,
    /// Failed attempts in the current outage.
    pub retry_count: u32,
    /// Last inbound frame.
    pub last_heartbeat_at: Option<DateTime<Utc>>,
    /// Adapter counters.
    pub stats: AdapterStats,
}

impl FeedInfo {
    const fn streaming(&self) -> bool {
        self.state.is_streaming()
    }
}

// =============================================================================
// Health Server State
// =============================================================================

/// Shared state for the health server.
pub struct HealthServerState {
    version: String,
    started_at: Instant,
    router: Arc<AdapterRouter>,
    feeds: Arc<FeedStateTable>,
    registry: Arc<SubscriptionRegistry>,
    bus: SharedMessageBus,
    proxy: Arc<ProxyServer>,
}

impl HealthServerState {
    /// Create new health server state.
    #[must_use]
    pub fn new(
        version: String,
        router: Arc<AdapterRouter>,
        feeds: Arc<FeedStateTable>,
        registry: Arc<SubscriptionRegistry>,
        bus: SharedMessageBus,
        proxy: Arc<ProxyServer>,
    ) -> Self {
        Self {
            version,
            started_at: Instant::now(),
            router,
            feeds,
            registry,
            bus,
            proxy,
        }
    }

    /// Current health report.
    #[must_use]
    pub fn report(&self) -> HealthResponse {
        let feeds: Vec<FeedInfo> = self
            .router
            .adapters()
            .iter()
            .map(|adapter| {
                let connection = adapter.connection();
                let record = self.feeds.get(adapter.broker_id());
                FeedInfo {
                    broker_id: connection.broker_id,
                    exchanges: adapter.exchanges().to_vec(),
                    state: connection.state,
                    health: record.as_ref().map(|r| r.health),
                    reason: record.and_then(|r| r.reason),
                    retry_count: connection.retry_count,
                    last_heartbeat_at: connection.last_heartbeat_at,
                    stats: adapter.stats(),
                }
            })
            .collect();

        HealthResponse {
            status: determine_health_status(&feeds),
            version: self.version.clone(),
            uptime_secs: self.started_at.elapsed().as_secs(),
            current_time: Utc::now(),
            feeds,
            clients: self.proxy.client_count(),
            subscriptions: self.registry.stats(),
            bus: self.bus.stats(),
        }
    }
}

// =============================================================================
// Health Server
// =============================================================================

/// Health check HTTP server.
pub struct HealthServer {
    port: u16,
    state: Arc<HealthServerState>,
    cancel: CancellationToken,
}

impl HealthServer {
    /// Create a new health server.
    #[must_use]
    pub const fn new(port: u16, state: Arc<HealthServerState>, cancel: CancellationToken) -> Self {
        Self {
            port,
            state,
            cancel,
        }
    }

    /// Run the health server until cancelled.
    ///
    /// # Errors
    ///
    /// Returns `HealthServerError` if binding fails or the HTTP server
    /// encounters a fatal error while running.
    pub async fn run(self) -> Result<(), HealthServerError> {
        let addr = SocketAddr::from(([0, 0, 0, 0], self.port));
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|e| HealthServerError::BindFailed(self.port, e.to_string()))?;
        self.serve(listener).await
    }

    /// Serve on an already bound listener until cancelled.
    ///
    /// # Errors
    ///
    /// Returns `HealthServerError::ServerFailed` if the HTTP server fails.
    pub async fn serve(self, listener: TcpListener) -> Result<(), HealthServerError> {
        if let Ok(addr) = listener.local_addr() {
            tracing::info!(%addr, "Health server listening");
        }

        axum::serve(listener, router(self.state))
            .with_graceful_shutdown(self.cancel.cancelled_owned())
            .await
            .map_err(|e| HealthServerError::ServerFailed(e.to_string()))?;

        tracing::info!("Health server stopped");
        Ok(())
    }
}

fn router(state: Arc<HealthServerState>) -> Router {
    Router::new()
        .route("/health", get(health_handler))
        .route("/healthz", get(liveness_handler))
        .route("/readyz", get(readiness_handler))
        .route("/metrics", get(metrics_handler))
        .with_state(state)
}

// =============================================================================
// HTTP Handlers
// =============================================================================

async fn health_handler(State(state): State<Arc<HealthServerState>>) -> impl IntoResponse {
    let response = state.report();
    let status_code = match response.status {
        HealthStatus::Healthy | HealthStatus::Degraded => StatusCode::OK,
        HealthStatus::Unhealthy => StatusCode::SERVICE_UNAVAILABLE,
    };
    (status_code, Json(response))
}

async fn liveness_handler() -> impl IntoResponse {
    (StatusCode::OK, "OK")
}

async fn readiness_handler(State(state): State<Arc<HealthServerState>>) -> impl IntoResponse {
    if state.report().feeds.iter().any(FeedInfo::streaming) {
        (StatusCode::OK, "READY")
    } else {
        (StatusCode::SERVICE_UNAVAILABLE, "NOT READY")
    }
}

async fn metrics_handler() -> impl IntoResponse {
    get_metrics_handle().map_or_else(
        || {
            (
                StatusCode::SERVICE_UNAVAILABLE,
                [("content-type", "text/plain")],
                "Metrics not initialized".to_string(),
            )
        },
        |handle| {
            (
                StatusCode::OK,
                [("content-type", "text/plain; version=0.0.4; charset=utf-8")],
                handle.render(),
            )
        },
    )
}

fn determine_health_status(feeds: &[FeedInfo]) -> HealthStatus {
    let streaming = feeds.iter().filter(|f| f.streaming()).count();
    match streaming {
        0 => HealthStatus::Unhealthy,
        n if n == feeds.len() => HealthStatus::Healthy,
        _ => HealthStatus::Degraded,
    }
}

// =============================================================================
// Errors
// =============================================================================

/// Health server errors.
#[derive(Debug, thiserror::Error)]
pub enum HealthServerError {
    /// Failed to bind to port.
    #[error("failed to bind to port {0}: {1}")]
    BindFailed(u16, String),

    /// Server error.
    #[error("server error: {0}")]
    ServerFailed(String),
}

// =============================================================================
// Tests
// =============================================================================
