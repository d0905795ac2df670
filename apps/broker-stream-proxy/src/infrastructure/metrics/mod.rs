//! Prometheus Metrics Module
//!
//! Application metrics exposed in Prometheus text format.
//!
//! # Metrics Categories
//!
//! - **Upstream**: frames, ticks, malformed frames and reconnects per broker
//! - **Adapter state**: one gauge per broker
//! - **Delivery**: bus publishes, slow consumer drops, connected clients
//! - **Control**: rejected client control messages by code
//!
//! Recording functions are no-ops until [`init_metrics`] installs the
//! recorder, so library code and tests can call them freely.

use std::sync::OnceLock;

use metrics::{counter, describe_counter, describe_gauge, gauge};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};

use crate::domain::feed::AdapterState;

static PROMETHEUS_HANDLE: OnceLock<PrometheusHandle> = OnceLock::new();

/// Install the Prometheus recorder, once per process.
///
/// # Panics
///
/// Panics if another global recorder was installed first.
#[allow(clippy::expect_used)]
pub fn init_metrics() -> PrometheusHandle {
    PROMETHEUS_HANDLE
        .get_or_init(|| {
            let handle = PrometheusBuilder::new()
                .install_recorder()
                .expect("failed to install Prometheus recorder");
            describe_metrics();
            handle
        })
        .clone()
}

/// Handle for rendering, if [`init_metrics`] has run.
#[must_use]
pub fn get_metrics_handle() -> Option<PrometheusHandle> {
    PROMETHEUS_HANDLE.get().cloned()
}

fn describe_metrics() {
    describe_counter!(
        "broker_proxy_frames_received_total",
        "Frames read from broker venues"
    );
    describe_counter!(
        "broker_proxy_ticks_published_total",
        "Canonical ticks published to the bus"
    );
    describe_counter!(
        "broker_proxy_malformed_frames_total",
        "Upstream frames dropped because they failed to decode"
    );
    describe_counter!(
        "broker_proxy_reconnects_total",
        "Upstream reconnect attempts"
    );
    describe_counter!(
        "broker_proxy_upstream_errors_total",
        "Upstream connection failures by category"
    );
    describe_gauge!(
        "broker_proxy_adapter_state",
        "Adapter state (0 disconnected, 1 connecting, 2 authenticating, 3 streaming, 4 reconnecting)"
    );
    describe_counter!(
        "broker_proxy_bus_undelivered_total",
        "Ticks published with no matching subscriber"
    );
    describe_counter!(
        "broker_proxy_slow_consumer_drops_total",
        "Ticks dropped because a consumer fell behind"
    );
    describe_gauge!(
        "broker_proxy_clients",
        "Connected downstream clients"
    );
    describe_gauge!(
        "broker_proxy_active_topics",
        "Topics with at least one subscribed client"
    );
    describe_counter!(
        "broker_proxy_control_rejections_total",
        "Client control messages rejected, by error code"
    );
}

// =============================================================================
// Upstream
// =============================================================================

/// Frame read from a venue.
pub fn record_frame_received(broker: &str) {
    counter!("broker_proxy_frames_received_total", "broker" => broker.to_string()).increment(1);
}

/// Tick handed to the bus.
pub fn record_tick_published(broker: &str) {
    counter!("broker_proxy_ticks_published_total", "broker" => broker.to_string()).increment(1);
}

/// Frame dropped as malformed.
pub fn record_malformed_frame(broker: &str) {
    counter!("broker_proxy_malformed_frames_total", "broker" => broker.to_string()).increment(1);
}

/// Reconnect attempt scheduled.
pub fn record_reconnect(broker: &str) {
    counter!("broker_proxy_reconnects_total", "broker" => broker.to_string()).increment(1);
}

/// Connection failure, labelled by error category.
pub fn record_upstream_error(broker: &str, category: &'static str) {
    counter!(
        "broker_proxy_upstream_errors_total",
        "broker" => broker.to_string(),
        "category" => category
    )
    .increment(1);
}

/// Adapter state change.
pub fn set_adapter_state(broker: &str, state: AdapterState) {
    gauge!("broker_proxy_adapter_state", "broker" => broker.to_string())
        .set(state.gauge_value());
}

// =============================================================================
// Delivery
// =============================================================================

/// Tick published with nobody listening.
pub fn record_bus_undelivered() {
    counter!("broker_proxy_bus_undelivered_total").increment(1);
}

/// Ticks lost by a lagging consumer. `stage` is `bus` or `client_queue`.
pub fn record_slow_consumer_drop(stage: &'static str, count: u64) {
    counter!("broker_proxy_slow_consumer_drops_total", "stage" => stage).increment(count);
}

/// Connected client count.
#[allow(clippy::cast_precision_loss)]
pub fn set_clients(count: usize) {
    gauge!("broker_proxy_clients").set(count as f64);
}

/// Active topic count.
#[allow(clippy::cast_precision_loss)]
pub fn set_active_topics(count: usize) {
    gauge!("broker_proxy_active_topics").set(count as f64);
}

/// Control message rejected.
pub fn record_control_rejection(code: &'static str) {
    counter!("broker_proxy_control_rejections_total", "code" => code).increment(1);
}
