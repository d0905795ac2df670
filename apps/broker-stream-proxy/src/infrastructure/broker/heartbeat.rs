//! Upstream Liveness
//!
//! A per-connection task that asks the adapter to send a heartbeat frame
//! every interval and reports a timeout once no inbound frame (tick,
//! ack or heartbeat reply) has arrived for longer than the configured
//! limit. Liveness is judged on inbound traffic only.

use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::infrastructure::config::UpstreamSettings;

/// Floor for the send interval; `tokio::time::interval` rejects zero.
const MIN_INTERVAL: Duration = Duration::from_millis(1);

/// Heartbeat timing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HeartbeatConfig {
    /// How often to send a heartbeat frame.
    pub interval: Duration,
    /// Inbound silence after which the connection is considered dead.
    pub timeout: Duration,
}

impl Default for HeartbeatConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(15),
            timeout: Duration::from_secs(45),
        }
    }
}

impl HeartbeatConfig {
    /// Build from upstream settings.
    #[must_use]
    pub const fn from_settings(settings: &UpstreamSettings) -> Self {
        Self {
            interval: settings.heartbeat_interval,
            timeout: settings.heartbeat_timeout,
        }
    }
}

/// What the connection loop should do next.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HeartbeatEvent {
    /// Send the venue heartbeat frame.
    SendHeartbeat,
    /// Inbound traffic stopped for this long; reconnect.
    Timeout(Duration),
}

/// Inbound activity shared between the read loop and the monitor.
#[derive(Debug)]
pub struct LivenessState {
    last_inbound: Mutex<(Instant, Option<DateTime<Utc>>)>,
}

impl Default for LivenessState {
    fn default() -> Self {
        Self::new()
    }
}

impl LivenessState {
    /// Fresh state; the connection counts as alive right now.
    #[must_use]
    pub fn new() -> Self {
        Self {
            last_inbound: Mutex::new((Instant::now(), None)),
        }
    }

    /// Note that a frame arrived.
    pub fn record_inbound(&self) {
        *self.last_inbound.lock() = (Instant::now(), Some(Utc::now()));
    }

    /// Time since the last inbound frame (or since creation).
    #[must_use]
    pub fn silence(&self) -> Duration {
        self.last_inbound.lock().0.elapsed()
    }

    /// Wall-clock time of the last inbound frame.
    #[must_use]
    pub fn last_inbound_at(&self) -> Option<DateTime<Utc>> {
        self.last_inbound.lock().1
    }
}

/// Interval task driving heartbeats for one connection.
pub struct HeartbeatMonitor {
    config: HeartbeatConfig,
    state: Arc<LivenessState>,
    events: mpsc::Sender<HeartbeatEvent>,
    cancel: CancellationToken,
}

impl HeartbeatMonitor {
    /// Create a monitor; spawn [`run`](Self::run) to start it.
    #[must_use]
    pub const fn new(
        config: HeartbeatConfig,
        state: Arc<LivenessState>,
        events: mpsc::Sender<HeartbeatEvent>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            config,
            state,
            events,
            cancel,
        }
    }

    /// Run until cancelled, the receiver goes away, or a timeout fires.
    pub async fn run(self) {
        let mut ticker = tokio::time::interval(self.config.interval.max(MIN_INTERVAL));
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        // The first tick completes immediately; nothing to check yet.
        ticker.tick().await;

        loop {
            tokio::select! {
                () = self.cancel.cancelled() => break,
                _ = ticker.tick() => {
                    let silence = self.state.silence();
                    if silence > self.config.timeout {
                        tracing::warn!(
                            silence_ms = u64::try_from(silence.as_millis()).unwrap_or(u64::MAX),
                            timeout_ms = u64::try_from(self.config.timeout.as_millis()).unwrap_or(u64::MAX),
                            "Upstream heartbeat timeout"
                        );
                        let _ = self.events.send(HeartbeatEvent::Timeout(silence)).await;
                        break;
                    }
                    if self.events.send(HeartbeatEvent::SendHeartbeat).await.is_err() {
                        break;
                    }
                }
            }
        }
    }
}
