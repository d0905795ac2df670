//! Streaming Adapter Runtime
//!
//! Generic upstream connection driver shared by every venue. One tokio
//! task per adapter runs the state machine:
//!
//! ```text
//! Disconnected → Connecting → Authenticating → Streaming
//!                                   ↑              │
//!                                   └─ Reconnecting ┘ → Disconnected (cap hit / auth rejected)
//! ```
//!
//! Subscription changes arrive on an unbounded command channel and are
//! folded into the *desired* topic set. The full set is replayed every
//! time the connection reaches `Streaming`, which covers both commands
//! queued before the first connect and resubscription after a reconnect.

use std::collections::BTreeSet;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use parking_lot::{Mutex, RwLock};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};
use tokio_util::sync::CancellationToken;

use super::heartbeat::{HeartbeatConfig, HeartbeatEvent, HeartbeatMonitor, LivenessState};
use super::reconnect::{ReconnectConfig, ReconnectPolicy};
use super::venue::{DecodeError, Venue, VenueEvent, VenueSession};
use crate::application::ports::{AdapterError, AdapterStats, BrokerAdapter};
use crate::domain::feed::{AdapterConnection, AdapterState, AdapterStatusEvent, FeedHealth};
use crate::domain::tick::Topic;
use crate::infrastructure::bus::SharedMessageBus;
use crate::infrastructure::config::UpstreamSettings;
use crate::infrastructure::metrics;

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;
type WsWrite = SplitSink<WsStream, Message>;
type WsRead = SplitStream<WsStream>;

/// Sender half for adapter health events.
pub type StatusSender = mpsc::UnboundedSender<AdapterStatusEvent>;

// =============================================================================
// Settings
// =============================================================================

/// Timing knobs for an adapter.
#[derive(Debug, Clone, PartialEq)]
pub struct AdapterSettings {
    /// Heartbeat interval and liveness timeout.
    pub heartbeat: HeartbeatConfig,
    /// Backoff between reconnect attempts.
    pub reconnect: ReconnectConfig,
    /// Time allowed for the venue to answer the login frame.
    pub auth_timeout: Duration,
    /// Time allowed for the TCP/TLS/WebSocket handshake.
    pub connect_timeout: Duration,
}

impl Default for AdapterSettings {
    fn default() -> Self {
        Self {
            heartbeat: HeartbeatConfig::default(),
            reconnect: ReconnectConfig::default(),
            auth_timeout: Duration::from_secs(10),
            connect_timeout: Duration::from_secs(10),
        }
    }
}

impl AdapterSettings {
    /// Build from upstream settings.
    #[must_use]
    pub const fn from_settings(settings: &UpstreamSettings) -> Self {
        Self {
            heartbeat: HeartbeatConfig::from_settings(settings),
            reconnect: ReconnectConfig::from_settings(settings),
            auth_timeout: settings.auth_timeout,
            connect_timeout: settings.connect_timeout,
        }
    }
}

// =============================================================================
// Shared State
// =============================================================================

#[derive(Debug, Clone)]
enum Command {
    Subscribe(Topic),
    Unsubscribe(Topic),
}

#[derive(Debug, Default)]
struct Counters {
    frames: AtomicU64,
    ticks: AtomicU64,
    malformed: AtomicU64,
    reconnects: AtomicU64,
}

struct Shared<V: Venue> {
    venue: V,
    settings: AdapterSettings,
    bus: SharedMessageBus,
    status_tx: StatusSender,
    connection: RwLock<AdapterConnection>,
    desired: RwLock<BTreeSet<Topic>>,
    commands: tokio::sync::Mutex<mpsc::UnboundedReceiver<Command>>,
    counters: Counters,
}

fn transport(err: impl std::fmt::Display) -> AdapterError {
    AdapterError::Transport(err.to_string())
}

const fn error_category(err: &AdapterError) -> &'static str {
    match err {
        AdapterError::AuthRejected(_) | AdapterError::InvalidCredentials(_) => "auth_rejected",
        AdapterError::AuthTimeout(_) => "auth_timeout",
        AdapterError::UpstreamTimeout(_) => "upstream_timeout",
        AdapterError::Transport(_) => "transport",
        AdapterError::ConnectionClosed => "closed",
        AdapterError::Closed { .. } => "shutdown",
    }
}

impl<V: Venue> Shared<V> {
    fn broker_id(&self) -> &str {
        self.venue.broker_id()
    }

    fn set_state(&self, state: AdapterState) {
        let previous = {
            let mut conn = self.connection.write();
            std::mem::replace(&mut conn.state, state)
        };
        if previous != state {
            tracing::debug!(broker = %self.broker_id(), from = %previous, to = %state, "Adapter state change");
            metrics::set_adapter_state(self.broker_id(), state);
        }
    }

    fn emit(&self, health: FeedHealth, reason: Option<String>) {
        let _ = self.status_tx.send(AdapterStatusEvent {
            broker_id: self.broker_id().to_string(),
            exchanges: self.venue.exchanges().to_vec(),
            health,
            reason,
        });
    }

    /// Terminal stop: `Disconnected` plus a feed-down event.
    fn fail(&self, reason: String) {
        self.connection.write().retry_count = 0;
        self.set_state(AdapterState::Disconnected);
        self.emit(FeedHealth::Down, Some(reason));
    }

    /// Fold a command into the desired set; true when it changed.
    fn record_command(&self, command: &Command) -> bool {
        match command {
            Command::Subscribe(topic) => self.desired.write().insert(topic.clone()),
            Command::Unsubscribe(topic) => self.desired.write().remove(topic),
        }
    }

    fn record_malformed(&self, err: &DecodeError) {
        self.counters.malformed.fetch_add(1, Ordering::Relaxed);
        metrics::record_malformed_frame(self.broker_id());
        tracing::debug!(broker = %self.broker_id(), error = %err, "Dropped malformed frame");
    }

    fn record_inbound(&self, liveness: &LivenessState) {
        liveness.record_inbound();
        self.counters.frames.fetch_add(1, Ordering::Relaxed);
        metrics::record_frame_received(self.broker_id());
        self.connection.write().last_heartbeat_at = liveness.last_inbound_at();
    }

    /// Connection loop with backoff. Runs until cancelled or a terminal
    /// failure.
    async fn run(self: Arc<Self>, cancel: CancellationToken) {
        let mut commands = self.commands.lock().await;
        let mut policy = ReconnectPolicy::new(self.settings.reconnect.clone());
        let mut outage = false;

        loop {
            if cancel.is_cancelled() {
                break;
            }

            match self
                .connect_and_stream(&mut commands, &cancel, &mut policy, &mut outage)
                .await
            {
                Ok(()) => break,
                Err(e) if !e.is_retryable() => {
                    metrics::record_upstream_error(self.broker_id(), error_category(&e));
                    tracing::error!(broker = %self.broker_id(), error = %e, "Upstream session refused");
                    self.fail(e.to_string());
                    return;
                }
                Err(e) => {
                    metrics::record_upstream_error(self.broker_id(), error_category(&e));
                    tracing::warn!(broker = %self.broker_id(), error = %e, "Upstream connection lost");

                    let Some(delay) = policy.next_delay() else {
                        let reason = format!(
                            "maximum reconnect attempts ({}) exceeded: {e}",
                            policy.max_attempts()
                        );
                        tracing::error!(broker = %self.broker_id(), %reason, "Giving up on upstream");
                        self.fail(reason);
                        return;
                    };

                    let attempt = policy.attempt_count();
                    self.counters.reconnects.fetch_add(1, Ordering::Relaxed);
                    metrics::record_reconnect(self.broker_id());
                    self.connection.write().retry_count = attempt;
                    self.set_state(AdapterState::Reconnecting);
                    if !outage {
                        outage = true;
                        self.emit(FeedHealth::Reconnecting, Some(e.to_string()));
                    }

                    tracing::info!(
                        broker = %self.broker_id(),
                        attempt,
                        delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
                        "Reconnecting to venue"
                    );

                    tokio::select! {
                        () = cancel.cancelled() => break,
                        () = tokio::time::sleep(delay) => {}
                    }
                }
            }
        }

        self.set_state(AdapterState::Disconnected);
        tracing::info!(broker = %self.broker_id(), "Adapter stopped");
    }

    /// One connection from handshake to failure. `Ok(())` means cancelled.
    async fn connect_and_stream(
        &self,
        commands: &mut mpsc::UnboundedReceiver<Command>,
        cancel: &CancellationToken,
        policy: &mut ReconnectPolicy,
        outage: &mut bool,
    ) -> Result<(), AdapterError> {
        let retrying = policy.attempt_count() > 0;
        if !retrying {
            self.set_state(AdapterState::Connecting);
        }
        tracing::info!(broker = %self.broker_id(), url = %self.venue.url(), "Connecting to venue");

        let handshake = tokio::time::timeout(
            self.settings.connect_timeout,
            tokio_tungstenite::connect_async(self.venue.url()),
        );
        let (ws, _response) = tokio::select! {
            () = cancel.cancelled() => return Ok(()),
            result = handshake => result
                .map_err(|_| AdapterError::Transport("connect timed out".to_string()))?
                .map_err(transport)?,
        };
        let (mut write, mut read) = ws.split();

        let mut session = self.venue.open_session();
        let liveness = Arc::new(LivenessState::new());

        if !retrying {
            self.set_state(AdapterState::Authenticating);
        }
        for frame in session.login()? {
            write.send(frame).await.map_err(transport)?;
        }
        if !self
            .await_login(&mut session, &mut write, &mut read, cancel, &liveness)
            .await?
        {
            return Ok(());
        }

        policy.reset();
        let resumed = std::mem::take(outage);
        while let Ok(command) = commands.try_recv() {
            self.record_command(&command);
        }
        {
            let mut conn = self.connection.write();
            conn.retry_count = 0;
            conn.last_heartbeat_at = liveness.last_inbound_at();
        }
        self.set_state(AdapterState::Streaming);
        self.emit(FeedHealth::Up, None);

        let topics: Vec<Topic> = self.desired.read().iter().cloned().collect();
        tracing::info!(broker = %self.broker_id(), resumed, topics = topics.len(), "Streaming");
        for topic in &topics {
            for frame in session.subscribe(topic) {
                write.send(frame).await.map_err(transport)?;
            }
        }

        self.stream(&mut session, &mut write, &mut read, commands, cancel, &liveness)
            .await
    }

    /// Wait for the login verdict. `Ok(false)` means cancelled.
    async fn await_login(
        &self,
        session: &mut V::Session,
        write: &mut WsWrite,
        read: &mut WsRead,
        cancel: &CancellationToken,
        liveness: &LivenessState,
    ) -> Result<bool, AdapterError> {
        let deadline = tokio::time::sleep(self.settings.auth_timeout);
        tokio::pin!(deadline);

        loop {
            tokio::select! {
                () = cancel.cancelled() => return Ok(false),
                () = &mut deadline => return Err(AdapterError::AuthTimeout(self.settings.auth_timeout)),
                msg = read.next() => match msg {
                    Some(Ok(frame @ (Message::Text(_) | Message::Binary(_)))) => {
                        self.record_inbound(liveness);
                        match session.decode(&frame) {
                            Ok(events) => {
                                for event in events {
                                    match event {
                                        VenueEvent::Authenticated => {
                                            tracing::info!(broker = %self.broker_id(), "Venue accepted credentials");
                                            return Ok(true);
                                        }
                                        VenueEvent::AuthRejected(reason) => {
                                            return Err(AdapterError::AuthRejected(reason));
                                        }
                                        VenueEvent::Malformed(e) => self.record_malformed(&e),
                                        VenueEvent::Tick(_) | VenueEvent::Control => {}
                                    }
                                }
                            }
                            Err(e) => self.record_malformed(&e),
                        }
                    }
                    Some(Ok(Message::Ping(data))) => {
                        write.send(Message::Pong(data)).await.map_err(transport)?;
                    }
                    Some(Ok(Message::Close(_))) | None => return Err(AdapterError::ConnectionClosed),
                    Some(Ok(_)) => {}
                    Some(Err(e)) => return Err(transport(e)),
                },
            }
        }
    }

    /// Steady state: apply commands, send heartbeats, publish ticks.
    async fn stream(
        &self,
        session: &mut V::Session,
        write: &mut WsWrite,
        read: &mut WsRead,
        commands: &mut mpsc::UnboundedReceiver<Command>,
        cancel: &CancellationToken,
        liveness: &Arc<LivenessState>,
    ) -> Result<(), AdapterError> {
        let heartbeat_cancel = cancel.child_token();
        let _heartbeat_guard = heartbeat_cancel.clone().drop_guard();
        let (heartbeat_tx, mut heartbeat_rx) = mpsc::channel(4);
        tokio::spawn(
            HeartbeatMonitor::new(
                self.settings.heartbeat,
                Arc::clone(liveness),
                heartbeat_tx,
                heartbeat_cancel,
            )
            .run(),
        );

        loop {
            tokio::select! {
                () = cancel.cancelled() => {
                    let _ = write.send(Message::Close(None)).await;
                    return Ok(());
                }
                command = commands.recv() => {
                    let Some(command) = command else {
                        // Every adapter handle is gone.
                        return Ok(());
                    };
                    if self.record_command(&command) {
                        let frames = match &command {
                            Command::Subscribe(topic) => session.subscribe(topic),
                            Command::Unsubscribe(topic) => session.unsubscribe(topic),
                        };
                        tracing::debug!(broker = %self.broker_id(), ?command, frames = frames.len(), "Applying subscription change");
                        for frame in frames {
                            write.send(frame).await.map_err(transport)?;
                        }
                    }
                }
                event = heartbeat_rx.recv() => match event {
                    Some(HeartbeatEvent::SendHeartbeat) => {
                        let frame = session.heartbeat();
                        write.send(frame).await.map_err(transport)?;
                    }
                    Some(HeartbeatEvent::Timeout(silence)) => {
                        return Err(AdapterError::UpstreamTimeout(silence));
                    }
                    None => return Err(AdapterError::Transport("heartbeat monitor stopped".to_string())),
                },
                msg = read.next() => match msg {
                    Some(Ok(frame @ (Message::Text(_) | Message::Binary(_)))) => {
                        self.record_inbound(liveness);
                        self.handle_frame(session, &frame)?;
                    }
                    Some(Ok(Message::Ping(data))) => {
                        self.record_inbound(liveness);
                        write.send(Message::Pong(data)).await.map_err(transport)?;
                    }
                    Some(Ok(Message::Pong(_))) => self.record_inbound(liveness),
                    Some(Ok(Message::Close(_))) | None => return Err(AdapterError::ConnectionClosed),
                    Some(Ok(Message::Frame(_))) => {}
                    Some(Err(e)) => return Err(transport(e)),
                },
            }
        }
    }

    fn handle_frame(&self, session: &mut V::Session, frame: &Message) -> Result<(), AdapterError> {
        let events = match session.decode(frame) {
            Ok(events) => events,
            Err(e) => {
                self.record_malformed(&e);
                return Ok(());
            }
        };

        for event in events {
            match event {
                VenueEvent::Tick(tick) => {
                    self.counters.ticks.fetch_add(1, Ordering::Relaxed);
                    metrics::record_tick_published(self.broker_id());
                    self.bus.publish(Arc::new(tick));
                }
                VenueEvent::Malformed(e) => self.record_malformed(&e),
                VenueEvent::AuthRejected(reason) => return Err(AdapterError::AuthRejected(reason)),
                VenueEvent::Authenticated | VenueEvent::Control => {}
            }
        }
        Ok(())
    }
}

// =============================================================================
// Streaming Adapter
// =============================================================================

struct Worker {
    cancel: CancellationToken,
    handle: JoinHandle<()>,
}

/// [`BrokerAdapter`] implementation for any [`Venue`].
pub struct StreamingAdapter<V: Venue> {
    shared: Arc<Shared<V>>,
    commands: mpsc::UnboundedSender<Command>,
    worker: Mutex<Option<Worker>>,
    shutdown: CancellationToken,
}

impl<V: Venue> std::fmt::Debug for StreamingAdapter<V> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StreamingAdapter")
            .field("broker_id", &self.shared.broker_id())
            .field("connection", &*self.shared.connection.read())
            .finish_non_exhaustive()
    }
}

impl<V: Venue> StreamingAdapter<V> {
    /// Create an adapter. Nothing connects until [`BrokerAdapter::connect`].
    ///
    /// Ticks go to `bus`, health events to `status_tx`. Cancelling
    /// `shutdown` stops the connection task for good.
    #[must_use]
    pub fn new(
        venue: V,
        settings: AdapterSettings,
        bus: SharedMessageBus,
        status_tx: StatusSender,
        shutdown: CancellationToken,
    ) -> Self {
        let (commands, command_rx) = mpsc::unbounded_channel();
        let connection = AdapterConnection::new(venue.broker_id());
        Self {
            shared: Arc::new(Shared {
                venue,
                settings,
                bus,
                status_tx,
                connection: RwLock::new(connection),
                desired: RwLock::new(BTreeSet::new()),
                commands: tokio::sync::Mutex::new(command_rx),
                counters: Counters::default(),
            }),
            commands,
            worker: Mutex::new(None),
            shutdown,
        }
    }

    /// Topics the adapter keeps subscribed while streaming.
    #[must_use]
    pub fn desired_topics(&self) -> Vec<Topic> {
        self.shared.desired.read().iter().cloned().collect()
    }

    fn enqueue(&self, command: Command) -> Result<(), AdapterError> {
        self.commands.send(command).map_err(|_| AdapterError::Closed {
            broker_id: self.shared.broker_id().to_string(),
        })
    }
}

#[async_trait]
impl<V: Venue> BrokerAdapter for StreamingAdapter<V> {
    fn broker_id(&self) -> &str {
        self.shared.broker_id()
    }

    fn exchanges(&self) -> &[String] {
        self.shared.venue.exchanges()
    }

    fn connection(&self) -> AdapterConnection {
        self.shared.connection.read().clone()
    }

    async fn connect(&self) -> Result<(), AdapterError> {
        if self.shutdown.is_cancelled() {
            return Err(AdapterError::Closed {
                broker_id: self.broker_id().to_string(),
            });
        }

        let mut worker = self.worker.lock();
        if worker.as_ref().is_some_and(|w| !w.handle.is_finished()) {
            return Ok(());
        }

        let cancel = self.shutdown.child_token();
        let handle = tokio::spawn(Arc::clone(&self.shared).run(cancel.clone()));
        *worker = Some(Worker { cancel, handle });
        drop(worker);

        tracing::info!(broker = %self.broker_id(), "Adapter started");
        Ok(())
    }

    fn subscribe(&self, topic: &Topic) -> Result<(), AdapterError> {
        self.enqueue(Command::Subscribe(topic.clone()))
    }

    fn unsubscribe(&self, topic: &Topic) -> Result<(), AdapterError> {
        self.enqueue(Command::Unsubscribe(topic.clone()))
    }

    async fn disconnect(&self) {
        let worker = self.worker.lock().take();
        if let Some(worker) = worker {
            worker.cancel.cancel();
            if let Err(e) = worker.handle.await {
                tracing::warn!(broker = %self.broker_id(), error = %e, "Adapter task ended abnormally");
            }
        }
        self.shared.set_state(AdapterState::Disconnected);
    }

    fn stats(&self) -> AdapterStats {
        let counters = &self.shared.counters;
        AdapterStats {
            frames_received: counters.frames.load(Ordering::Relaxed),
            ticks_published: counters.ticks.load(Ordering::Relaxed),
            malformed_frames: counters.malformed.load(Ordering::Relaxed),
            reconnect_attempts: counters.reconnects.load(Ordering::Relaxed),
            desired_topics: self.shared.desired.read().len(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::tick::{CanonicalTick, Mode};
    use crate::infrastructure::bus::{BusFilter, MessageBus};
    use chrono::Utc;
    use rust_decimal::Decimal;
    use tokio::net::TcpListener;

    /// Line protocol: login `LOGIN`, reply `OK`/`NO`; `SUB <topic>` /
    /// `UNSUB <topic>`; data frames are `<topic> <ltp>`.
    struct LineVenue {
        url: String,
        exchanges: Vec<String>,
    }

    struct LineSession;

    impl Venue for LineVenue {
        type Session = LineSession;

        fn broker_id(&self) -> &str {
            "line"
        }

        fn url(&self) -> &str {
            &self.url
        }

        fn exchanges(&self) -> &[String] {
            &self.exchanges
        }

        fn open_session(&self) -> LineSession {
            LineSession
        }
    }

    impl VenueSession for LineSession {
        fn login(&mut self) -> Result<Vec<Message>, AdapterError> {
            Ok(vec![Message::Text("LOGIN".into())])
        }

        fn subscribe(&mut self, topic: &Topic) -> Vec<Message> {
            vec![Message::Text(format!("SUB {topic}").into())]
        }

        fn unsubscribe(&mut self, topic: &Topic) -> Vec<Message> {
            vec![Message::Text(format!("UNSUB {topic}").into())]
        }

        fn decode(&mut self, frame: &Message) -> Result<Vec<VenueEvent>, DecodeError> {
            let Message::Text(text) = frame else {
                return Err(DecodeError::UnsupportedFrame);
            };
            match text.as_str() {
                "OK" => Ok(vec![VenueEvent::Authenticated]),
                "NO" => Ok(vec![VenueEvent::AuthRejected("bad token".to_string())]),
                other => {
                    let (key, ltp) = other
                        .split_once(' ')
                        .ok_or_else(|| DecodeError::UnknownMessage(other.to_string()))?;
                    let topic = Topic::parse(key)?;
                    let ltp: Decimal = ltp
                        .parse()
                        .map_err(|_| DecodeError::UnknownMessage(other.to_string()))?;
                    let tick = CanonicalTick::builder(topic.exchange(), topic.symbol(), topic.mode())
                        .timestamp(Utc::now())
                        .last_traded_price(ltp)
                        .build()?;
                    Ok(vec![VenueEvent::Tick(tick)])
                }
            }
        }
    }

    fn fast_settings(max_attempts: u32) -> AdapterSettings {
        AdapterSettings {
            heartbeat: HeartbeatConfig {
                interval: Duration::from_millis(50),
                timeout: Duration::from_secs(5),
            },
            reconnect: ReconnectConfig {
                initial_delay: Duration::from_millis(10),
                max_delay: Duration::from_millis(20),
                multiplier: 2.0,
                jitter_factor: 0.0,
                max_attempts,
            },
            auth_timeout: Duration::from_secs(2),
            connect_timeout: Duration::from_secs(2),
        }
    }

    fn adapter(
        url: String,
        max_attempts: u32,
    ) -> (
        StreamingAdapter<LineVenue>,
        Arc<MessageBus>,
        mpsc::UnboundedReceiver<AdapterStatusEvent>,
    ) {
        let bus = Arc::new(MessageBus::new(64));
        let (status_tx, status_rx) = mpsc::unbounded_channel();
        let venue = LineVenue {
            url,
            exchanges: vec!["NSE".to_string()],
        };
        let adapter = StreamingAdapter::new(
            venue,
            fast_settings(max_attempts),
            Arc::clone(&bus),
            status_tx,
            CancellationToken::new(),
        );
        (adapter, bus, status_rx)
    }

    async fn next_status(rx: &mut mpsc::UnboundedReceiver<AdapterStatusEvent>) -> AdapterStatusEvent {
        tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .unwrap()
            .unwrap()
    }

    /// Accepts one connection, answers login with `reply`, then forwards
    /// every client frame to `seen` and sends `data` frames.
    async fn line_server(
        reply: &'static str,
        data: Vec<String>,
    ) -> (String, mpsc::UnboundedReceiver<String>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let url = format!("ws://{}", listener.local_addr().unwrap());
        let (seen_tx, seen_rx) = mpsc::unbounded_channel();

        tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let mut ws = tokio_tungstenite::accept_async(stream).await.unwrap();
            while let Some(Ok(msg)) = ws.next().await {
                let Message::Text(text) = msg else { continue };
                let text = text.to_string();
                let _ = seen_tx.send(text.clone());
                if text == "LOGIN" {
                    ws.send(Message::Text(reply.into())).await.unwrap();
                } else if text.starts_with("SUB ") {
                    for frame in &data {
                        ws.send(Message::Text(frame.clone().into())).await.unwrap();
                    }
                }
            }
        });

        (url, seen_rx)
    }

    #[tokio::test]
    async fn queued_subscription_replays_on_streaming() {
        let infy = Topic::new("NSE", "INFY", Mode::Ltp).unwrap();
        let (url, mut seen) = line_server("OK", vec!["NSE:INFY:LTP 1500.25".to_string()]).await;
        let (adapter, bus, mut status) = adapter(url, 3);
        let mut rx = bus.subscribe(&BusFilter::Topic(infy.clone()));

        adapter.subscribe(&infy).unwrap();
        adapter.subscribe(&infy).unwrap();
        assert_eq!(adapter.state(), AdapterState::Disconnected);

        adapter.connect().await.unwrap();
        assert_eq!(next_status(&mut status).await.health, FeedHealth::Up);

        let envelope = tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(envelope.tick.last_traded_price(), Decimal::new(150_025, 2));
        assert_eq!(adapter.state(), AdapterState::Streaming);
        assert_eq!(adapter.desired_topics(), vec![infy]);

        assert_eq!(seen.recv().await.unwrap(), "LOGIN");
        assert_eq!(seen.recv().await.unwrap(), "SUB NSE:INFY:LTP");

        adapter.disconnect().await;
        assert_eq!(adapter.state(), AdapterState::Disconnected);
    }

    #[tokio::test]
    async fn malformed_frames_are_counted_not_fatal() {
        let infy = Topic::new("NSE", "INFY", Mode::Ltp).unwrap();
        let mut data: Vec<String> = (0..5).map(|i| format!("garbage-{i}")).collect();
        data.push("NSE:INFY:LTP 1".to_string());
        let (url, _seen) = line_server("OK", data).await;
        let (adapter, bus, mut status) = adapter(url, 3);
        let mut rx = bus.subscribe(&BusFilter::Topic(infy.clone()));

        adapter.subscribe(&infy).unwrap();
        adapter.connect().await.unwrap();
        assert_eq!(next_status(&mut status).await.health, FeedHealth::Up);

        tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .unwrap()
            .unwrap();
        let stats = adapter.stats();
        assert_eq!(stats.malformed_frames, 5);
        assert_eq!(stats.ticks_published, 1);
        assert_eq!(adapter.state(), AdapterState::Streaming);

        adapter.disconnect().await;
    }

    #[tokio::test]
    async fn auth_rejection_is_terminal() {
        let (url, _seen) = line_server("NO", vec![]).await;
        let (adapter, _bus, mut status) = adapter(url, 3);

        adapter.connect().await.unwrap();

        let event = next_status(&mut status).await;
        assert_eq!(event.health, FeedHealth::Down);
        assert!(event.reason.unwrap().contains("bad token"));
        assert_eq!(adapter.state(), AdapterState::Disconnected);
        assert_eq!(adapter.stats().reconnect_attempts, 0);
    }

    #[tokio::test]
    async fn retry_cap_reports_feed_down() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let url = format!("ws://{}", listener.local_addr().unwrap());
        drop(listener);

        let (adapter, _bus, mut status) = adapter(url, 2);
        adapter.connect().await.unwrap();

        assert_eq!(next_status(&mut status).await.health, FeedHealth::Reconnecting);
        let down = next_status(&mut status).await;
        assert_eq!(down.health, FeedHealth::Down);
        assert!(down.reason.unwrap().contains("maximum reconnect attempts (2)"));
        assert_eq!(adapter.stats().reconnect_attempts, 2);
        assert_eq!(adapter.state(), AdapterState::Disconnected);
    }
}
