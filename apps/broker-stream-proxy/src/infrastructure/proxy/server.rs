//! Streaming Proxy Server
//!
//! Accepts downstream WebSocket clients. Each connection runs as its own
//! session:
//!
//! - the **reader** handles control messages, pulls ticks from the bus
//!   receivers of the client's topics and forwards feed status events;
//! - the **writer** sends control frames first and queued ticks after.
//!
//! Ticks pass through a bounded [`SharedQueue`]; control frames use an
//! unbounded channel so acknowledgements are never dropped. When the
//! session ends, for any reason, every topic the client held is released.

use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::time::Duration;

use futures_util::stream::SplitSink;
use futures_util::{SinkExt, StreamExt};
use thiserror::Error;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio_stream::StreamMap;
use tokio_stream::wrappers::BroadcastStream;
use tokio_stream::wrappers::errors::BroadcastStreamRecvError;
use tokio_tungstenite::WebSocketStream;
use tokio_tungstenite::tungstenite::{Error as WsError, Message};
use tokio_util::sync::CancellationToken;

use super::protocol::{ControlError, ControlRequest, OutboundFrame};
use super::queue::SharedQueue;
use crate::application::ports::UpstreamError;
use crate::application::services::{RegistryError, SubscribeOutcome, SubscriptionRegistry};
use crate::domain::subscription::ClientId;
use crate::domain::tick::Topic;
use crate::infrastructure::bus::{BusEnvelope, BusFilter, SharedMessageBus};
use crate::infrastructure::metrics;

type ClientSink = SplitSink<WebSocketStream<TcpStream>, Message>;

/// Pause after a failed accept (e.g. out of file descriptors).
const ACCEPT_BACKOFF: Duration = Duration::from_millis(100);

/// Proxy server failures.
#[derive(Debug, Error)]
pub enum ProxyServerError {
    /// Could not bind the listener.
    #[error("failed to bind {addr}: {source}")]
    Bind {
        /// Requested address.
        addr: String,
        /// Underlying error.
        #[source]
        source: std::io::Error,
    },
}

/// Accepts clients and runs their sessions.
#[derive(Debug)]
pub struct ProxyServer {
    registry: Arc<SubscriptionRegistry>,
    bus: SharedMessageBus,
    queue_capacity: usize,
    clients: AtomicUsize,
    dropped: Arc<AtomicU64>,
    shutdown: CancellationToken,
}

impl ProxyServer {
    /// Create a server. `queue_capacity` bounds each client's tick queue.
    #[must_use]
    pub fn new(
        registry: Arc<SubscriptionRegistry>,
        bus: SharedMessageBus,
        queue_capacity: usize,
        shutdown: CancellationToken,
    ) -> Self {
        Self {
            registry,
            bus,
            queue_capacity: queue_capacity.max(1),
            clients: AtomicUsize::new(0),
            dropped: Arc::new(AtomicU64::new(0)),
            shutdown,
        }
    }

    /// Bind the client listener.
    ///
    /// # Errors
    ///
    /// Returns [`ProxyServerError::Bind`] if the address is unavailable.
    pub async fn bind(addr: &str) -> Result<TcpListener, ProxyServerError> {
        TcpListener::bind(addr)
            .await
            .map_err(|source| ProxyServerError::Bind {
                addr: addr.to_string(),
                source,
            })
    }

    /// Connected clients.
    #[must_use]
    pub fn client_count(&self) -> usize {
        self.clients.load(Ordering::Relaxed)
    }

    /// Ticks evicted from client queues since start, across all sessions.
    #[must_use]
    pub fn dropped_ticks(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    /// Accept clients until shutdown. A failed accept is logged and
    /// retried after a short pause; it never stops the listener.
    pub async fn run(self: Arc<Self>, listener: TcpListener) {
        if let Ok(addr) = listener.local_addr() {
            tracing::info!(%addr, "Streaming proxy listening");
        }
        self.accept_loop(|| listener.accept()).await;
    }

    async fn accept_loop<F, Fut>(self: Arc<Self>, mut accept: F)
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = std::io::Result<(TcpStream, SocketAddr)>>,
    {
        loop {
            tokio::select! {
                () = self.shutdown.cancelled() => break,
                accepted = accept() => match accepted {
                    Ok((stream, peer)) => {
                        let server = Arc::clone(&self);
                        tokio::spawn(async move { server.serve(stream, peer).await });
                    }
                    Err(e) => {
                        tracing::warn!(error = %e, "Failed to accept client");
                        tokio::select! {
                            () = self.shutdown.cancelled() => break,
                            () = tokio::time::sleep(ACCEPT_BACKOFF) => {}
                        }
                    }
                },
            }
        }

        tracing::info!("Streaming proxy stopped accepting clients");
    }

    async fn serve(self: Arc<Self>, stream: TcpStream, peer: SocketAddr) {
        let ws = match tokio_tungstenite::accept_async(stream).await {
            Ok(ws) => ws,
            Err(e) => {
                tracing::debug!(%peer, error = %e, "WebSocket handshake failed");
                return;
            }
        };

        let client = ClientId::new();
        let count = self.clients.fetch_add(1, Ordering::Relaxed) + 1;
        metrics::set_clients(count);
        tracing::info!(%client, %peer, clients = count, "Client connected");

        let (session, control_rx) = Session::new(
            client,
            Arc::clone(&self.registry),
            Arc::clone(&self.bus),
            self.queue_capacity,
            Arc::clone(&self.dropped),
        );
        session.run(ws, control_rx, self.shutdown.child_token()).await;

        let count = self.clients.fetch_sub(1, Ordering::Relaxed) - 1;
        metrics::set_clients(count);
        tracing::info!(%client, %peer, clients = count, "Client disconnected");
    }
}

// =============================================================================
// Session
// =============================================================================

struct Session {
    client: ClientId,
    registry: Arc<SubscriptionRegistry>,
    bus: SharedMessageBus,
    queue: Arc<SharedQueue>,
    dropped: Arc<AtomicU64>,
    control_tx: mpsc::UnboundedSender<OutboundFrame>,
    streams: StreamMap<Topic, BroadcastStream<BusEnvelope>>,
}

impl Session {
    fn new(
        client: ClientId,
        registry: Arc<SubscriptionRegistry>,
        bus: SharedMessageBus,
        queue_capacity: usize,
        dropped: Arc<AtomicU64>,
    ) -> (Self, mpsc::UnboundedReceiver<OutboundFrame>) {
        let (control_tx, control_rx) = mpsc::unbounded_channel();
        let session = Self {
            client,
            registry,
            bus,
            queue: Arc::new(SharedQueue::new(queue_capacity)),
            dropped,
            control_tx,
            streams: StreamMap::new(),
        };
        (session, control_rx)
    }

    async fn run(
        mut self,
        ws: WebSocketStream<TcpStream>,
        control_rx: mpsc::UnboundedReceiver<OutboundFrame>,
        cancel: CancellationToken,
    ) {
        let (sink, mut read) = ws.split();
        let (status_tx, mut status_rx) = mpsc::unbounded_channel();
        self.registry.attach_client(self.client, status_tx);

        let writer_cancel = cancel.child_token();
        let writer = tokio::spawn(write_loop(
            self.client,
            sink,
            control_rx,
            Arc::clone(&self.queue),
            writer_cancel.clone(),
        ));

        loop {
            tokio::select! {
                () = cancel.cancelled() => break,
                () = writer_cancel.cancelled() => break,
                msg = read.next() => match msg {
                    Some(Ok(Message::Text(text))) => self.handle_text(text.as_str()),
                    Some(Ok(Message::Binary(_))) => self.reject(&ControlError::BinaryFrame),
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Ok(_)) => {}
                    Some(Err(e)) => {
                        tracing::debug!(client = %self.client, error = %e, "Client read error");
                        break;
                    }
                },
                Some((topic, item)) = self.streams.next(), if !self.streams.is_empty() => {
                    self.deliver(&topic, item);
                }
                Some(event) = status_rx.recv() => {
                    self.send(OutboundFrame::Status(event));
                }
            }
        }

        self.close();
        writer_cancel.cancel();
        if let Err(e) = writer.await {
            tracing::warn!(client = %self.client, error = %e, "Writer task ended abnormally");
        }
    }

    fn deliver(&self, topic: &Topic, item: Result<BusEnvelope, BroadcastStreamRecvError>) {
        match item {
            Ok(envelope) => {
                if self.queue.push(envelope) {
                    self.dropped.fetch_add(1, Ordering::Relaxed);
                    metrics::record_slow_consumer_drop("client_queue", 1);
                    tracing::trace!(client = %self.client, %topic, "Dropped oldest queued tick");
                }
            }
            Err(BroadcastStreamRecvError::Lagged(skipped)) => {
                self.bus.record_lag(skipped);
                tracing::debug!(client = %self.client, %topic, skipped, "Client lagged behind bus");
            }
        }
    }

    fn send(&self, frame: OutboundFrame) {
        let _ = self.control_tx.send(frame);
    }

    fn reject(&self, err: &ControlError) {
        metrics::record_control_rejection(err.code());
        tracing::debug!(client = %self.client, code = err.code(), error = %err, "Rejected control message");
        self.send(OutboundFrame::error(err));
    }

    fn handle_text(&mut self, text: &str) {
        let request = match ControlRequest::parse(text) {
            Ok(request) => request,
            Err(e) => return self.reject(&e),
        };

        match request {
            ControlRequest::Subscribe(topic) => match self.subscribe(&topic) {
                Ok(()) => self.send(OutboundFrame::ack("subscribe", topic)),
                Err(e) => self.reject(&e),
            },
            ControlRequest::Unsubscribe(topic) => {
                self.unsubscribe(&topic);
                self.send(OutboundFrame::ack("unsubscribe", topic));
            }
            ControlRequest::UnsubscribeAll => {
                let topics = self.registry.client_topics(self.client);
                for topic in &topics {
                    self.unsubscribe(topic);
                }
                self.send(OutboundFrame::Ack {
                    action: "unsubscribe_all",
                    topic: None,
                    count: Some(topics.len()),
                });
            }
            ControlRequest::Subscriptions => self.send(OutboundFrame::Subscriptions {
                topics: self.registry.client_topics(self.client),
            }),
            ControlRequest::Snapshot(topic) => {
                let data = self.bus.last_tick(&topic);
                self.send(OutboundFrame::Snapshot { topic, data });
            }
            ControlRequest::Ping => self.send(OutboundFrame::Pong),
        }
    }

    fn subscribe(&mut self, topic: &Topic) -> Result<(), ControlError> {
        let outcome = self
            .registry
            .subscribe(self.client, topic)
            .map_err(|RegistryError::Upstream(e)| match e {
                UpstreamError::NoAdapter { exchange } => ControlError::NoAdapter(exchange),
                other @ UpstreamError::Unavailable { .. } => ControlError::Upstream(other.to_string()),
            })?;

        if !self.streams.contains_key(topic) {
            let rx = self.bus.subscribe(&BusFilter::Topic(topic.clone()));
            self.streams.insert(topic.clone(), BroadcastStream::new(rx));
        }
        if let SubscribeOutcome::Subscribed { refcount, upstream } = outcome {
            tracing::debug!(client = %self.client, %topic, refcount, upstream, "Subscribed");
        }
        Ok(())
    }

    fn unsubscribe(&mut self, topic: &Topic) {
        let outcome = self.registry.unsubscribe(self.client, topic);
        tracing::debug!(client = %self.client, %topic, ?outcome, "Unsubscribed");
        if self.streams.remove(topic).is_some() {
            self.bus.release(&BusFilter::Topic(topic.clone()));
        }
        self.queue.purge_topic(topic);
    }

    fn close(&mut self) {
        let released = self.registry.release_client(self.client);
        let topics: Vec<Topic> = self.streams.keys().cloned().collect();
        for topic in &topics {
            self.streams.remove(topic);
            self.bus.release(&BusFilter::Topic(topic.clone()));
        }
        tracing::debug!(client = %self.client, released, "Session closed");
    }
}

async fn write_loop(
    client: ClientId,
    mut sink: ClientSink,
    mut control_rx: mpsc::UnboundedReceiver<OutboundFrame>,
    queue: Arc<SharedQueue>,
    cancel: CancellationToken,
) {
    if let Err(e) = pump(&mut sink, &mut control_rx, &queue, &cancel).await {
        tracing::debug!(%client, error = %e, "Client write failed");
    }
    let _ = sink.close().await;
    cancel.cancel();
}

/// Control frames always go out before queued ticks.
async fn pump(
    sink: &mut ClientSink,
    control_rx: &mut mpsc::UnboundedReceiver<OutboundFrame>,
    queue: &SharedQueue,
    cancel: &CancellationToken,
) -> Result<(), WsError> {
    loop {
        while let Ok(frame) = control_rx.try_recv() {
            send_frame(sink, &frame).await?;
        }

        if let Some(envelope) = queue.pop() {
            let frame = OutboundFrame::Tick {
                topic: envelope.topic,
                data: envelope.tick,
            };
            send_frame(sink, &frame).await?;
            continue;
        }

        tokio::select! {
            biased;
            () = cancel.cancelled() => return Ok(()),
            frame = control_rx.recv() => match frame {
                Some(frame) => send_frame(sink, &frame).await?,
                None => return Ok(()),
            },
            () = queue.ready() => {}
        }
    }
}

async fn send_frame(sink: &mut ClientSink, frame: &OutboundFrame) -> Result<(), WsError> {
    match frame.to_message() {
        Ok(message) => sink.send(message).await,
        Err(e) => {
            tracing::error!(error = %e, "Failed to encode outbound frame");
            Ok(())
        }
    }
}
