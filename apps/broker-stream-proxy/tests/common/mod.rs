//! Shared integration test fixtures: a scripted Noren venue and a stack
//! builder wiring adapters, registry, bus and proxy the way `main` does.

#![allow(dead_code, clippy::unwrap_used, clippy::expect_used)]

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use parking_lot::Mutex;
use serde_json::{Value, json};
use tokio::net::{TcpListener, TcpSocket, TcpStream};
use tokio::sync::mpsc;
use tokio::time::timeout;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, accept_async, client_async, connect_async};
use tokio_util::sync::CancellationToken;

use broker_stream_proxy::application::ports::{BrokerAdapter, UpstreamControl};
use broker_stream_proxy::domain::feed::AdapterStatusEvent;
use broker_stream_proxy::infrastructure::broker::heartbeat::HeartbeatConfig;
use broker_stream_proxy::infrastructure::broker::reconnect::ReconnectConfig;
use broker_stream_proxy::infrastructure::broker::{
    AdapterContext, AdapterFactory, AdapterRouter, AdapterSettings, AdapterSpec, Credentials,
    InstrumentMap,
};
use broker_stream_proxy::{FeedMonitor, MessageBus, ProxyServer, SharedMessageBus, SubscriptionRegistry};

pub const WAIT: Duration = Duration::from_secs(5);

// =============================================================================
// Fake venue
// =============================================================================

/// How the fake venue treats one connection.
#[derive(Debug, Clone)]
pub struct ConnectionPlan {
    /// `None` accepts the login; `Some(reason)` rejects it.
    pub reject_login: Option<String>,
    /// Reply to `h` frames. When false the connection goes silent after login.
    pub answer_heartbeats: bool,
}

impl ConnectionPlan {
    pub fn healthy() -> Self {
        Self {
            reject_login: None,
            answer_heartbeats: true,
        }
    }

    pub fn silent() -> Self {
        Self {
            reject_login: None,
            answer_heartbeats: false,
        }
    }

    pub fn rejecting(reason: &str) -> Self {
        Self {
            reject_login: Some(reason.to_string()),
            answer_heartbeats: true,
        }
    }
}

type Planner = Arc<dyn Fn(usize) -> ConnectionPlan + Send + Sync>;

/// A local WebSocket server speaking just enough Noren to drive an adapter.
pub struct FakeVenue {
    pub url: String,
    inbound: mpsc::UnboundedReceiver<(usize, Value)>,
    current: Arc<Mutex<Option<mpsc::UnboundedSender<Message>>>>,
    connections: Arc<AtomicUsize>,
}

impl FakeVenue {
    /// Every connection behaves the same.
    pub async fn start(plan: ConnectionPlan) -> Self {
        Self::scripted(move |_| plan.clone()).await
    }

    /// Connection `n` (0-based) follows `planner(n)`.
    pub async fn scripted(planner: impl Fn(usize) -> ConnectionPlan + Send + Sync + 'static) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let url = format!("ws://{}", listener.local_addr().unwrap());
        let (inbound_tx, inbound) = mpsc::unbounded_channel();
        let current = Arc::new(Mutex::new(None));
        let connections = Arc::new(AtomicUsize::new(0));
        let planner: Planner = Arc::new(planner);

        {
            let current = Arc::clone(&current);
            let connections = Arc::clone(&connections);
            tokio::spawn(async move {
                while let Ok((stream, _)) = listener.accept().await {
                    let index = connections.fetch_add(1, Ordering::SeqCst);
                    let plan = planner(index);
                    let (out_tx, out_rx) = mpsc::unbounded_channel();
                    *current.lock() = Some(out_tx);
                    tokio::spawn(serve_connection(stream, index, plan, inbound_tx.clone(), out_rx));
                }
            });
        }

        Self {
            url,
            inbound,
            current,
            connections,
        }
    }

    /// Connections accepted so far.
    pub fn connections(&self) -> usize {
        self.connections.load(Ordering::SeqCst)
    }

    /// Push a JSON frame down the newest connection.
    pub fn send(&self, value: &Value) {
        self.send_raw(Message::Text(value.to_string().into()));
    }

    pub fn send_raw(&self, message: Message) {
        let current = self.current.lock();
        current
            .as_ref()
            .expect("no venue connection yet")
            .send(message)
            .expect("venue connection closed");
    }

    /// Next frame from the adapter that is not a heartbeat.
    pub async fn next_request(&mut self) -> (usize, Value) {
        timeout(WAIT, async {
            loop {
                let (index, value) = self.inbound.recv().await.expect("venue stopped");
                if value["t"] != "h" {
                    return (index, value);
                }
            }
        })
        .await
        .expect("timed out waiting for a venue request")
    }

    /// Skip frames until one with message type `t` arrives.
    pub async fn expect_request(&mut self, t: &str) -> (usize, Value) {
        timeout(WAIT, async {
            loop {
                let (index, value) = self.inbound.recv().await.expect("venue stopped");
                if value["t"] == t {
                    return (index, value);
                }
            }
        })
        .await
        .unwrap_or_else(|_| panic!("timed out waiting for a {t:?} request"))
    }

    /// True if no non-heartbeat request arrives within `quiet`.
    pub async fn stays_quiet(&mut self, quiet: Duration) -> bool {
        timeout(quiet, async {
            loop {
                match self.inbound.recv().await {
                    Some((_, value)) if value["t"] == "h" => {}
                    Some(_) => return,
                    None => std::future::pending::<()>().await,
                }
            }
        })
        .await
        .is_err()
    }
}

async fn serve_connection(
    stream: TcpStream,
    index: usize,
    plan: ConnectionPlan,
    inbound: mpsc::UnboundedSender<(usize, Value)>,
    mut outbound: mpsc::UnboundedReceiver<Message>,
) {
    let Ok(ws) = accept_async(stream).await else {
        return;
    };
    let (mut sink, mut source) = ws.split();

    loop {
        tokio::select! {
            msg = source.next() => match msg {
                Some(Ok(Message::Text(text))) => {
                    let Ok(value) = serde_json::from_str::<Value>(text.as_str()) else {
                        continue;
                    };
                    let _ = inbound.send((index, value.clone()));
                    let reply = match value["t"].as_str() {
                        Some("c") => Some(match &plan.reject_login {
                            None => json!({"t": "ck", "s": "OK", "uid": value["uid"]}),
                            Some(reason) => json!({"t": "ck", "s": "NOT_OK", "emsg": reason}),
                        }),
                        Some("h") if plan.answer_heartbeats => Some(json!({"t": "h"})),
                        _ => None,
                    };
                    if let Some(reply) = reply
                        && sink.send(Message::Text(reply.to_string().into())).await.is_err()
                    {
                        break;
                    }
                }
                Some(Ok(Message::Close(_))) | None | Some(Err(_)) => break,
                Some(Ok(_)) => {}
            },
            out = outbound.recv() => match out {
                Some(message) => {
                    if sink.send(message).await.is_err() {
                        break;
                    }
                }
                None => break,
            },
        }
    }
}

/// Depth acknowledgement with five levels per side.
pub fn depth_snapshot(exchange: &str, token: &str, lp: &str) -> Value {
    let mut frame = json!({"t": "dk", "e": exchange, "tk": token, "lp": lp, "ft": "1700000000"});
    for level in 1..=5 {
        frame[format!("bp{level}")] = json!(format!("{}.{level}5", 1499 - level));
        frame[format!("bq{level}")] = json!((level * 100).to_string());
        frame[format!("bo{level}")] = json!(level.to_string());
        frame[format!("sp{level}")] = json!(format!("{}.{level}5", 1500 + level));
        frame[format!("sq{level}")] = json!((level * 150).to_string());
        frame[format!("so{level}")] = json!(level.to_string());
    }
    frame
}

/// Touchline acknowledgement carrying a full snapshot.
pub fn touchline(exchange: &str, token: &str, lp: &str) -> Value {
    json!({"t": "tk", "e": exchange, "tk": token, "lp": lp, "v": "1200", "ft": "1700000000"})
}

// =============================================================================
// Stack
// =============================================================================

/// Adapter timing tuned for tests.
pub fn fast_settings(max_attempts: u32) -> AdapterSettings {
    AdapterSettings {
        heartbeat: HeartbeatConfig {
            interval: Duration::from_millis(100),
            timeout: Duration::from_millis(400),
        },
        reconnect: ReconnectConfig {
            initial_delay: Duration::from_millis(50),
            max_delay: Duration::from_millis(200),
            multiplier: 2.0,
            jitter_factor: 0.0,
            max_attempts,
        },
        auth_timeout: Duration::from_secs(2),
        connect_timeout: Duration::from_secs(2),
    }
}

/// Instruments used across the tests.
pub fn instruments() -> InstrumentMap {
    let mut map = InstrumentMap::new();
    map.insert("NSE", "INFY", "NSE", "1594");
    map.insert("NSE", "TCS", "NSE", "11536");
    map
}

/// One Noren adapter pointed at `venue`, plus everything around it.
pub struct Stack {
    pub adapter: Arc<dyn BrokerAdapter>,
    pub router: Arc<AdapterRouter>,
    pub registry: Arc<SubscriptionRegistry>,
    pub bus: SharedMessageBus,
    pub proxy: Option<Arc<ProxyServer>>,
    pub status_rx: Option<mpsc::UnboundedReceiver<AdapterStatusEvent>>,
    pub shutdown: CancellationToken,
}

impl Stack {
    pub fn new(venue_url: &str, settings: AdapterSettings) -> Self {
        let bus = Arc::new(MessageBus::new(256));
        let (status_tx, status_rx) = mpsc::unbounded_channel();
        let shutdown = CancellationToken::new();
        let factory = AdapterFactory::new(AdapterContext {
            bus: Arc::clone(&bus),
            status_tx,
            settings,
            instruments: Arc::new(instruments()),
            shutdown: shutdown.clone(),
        });
        let mut spec = AdapterSpec::new("definedge", Credentials::new("AB1234", "session-token").unwrap());
        spec.url = Some(venue_url.to_string());
        spec.exchanges = vec!["NSE".to_string()];
        let adapter = factory.create_with(spec).unwrap();

        let router = Arc::new(AdapterRouter::new(vec![Arc::clone(&adapter)]));
        let upstream: Arc<dyn UpstreamControl> = Arc::clone(&router) as _;
        let registry = Arc::new(SubscriptionRegistry::new(upstream));

        Self {
            adapter,
            router,
            registry,
            bus,
            proxy: None,
            status_rx: Some(status_rx),
            shutdown,
        }
    }

    /// Next adapter status event.
    pub async fn next_status(&mut self) -> AdapterStatusEvent {
        let rx = self.status_rx.as_mut().expect("status events handed to a monitor");
        timeout(WAIT, rx.recv())
            .await
            .expect("timed out waiting for a status event")
            .expect("status channel closed")
    }

    /// Start the feed monitor and the client-facing proxy; returns its URL.
    pub async fn serve_clients(&mut self) -> String {
        self.serve_clients_with(64).await
    }

    /// Same as [`serve_clients`](Self::serve_clients) with a chosen
    /// per-client queue bound.
    pub async fn serve_clients_with(&mut self, queue_capacity: usize) -> String {
        let monitor = FeedMonitor::new(Arc::clone(&self.registry));
        let status_rx = self.status_rx.take().expect("proxy already started");
        tokio::spawn(monitor.run(status_rx, self.shutdown.clone()));

        let proxy = Arc::new(ProxyServer::new(
            Arc::clone(&self.registry),
            Arc::clone(&self.bus),
            queue_capacity,
            self.shutdown.clone(),
        ));
        let listener = ProxyServer::bind("127.0.0.1:0").await.unwrap();
        let url = format!("ws://{}", listener.local_addr().unwrap());
        self.proxy = Some(Arc::clone(&proxy));
        tokio::spawn(proxy.run(listener));
        url
    }

    pub async fn stop(&self) {
        self.shutdown.cancel();
        self.router.disconnect_all().await;
    }
}

/// Poll `check` until it holds or `WAIT` passes.
pub async fn eventually(mut check: impl FnMut() -> bool) -> bool {
    timeout(WAIT, async {
        while !check() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .is_ok()
}

// =============================================================================
// Proxy client
// =============================================================================

type ClientStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Downstream test client.
pub struct Client {
    ws: ClientStream,
}

impl Client {
    pub async fn connect(url: &str) -> Self {
        let (ws, _) = connect_async(url).await.unwrap();
        Self { ws }
    }

    /// Connect with a tiny socket receive buffer, so a client that stops
    /// reading pushes back on the proxy quickly.
    pub async fn connect_with_recv_buffer(url: &str, bytes: u32) -> Self {
        let addr = url.trim_start_matches("ws://").parse().unwrap();
        let socket = TcpSocket::new_v4().unwrap();
        socket.set_recv_buffer_size(bytes).unwrap();
        let stream = socket.connect(addr).await.unwrap();
        let (ws, _) = client_async(url, MaybeTlsStream::Plain(stream)).await.unwrap();
        Self { ws }
    }

    pub async fn send(&mut self, value: &Value) {
        self.ws
            .send(Message::Text(value.to_string().into()))
            .await
            .unwrap();
    }

    pub async fn send_text(&mut self, raw: &str) {
        self.ws.send(Message::Text(raw.into())).await.unwrap();
    }

    pub async fn send_binary(&mut self, bytes: Vec<u8>) {
        self.ws.send(Message::Binary(bytes.into())).await.unwrap();
    }

    pub async fn subscribe(&mut self, exchange: &str, symbol: &str, mode: &str) -> Value {
        self.send(&json!({"action": "subscribe", "exchange": exchange, "symbol": symbol, "mode": mode}))
            .await;
        self.expect("ack").await
    }

    pub async fn unsubscribe(&mut self, exchange: &str, symbol: &str, mode: &str) -> Value {
        self.send(&json!({"action": "unsubscribe", "exchange": exchange, "symbol": symbol, "mode": mode}))
            .await;
        self.expect("ack").await
    }

    /// Next JSON frame.
    pub async fn next(&mut self) -> Value {
        timeout(WAIT, async {
            loop {
                match self.ws.next().await {
                    Some(Ok(Message::Text(text))) => {
                        return serde_json::from_str::<Value>(text.as_str()).unwrap();
                    }
                    Some(Ok(_)) => {}
                    other => panic!("client stream ended: {other:?}"),
                }
            }
        })
        .await
        .expect("timed out waiting for a proxy frame")
    }

    /// Skip frames until one of `kind` arrives.
    pub async fn expect(&mut self, kind: &str) -> Value {
        loop {
            let frame = self.next().await;
            if frame["type"] == kind {
                return frame;
            }
        }
    }

    pub async fn close(mut self) {
        let _ = self.ws.close(None).await;
    }
}
