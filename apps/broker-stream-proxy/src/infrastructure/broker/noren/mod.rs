//! Noren Streaming Venue
//!
//! The JSON WebSocket protocol shared by DefinEdge, Shoonya and Flattrade.
//! One [`NorenVenue`] per broker; the [`NorenSession`] tracks which
//! canonical topics ride on each upstream `EXCH|token` feed and merges
//! incremental updates into snapshots before normalizing.
//!
//! LTP and Quote topics share the touchline feed of their token; Depth
//! topics use the depth feed. An upstream feed is started for the first
//! topic that needs it and stopped when the last one goes.

pub mod messages;

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use tokio_tungstenite::tungstenite::Message;

pub use messages::{FeedSnapshot, NorenFrame, NorenMessageType, NorenRequest};

use super::credentials::Credentials;
use super::instruments::InstrumentMap;
use super::venue::{DecodeError, Venue, VenueEvent, VenueSession};
use crate::application::ports::AdapterError;
use crate::domain::tick::{CanonicalTick, Mode, TickError, Topic};

/// DefinEdge streaming endpoint.
pub const DEFINEDGE_WS_URL: &str = "wss://trade.definedgesecurities.com/NorenWSTRTP/";
/// Shoonya (Finvasia) streaming endpoint.
pub const SHOONYA_WS_URL: &str = "wss://api.shoonya.com/NorenWSTP/";
/// Flattrade streaming endpoint.
pub const FLATTRADE_WS_URL: &str = "wss://piconnect.flattrade.in/PiConnectWSTp/";

/// A broker speaking the Noren protocol.
#[derive(Debug, Clone)]
pub struct NorenVenue {
    broker_id: String,
    url: String,
    exchanges: Vec<String>,
    credentials: Credentials,
    instruments: Arc<InstrumentMap>,
}

impl NorenVenue {
    /// Describe a Noren endpoint.
    #[must_use]
    pub fn new(
        broker_id: impl Into<String>,
        url: impl Into<String>,
        exchanges: Vec<String>,
        credentials: Credentials,
        instruments: Arc<InstrumentMap>,
    ) -> Self {
        Self {
            broker_id: broker_id.into(),
            url: url.into(),
            exchanges,
            credentials,
            instruments,
        }
    }
}

impl Venue for NorenVenue {
    type Session = NorenSession;

    fn broker_id(&self) -> &str {
        &self.broker_id
    }

    fn url(&self) -> &str {
        &self.url
    }

    fn exchanges(&self) -> &[String] {
        &self.exchanges
    }

    fn open_session(&self) -> NorenSession {
        NorenSession::new(self.credentials.clone(), Arc::clone(&self.instruments))
    }
}

// =============================================================================
// Session
// =============================================================================

/// Topics and snapshots for one `EXCH|token` key.
#[derive(Debug, Default)]
struct KeyFeed {
    topics: BTreeSet<Topic>,
    touchline: FeedSnapshot,
    depth: FeedSnapshot,
}

impl KeyFeed {
    fn needs_touchline(&self) -> bool {
        self.topics.iter().any(|t| t.mode() != Mode::Depth)
    }

    fn needs_depth(&self) -> bool {
        self.topics.iter().any(|t| t.mode() == Mode::Depth)
    }
}

/// Per-connection Noren protocol state.
#[derive(Debug)]
pub struct NorenSession {
    credentials: Credentials,
    instruments: Arc<InstrumentMap>,
    feeds: HashMap<String, KeyFeed>,
}

const fn uses_depth_feed(mode: Mode) -> bool {
    matches!(mode, Mode::Depth)
}

fn encode(request: &NorenRequest<'_>) -> Vec<Message> {
    match request.to_message() {
        Ok(message) => vec![message],
        Err(e) => {
            tracing::error!(error = %e, ?request, "Failed to encode venue request");
            Vec::new()
        }
    }
}

impl NorenSession {
    /// Fresh session with no feeds.
    #[must_use]
    pub fn new(credentials: Credentials, instruments: Arc<InstrumentMap>) -> Self {
        Self {
            credentials,
            instruments,
            feeds: HashMap::new(),
        }
    }

    /// Venue key for a topic.
    #[must_use]
    pub fn key_for(&self, topic: &Topic) -> String {
        self.instruments.resolve(topic.exchange(), topic.symbol()).key()
    }

    /// Keys with at least one topic.
    #[must_use]
    pub fn active_keys(&self) -> Vec<String> {
        let mut keys: Vec<String> = self.feeds.keys().cloned().collect();
        keys.sort();
        keys
    }

    fn login_verdict(frame: &NorenFrame) -> VenueEvent {
        if frame.str_field("s") == Some("OK") {
            return VenueEvent::Authenticated;
        }
        let reason = frame
            .str_field("emsg")
            .or_else(|| frame.str_field("s"))
            .unwrap_or("login rejected")
            .to_string();
        VenueEvent::AuthRejected(reason)
    }

    fn data_events(&mut self, frame: &NorenFrame) -> Result<Vec<VenueEvent>, DecodeError> {
        let key = frame
            .instrument_key()
            .ok_or(TickError::MissingField("tk"))?;
        let Some(feed) = self.feeds.get_mut(&key) else {
            tracing::debug!(%key, "Data for unsubscribed key");
            return Ok(Vec::new());
        };

        let depth_frame = frame.kind.is_depth();
        let snapshot = if depth_frame {
            &mut feed.depth
        } else {
            &mut feed.touchline
        };
        snapshot.merge(&frame.fields);
        let snapshot = &*snapshot;

        let received_at = Utc::now();
        Ok(feed
            .topics
            .iter()
            .filter(|topic| uses_depth_feed(topic.mode()) == depth_frame)
            .map(|topic| match build_tick(topic, snapshot, received_at) {
                Ok(tick) => VenueEvent::Tick(tick),
                Err(e) => VenueEvent::Malformed(DecodeError::Tick(e)),
            })
            .collect())
    }
}

fn build_tick(
    topic: &Topic,
    snapshot: &FeedSnapshot,
    received_at: DateTime<Utc>,
) -> Result<CanonicalTick, TickError> {
    let lp = snapshot
        .decimal("lp")?
        .ok_or(TickError::MissingField("lp"))?;
    let mut builder = CanonicalTick::builder(topic.exchange(), topic.symbol(), topic.mode())
        .last_traded_price(lp)
        .volume(snapshot.integer("v")?);
    builder = match snapshot.feed_time() {
        Some(ft) => builder.timestamp_raw(ft),
        None => builder.timestamp(received_at),
    };
    builder = match topic.mode() {
        Mode::Ltp => builder,
        Mode::Quote => builder.quote(snapshot.quote()?),
        Mode::Depth => builder.quote(snapshot.quote()?).depth(snapshot.depth()?),
    };
    builder.build()
}

impl VenueSession for NorenSession {
    fn login(&mut self) -> Result<Vec<Message>, AdapterError> {
        let request = NorenRequest::Connect {
            uid: self.credentials.user_id(),
            actid: self.credentials.account_id(),
            susertoken: self.credentials.session_token(),
            source: "API",
        };
        let message = request
            .to_message()
            .map_err(|e| AdapterError::InvalidCredentials(e.to_string()))?;
        Ok(vec![message])
    }

    fn heartbeat(&self) -> Message {
        NorenRequest::Heartbeat
            .to_message()
            .unwrap_or_else(|_| Message::Ping(Vec::new().into()))
    }

    fn subscribe(&mut self, topic: &Topic) -> Vec<Message> {
        let key = self.key_for(topic);
        let feed = self.feeds.entry(key.clone()).or_default();
        let (had_touchline, had_depth) = (feed.needs_touchline(), feed.needs_depth());
        if !feed.topics.insert(topic.clone()) {
            return Vec::new();
        }

        if uses_depth_feed(topic.mode()) {
            if had_depth {
                return Vec::new();
            }
            encode(&NorenRequest::Depth { k: &key })
        } else {
            if had_touchline {
                return Vec::new();
            }
            encode(&NorenRequest::Touchline { k: &key })
        }
    }

    fn unsubscribe(&mut self, topic: &Topic) -> Vec<Message> {
        let key = self.key_for(topic);
        let Some(feed) = self.feeds.get_mut(&key) else {
            return Vec::new();
        };
        if !feed.topics.remove(topic) {
            return Vec::new();
        }

        let frames = if uses_depth_feed(topic.mode()) {
            if feed.needs_depth() {
                Vec::new()
            } else {
                feed.depth.clear();
                encode(&NorenRequest::UnsubscribeDepth { k: &key })
            }
        } else if feed.needs_touchline() {
            Vec::new()
        } else {
            feed.touchline.clear();
            encode(&NorenRequest::UnsubscribeTouchline { k: &key })
        };

        if feed.topics.is_empty() {
            self.feeds.remove(&key);
        }
        frames
    }

    fn decode(&mut self, frame: &Message) -> Result<Vec<VenueEvent>, DecodeError> {
        let Message::Text(text) = frame else {
            return Err(DecodeError::UnsupportedFrame);
        };
        let frame = NorenFrame::parse(text.as_str())?;

        match frame.kind {
            NorenMessageType::ConnectAck => Ok(vec![Self::login_verdict(&frame)]),
            NorenMessageType::Heartbeat
            | NorenMessageType::TouchlineUnsubscribed
            | NorenMessageType::DepthUnsubscribed => Ok(vec![VenueEvent::Control]),
            NorenMessageType::TouchlineAck
            | NorenMessageType::TouchlineFeed
            | NorenMessageType::DepthAck
            | NorenMessageType::DepthFeed => self.data_events(&frame),
        }
    }
}
