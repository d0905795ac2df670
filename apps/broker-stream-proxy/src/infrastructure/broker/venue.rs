//! Venue Protocol Seam
//!
//! A [`Venue`] describes one broker's streaming endpoint; a
//! [`VenueSession`] holds the per-connection protocol state (login frames,
//! subscription bookkeeping, incremental snapshots). The generic
//! [`StreamingAdapter`](super::adapter::StreamingAdapter) owns the socket and
//! the state machine and delegates every protocol decision here.

use thiserror::Error;
use tokio_tungstenite::tungstenite::Message;

use crate::application::ports::AdapterError;
use crate::domain::ErrorKind;
use crate::domain::tick::{CanonicalTick, TickError, Topic};

/// Decoded meaning of one inbound frame.
#[derive(Debug, Clone, PartialEq)]
pub enum VenueEvent {
    /// Credentials accepted.
    Authenticated,
    /// Credentials refused, with the venue's reason.
    AuthRejected(String),
    /// A normalized tick.
    Tick(CanonicalTick),
    /// Venue heartbeat or subscription acknowledgement.
    Control,
    /// One topic's tick failed to build; siblings from the same frame
    /// are still delivered.
    Malformed(DecodeError),
}

/// Why an inbound frame could not be decoded.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DecodeError {
    /// Not valid JSON, or not the expected shape.
    #[error("invalid json: {0}")]
    Json(String),

    /// Frame lacked the message type discriminator.
    #[error("frame has no message type")]
    MissingType,

    /// Message type not part of the protocol.
    #[error("unknown message type {0:?}")]
    UnknownMessage(String),

    /// Binary frames on a text protocol, or similar.
    #[error("unsupported frame kind")]
    UnsupportedFrame,

    /// Frame parsed but the tick failed validation.
    #[error(transparent)]
    Tick(#[from] TickError),
}

impl DecodeError {
    /// Taxonomy category.
    #[must_use]
    pub const fn kind(&self) -> ErrorKind {
        ErrorKind::MalformedTick
    }
}

impl From<serde_json::Error> for DecodeError {
    fn from(err: serde_json::Error) -> Self {
        Self::Json(err.to_string())
    }
}

/// Static description of a broker streaming endpoint.
pub trait Venue: Send + Sync + 'static {
    /// Per-connection protocol state.
    type Session: VenueSession;

    /// Broker identifier.
    fn broker_id(&self) -> &str;

    /// WebSocket URL.
    fn url(&self) -> &str;

    /// Canonical exchanges served.
    fn exchanges(&self) -> &[String];

    /// Fresh protocol state for a new connection.
    fn open_session(&self) -> Self::Session;
}

/// Protocol state for one live connection.
pub trait VenueSession: Send + Sync + 'static {
    /// Frames that authenticate the connection.
    ///
    /// # Errors
    ///
    /// Fails when the credentials cannot be encoded.
    fn login(&mut self) -> Result<Vec<Message>, AdapterError>;

    /// Frame sent every heartbeat interval.
    fn heartbeat(&self) -> Message {
        Message::Ping(Vec::new().into())
    }

    /// Frames that start `topic`; empty when the venue is already sending
    /// the underlying feed.
    fn subscribe(&mut self, topic: &Topic) -> Vec<Message>;

    /// Frames that stop `topic`; empty while another topic still needs the
    /// underlying feed.
    fn unsubscribe(&mut self, topic: &Topic) -> Vec<Message>;

    /// Decode one inbound data frame.
    ///
    /// # Errors
    ///
    /// Returns [`DecodeError`] for frames that must be dropped and counted.
    fn decode(&mut self, frame: &Message) -> Result<Vec<VenueEvent>, DecodeError>;
}
