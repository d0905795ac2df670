//! Client Wire Protocol
//!
//! JSON text frames exchanged with downstream clients.
//!
//! Inbound control messages carry an `action`:
//!
//! ```json
//! {"action": "subscribe", "exchange": "NSE", "symbol": "INFY", "mode": "LTP"}
//! {"action": "unsubscribe", "exchange": "NSE", "symbol": "INFY", "mode": "LTP"}
//! {"action": "unsubscribe_all"}
//! {"action": "subscriptions"}
//! {"action": "snapshot", "exchange": "NSE", "symbol": "INFY", "mode": "Quote"}
//! {"action": "ping"}
//! ```
//!
//! Outbound frames carry a `type`: `tick`, `status`, `ack`,
//! `subscriptions`, `snapshot`, `pong` or `error`.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use tokio_tungstenite::tungstenite::Message;

use crate::domain::feed::FeedStatusEvent;
use crate::domain::tick::{CanonicalTick, Mode, TickError, Topic};

// =============================================================================
// Inbound
// =============================================================================

/// Why a control message was rejected. The connection stays open.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ControlError {
    /// Not a JSON object.
    #[error("invalid JSON: {0}")]
    InvalidJson(String),

    /// Binary frames are not part of the protocol.
    #[error("binary frames are not supported")]
    BinaryFrame,

    /// No `action` field.
    #[error("missing field: {0}")]
    MissingField(&'static str),

    /// `action` not recognized.
    #[error("unknown action: {0}")]
    UnknownAction(String),

    /// Exchange, symbol or mode failed validation.
    #[error(transparent)]
    InvalidTopic(#[from] TickError),

    /// No broker serves the exchange.
    #[error("no broker serves exchange {0}")]
    NoAdapter(String),

    /// The owning adapter refused the request.
    #[error("{0}")]
    Upstream(String),
}

impl ControlError {
    /// Stable code for the error frame.
    #[must_use]
    pub const fn code(&self) -> &'static str {
        match self {
            Self::InvalidJson(_) => "invalid_json",
            Self::BinaryFrame => "unsupported_frame",
            Self::MissingField(_) => "missing_field",
            Self::UnknownAction(_) => "unknown_action",
            Self::InvalidTopic(_) => "invalid_topic",
            Self::NoAdapter(_) => "no_adapter",
            Self::Upstream(_) => "upstream_unavailable",
        }
    }
}

#[derive(Debug, Deserialize)]
struct RawControl {
    action: Option<String>,
    exchange: Option<String>,
    symbol: Option<String>,
    mode: Option<Value>,
}

impl RawControl {
    fn topic(&self) -> Result<Topic, ControlError> {
        let exchange = self
            .exchange
            .as_deref()
            .ok_or(ControlError::MissingField("exchange"))?;
        let symbol = self
            .symbol
            .as_deref()
            .ok_or(ControlError::MissingField("symbol"))?;
        let mode: Mode = match self.mode.as_ref().ok_or(ControlError::MissingField("mode"))? {
            Value::String(s) => s.parse()?,
            Value::Number(n) => n.to_string().parse()?,
            other => return Err(TickError::InvalidMode(other.to_string()).into()),
        };
        Ok(Topic::new(exchange, symbol, mode)?)
    }
}

/// A validated client request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ControlRequest {
    /// Start receiving a topic.
    Subscribe(Topic),
    /// Stop receiving a topic.
    Unsubscribe(Topic),
    /// Drop every topic this client holds.
    UnsubscribeAll,
    /// List this client's topics.
    Subscriptions,
    /// Last cached tick of a topic.
    Snapshot(Topic),
    /// Liveness probe.
    Ping,
}

impl ControlRequest {
    /// Parse a text frame.
    ///
    /// # Errors
    ///
    /// Returns a [`ControlError`] describing the first problem found.
    pub fn parse(text: &str) -> Result<Self, ControlError> {
        let raw: RawControl =
            serde_json::from_str(text).map_err(|e| ControlError::InvalidJson(e.to_string()))?;
        let action = raw
            .action
            .as_deref()
            .ok_or(ControlError::MissingField("action"))?
            .trim()
            .to_ascii_lowercase();

        match action.as_str() {
            "subscribe" => Ok(Self::Subscribe(raw.topic()?)),
            "unsubscribe" => Ok(Self::Unsubscribe(raw.topic()?)),
            "unsubscribe_all" => Ok(Self::UnsubscribeAll),
            "subscriptions" => Ok(Self::Subscriptions),
            "snapshot" => Ok(Self::Snapshot(raw.topic()?)),
            "ping" => Ok(Self::Ping),
            _ => Err(ControlError::UnknownAction(action)),
        }
    }

    /// Wire name of the action.
    #[must_use]
    pub const fn action(&self) -> &'static str {
        match self {
            Self::Subscribe(_) => "subscribe",
            Self::Unsubscribe(_) => "unsubscribe",
            Self::UnsubscribeAll => "unsubscribe_all",
            Self::Subscriptions => "subscriptions",
            Self::Snapshot(_) => "snapshot",
            Self::Ping => "ping",
        }
    }
}

// =============================================================================
// Outbound
// =============================================================================

/// Frames sent to a client.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum OutboundFrame {
    /// Market data.
    Tick {
        /// Routing key.
        topic: Topic,
        /// Normalized tick.
        data: Arc<CanonicalTick>,
    },
    /// Feed health change for an exchange the client holds.
    Status(FeedStatusEvent),
    /// Control request accepted.
    Ack {
        /// Action acknowledged.
        action: &'static str,
        /// Topic, for topic-scoped actions.
        #[serde(skip_serializing_if = "Option::is_none")]
        topic: Option<Topic>,
        /// Topics affected, for `unsubscribe_all`.
        #[serde(skip_serializing_if = "Option::is_none")]
        count: Option<usize>,
    },
    /// Reply to `subscriptions`.
    Subscriptions {
        /// Topics held, sorted.
        topics: Vec<Topic>,
    },
    /// Reply to `snapshot`.
    Snapshot {
        /// Requested topic.
        topic: Topic,
        /// Last tick, or null if none is cached.
        data: Option<Arc<CanonicalTick>>,
    },
    /// Reply to `ping`.
    Pong,
    /// Control request rejected.
    Error {
        /// Stable error code.
        code: &'static str,
        /// Human-readable detail.
        message: String,
    },
}

impl OutboundFrame {
    /// Ack for a topic-scoped action.
    #[must_use]
    pub const fn ack(action: &'static str, topic: Topic) -> Self {
        Self::Ack {
            action,
            topic: Some(topic),
            count: None,
        }
    }

    /// Error frame for a rejected request.
    #[must_use]
    pub fn error(err: &ControlError) -> Self {
        Self::Error {
            code: err.code(),
            message: err.to_string(),
        }
    }

    /// Encode as a WebSocket text frame.
    ///
    /// # Errors
    ///
    /// Returns an error if serialization fails.
    pub fn to_message(&self) -> Result<Message, serde_json::Error> {
        Ok(Message::Text(serde_json::to_string(self)?.into()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::feed::FeedHealth;
    use chrono::{TimeZone, Utc};
    use rust_decimal::Decimal;
    use serde_json::json;
    use test_case::test_case;

    fn topic(key: &str) -> Topic {
        Topic::parse(key).unwrap()
    }

    #[test_case(r#"{"action":"subscribe","exchange":"NSE","symbol":"INFY","mode":"LTP"}"#,
        ControlRequest::Subscribe(topic("NSE:INFY:LTP")) ; "subscribe")]
    #[test_case(r#"{"action":"Unsubscribe","exchange":"nse","symbol":"INFY","mode":"quote"}"#,
        ControlRequest::Unsubscribe(topic("NSE:INFY:QUOTE")) ; "unsubscribe mixed case")]
    #[test_case(r#"{"action":"snapshot","exchange":"NFO","symbol":"NIFTY24DECFUT","mode":3}"#,
        ControlRequest::Snapshot(topic("NFO:NIFTY24DECFUT:DEPTH")) ; "snapshot numeric mode")]
    #[test_case(r#"{"action":"unsubscribe_all"}"#, ControlRequest::UnsubscribeAll ; "unsubscribe all")]
    #[test_case(r#"{"action":"subscriptions"}"#, ControlRequest::Subscriptions ; "subscriptions")]
    #[test_case(r#"{"action":"ping"}"#, ControlRequest::Ping ; "ping")]
    fn parses_actions(text: &str, expected: ControlRequest) {
        assert_eq!(ControlRequest::parse(text).unwrap(), expected);
    }

    #[test_case("{not json", "invalid_json" ; "bad json")]
    #[test_case(r#"{"exchange":"NSE"}"#, "missing_field" ; "no action")]
    #[test_case(r#"{"action":"subscribe","exchange":"NSE","mode":"LTP"}"#, "missing_field" ; "no symbol")]
    #[test_case(r#"{"action":"subscribe","exchange":"NSE","symbol":"INFY","mode":"FULL"}"#, "invalid_topic" ; "bad mode")]
    #[test_case(r#"{"action":"subscribe","exchange":"","symbol":"INFY","mode":"LTP"}"#, "invalid_topic" ; "empty exchange")]
    #[test_case(r#"{"action":"explode"}"#, "unknown_action" ; "unknown action")]
    fn rejects_bad_requests(text: &str, code: &str) {
        assert_eq!(ControlRequest::parse(text).unwrap_err().code(), code);
    }

    #[test]
    fn tick_frame_shape() {
        let tick = CanonicalTick::builder("NSE", "INFY", Mode::Ltp)
            .timestamp(Utc.timestamp_opt(1_700_000_000, 0).unwrap())
            .last_traded_price(Decimal::new(150_025, 2))
            .build()
            .unwrap();
        let frame = OutboundFrame::Tick {
            topic: tick.topic(),
            data: Arc::new(tick),
        };
        let value: Value = serde_json::to_value(&frame).unwrap();
        assert_eq!(value["type"], "tick");
        assert_eq!(value["topic"], "NSE:INFY:LTP");
        assert_eq!(value["data"]["symbol"], "INFY");
        assert_eq!(value["data"]["last_traded_price"], "1500.25");
    }

    #[test]
    fn status_frame_is_flat() {
        let frame = OutboundFrame::Status(FeedStatusEvent {
            exchange: "NSE".to_string(),
            broker_id: "definedge".to_string(),
            state: FeedHealth::Down,
            reason: None,
        });
        assert_eq!(
            serde_json::to_value(&frame).unwrap(),
            json!({"type": "status", "exchange": "NSE", "broker_id": "definedge", "state": "down"})
        );
    }

    #[test]
    fn control_frames() {
        assert_eq!(
            serde_json::to_value(OutboundFrame::ack("subscribe", topic("NSE:INFY:LTP"))).unwrap(),
            json!({"type": "ack", "action": "subscribe", "topic": "NSE:INFY:LTP"})
        );
        assert_eq!(
            serde_json::to_value(OutboundFrame::Pong).unwrap(),
            json!({"type": "pong"})
        );
        let err = ControlError::UnknownAction("explode".to_string());
        assert_eq!(
            serde_json::to_value(OutboundFrame::error(&err)).unwrap(),
            json!({"type": "error", "code": "unknown_action", "message": "unknown action: explode"})
        );
        assert_eq!(
            serde_json::to_value(OutboundFrame::Snapshot { topic: topic("NSE:TCS:LTP"), data: None }).unwrap(),
            json!({"type": "snapshot", "topic": "NSE:TCS:LTP", "data": null})
        );
    }
}
