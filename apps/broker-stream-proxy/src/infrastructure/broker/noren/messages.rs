//! Noren WebSocket Message Types
//!
//! Wire format of the Noren streaming protocol. Every frame is a JSON
//! object whose `t` field names the message type.
//!
//! # Client → venue
//! - `c`: connect/login
//! - `t` / `u`: touchline subscribe / unsubscribe
//! - `d` / `ud`: depth subscribe / unsubscribe
//! - `h`: heartbeat
//!
//! # Venue → client
//! - `ck`: login verdict (`s == "OK"` accepts)
//! - `tk` / `tf`: touchline acknowledgement / incremental update
//! - `dk` / `df`: depth acknowledgement / incremental update
//! - `uk` / `udk`: unsubscribe acknowledgements
//! - `h`: heartbeat reply
//!
//! Acknowledgements carry a full snapshot; updates carry only the fields
//! that changed. Numeric fields arrive as strings or numbers.

use std::str::FromStr;

use rust_decimal::Decimal;
use rust_decimal::prelude::ToPrimitive;
use serde::Serialize;
use serde_json::{Map, Value};
use tokio_tungstenite::tungstenite::Message;

use crate::domain::tick::{DepthLevel, MarketDepth, QuoteFields, TickError};
use crate::infrastructure::broker::venue::DecodeError;

/// Levels per side in a Noren depth frame.
pub const DEPTH_LEVELS: usize = 5;

// =============================================================================
// Outbound
// =============================================================================

/// Frames sent to the venue.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "t")]
pub enum NorenRequest<'a> {
    /// Login with a session token.
    #[serde(rename = "c")]
    Connect {
        /// User id.
        uid: &'a str,
        /// Account id.
        actid: &'a str,
        /// Session token.
        susertoken: &'a str,
        /// Always `API`.
        source: &'a str,
    },
    /// Start the touchline feed for `k` (`EXCH|token`, `#`-joined).
    #[serde(rename = "t")]
    Touchline {
        /// Instrument key.
        k: &'a str,
    },
    /// Stop the touchline feed.
    #[serde(rename = "u")]
    UnsubscribeTouchline {
        /// Instrument key.
        k: &'a str,
    },
    /// Start the depth feed.
    #[serde(rename = "d")]
    Depth {
        /// Instrument key.
        k: &'a str,
    },
    /// Stop the depth feed.
    #[serde(rename = "ud")]
    UnsubscribeDepth {
        /// Instrument key.
        k: &'a str,
    },
    /// Keepalive.
    #[serde(rename = "h")]
    Heartbeat,
}

impl NorenRequest<'_> {
    /// Encode as a WebSocket text frame.
    ///
    /// # Errors
    ///
    /// Returns an error if serialization fails.
    pub fn to_message(&self) -> Result<Message, serde_json::Error> {
        Ok(Message::Text(serde_json::to_string(self)?.into()))
    }
}

// =============================================================================
// Inbound
// =============================================================================

/// Inbound message type discriminator.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NorenMessageType {
    /// `ck`
    ConnectAck,
    /// `tk`
    TouchlineAck,
    /// `tf`
    TouchlineFeed,
    /// `dk`
    DepthAck,
    /// `df`
    DepthFeed,
    /// `uk`
    TouchlineUnsubscribed,
    /// `udk`
    DepthUnsubscribed,
    /// `h`
    Heartbeat,
}

impl NorenMessageType {
    /// Look up a wire code.
    #[must_use]
    pub fn from_code(code: &str) -> Option<Self> {
        Some(match code {
            "ck" => Self::ConnectAck,
            "tk" => Self::TouchlineAck,
            "tf" => Self::TouchlineFeed,
            "dk" => Self::DepthAck,
            "df" => Self::DepthFeed,
            "uk" => Self::TouchlineUnsubscribed,
            "udk" => Self::DepthUnsubscribed,
            "h" => Self::Heartbeat,
            _ => return None,
        })
    }

    /// True for touchline and depth data frames.
    #[must_use]
    pub const fn carries_data(self) -> bool {
        matches!(
            self,
            Self::TouchlineAck | Self::TouchlineFeed | Self::DepthAck | Self::DepthFeed
        )
    }

    /// True for depth data frames.
    #[must_use]
    pub const fn is_depth(self) -> bool {
        matches!(self, Self::DepthAck | Self::DepthFeed)
    }
}

/// One parsed inbound frame.
#[derive(Debug, Clone, PartialEq)]
pub struct NorenFrame {
    /// Message type.
    pub kind: NorenMessageType,
    /// Every field, including `t`.
    pub fields: Map<String, Value>,
}

impl NorenFrame {
    /// Parse a JSON text frame.
    ///
    /// # Errors
    ///
    /// Fails on invalid JSON, a non-object payload, or a missing/unknown
    /// `t` field.
    pub fn parse(text: &str) -> Result<Self, DecodeError> {
        let value: Value = serde_json::from_str(text)?;
        let Value::Object(fields) = value else {
            return Err(DecodeError::Json("expected a JSON object".to_string()));
        };
        let code = fields
            .get("t")
            .and_then(Value::as_str)
            .ok_or(DecodeError::MissingType)?;
        let kind = NorenMessageType::from_code(code)
            .ok_or_else(|| DecodeError::UnknownMessage(code.to_string()))?;
        Ok(Self { kind, fields })
    }

    /// A string field.
    #[must_use]
    pub fn str_field(&self, name: &str) -> Option<&str> {
        self.fields.get(name).and_then(Value::as_str)
    }

    /// `EXCH|token` key of a data frame.
    #[must_use]
    pub fn instrument_key(&self) -> Option<String> {
        let exchange = self.str_field("e")?;
        let token = field_text(self.fields.get("tk")?)?;
        Some(format!("{exchange}|{token}"))
    }
}

fn field_text(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

// =============================================================================
// Snapshot
// =============================================================================

/// Accumulated state for one instrument key.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FeedSnapshot {
    fields: Map<String, Value>,
}

impl FeedSnapshot {
    /// Overlay an update onto the snapshot.
    pub fn merge(&mut self, update: &Map<String, Value>) {
        for (name, value) in update {
            if name != "t" && !value.is_null() {
                self.fields.insert(name.clone(), value.clone());
            }
        }
    }

    /// Forget everything, e.g. after the feed is unsubscribed.
    pub fn clear(&mut self) {
        self.fields.clear();
    }

    /// Decimal field; `None` when absent or empty.
    ///
    /// # Errors
    ///
    /// Fails when the field holds a non-numeric value.
    pub fn decimal(&self, name: &str) -> Result<Option<Decimal>, TickError> {
        let Some(raw) = self.raw(name) else {
            return Ok(None);
        };
        Decimal::from_str(&raw)
            .or_else(|_| Decimal::from_scientific(&raw))
            .map(|d| Some(d.normalize()))
            .map_err(|_| invalid(name, &raw))
    }

    /// Non-negative integer field; `None` when absent or empty.
    ///
    /// # Errors
    ///
    /// Fails when the field holds anything but a non-negative whole number.
    pub fn integer(&self, name: &str) -> Result<Option<u64>, TickError> {
        let Some(raw) = self.raw(name) else {
            return Ok(None);
        };
        if let Ok(v) = raw.parse::<u64>() {
            return Ok(Some(v));
        }
        Decimal::from_str(&raw)
            .ok()
            .filter(|d| d.fract().is_zero())
            .and_then(|d| d.to_u64())
            .map(Some)
            .ok_or_else(|| invalid(name, &raw))
    }

    /// Feed time (`ft`, epoch seconds) as text.
    #[must_use]
    pub fn feed_time(&self) -> Option<String> {
        self.raw("ft")
    }

    /// Quote block from touchline fields.
    ///
    /// # Errors
    ///
    /// Fails when any present field is not numeric.
    pub fn quote(&self) -> Result<QuoteFields, TickError> {
        Ok(QuoteFields {
            open: self.decimal("o")?,
            high: self.decimal("h")?,
            low: self.decimal("l")?,
            close: self.decimal("c")?,
            average_price: self.decimal("ap")?,
            change_percent: self.decimal("pc")?,
            bid_price: self.decimal("bp1")?,
            bid_quantity: self.integer("bq1")?,
            ask_price: self.decimal("sp1")?,
            ask_quantity: self.integer("sq1")?,
            open_interest: self.integer("oi")?,
        })
    }

    /// Up to five levels per side. A level without a price, or with zero
    /// price and zero quantity, is absent.
    ///
    /// # Errors
    ///
    /// Fails when any present field is not numeric.
    pub fn depth(&self) -> Result<MarketDepth, TickError> {
        Ok(MarketDepth {
            bids: self.side("bp", "bq", "bo")?,
            asks: self.side("sp", "sq", "so")?,
        })
    }

    fn side(&self, price: &str, quantity: &str, orders: &str) -> Result<Vec<DepthLevel>, TickError> {
        let mut levels = Vec::with_capacity(DEPTH_LEVELS);
        for i in 1..=DEPTH_LEVELS {
            let Some(level_price) = self.decimal(&format!("{price}{i}"))? else {
                continue;
            };
            let level_quantity = self.integer(&format!("{quantity}{i}"))?.unwrap_or(0);
            if level_price.is_zero() && level_quantity == 0 {
                continue;
            }
            let level_orders = self
                .integer(&format!("{orders}{i}"))?
                .and_then(|n| u32::try_from(n).ok());
            levels.push(DepthLevel {
                price: level_price,
                quantity: level_quantity,
                orders: level_orders,
            });
        }
        Ok(levels)
    }

    fn raw(&self, name: &str) -> Option<String> {
        self.fields
            .get(name)
            .and_then(field_text)
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
    }
}

fn invalid(field: &str, value: &str) -> TickError {
    TickError::InvalidNumber {
        field: field.to_string(),
        value: value.to_string(),
    }
}
