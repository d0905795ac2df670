//! Canonical Tick Model
//!
//! Venue-agnostic market data shapes. Every adapter normalizes its wire
//! format into [`CanonicalTick`], and every consumer reads only this type.
//!
//! # Topics
//!
//! A [`Topic`] is the routing key `EXCHANGE:SYMBOL:MODE` used by both the
//! message bus and the subscription registry:
//!
//! ```rust
//! use broker_stream_proxy::domain::tick::{Mode, Topic};
//!
//! let topic = Topic::parse("nse:INFY:ltp").unwrap();
//! assert_eq!(topic.exchange(), "NSE");
//! assert_eq!(topic.mode(), Mode::Ltp);
//! assert_eq!(topic.to_string(), "NSE:INFY:LTP");
//! ```

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, TimeZone, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use thiserror::Error;

use super::ErrorKind;

// =============================================================================
// Errors
// =============================================================================

/// Validation failures while building ticks or topics.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum TickError {
    /// A required string field was empty after trimming.
    #[error("{0} must not be empty")]
    EmptyField(&'static str),

    /// A required field was never supplied.
    #[error("missing field: {0}")]
    MissingField(&'static str),

    /// The timestamp could not be parsed.
    #[error("invalid timestamp: {0:?}")]
    InvalidTimestamp(String),

    /// Unknown subscription mode.
    #[error("invalid mode: {0:?} (expected LTP, Quote or Depth)")]
    InvalidMode(String),

    /// Topic key or component failed validation.
    #[error("invalid topic: {0}")]
    InvalidTopic(String),

    /// A numeric field held something that is not a number.
    #[error("invalid number in {field}: {value:?}")]
    InvalidNumber {
        /// Field name as it appeared upstream.
        field: String,
        /// Raw value.
        value: String,
    },
}

impl TickError {
    /// Taxonomy category.
    #[must_use]
    pub const fn kind(&self) -> ErrorKind {
        ErrorKind::MalformedTick
    }
}

// =============================================================================
// Mode
// =============================================================================

/// Granularity of data requested for a symbol.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Mode {
    /// Last traded price only.
    #[serde(rename = "LTP")]
    Ltp,
    /// Top of book with session statistics.
    Quote,
    /// Multi-level order book.
    Depth,
}

impl Mode {
    /// All modes in venue code order.
    #[must_use]
    pub const fn all() -> &'static [Self] {
        &[Self::Ltp, Self::Quote, Self::Depth]
    }

    /// Canonical spelling used in topic keys.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Ltp => "LTP",
            Self::Quote => "Quote",
            Self::Depth => "Depth",
        }
    }

    /// Numeric code used by venue socket APIs (1, 2, 3).
    #[must_use]
    pub const fn code(self) -> u8 {
        match self {
            Self::Ltp => 1,
            Self::Quote => 2,
            Self::Depth => 3,
        }
    }
}

impl FromStr for Mode {
    type Err = TickError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_uppercase().as_str() {
            "LTP" | "1" => Ok(Self::Ltp),
            "QUOTE" | "2" => Ok(Self::Quote),
            "DEPTH" | "3" => Ok(Self::Depth),
            _ => Err(TickError::InvalidMode(s.to_string())),
        }
    }
}

impl fmt::Display for Mode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// =============================================================================
// Topic
// =============================================================================

/// Routing key combining exchange, symbol and mode.
///
/// Exchanges are upper-cased on construction; symbols keep their case but
/// may not contain `:` or whitespace.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Topic {
    exchange: String,
    symbol: String,
    mode: Mode,
}

impl Topic {
    /// Build a validated topic.
    ///
    /// # Errors
    ///
    /// Returns [`TickError`] if the exchange or symbol is empty or contains
    /// characters that would make the key ambiguous.
    pub fn new(
        exchange: impl AsRef<str>,
        symbol: impl AsRef<str>,
        mode: Mode,
    ) -> Result<Self, TickError> {
        let exchange = normalize_exchange(exchange.as_ref())?;
        let symbol = normalize_symbol(symbol.as_ref())?;
        Ok(Self {
            exchange,
            symbol,
            mode,
        })
    }

    /// Parse a canonical `EXCHANGE:SYMBOL:MODE` key.
    ///
    /// # Errors
    ///
    /// Returns [`TickError`] when the key does not have exactly three
    /// components or any component is invalid.
    pub fn parse(key: &str) -> Result<Self, TickError> {
        let mut parts = key.split(':');
        let (Some(exchange), Some(symbol), Some(mode), None) =
            (parts.next(), parts.next(), parts.next(), parts.next())
        else {
            return Err(TickError::InvalidTopic(format!(
                "expected EXCHANGE:SYMBOL:MODE, got {key:?}"
            )));
        };
        Self::new(exchange, symbol, mode.parse()?)
    }

    /// Exchange segment (upper case).
    #[must_use]
    pub fn exchange(&self) -> &str {
        &self.exchange
    }

    /// Trading symbol.
    #[must_use]
    pub fn symbol(&self) -> &str {
        &self.symbol
    }

    /// Data mode.
    #[must_use]
    pub const fn mode(&self) -> Mode {
        self.mode
    }

    /// Same instrument at a different mode.
    #[must_use]
    pub fn with_mode(&self, mode: Mode) -> Self {
        Self {
            exchange: self.exchange.clone(),
            symbol: self.symbol.clone(),
            mode,
        }
    }
}

impl fmt::Display for Topic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}:{}", self.exchange, self.symbol, self.mode)
    }
}

impl FromStr for Topic {
    type Err = TickError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl Serialize for Topic {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for Topic {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let key = String::deserialize(deserializer)?;
        Self::parse(&key).map_err(serde::de::Error::custom)
    }
}

fn normalize_exchange(raw: &str) -> Result<String, TickError> {
    let exchange = raw.trim();
    if exchange.is_empty() {
        return Err(TickError::EmptyField("exchange"));
    }
    if !exchange
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || c == '_')
    {
        return Err(TickError::InvalidTopic(format!(
            "exchange {exchange:?} may only contain letters, digits and '_'"
        )));
    }
    Ok(exchange.to_ascii_uppercase())
}

fn normalize_symbol(raw: &str) -> Result<String, TickError> {
    let symbol = raw.trim();
    if symbol.is_empty() {
        return Err(TickError::EmptyField("symbol"));
    }
    if symbol.chars().any(|c| c == ':' || c.is_whitespace()) {
        return Err(TickError::InvalidTopic(format!(
            "symbol {symbol:?} may not contain ':' or whitespace"
        )));
    }
    Ok(symbol.to_string())
}

// =============================================================================
// Depth and Quote
// =============================================================================

/// One price level of an order book side.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DepthLevel {
    /// Level price.
    pub price: Decimal,
    /// Total quantity resting at this price.
    pub quantity: u64,
    /// Number of orders, when the venue reports it.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub orders: Option<u32>,
}

/// Bid and ask ladders, best level first.
///
/// Levels the venue did not report are absent rather than zero-filled, so
/// either side may be shorter than the venue's nominal depth.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MarketDepth {
    /// Buy side, highest price first.
    pub bids: Vec<DepthLevel>,
    /// Sell side, lowest price first.
    pub asks: Vec<DepthLevel>,
}

impl MarketDepth {
    /// True when neither side has a level.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.bids.is_empty() && self.asks.is_empty()
    }
}

/// Session statistics and top of book carried by Quote ticks.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[allow(missing_docs)]
pub struct QuoteFields {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub open: Option<Decimal>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub high: Option<Decimal>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub low: Option<Decimal>,
    /// Previous session close.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub close: Option<Decimal>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub average_price: Option<Decimal>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub change_percent: Option<Decimal>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bid_price: Option<Decimal>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bid_quantity: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ask_price: Option<Decimal>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ask_quantity: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub open_interest: Option<u64>,
}

// =============================================================================
// Canonical Tick
// =============================================================================

/// One normalized market data update.
///
/// Fields are private: a tick is built once through [`TickBuilder`] and
/// shared as `Arc<CanonicalTick>` from then on. Deserialization goes
/// through the same builder.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "TickRecord")]
pub struct CanonicalTick {
    exchange: String,
    symbol: String,
    mode: Mode,
    timestamp: DateTime<Utc>,
    last_traded_price: Decimal,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    volume: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    quote: Option<QuoteFields>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    depth: Option<MarketDepth>,
}

impl CanonicalTick {
    /// Start building a tick for an instrument.
    #[must_use]
    pub fn builder(exchange: impl Into<String>, symbol: impl Into<String>, mode: Mode) -> TickBuilder {
        TickBuilder {
            exchange: exchange.into(),
            symbol: symbol.into(),
            mode,
            timestamp: None,
            last_traded_price: None,
            volume: None,
            quote: None,
            depth: None,
        }
    }

    /// Exchange segment.
    #[must_use]
    pub fn exchange(&self) -> &str {
        &self.exchange
    }

    /// Trading symbol.
    #[must_use]
    pub fn symbol(&self) -> &str {
        &self.symbol
    }

    /// Data mode.
    #[must_use]
    pub const fn mode(&self) -> Mode {
        self.mode
    }

    /// Upstream-reported event time.
    #[must_use]
    pub const fn timestamp(&self) -> DateTime<Utc> {
        self.timestamp
    }

    /// Last traded price.
    #[must_use]
    pub const fn last_traded_price(&self) -> Decimal {
        self.last_traded_price
    }

    /// Cumulative session volume, when reported.
    #[must_use]
    pub const fn volume(&self) -> Option<u64> {
        self.volume
    }

    /// Quote block (Quote mode).
    #[must_use]
    pub const fn quote(&self) -> Option<&QuoteFields> {
        self.quote.as_ref()
    }

    /// Order book (Depth mode).
    #[must_use]
    pub const fn depth(&self) -> Option<&MarketDepth> {
        self.depth.as_ref()
    }

    /// Routing key for this tick.
    #[must_use]
    pub fn topic(&self) -> Topic {
        // Exchange and symbol were validated by the builder.
        Topic {
            exchange: self.exchange.clone(),
            symbol: self.symbol.clone(),
            mode: self.mode,
        }
    }
}

/// Wire shape of a tick before validation.
#[derive(Deserialize)]
struct TickRecord {
    exchange: String,
    symbol: String,
    mode: Mode,
    timestamp: DateTime<Utc>,
    last_traded_price: Decimal,
    #[serde(default)]
    volume: Option<u64>,
    #[serde(default)]
    quote: Option<QuoteFields>,
    #[serde(default)]
    depth: Option<MarketDepth>,
}

impl TryFrom<TickRecord> for CanonicalTick {
    type Error = TickError;

    fn try_from(record: TickRecord) -> Result<Self, Self::Error> {
        let mut builder = Self::builder(record.exchange, record.symbol, record.mode)
            .timestamp(record.timestamp)
            .last_traded_price(record.last_traded_price)
            .volume(record.volume);
        if let Some(quote) = record.quote {
            builder = builder.quote(quote);
        }
        if let Some(depth) = record.depth {
            builder = builder.depth(depth);
        }
        builder.build()
    }
}

#[derive(Debug, Clone)]
enum TimestampInput {
    Parsed(DateTime<Utc>),
    Raw(String),
}

/// Validating builder for [`CanonicalTick`].
#[derive(Debug, Clone)]
#[must_use]
pub struct TickBuilder {
    exchange: String,
    symbol: String,
    mode: Mode,
    timestamp: Option<TimestampInput>,
    last_traded_price: Option<Decimal>,
    volume: Option<u64>,
    quote: Option<QuoteFields>,
    depth: Option<MarketDepth>,
}

impl TickBuilder {
    /// Event time as an already-parsed instant.
    pub fn timestamp(mut self, timestamp: DateTime<Utc>) -> Self {
        self.timestamp = Some(TimestampInput::Parsed(timestamp));
        self
    }

    /// Event time as reported by the venue; parsed by [`parse_timestamp`]
    /// during [`build`](Self::build).
    pub fn timestamp_raw(mut self, raw: impl Into<String>) -> Self {
        self.timestamp = Some(TimestampInput::Raw(raw.into()));
        self
    }

    /// Last traded price.
    pub const fn last_traded_price(mut self, price: Decimal) -> Self {
        self.last_traded_price = Some(price);
        self
    }

    /// Cumulative volume.
    pub const fn volume(mut self, volume: Option<u64>) -> Self {
        self.volume = volume;
        self
    }

    /// Quote block.
    pub fn quote(mut self, quote: QuoteFields) -> Self {
        self.quote = Some(quote);
        self
    }

    /// Order book.
    pub fn depth(mut self, depth: MarketDepth) -> Self {
        self.depth = Some(depth);
        self
    }

    /// Validate and produce the tick.
    ///
    /// # Errors
    ///
    /// Fails with a [`TickError`] (kind `MalformedTick`) when exchange or
    /// symbol is empty, the timestamp is missing or unparseable, or no
    /// last traded price was supplied.
    pub fn build(self) -> Result<CanonicalTick, TickError> {
        let exchange = normalize_exchange(&self.exchange)?;
        let symbol = normalize_symbol(&self.symbol)?;

        let timestamp = match self.timestamp {
            Some(TimestampInput::Parsed(ts)) => ts,
            Some(TimestampInput::Raw(raw)) => parse_timestamp(&raw)?,
            None => return Err(TickError::MissingField("timestamp")),
        };

        let last_traded_price = self
            .last_traded_price
            .ok_or(TickError::MissingField("last_traded_price"))?;

        Ok(CanonicalTick {
            exchange,
            symbol,
            mode: self.mode,
            timestamp,
            last_traded_price,
            volume: self.volume,
            quote: self.quote,
            depth: self.depth.filter(|d| !d.is_empty()),
        })
    }
}

/// Parse a venue timestamp.
///
/// Accepts epoch seconds, epoch milliseconds (13 or more digits) and
/// RFC 3339 strings.
///
/// # Errors
///
/// Returns [`TickError::InvalidTimestamp`] for anything else.
pub fn parse_timestamp(raw: &str) -> Result<DateTime<Utc>, TickError> {
    let trimmed = raw.trim();
    let invalid = || TickError::InvalidTimestamp(raw.to_string());

    if trimmed.is_empty() {
        return Err(invalid());
    }

    if trimmed.bytes().all(|b| b.is_ascii_digit()) {
        let value: i64 = trimmed.parse().map_err(|_| invalid())?;
        let parsed = if trimmed.len() >= 13 {
            Utc.timestamp_millis_opt(value).single()
        } else {
            Utc.timestamp_opt(value, 0).single()
        };
        return parsed.ok_or_else(invalid);
    }

    DateTime::parse_from_rfc3339(trimmed)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|_| invalid())
}
