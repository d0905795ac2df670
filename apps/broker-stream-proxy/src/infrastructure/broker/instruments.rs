//! Instrument Map
//!
//! Resolves canonical `(exchange, symbol)` pairs to the venue's
//! `(exchange, token)` addressing. Entries come from an optional JSON file:
//!
//! ```json
//! [
//!   { "exchange": "NSE", "symbol": "INFY", "token": "1594" },
//!   { "exchange": "NSE_INDEX", "symbol": "NIFTY", "token": "26000", "venue_exchange": "NSE" }
//! ]
//! ```
//!
//! Unmapped symbols resolve to themselves, so venues that accept trading
//! symbols directly need no file at all.

use std::collections::HashMap;
use std::path::Path;

use serde::Deserialize;
use thiserror::Error;

/// Instrument file could not be loaded.
#[derive(Debug, Error)]
pub enum InstrumentError {
    /// File unreadable.
    #[error("failed to read instrument file {path}: {source}")]
    Io {
        /// File path.
        path: String,
        /// Underlying error.
        #[source]
        source: std::io::Error,
    },

    /// File is not a JSON array of instruments.
    #[error("invalid instrument file: {0}")]
    Json(#[from] serde_json::Error),
}

#[derive(Debug, Deserialize)]
struct InstrumentRecord {
    exchange: String,
    symbol: String,
    token: String,
    #[serde(default)]
    venue_exchange: Option<String>,
}

/// Venue-side address of an instrument.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct VenueInstrument {
    /// Exchange segment as the venue names it.
    pub exchange: String,
    /// Venue instrument token.
    pub token: String,
}

impl VenueInstrument {
    /// `EXCH|token` key used by Noren-family venues.
    #[must_use]
    pub fn key(&self) -> String {
        format!("{}|{}", self.exchange, self.token)
    }
}

/// Venue segment for a canonical exchange.
#[must_use]
pub fn venue_exchange(exchange: &str) -> &str {
    match exchange {
        "NSE_INDEX" => "NSE",
        "BSE_INDEX" => "BSE",
        "MCX_INDEX" => "MCX",
        other => other,
    }
}

/// Canonical → venue instrument lookup.
#[derive(Debug, Clone, Default)]
pub struct InstrumentMap {
    entries: HashMap<(String, String), VenueInstrument>,
}

impl InstrumentMap {
    /// Empty map; every symbol resolves to itself.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Parse a JSON array of instrument records.
    ///
    /// # Errors
    ///
    /// Returns an error if the document is not a valid instrument list.
    pub fn from_json(json: &str) -> Result<Self, InstrumentError> {
        let records: Vec<InstrumentRecord> = serde_json::from_str(json)?;
        let mut map = Self::new();
        for record in records {
            let exchange = record.exchange.trim().to_ascii_uppercase();
            let venue = record
                .venue_exchange
                .map_or_else(|| venue_exchange(&exchange).to_string(), |v| v.trim().to_ascii_uppercase());
            map.insert(&exchange, record.symbol.trim(), venue, record.token.trim());
        }
        Ok(map)
    }

    /// Load from a file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file is unreadable or malformed.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, InstrumentError> {
        let path = path.as_ref();
        let json = std::fs::read_to_string(path).map_err(|source| InstrumentError::Io {
            path: path.display().to_string(),
            source,
        })?;
        let map = Self::from_json(&json)?;
        tracing::info!(path = %path.display(), instruments = map.len(), "Loaded instrument map");
        Ok(map)
    }

    /// Add or replace one mapping.
    pub fn insert(
        &mut self,
        exchange: &str,
        symbol: &str,
        venue_exchange: impl Into<String>,
        token: impl Into<String>,
    ) {
        self.entries.insert(
            (exchange.to_string(), symbol.to_string()),
            VenueInstrument {
                exchange: venue_exchange.into(),
                token: token.into(),
            },
        );
    }

    /// Venue address for a canonical instrument.
    #[must_use]
    pub fn resolve(&self, exchange: &str, symbol: &str) -> VenueInstrument {
        self.entries
            .get(&(exchange.to_string(), symbol.to_string()))
            .cloned()
            .unwrap_or_else(|| VenueInstrument {
                exchange: venue_exchange(exchange).to_string(),
                token: symbol.to_string(),
            })
    }

    /// Number of explicit mappings.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// True when no explicit mappings exist.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
