//! Exchange-agnostic market data types
//!
//! The wire codec in [`crate::parser`] converts venue payloads into these.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Price level (price, size pair). A zero size deletes the level.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PriceLevel {
    pub price: Decimal,
    pub size: Decimal,
}

impl PriceLevel {
    pub fn new(price: Decimal, size: Decimal) -> Self {
        Self { price, size }
    }

    pub fn is_delete(&self) -> bool {
        self.size.is_zero()
    }
}

/// Full book state fetched over REST
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrderBookSnapshot {
    pub symbol: String,
    /// Best bid first
    pub bids: Vec<PriceLevel>,
    /// Best ask first
    pub asks: Vec<PriceLevel>,
    pub sequence_id: u64,
    pub captured_at: DateTime<Utc>,
}

/// Incremental book changes between two sequence points
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrderBookDiff {
    pub symbol: String,
    pub first_sequence_id: u64,
    pub final_sequence_id: u64,
    /// Final id of the previous diff, when the venue supplies it
    pub previous_final_sequence_id: Option<u64>,
    pub bid_changes: Vec<PriceLevel>,
    pub ask_changes: Vec<PriceLevel>,
    /// Exchange event time (epoch milliseconds)
    pub event_time: u64,
}

/// Executed trade
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Trade {
    pub id: u64,
    pub symbol: String,
    pub price: Decimal,
    pub quantity: Decimal,
    /// Exchange event time (epoch milliseconds)
    pub event_time: u64,
    pub taker_is_buyer: bool,
}

/// OHLCV bar forwarded downstream untouched
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Candle {
    pub symbol: String,
    pub interval: String,
    pub open_time: u64,
    pub close_time: u64,
    pub open: Decimal,
    pub high: Decimal,
    pub low: Decimal,
    pub close: Decimal,
    pub volume: Decimal,
    pub is_closed: bool,
}

/// Logical stream served by one feed connection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StreamKind {
    Depth,
    Trades,
    Candles,
}

impl StreamKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            StreamKind::Depth => "depth",
            StreamKind::Trades => "trades",
            StreamKind::Candles => "candles",
        }
    }
}

impl fmt::Display for StreamKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
