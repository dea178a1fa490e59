//! Order book module
//!
//! Maintains a sequenced, self-correcting order book per symbol from REST
//! snapshots and depth diffs.

mod aggregate;
mod metrics;
mod store;

pub use aggregate::{aggregate_side, round_to_tick};
pub use metrics::OrderBookMetrics;
pub use store::{DiffOutcome, OrderBookStore, RebaseReport, SyncState};

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::model::PriceLevel;

/// Side of the order book
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Side {
    Bid,
    Ask,
}

/// Display level produced by aggregation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct AggregatedLevel {
    pub price: Decimal,
    pub size: Decimal,
    /// Running size total from the top of book down to this level
    pub cumulative: Decimal,
}

/// Aggregated, outlier-filtered depth for both sides
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AggregatedBook {
    pub bids: Vec<AggregatedLevel>,
    pub asks: Vec<AggregatedLevel>,
}

/// Immutable copy of a book handed to readers
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BookView {
    pub symbol: String,
    pub bids: Vec<PriceLevel>,
    pub asks: Vec<PriceLevel>,
    pub last_applied_sequence_id: u64,
    /// Exchange time of the last applied diff (epoch milliseconds, 0 if none)
    pub last_event_time: u64,
    /// Milliseconds since the book last changed
    pub age_ms: u64,
    /// Last known, not current
    pub is_stale: bool,
    pub sync: SyncState,
    pub buffered_diffs: usize,
    pub metrics: OrderBookMetrics,
}
