//! Sequenced order book store
//!
//! Uses BTreeMap for sorted price level management. Diffs are applied only
//! when they chain onto the last applied sequence id; anything else is
//! buffered until the next snapshot rebase.

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::cmp::Reverse;
use std::collections::{BTreeMap, VecDeque};
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, warn};

use super::{aggregate_side, AggregatedBook, BookView, OrderBookMetrics, Side};
use crate::error::Result;
use crate::model::{OrderBookDiff, OrderBookSnapshot, PriceLevel};

/// Synchronization state of a store relative to the exchange sequence
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "state")]
pub enum SyncState {
    /// No snapshot applied yet; diffs are buffered
    AwaitingSnapshot,
    /// Applying diffs. `rebased` holds until the first diff after a snapshot.
    Live { rebased: bool },
    /// Continuity broken; diffs are buffered until the next rebase
    Gap {
        expected_previous: u64,
        received_previous: u64,
    },
}

/// Result of offering a diff to the store
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DiffOutcome {
    Applied,
    /// Already covered by the current state; ignored
    Stale,
    /// Buffered while waiting for the first snapshot
    Pending { evicted: usize },
    /// This diff broke continuity and was buffered
    GapDetected {
        expected_previous: u64,
        received_previous: u64,
        evicted: usize,
    },
    /// Buffered behind an earlier gap
    Buffered { evicted: usize },
}

impl DiffOutcome {
    pub fn evicted(&self) -> usize {
        match self {
            DiffOutcome::Pending { evicted }
            | DiffOutcome::GapDetected { evicted, .. }
            | DiffOutcome::Buffered { evicted } => *evicted,
            _ => 0,
        }
    }
}

/// Summary of a snapshot rebase
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RebaseReport {
    pub sequence_id: u64,
    /// Buffered diffs superseded by the snapshot
    pub discarded: usize,
    /// Buffered diffs applied on top of the snapshot
    pub replayed: usize,
    /// Diffs still buffered because replay hit a new gap
    pub still_buffered: usize,
    /// Gap found during replay as (expected_previous, received_previous)
    pub gap: Option<(u64, u64)>,
}

/// Authoritative book for a single symbol
#[derive(Debug)]
pub struct OrderBookStore {
    symbol: String,
    /// Bids sorted by price descending (highest first)
    bids: BTreeMap<Reverse<Decimal>, Decimal>,
    /// Asks sorted by price ascending (lowest first)
    asks: BTreeMap<Decimal, Decimal>,
    last_applied_sequence_id: u64,
    last_mutated_at: Instant,
    /// Exchange event time of the last applied diff
    last_event_time: u64,
    is_stale: bool,
    sync: SyncState,
    buffer: VecDeque<OrderBookDiff>,
    max_buffered: usize,
}

impl OrderBookStore {
    /// Create a new empty store
    pub fn new(symbol: &str, max_buffered: usize) -> Self {
        Self {
            symbol: symbol.to_string(),
            bids: BTreeMap::new(),
            asks: BTreeMap::new(),
            last_applied_sequence_id: 0,
            last_mutated_at: Instant::now(),
            last_event_time: 0,
            is_stale: false,
            sync: SyncState::AwaitingSnapshot,
            buffer: VecDeque::new(),
            max_buffered: max_buffered.max(1),
        }
    }

    /// Replace the book with a full snapshot, then replay any buffered diffs
    /// the snapshot does not supersede.
    pub fn apply_snapshot(&mut self, snapshot: &OrderBookSnapshot) -> RebaseReport {
        self.bids.clear();
        self.asks.clear();

        for level in snapshot.bids.iter().filter(|l| l.size > Decimal::ZERO) {
            self.bids.insert(Reverse(level.price), level.size);
        }
        for level in snapshot.asks.iter().filter(|l| l.size > Decimal::ZERO) {
            self.asks.insert(level.price, level.size);
        }

        self.last_applied_sequence_id = snapshot.sequence_id;
        self.last_mutated_at = Instant::now();
        self.is_stale = false;
        self.sync = SyncState::Live { rebased: true };

        let mut pending: Vec<OrderBookDiff> = self.buffer.drain(..).collect();
        pending.sort_by_key(|d| (d.final_sequence_id, d.first_sequence_id));

        let mut report = RebaseReport {
            sequence_id: snapshot.sequence_id,
            ..RebaseReport::default()
        };

        for diff in pending {
            match self.apply_diff(diff) {
                DiffOutcome::Applied => report.replayed += 1,
                DiffOutcome::Stale => report.discarded += 1,
                DiffOutcome::GapDetected {
                    expected_previous,
                    received_previous,
                    ..
                } => report.gap = Some((expected_previous, received_previous)),
                DiffOutcome::Pending { .. } | DiffOutcome::Buffered { .. } => {}
            }
        }
        report.still_buffered = self.buffer.len();

        debug!(
            symbol = %self.symbol,
            sequence_id = snapshot.sequence_id,
            discarded = report.discarded,
            replayed = report.replayed,
            still_buffered = report.still_buffered,
            "Snapshot applied"
        );

        report
    }

    /// Offer a diff to the store
    pub fn apply_diff(&mut self, diff: OrderBookDiff) -> DiffOutcome {
        match self.sync {
            SyncState::AwaitingSnapshot => DiffOutcome::Pending {
                evicted: self.buffer_diff(diff),
            },
            SyncState::Gap { .. } => {
                if diff.final_sequence_id <= self.last_applied_sequence_id {
                    return DiffOutcome::Stale;
                }
                DiffOutcome::Buffered {
                    evicted: self.buffer_diff(diff),
                }
            }
            SyncState::Live { rebased } => {
                if diff.final_sequence_id <= self.last_applied_sequence_id {
                    return DiffOutcome::Stale;
                }

                if !self.chains(&diff, rebased) {
                    let expected_previous = self.last_applied_sequence_id;
                    let received_previous = diff
                        .previous_final_sequence_id
                        .unwrap_or(diff.first_sequence_id.saturating_sub(1));
                    warn!(
                        symbol = %self.symbol,
                        expected_previous,
                        received_previous,
                        "Sequence gap, buffering until next rebase"
                    );
                    self.sync = SyncState::Gap {
                        expected_previous,
                        received_previous,
                    };
                    let evicted = self.buffer_diff(diff);
                    return DiffOutcome::GapDetected {
                        expected_previous,
                        received_previous,
                        evicted,
                    };
                }

                self.apply_changes(&diff);
                self.last_applied_sequence_id = diff.final_sequence_id;
                self.last_event_time = diff.event_time;
                self.last_mutated_at = Instant::now();
                self.is_stale = false;
                self.sync = SyncState::Live { rebased: false };
                DiffOutcome::Applied
            }
        }
    }

    /// Whether `diff` continues directly from the last applied sequence id.
    /// Right after a rebase the first diff may straddle the snapshot point.
    fn chains(&self, diff: &OrderBookDiff, rebased: bool) -> bool {
        let next = self.last_applied_sequence_id.saturating_add(1);
        if rebased && diff.first_sequence_id <= next {
            return true;
        }
        match diff.previous_final_sequence_id {
            Some(previous) => previous == self.last_applied_sequence_id,
            None => diff.first_sequence_id <= next,
        }
    }

    fn apply_changes(&mut self, diff: &OrderBookDiff) {
        for level in &diff.bid_changes {
            self.update_side(Side::Bid, level);
        }
        for level in &diff.ask_changes {
            self.update_side(Side::Ask, level);
        }
    }

    /// Update a single price level
    fn update_side(&mut self, side: Side, level: &PriceLevel) {
        match side {
            Side::Bid => {
                if level.size <= Decimal::ZERO {
                    self.bids.remove(&Reverse(level.price));
                } else {
                    self.bids.insert(Reverse(level.price), level.size);
                }
            }
            Side::Ask => {
                if level.size <= Decimal::ZERO {
                    self.asks.remove(&level.price);
                } else {
                    self.asks.insert(level.price, level.size);
                }
            }
        }
    }

    /// Push onto the bounded buffer, returning how many old diffs were evicted
    fn buffer_diff(&mut self, diff: OrderBookDiff) -> usize {
        let mut evicted = 0;
        while self.buffer.len() >= self.max_buffered {
            self.buffer.pop_front();
            evicted += 1;
        }
        self.buffer.push_back(diff);
        if evicted > 0 {
            warn!(symbol = %self.symbol, evicted, "Diff buffer full, dropped oldest");
        }
        evicted
    }

    /// Flag the book stale if it has not changed for longer than `threshold`
    pub fn mark_stale_if_older_than(&mut self, threshold: Duration) -> bool {
        self.mark_stale_if_older_than_at(threshold, Instant::now())
    }

    pub fn mark_stale_if_older_than_at(&mut self, threshold: Duration, now: Instant) -> bool {
        if now.saturating_duration_since(self.last_mutated_at) > threshold {
            self.is_stale = true;
        }
        self.is_stale
    }

    pub fn is_stale(&self) -> bool {
        self.is_stale
    }

    pub fn sync_state(&self) -> SyncState {
        self.sync
    }

    pub fn last_applied_sequence_id(&self) -> u64 {
        self.last_applied_sequence_id
    }

    pub fn buffered_len(&self) -> usize {
        self.buffer.len()
    }

    pub fn age(&self) -> Duration {
        Instant::now().saturating_duration_since(self.last_mutated_at)
    }

    /// Get best bid price
    pub fn best_bid(&self) -> Option<Decimal> {
        self.bids.first_key_value().map(|(Reverse(p), _)| *p)
    }

    /// Get best ask price
    pub fn best_ask(&self) -> Option<Decimal> {
        self.asks.first_key_value().map(|(p, _)| *p)
    }

    /// Get mid price
    pub fn mid_price(&self) -> Option<Decimal> {
        match (self.best_bid(), self.best_ask()) {
            (Some(bid), Some(ask)) => Some((bid + ask) / Decimal::from(2)),
            _ => None,
        }
    }

    /// Get spread in basis points
    pub fn spread_bps(&self) -> Option<Decimal> {
        match (self.best_bid(), self.best_ask(), self.mid_price()) {
            (Some(bid), Some(ask), Some(mid)) if mid > Decimal::ZERO => {
                Some((ask - bid) / mid * Decimal::from(10000))
            }
            _ => None,
        }
    }

    /// Bid levels, best first
    pub fn bids(&self) -> impl Iterator<Item = PriceLevel> + '_ {
        self.bids
            .iter()
            .map(|(Reverse(price), size)| PriceLevel::new(*price, *size))
    }

    /// Ask levels, best first
    pub fn asks(&self) -> impl Iterator<Item = PriceLevel> + '_ {
        self.asks
            .iter()
            .map(|(price, size)| PriceLevel::new(*price, *size))
    }

    /// Tick-aggregated, outlier-filtered depth. Never mutates the store.
    pub fn aggregated_levels(
        &self,
        tick_size: Decimal,
        depth: usize,
        outlier_multiple: Decimal,
    ) -> Result<AggregatedBook> {
        Ok(AggregatedBook {
            bids: aggregate_side(
                self.bids().map(|l| (l.price, l.size)),
                Side::Bid,
                tick_size,
                depth,
                outlier_multiple,
            )?,
            asks: aggregate_side(
                self.asks().map(|l| (l.price, l.size)),
                Side::Ask,
                tick_size,
                depth,
                outlier_multiple,
            )?,
        })
    }

    /// Owned copy of the top `depth` levels per side
    pub fn view(&self, depth: usize) -> BookView {
        BookView {
            symbol: self.symbol.clone(),
            bids: self.bids().take(depth).collect(),
            asks: self.asks().take(depth).collect(),
            last_applied_sequence_id: self.last_applied_sequence_id,
            last_event_time: self.last_event_time,
            age_ms: self.age().as_millis() as u64,
            is_stale: self.is_stale,
            sync: self.sync,
            buffered_diffs: self.buffer.len(),
            metrics: self.calculate_metrics(),
        }
    }

    fn calculate_metrics(&self) -> OrderBookMetrics {
        OrderBookMetrics {
            best_bid: self.best_bid(),
            best_ask: self.best_ask(),
            mid_price: self.mid_price(),
            spread_bps: self.spread_bps(),
            bid_depth: self.bids.values().copied().sum(),
            ask_depth: self.asks.values().copied().sum(),
            bid_levels: self.bids.len(),
            ask_levels: self.asks.len(),
        }
    }
}
