//! Periodic snapshot reconciliation
//!
//! The only path that resolves a sequence gap: on a fixed interval the
//! scheduler fetches a full REST snapshot and rebases the store. The same
//! task sweeps the store for staleness.

use async_trait::async_trait;
use chrono::Utc;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, watch};
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, info, warn};

use crate::engine::{BookSlot, EngineEvent};
use crate::error::{MarketDataError, Result};
use crate::model::OrderBookSnapshot;
use crate::orderbook::RebaseReport;
use crate::parser::SnapshotResponse;
use crate::quality::QualityMonitor;

/// Source of full order book snapshots
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait SnapshotSource: Send + Sync {
    async fn fetch(&self, symbol: &str) -> Result<OrderBookSnapshot>;
}

/// Snapshots from the exchange REST API
#[derive(Debug, Clone)]
pub struct RestSnapshotSource {
    client: reqwest::Client,
    rest_endpoint: String,
    depth_levels: usize,
}

impl RestSnapshotSource {
    pub fn new(
        rest_endpoint: &str,
        depth_levels: usize,
        request_timeout: Duration,
    ) -> Result<Self> {
        let client = reqwest::Client::builder().timeout(request_timeout).build()?;
        Ok(Self {
            client,
            rest_endpoint: rest_endpoint.trim_end_matches('/').to_string(),
            depth_levels,
        })
    }

    fn url(&self, symbol: &str) -> String {
        format!(
            "{}/depth?symbol={}&limit={}",
            self.rest_endpoint, symbol, self.depth_levels
        )
    }
}

#[async_trait]
impl SnapshotSource for RestSnapshotSource {
    async fn fetch(&self, symbol: &str) -> Result<OrderBookSnapshot> {
        let url = self.url(symbol);
        debug!(symbol = %symbol, url = %url, "Fetching order book snapshot");

        let failed = |reason: String| MarketDataError::SnapshotFetch {
            symbol: symbol.to_string(),
            reason,
        };

        let response = self
            .client
            .get(&url)
            .send()
            .await
            .and_then(|r| r.error_for_status())
            .map_err(|e| failed(e.to_string()))?;

        let body = response
            .json::<SnapshotResponse>()
            .await
            .map_err(|e| failed(format!("invalid body: {}", e)))?;

        Ok(body.into_snapshot(symbol, Utc::now()))
    }
}

/// Per-symbol rebase and staleness task
pub struct ReconciliationScheduler {
    symbol: String,
    source: Arc<dyn SnapshotSource>,
    book: BookSlot,
    monitor: Arc<QualityMonitor>,
    events: broadcast::Sender<EngineEvent>,
    rebase_interval: Duration,
    stale_check_interval: Duration,
    stale_after: Duration,
}

impl ReconciliationScheduler {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        symbol: &str,
        source: Arc<dyn SnapshotSource>,
        book: BookSlot,
        monitor: Arc<QualityMonitor>,
        events: broadcast::Sender<EngineEvent>,
        rebase_interval: Duration,
        stale_check_interval: Duration,
        stale_after: Duration,
    ) -> Self {
        Self {
            symbol: symbol.to_string(),
            source,
            book,
            monitor,
            events,
            rebase_interval,
            stale_check_interval,
            stale_after,
        }
    }

    /// Fetch one snapshot and rebase the store.
    ///
    /// `Ok(None)` means the symbol was unsubscribed meanwhile. On a failed
    /// fetch the store is left untouched.
    pub async fn rebase(&self) -> Result<Option<RebaseReport>> {
        let snapshot = match self.source.fetch(&self.symbol).await {
            Ok(snapshot) => snapshot,
            Err(e) => {
                let failures = self.monitor.record_snapshot_failure(&e.to_string());
                warn!(
                    symbol = %self.symbol,
                    failures,
                    error = %e,
                    "Snapshot fetch failed, keeping current book"
                );
                return Err(e);
            }
        };

        let report = {
            let mut slot = self.book.write().await;
            let Some(store) = slot.as_mut() else {
                return Ok(None);
            };
            store.apply_snapshot(&snapshot)
        };

        self.monitor.record_rebase(&report);
        let _ = self.events.send(EngineEvent::BookChanged {
            symbol: self.symbol.clone(),
            sequence_id: report.sequence_id,
        });

        info!(
            symbol = %self.symbol,
            sequence_id = report.sequence_id,
            replayed = report.replayed,
            still_buffered = report.still_buffered,
            "Order book rebased"
        );
        Ok(Some(report))
    }

    /// Flag the store stale if it has not moved recently. `None` once the
    /// symbol is gone.
    pub async fn check_staleness(&self) -> Option<bool> {
        let (is_stale, age_ms) = {
            let mut slot = self.book.write().await;
            let store = slot.as_mut()?;
            let is_stale = store.mark_stale_if_older_than(self.stale_after);
            (is_stale, store.age().as_millis() as u64)
        };
        self.monitor.record_staleness(is_stale, age_ms);
        Some(is_stale)
    }

    /// Run until shutdown or until the store slot is emptied
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        let mut rebase_tick = interval(self.rebase_interval);
        rebase_tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut stale_tick = interval(self.stale_check_interval);
        stale_tick.set_missed_tick_behavior(MissedTickBehavior::Delay);

        info!(
            symbol = %self.symbol,
            interval_ms = self.rebase_interval.as_millis() as u64,
            "Starting reconciliation scheduler"
        );

        loop {
            tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
                _ = rebase_tick.tick() => {
                    if let Ok(None) = self.rebase().await {
                        break;
                    }
                }
                _ = stale_tick.tick() => {
                    if self.check_staleness().await.is_none() {
                        break;
                    }
                }
            }
        }

        info!(symbol = %self.symbol, "Reconciliation scheduler stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::QualitySettings;
    use crate::model::PriceLevel;
    use crate::orderbook::{OrderBookStore, SyncState};
    use crate::telemetry::EngineMetrics;
    use rust_decimal_macros::dec;
    use tokio::sync::RwLock;

    fn snapshot(sequence_id: u64) -> OrderBookSnapshot {
        OrderBookSnapshot {
            symbol: "BTCUSDT".to_string(),
            bids: vec![PriceLevel::new(dec!(10), dec!(5))],
            asks: vec![PriceLevel::new(dec!(11), dec!(5))],
            sequence_id,
            captured_at: Utc::now(),
        }
    }

    fn scheduler(
        source: MockSnapshotSource,
    ) -> (ReconciliationScheduler, BookSlot, Arc<QualityMonitor>) {
        let store = OrderBookStore::new("BTCUSDT", 16);
        let book: BookSlot = Arc::new(RwLock::new(Some(store)));
        let monitor = Arc::new(QualityMonitor::new(
            "BTCUSDT",
            QualitySettings {
                latency_window: 8,
                alert_capacity: 16,
                transition_history: 8,
            },
            2,
            Arc::new(EngineMetrics::new().unwrap()),
        ));
        let (events, _) = broadcast::channel(16);
        let scheduler = ReconciliationScheduler::new(
            "BTCUSDT",
            Arc::new(source),
            book.clone(),
            monitor.clone(),
            events,
            Duration::from_secs(30),
            Duration::from_secs(1),
            Duration::from_secs(5),
        );
        (scheduler, book, monitor)
    }

    #[tokio::test]
    async fn test_rebase_applies_snapshot() {
        let mut source = MockSnapshotSource::new();
        source
            .expect_fetch()
            .times(1)
            .returning(|_| Ok(snapshot(100)));
        let (scheduler, book, monitor) = scheduler(source);

        let report = scheduler.rebase().await.unwrap().unwrap();

        assert_eq!(report.sequence_id, 100);
        let slot = book.read().await;
        let store = slot.as_ref().unwrap();
        assert_eq!(store.last_applied_sequence_id(), 100);
        assert_eq!(store.sync_state(), SyncState::Live { rebased: true });
        assert_eq!(monitor.health().rebases, 1);
    }

    #[tokio::test]
    async fn test_failed_fetch_leaves_book_untouched() {
        let mut source = MockSnapshotSource::new();
        source.expect_fetch().times(2).returning(|symbol| {
            Err(MarketDataError::SnapshotFetch {
                symbol: symbol.to_string(),
                reason: "503".to_string(),
            })
        });
        let (scheduler, book, monitor) = scheduler(source);

        assert!(scheduler.rebase().await.is_err());
        assert!(scheduler.rebase().await.is_err());

        let slot = book.read().await;
        assert_eq!(slot.as_ref().unwrap().sync_state(), SyncState::AwaitingSnapshot);
        assert_eq!(monitor.health().consecutive_snapshot_failures, 2);
        assert!(monitor
            .alerts_since(0)
            .iter()
            .any(|a| a.kind == crate::quality::AlertKind::Staleness));
    }

    #[tokio::test]
    async fn test_rebase_after_unsubscribe_is_a_no_op() {
        let mut source = MockSnapshotSource::new();
        source.expect_fetch().returning(|_| Ok(snapshot(100)));
        let (scheduler, book, monitor) = scheduler(source);
        *book.write().await = None;

        assert!(scheduler.rebase().await.unwrap().is_none());
        assert_eq!(monitor.health().rebases, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_run_rebases_immediately_then_on_interval() {
        let mut source = MockSnapshotSource::new();
        let mut next = 100;
        source.expect_fetch().returning(move |_| {
            next += 10;
            Ok(snapshot(next))
        });
        let (scheduler, book, _monitor) = scheduler(source);
        let (shutdown_tx, shutdown) = watch::channel(false);

        let task = tokio::spawn(scheduler.run(shutdown));

        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(book.read().await.as_ref().unwrap().last_applied_sequence_id(), 110);

        tokio::time::sleep(Duration::from_secs(30)).await;
        assert_eq!(book.read().await.as_ref().unwrap().last_applied_sequence_id(), 120);

        shutdown_tx.send(true).unwrap();
        task.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_staleness_sweep_flags_quiet_book() {
        let mut source = MockSnapshotSource::new();
        source.expect_fetch().returning(|_| Ok(snapshot(100)));
        let (scheduler, book, monitor) = scheduler(source);
        scheduler.rebase().await.unwrap();

        assert_eq!(scheduler.check_staleness().await, Some(false));
        tokio::time::advance(Duration::from_secs(6)).await;
        assert_eq!(scheduler.check_staleness().await, Some(true));

        assert!(book.read().await.as_ref().unwrap().is_stale());
        assert!(monitor
            .alerts_since(0)
            .iter()
            .any(|a| a.kind == crate::quality::AlertKind::Staleness));
    }

    #[test]
    fn test_rest_url() {
        let source =
            RestSnapshotSource::new("https://api.binance.com/api/v3/", 100, Duration::from_secs(5))
                .unwrap();
        assert_eq!(
            source.url("BTCUSDT"),
            "https://api.binance.com/api/v3/depth?symbol=BTCUSDT&limit=100"
        );
    }
}
