//! Market data consistency engine
//!
//! Owns one subscription per symbol: a store behind a single-writer lock,
//! one reconnect supervisor per stream, a diff-apply task and a
//! reconciliation scheduler. Readers get owned views.

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, watch, Notify, RwLock};
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tracing::{debug, info, warn};

use crate::config::Config;
use crate::error::{MarketDataError, Result};
use crate::feed::{stream_url, ConnectionStatus, Connector, FeedEvent, ReconnectSupervisor};
use crate::model::{Candle, StreamKind, Trade};
use crate::orderbook::{AggregatedBook, BookView, DiffOutcome, OrderBookStore};
use crate::quality::{Alert, HealthSummary, QualityMonitor};
use crate::rate_limit::RateLimiterRegistry;
use crate::reconcile::{ReconciliationScheduler, SnapshotSource};
use crate::telemetry::EngineMetrics;

/// Store slot shared by the apply task, the scheduler and readers. `None`
/// once the symbol is unsubscribed.
pub type BookSlot = Arc<RwLock<Option<OrderBookStore>>>;

/// How long unsubscribe waits for a task before aborting it
const TASK_STOP_TIMEOUT: Duration = Duration::from_secs(5);

/// Event broadcast to downstream consumers
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EngineEvent {
    BookChanged { symbol: String, sequence_id: u64 },
    TradeObserved(Trade),
    CandleObserved(Candle),
}

/// Connection and quality health for one symbol
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConnectionHealth {
    pub symbol: String,
    pub streams: Vec<ConnectionStatus>,
    pub is_stale: bool,
    pub quality: HealthSummary,
}

impl ConnectionHealth {
    /// Any stream stopped retrying and needs a resume
    pub fn needs_resume(&self) -> bool {
        self.streams.iter().any(|s| s.exhausted)
    }
}

struct StreamHandle {
    status: watch::Receiver<ConnectionStatus>,
    resume: Arc<Notify>,
}

struct Subscription {
    book: BookSlot,
    monitor: Arc<QualityMonitor>,
    streams: Vec<StreamHandle>,
    shutdown: watch::Sender<bool>,
    tasks: Vec<JoinHandle<()>>,
}

pub struct MarketDataEngine {
    config: Config,
    limiters: RateLimiterRegistry,
    connector: Arc<dyn Connector>,
    snapshots: Arc<dyn SnapshotSource>,
    subscriptions: RwLock<HashMap<String, Subscription>>,
    events: broadcast::Sender<EngineEvent>,
    metrics: Arc<EngineMetrics>,
}

impl MarketDataEngine {
    pub fn new(
        config: Config,
        connector: Arc<dyn Connector>,
        snapshots: Arc<dyn SnapshotSource>,
    ) -> Result<Self> {
        config.validate()?;
        let metrics = Arc::new(EngineMetrics::new()?);
        let (events, _) = broadcast::channel(config.event_channel_capacity);
        Ok(Self {
            limiters: RateLimiterRegistry::new(config.rate_limit.clone()),
            config,
            connector,
            snapshots,
            subscriptions: RwLock::new(HashMap::new()),
            events,
            metrics,
        })
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn metrics(&self) -> Arc<EngineMetrics> {
        self.metrics.clone()
    }

    /// Receive every downstream event from now on
    pub fn events(&self) -> broadcast::Receiver<EngineEvent> {
        self.events.subscribe()
    }

    pub async fn symbols(&self) -> Vec<String> {
        let mut symbols: Vec<String> = self
            .subscriptions
            .read()
            .await
            .keys()
            .cloned()
            .collect();
        symbols.sort();
        symbols
    }

    fn streams(&self) -> Vec<StreamKind> {
        let mut streams = vec![StreamKind::Depth, StreamKind::Trades];
        if self.config.candle_interval.is_some() {
            streams.push(StreamKind::Candles);
        }
        streams
    }

    /// Start feeds, the apply task and the scheduler for `symbol`.
    /// Subscribing twice is a no-op.
    pub async fn subscribe(&self, symbol: &str) -> Result<()> {
        let symbol = normalize(symbol);
        let mut subscriptions = self.subscriptions.write().await;
        if subscriptions.contains_key(&symbol) {
            debug!(symbol = %symbol, "Already subscribed");
            return Ok(());
        }

        let book: BookSlot = Arc::new(RwLock::new(Some(OrderBookStore::new(
            &symbol,
            self.config.book.max_buffered_diffs,
        ))));
        let monitor = Arc::new(QualityMonitor::new(
            &symbol,
            self.config.quality.clone(),
            self.config.reconciliation.failure_alert_threshold,
            self.metrics.clone(),
        ));
        let (shutdown, shutdown_rx) = watch::channel(false);
        let (feed_tx, feed_rx) = mpsc::channel(self.config.event_channel_capacity);
        let limiter = self.limiters.for_endpoint(&self.config.ws_endpoint);

        let mut streams = Vec::new();
        let mut tasks = Vec::new();

        for kind in self.streams() {
            let url = stream_url(
                &self.config.ws_endpoint,
                &symbol,
                kind,
                self.config.candle_interval.as_deref(),
            );
            let supervisor = ReconnectSupervisor::new(
                &symbol,
                kind,
                url,
                &self.config.reconnect,
                Duration::from_millis(self.config.connection.probe_interval_ms),
                Duration::from_millis(self.config.connection.connect_timeout_ms),
                limiter.clone(),
                self.connector.clone(),
                monitor.clone(),
            );
            streams.push(StreamHandle {
                status: supervisor.status(),
                resume: supervisor.resume_handle(),
            });
            tasks.push(tokio::spawn(supervisor.run(feed_tx.clone(), shutdown_rx.clone())));
        }
        drop(feed_tx);

        tasks.push(tokio::spawn(apply_feed(
            symbol.clone(),
            book.clone(),
            monitor.clone(),
            self.events.clone(),
            feed_rx,
        )));

        let scheduler = ReconciliationScheduler::new(
            &symbol,
            self.snapshots.clone(),
            book.clone(),
            monitor.clone(),
            self.events.clone(),
            Duration::from_millis(self.config.reconciliation.interval_ms),
            Duration::from_millis(self.config.reconciliation.stale_check_interval_ms),
            self.config.stale_after(),
        );
        tasks.push(tokio::spawn(scheduler.run(shutdown_rx)));

        info!(symbol = %symbol, streams = streams.len(), "Subscribed");
        subscriptions.insert(
            symbol,
            Subscription {
                book,
                monitor,
                streams,
                shutdown,
                tasks,
            },
        );
        Ok(())
    }

    /// Tear down every task for `symbol` and discard its store. Diffs that
    /// arrive after this starts find no store and are dropped.
    pub async fn unsubscribe(&self, symbol: &str) -> Result<()> {
        let symbol = normalize(symbol);
        let subscription = self
            .subscriptions
            .write()
            .await
            .remove(&symbol)
            .ok_or_else(|| MarketDataError::NotSubscribed(symbol.clone()))?;

        *subscription.book.write().await = None;
        let _ = subscription.shutdown.send(true);

        for mut task in subscription.tasks {
            if timeout(TASK_STOP_TIMEOUT, &mut task).await.is_err() {
                warn!(symbol = %symbol, "Task did not stop in time, aborting");
                task.abort();
            }
        }

        info!(symbol = %symbol, "Unsubscribed");
        Ok(())
    }

    /// Restart streams that exhausted their reconnect attempts. Returns how
    /// many were resumed.
    pub async fn resume(&self, symbol: &str) -> Result<usize> {
        let symbol = normalize(symbol);
        let subscriptions = self.subscriptions.read().await;
        let subscription = subscriptions
            .get(&symbol)
            .ok_or_else(|| MarketDataError::NotSubscribed(symbol.clone()))?;

        let mut resumed = 0;
        for stream in &subscription.streams {
            if stream.status.borrow().exhausted {
                stream.resume.notify_one();
                resumed += 1;
            }
        }
        info!(symbol = %symbol, resumed, "Resume requested");
        Ok(resumed)
    }

    async fn book(&self, symbol: &str) -> Result<BookSlot> {
        let symbol = normalize(symbol);
        self.subscriptions
            .read()
            .await
            .get(&symbol)
            .map(|s| s.book.clone())
            .ok_or(MarketDataError::NotSubscribed(symbol))
    }

    async fn monitor(&self, symbol: &str) -> Result<Arc<QualityMonitor>> {
        let symbol = normalize(symbol);
        self.subscriptions
            .read()
            .await
            .get(&symbol)
            .map(|s| s.monitor.clone())
            .ok_or(MarketDataError::NotSubscribed(symbol))
    }

    async fn read_store<T>(
        &self,
        symbol: &str,
        read: impl FnOnce(&OrderBookStore) -> T,
    ) -> Result<T> {
        let book = self.book(symbol).await?;
        let slot = book.read().await;
        slot.as_ref()
            .map(read)
            .ok_or_else(|| MarketDataError::NotSubscribed(normalize(symbol)))
    }

    /// Last known top `depth` levels, with staleness
    pub async fn current_levels(&self, symbol: &str, depth: usize) -> Result<BookView> {
        self.read_store(symbol, |store| store.view(depth)).await
    }

    pub async fn aggregated_levels(
        &self,
        symbol: &str,
        tick_size: Decimal,
        depth: usize,
        outlier_multiple: Decimal,
    ) -> Result<AggregatedBook> {
        if tick_size <= Decimal::ZERO {
            return Err(MarketDataError::InvalidQuery(format!(
                "tick must be positive, got {}",
                tick_size
            )));
        }
        self.read_store(symbol, |store| {
            store.aggregated_levels(tick_size, depth, outlier_multiple)
        })
        .await?
    }

    pub async fn is_stale(&self, symbol: &str) -> Result<bool> {
        self.read_store(symbol, |store| store.is_stale()).await
    }

    pub async fn connection_health(&self, symbol: &str) -> Result<ConnectionHealth> {
        let symbol = normalize(symbol);
        let (streams, monitor) = {
            let subscriptions = self.subscriptions.read().await;
            let subscription = subscriptions
                .get(&symbol)
                .ok_or_else(|| MarketDataError::NotSubscribed(symbol.clone()))?;
            let streams: Vec<ConnectionStatus> = subscription
                .streams
                .iter()
                .map(|s| s.status.borrow().clone())
                .collect();
            (streams, subscription.monitor.clone())
        };
        let is_stale = self.is_stale(&symbol).await?;

        Ok(ConnectionHealth {
            symbol,
            streams,
            is_stale,
            quality: monitor.health(),
        })
    }

    /// Alerts raised for `symbol` with id at or after `since`
    pub async fn alerts(&self, symbol: &str, since: u64) -> Result<Vec<Alert>> {
        Ok(self.monitor(symbol).await?.alerts_since(since))
    }

    /// Unsubscribe every symbol
    pub async fn shutdown_all(&self) {
        for symbol in self.symbols().await {
            if let Err(e) = self.unsubscribe(&symbol).await {
                warn!(symbol = %symbol, error = %e, "Unsubscribe during shutdown failed");
            }
        }
    }
}

fn normalize(symbol: &str) -> String {
    symbol.trim().to_uppercase()
}

/// Single writer for one symbol's store. Ends when every feed is gone or
/// the store slot has been emptied.
async fn apply_feed(
    symbol: String,
    book: BookSlot,
    monitor: Arc<QualityMonitor>,
    events: broadcast::Sender<EngineEvent>,
    mut feed: mpsc::Receiver<FeedEvent>,
) {
    while let Some(event) = feed.recv().await {
        match event {
            FeedEvent::SessionStarted { stream } => {
                if stream == StreamKind::Trades {
                    monitor.start_trade_session();
                }
            }
            FeedEvent::Diff {
                diff,
                received_at_ms,
            } => {
                monitor.record_latency(diff.event_time, received_at_ms);
                let (outcome, sequence_id) = {
                    let mut slot = book.write().await;
                    let Some(store) = slot.as_mut() else {
                        break;
                    };
                    let outcome = store.apply_diff(diff);
                    (outcome, store.last_applied_sequence_id())
                };
                monitor.record_diff(&outcome);
                if outcome == DiffOutcome::Applied {
                    let _ = events.send(EngineEvent::BookChanged {
                        symbol: symbol.clone(),
                        sequence_id,
                    });
                }
            }
            FeedEvent::Trade {
                trade,
                received_at_ms,
            } => {
                monitor.record_latency(trade.event_time, received_at_ms);
                monitor.observe_trade(&trade);
                let _ = events.send(EngineEvent::TradeObserved(trade));
            }
            FeedEvent::Candle { candle } => {
                let _ = events.send(EngineEvent::CandleObserved(candle));
            }
        }
    }
    debug!(symbol = %symbol, "Apply task stopped");
}
