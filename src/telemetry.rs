//! Prometheus metrics for the consistency engine

use prometheus::{
    Encoder, HistogramOpts, HistogramVec, IntCounterVec, IntGaugeVec, Opts, Registry,
    TextEncoder,
};

use crate::error::{MarketDataError, Result};

/// Engine-wide metric families, labelled by symbol (and stream where relevant)
#[derive(Clone)]
pub struct EngineMetrics {
    registry: Registry,
    pub diffs_applied: IntCounterVec,
    pub diffs_evicted: IntCounterVec,
    pub sequence_gaps: IntCounterVec,
    pub trade_gaps: IntCounterVec,
    pub trades_missed: IntCounterVec,
    pub malformed_messages: IntCounterVec,
    pub snapshot_failures: IntCounterVec,
    pub rebases: IntCounterVec,
    pub reconnect_attempts: IntCounterVec,
    pub feed_latency_ms: HistogramVec,
    pub book_stale: IntGaugeVec,
}

impl EngineMetrics {
    pub fn new() -> Result<Self> {
        let registry = Registry::new_custom(Some("book_sync".to_string()), None)?;

        let counter = |name: &str, help: &str, labels: &[&str]| -> Result<IntCounterVec> {
            let metric = IntCounterVec::new(Opts::new(name, help), labels)?;
            registry.register(Box::new(metric.clone()))?;
            Ok(metric)
        };

        let diffs_applied = counter("diffs_applied_total", "Depth diffs applied", &["symbol"])?;
        let diffs_evicted = counter(
            "diffs_evicted_total",
            "Buffered diffs dropped because the buffer was full",
            &["symbol"],
        )?;
        let sequence_gaps = counter("sequence_gaps_total", "Depth sequence gaps", &["symbol"])?;
        let trade_gaps = counter("trade_gaps_total", "Trade id discontinuities", &["symbol"])?;
        let trades_missed = counter(
            "trades_missed_total",
            "Trade ids skipped across discontinuities",
            &["symbol"],
        )?;
        let malformed_messages = counter(
            "malformed_messages_total",
            "Inbound messages dropped as malformed",
            &["symbol", "stream"],
        )?;
        let snapshot_failures = counter(
            "snapshot_failures_total",
            "Failed snapshot fetches",
            &["symbol"],
        )?;
        let rebases = counter("rebases_total", "Snapshot rebases applied", &["symbol"])?;
        let reconnect_attempts = counter(
            "reconnect_attempts_total",
            "Connection attempts after a failure",
            &["symbol", "stream"],
        )?;

        let feed_latency_ms = HistogramVec::new(
            HistogramOpts::new("feed_latency_ms", "Receive time minus exchange event time")
                .buckets(vec![1.0, 5.0, 10.0, 25.0, 50.0, 100.0, 250.0, 500.0, 1000.0, 5000.0]),
            &["symbol"],
        )?;
        registry.register(Box::new(feed_latency_ms.clone()))?;

        let book_stale = IntGaugeVec::new(
            Opts::new("book_stale", "1 when the book is last-known rather than current"),
            &["symbol"],
        )?;
        registry.register(Box::new(book_stale.clone()))?;

        Ok(Self {
            registry,
            diffs_applied,
            diffs_evicted,
            sequence_gaps,
            trade_gaps,
            trades_missed,
            malformed_messages,
            snapshot_failures,
            rebases,
            reconnect_attempts,
            feed_latency_ms,
            book_stale,
        })
    }

    /// Prometheus text exposition of every registered family
    pub fn render(&self) -> Result<String> {
        let encoder = TextEncoder::new();
        let mut buffer = Vec::new();
        encoder.encode(&self.registry.gather(), &mut buffer)?;
        String::from_utf8(buffer).map_err(|e| MarketDataError::MetricsError(e.to_string()))
    }
}

impl std::fmt::Debug for EngineMetrics {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EngineMetrics").finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_render_contains_labelled_series() {
        let metrics = EngineMetrics::new().unwrap();
        metrics.sequence_gaps.with_label_values(&["BTCUSDT"]).inc();
        metrics
            .malformed_messages
            .with_label_values(&["BTCUSDT", "depth"])
            .inc_by(3);

        let text = metrics.render().unwrap();
        assert!(text.contains("book_sync_sequence_gaps_total{symbol=\"BTCUSDT\"} 1"));
        assert!(text.contains(
            "book_sync_malformed_messages_total{stream=\"depth\",symbol=\"BTCUSDT\"} 3"
        ));
    }
}
