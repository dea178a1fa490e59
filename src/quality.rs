//! Feed quality monitoring
//!
//! Observes what the engine applies (latency, sequence gaps, trade id gaps,
//! malformed input, connection transitions, snapshot failures) and raises
//! alerts into a bounded ring. It never mutates book or trade state.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard};
use tracing::{debug, info, warn};

use crate::config::QualitySettings;
use crate::feed::ConnectionState;
use crate::model::{StreamKind, Trade};
use crate::orderbook::{DiffOutcome, RebaseReport};
use crate::telemetry::EngineMetrics;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AlertKind {
    SequenceGap,
    BufferOverflow,
    TradeGap,
    MalformedMessage,
    SnapshotFailure,
    Staleness,
    ConnectionFailed,
    ReconnectExhausted,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Info,
    Warning,
    Critical,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Alert {
    /// Monotonic per-monitor id; poll with [`QualityMonitor::alerts_since`]
    pub id: u64,
    pub symbol: String,
    pub kind: AlertKind,
    pub severity: Severity,
    pub message: String,
    pub raised_at: DateTime<Utc>,
}

/// Discontinuity in trade ids
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TradeGap {
    pub previous_id: u64,
    pub next_id: u64,
    pub missing: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Transition {
    pub stream: StreamKind,
    pub from: ConnectionState,
    pub to: ConnectionState,
    pub at: DateTime<Utc>,
    pub error: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LatencyStats {
    pub samples: usize,
    pub p50_ms: Option<i64>,
    pub p95_ms: Option<i64>,
    pub p99_ms: Option<i64>,
}

/// Read-only health summary for one symbol
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthSummary {
    pub symbol: String,
    pub latency: LatencyStats,
    pub diffs_applied: u64,
    pub diffs_evicted: u64,
    pub sequence_gaps: u64,
    pub rebases: u64,
    pub last_rebase_at: Option<DateTime<Utc>>,
    pub trades_observed: u64,
    pub trade_gaps: u64,
    pub trades_missed: u64,
    pub trades_out_of_order: u64,
    pub last_trade_gap: Option<TradeGap>,
    pub malformed_messages: u64,
    pub consecutive_snapshot_failures: u32,
    pub recent_transitions: Vec<Transition>,
    pub alerts_raised: u64,
}

#[derive(Debug, Default)]
struct MonitorState {
    latency_ms: VecDeque<i64>,
    diffs_applied: u64,
    diffs_evicted: u64,
    sequence_gaps: u64,
    rebases: u64,
    last_rebase_at: Option<DateTime<Utc>>,
    last_trade_id: Option<u64>,
    trades_observed: u64,
    trade_gaps: u64,
    trades_missed: u64,
    trades_out_of_order: u64,
    last_trade_gap: Option<TradeGap>,
    malformed_messages: u64,
    consecutive_snapshot_failures: u32,
    is_stale: bool,
    transitions: VecDeque<Transition>,
    alerts: VecDeque<Alert>,
    next_alert_id: u64,
}

/// Per-symbol quality monitor
#[derive(Debug)]
pub struct QualityMonitor {
    symbol: String,
    settings: QualitySettings,
    failure_alert_threshold: u32,
    metrics: Arc<EngineMetrics>,
    state: Mutex<MonitorState>,
}

impl QualityMonitor {
    pub fn new(
        symbol: &str,
        settings: QualitySettings,
        failure_alert_threshold: u32,
        metrics: Arc<EngineMetrics>,
    ) -> Self {
        Self {
            symbol: symbol.to_string(),
            settings,
            failure_alert_threshold: failure_alert_threshold.max(1),
            metrics,
            state: Mutex::new(MonitorState::default()),
        }
    }

    fn lock(&self) -> MutexGuard<'_, MonitorState> {
        match self.state.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    /// Record one receive-minus-event latency sample. Event times that do
    /// not fit the clock's range are dropped.
    pub fn record_latency(&self, event_time_ms: u64, received_at_ms: i64) {
        let Some(latency) = i64::try_from(event_time_ms)
            .ok()
            .and_then(|event| received_at_ms.checked_sub(event))
        else {
            debug!(symbol = %self.symbol, event_time_ms, "Dropped out-of-range event time");
            return;
        };
        let latency = latency.max(0);
        self.metrics
            .feed_latency_ms
            .with_label_values(&[&self.symbol])
            .observe(latency as f64);

        let mut state = self.lock();
        if state.latency_ms.len() >= self.settings.latency_window.max(1) {
            state.latency_ms.pop_front();
        }
        state.latency_ms.push_back(latency);
    }

    /// Account for a diff the store has just processed
    pub fn record_diff(&self, outcome: &DiffOutcome) {
        let mut state = self.lock();
        match outcome {
            DiffOutcome::Applied => {
                state.diffs_applied += 1;
                self.metrics.diffs_applied.with_label_values(&[&self.symbol]).inc();
            }
            DiffOutcome::GapDetected {
                expected_previous,
                received_previous,
                ..
            } => {
                self.note_sequence_gap(&mut state, *expected_previous, *received_previous);
            }
            DiffOutcome::Stale | DiffOutcome::Pending { .. } | DiffOutcome::Buffered { .. } => {}
        }

        let evicted = outcome.evicted();
        if evicted > 0 {
            self.note_eviction(&mut state, evicted);
        }
    }

    fn note_sequence_gap(&self, state: &mut MonitorState, expected: u64, received: u64) {
        state.sequence_gaps += 1;
        self.metrics.sequence_gaps.with_label_values(&[&self.symbol]).inc();
        self.push_alert(
            state,
            AlertKind::SequenceGap,
            Severity::Warning,
            format!(
                "expected previous id {}, received {}; holding diffs until next rebase",
                expected, received
            ),
        );
    }

    fn note_eviction(&self, state: &mut MonitorState, evicted: usize) {
        state.diffs_evicted += evicted as u64;
        self.metrics
            .diffs_evicted
            .with_label_values(&[&self.symbol])
            .inc_by(evicted as u64);
        self.push_alert(
            state,
            AlertKind::BufferOverflow,
            Severity::Warning,
            format!("diff buffer full, dropped {} oldest", evicted),
        );
    }

    /// Account for a successful snapshot rebase
    pub fn record_rebase(&self, report: &RebaseReport) {
        let mut state = self.lock();
        state.rebases += 1;
        state.last_rebase_at = Some(Utc::now());
        state.diffs_applied += report.replayed as u64;
        self.metrics.rebases.with_label_values(&[&self.symbol]).inc();
        self.metrics
            .diffs_applied
            .with_label_values(&[&self.symbol])
            .inc_by(report.replayed as u64);

        if state.consecutive_snapshot_failures > 0 {
            info!(
                symbol = %self.symbol,
                failures = state.consecutive_snapshot_failures,
                "Snapshot fetch recovered"
            );
        }
        state.consecutive_snapshot_failures = 0;

        if let Some((expected, received)) = report.gap {
            self.note_sequence_gap(&mut state, expected, received);
        }
    }

    /// Account for a failed snapshot fetch; returns the consecutive count
    pub fn record_snapshot_failure(&self, reason: &str) -> u32 {
        self.metrics.snapshot_failures.with_label_values(&[&self.symbol]).inc();

        let mut state = self.lock();
        state.consecutive_snapshot_failures += 1;
        let failures = state.consecutive_snapshot_failures;

        self.push_alert(
            &mut state,
            AlertKind::SnapshotFailure,
            Severity::Info,
            format!("snapshot fetch failed ({} in a row): {}", failures, reason),
        );
        if failures >= self.failure_alert_threshold {
            let severity = if failures >= self.failure_alert_threshold * 2 {
                Severity::Critical
            } else {
                Severity::Warning
            };
            self.push_alert(
                &mut state,
                AlertKind::Staleness,
                severity,
                format!("{} consecutive snapshot failures; book drift is unbounded", failures),
            );
        }
        failures
    }

    /// Track stale/fresh transitions of the book
    pub fn record_staleness(&self, is_stale: bool, age_ms: u64) {
        self.metrics
            .book_stale
            .with_label_values(&[&self.symbol])
            .set(is_stale as i64);

        let mut state = self.lock();
        if is_stale && !state.is_stale {
            self.push_alert(
                &mut state,
                AlertKind::Staleness,
                Severity::Warning,
                format!("no book update for {} ms", age_ms),
            );
        }
        state.is_stale = is_stale;
    }

    /// Begin a new trade session; ids are only expected contiguous within one
    pub fn start_trade_session(&self) {
        self.lock().last_trade_id = None;
    }

    /// Check a trade id against the previous one. Observational only.
    pub fn observe_trade(&self, trade: &Trade) -> Option<TradeGap> {
        let mut state = self.lock();
        state.trades_observed += 1;

        let previous = match state.last_trade_id {
            Some(previous) => previous,
            None => {
                state.last_trade_id = Some(trade.id);
                return None;
            }
        };

        if trade.id <= previous {
            state.trades_out_of_order += 1;
            return None;
        }
        state.last_trade_id = Some(trade.id);

        if trade.id == previous + 1 {
            return None;
        }

        let gap = TradeGap {
            previous_id: previous,
            next_id: trade.id,
            missing: trade.id - previous - 1,
        };
        state.trade_gaps += 1;
        state.trades_missed += gap.missing;
        state.last_trade_gap = Some(gap);
        self.metrics.trade_gaps.with_label_values(&[&self.symbol]).inc();
        self.metrics
            .trades_missed
            .with_label_values(&[&self.symbol])
            .inc_by(gap.missing);
        self.push_alert(
            &mut state,
            AlertKind::TradeGap,
            Severity::Warning,
            format!(
                "trade ids jumped {} -> {} ({} missing)",
                gap.previous_id, gap.next_id, gap.missing
            ),
        );
        Some(gap)
    }

    pub fn record_malformed(&self, stream: StreamKind, reason: &str) {
        self.metrics
            .malformed_messages
            .with_label_values(&[&self.symbol, stream.as_str()])
            .inc();

        let mut state = self.lock();
        state.malformed_messages += 1;
        // One alert per power of two keeps a garbage stream from flooding the ring.
        if state.malformed_messages.is_power_of_two() {
            let total = state.malformed_messages;
            self.push_alert(
                &mut state,
                AlertKind::MalformedMessage,
                Severity::Info,
                format!("{} malformed {} messages dropped, latest: {}", total, stream, reason),
            );
        }
    }

    pub fn record_transition(
        &self,
        stream: StreamKind,
        from: ConnectionState,
        to: ConnectionState,
        error: Option<String>,
    ) {
        let mut state = self.lock();
        if to == ConnectionState::Failed {
            self.push_alert(
                &mut state,
                AlertKind::ConnectionFailed,
                Severity::Warning,
                format!(
                    "{} connection failed: {}",
                    stream,
                    error.as_deref().unwrap_or("unknown error")
                ),
            );
        }
        if state.transitions.len() >= self.settings.transition_history.max(1) {
            state.transitions.pop_front();
        }
        state.transitions.push_back(Transition {
            stream,
            from,
            to,
            at: Utc::now(),
            error,
        });
    }

    pub fn record_reconnect_attempt(&self, stream: StreamKind) {
        self.metrics
            .reconnect_attempts
            .with_label_values(&[&self.symbol, stream.as_str()])
            .inc();
    }

    pub fn record_reconnect_exhausted(&self, stream: StreamKind, attempts: u32) {
        let mut state = self.lock();
        self.push_alert(
            &mut state,
            AlertKind::ReconnectExhausted,
            Severity::Critical,
            format!(
                "{} stream gave up after {} attempts; resubscribe or resume required",
                stream, attempts
            ),
        );
    }

    fn push_alert(
        &self,
        state: &mut MonitorState,
        kind: AlertKind,
        severity: Severity,
        message: String,
    ) {
        match severity {
            Severity::Info => {
                info!(symbol = %self.symbol, kind = ?kind, %message, "Quality alert")
            }
            _ => warn!(
                symbol = %self.symbol,
                kind = ?kind,
                severity = ?severity,
                %message,
                "Quality alert"
            ),
        }

        if state.alerts.len() >= self.settings.alert_capacity.max(1) {
            state.alerts.pop_front();
        }
        let id = state.next_alert_id;
        state.next_alert_id += 1;
        state.alerts.push_back(Alert {
            id,
            symbol: self.symbol.clone(),
            kind,
            severity,
            message,
            raised_at: Utc::now(),
        });
    }

    /// Alerts with `id >= since` still held in the ring
    pub fn alerts_since(&self, since: u64) -> Vec<Alert> {
        self.lock()
            .alerts
            .iter()
            .filter(|alert| alert.id >= since)
            .cloned()
            .collect()
    }

    pub fn latency(&self) -> LatencyStats {
        let state = self.lock();
        latency_stats(&state.latency_ms)
    }

    pub fn health(&self) -> HealthSummary {
        let state = self.lock();
        HealthSummary {
            symbol: self.symbol.clone(),
            latency: latency_stats(&state.latency_ms),
            diffs_applied: state.diffs_applied,
            diffs_evicted: state.diffs_evicted,
            sequence_gaps: state.sequence_gaps,
            rebases: state.rebases,
            last_rebase_at: state.last_rebase_at,
            trades_observed: state.trades_observed,
            trade_gaps: state.trade_gaps,
            trades_missed: state.trades_missed,
            trades_out_of_order: state.trades_out_of_order,
            last_trade_gap: state.last_trade_gap,
            malformed_messages: state.malformed_messages,
            consecutive_snapshot_failures: state.consecutive_snapshot_failures,
            recent_transitions: state.transitions.iter().cloned().collect(),
            alerts_raised: state.next_alert_id,
        }
    }
}

fn latency_stats(samples: &VecDeque<i64>) -> LatencyStats {
    let mut sorted: Vec<i64> = samples.iter().copied().collect();
    sorted.sort_unstable();
    LatencyStats {
        samples: sorted.len(),
        p50_ms: percentile_from_sorted(&sorted, 50),
        p95_ms: percentile_from_sorted(&sorted, 95),
        p99_ms: percentile_from_sorted(&sorted, 99),
    }
}

fn percentile_from_sorted(sorted_values: &[i64], percentile: usize) -> Option<i64> {
    if sorted_values.is_empty() {
        return None;
    }
    let max_index = sorted_values.len() - 1;
    let index = max_index * percentile / 100;
    sorted_values.get(index).copied()
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn monitor() -> QualityMonitor {
        QualityMonitor::new(
            "BTCUSDT",
            QualitySettings {
                latency_window: 100,
                alert_capacity: 4,
                transition_history: 3,
            },
            2,
            Arc::new(EngineMetrics::new().unwrap()),
        )
    }

    fn trade(id: u64) -> Trade {
        Trade {
            id,
            symbol: "BTCUSDT".to_string(),
            price: dec!(100),
            quantity: dec!(1),
            event_time: 0,
            taker_is_buyer: true,
        }
    }

    #[test]
    fn test_trade_gap_of_one() {
        let monitor = monitor();
        let gaps: Vec<_> = [5, 6, 8]
            .into_iter()
            .filter_map(|id| monitor.observe_trade(&trade(id)))
            .collect();

        assert_eq!(
            gaps,
            vec![TradeGap {
                previous_id: 6,
                next_id: 8,
                missing: 1
            }]
        );
        let health = monitor.health();
        assert_eq!(health.trade_gaps, 1);
        assert_eq!(health.trades_missed, 1);
    }

    #[test]
    fn test_new_session_resets_trade_continuity() {
        let monitor = monitor();
        monitor.observe_trade(&trade(10));
        monitor.start_trade_session();
        assert_eq!(monitor.observe_trade(&trade(50)), None);
        assert_eq!(monitor.observe_trade(&trade(49)), None);
        assert_eq!(monitor.health().trades_out_of_order, 1);
    }

    #[test]
    fn test_latency_percentiles() {
        let monitor = monitor();
        for latency in 1..=100 {
            monitor.record_latency(1_000, 1_000 + latency);
        }
        let stats = monitor.latency();
        assert_eq!(stats.samples, 100);
        assert_eq!(stats.p50_ms, Some(50));
        assert_eq!(stats.p95_ms, Some(95));
        assert_eq!(stats.p99_ms, Some(99));
    }

    #[test]
    fn test_latency_window_is_bounded_and_clamped() {
        let monitor = monitor();
        for _ in 0..150 {
            monitor.record_latency(2_000, 1_000);
        }
        let stats = monitor.latency();
        assert_eq!(stats.samples, 100);
        assert_eq!(stats.p99_ms, Some(0));
    }

    #[test]
    fn test_out_of_range_event_time_is_dropped() {
        let monitor = monitor();
        monitor.record_latency(9_223_372_036_854_775_808, 1_700_000_000_000);
        monitor.record_latency(u64::MAX, i64::MIN);
        assert_eq!(monitor.latency().samples, 0);

        monitor.record_latency(1_699_999_999_990, 1_700_000_000_000);
        assert_eq!(monitor.latency().samples, 1);
    }

    #[test]
    fn test_alert_ring_is_bounded() {
        let monitor = monitor();
        for id in (0..20).step_by(2) {
            monitor.observe_trade(&trade(id));
        }
        let alerts = monitor.alerts_since(0);
        assert_eq!(alerts.len(), 4);
        assert!(alerts.iter().all(|a| a.kind == AlertKind::TradeGap));
        assert_eq!(monitor.alerts_since(8).len(), 1);
        assert_eq!(monitor.health().alerts_raised, 9);
    }

    #[test]
    fn test_snapshot_failures_escalate_to_staleness() {
        let monitor = monitor();
        assert_eq!(monitor.record_snapshot_failure("timeout"), 1);
        assert!(!monitor
            .alerts_since(0)
            .iter()
            .any(|a| a.kind == AlertKind::Staleness));

        assert_eq!(monitor.record_snapshot_failure("timeout"), 2);
        assert!(monitor
            .alerts_since(0)
            .iter()
            .any(|a| a.kind == AlertKind::Staleness && a.severity == Severity::Warning));

        monitor.record_rebase(&RebaseReport::default());
        assert_eq!(monitor.health().consecutive_snapshot_failures, 0);
    }

    #[test]
    fn test_gap_outcome_counts() {
        let monitor = monitor();
        monitor.record_diff(&DiffOutcome::Applied);
        monitor.record_diff(&DiffOutcome::GapDetected {
            expected_previous: 10,
            received_previous: 12,
            evicted: 0,
        });
        monitor.record_diff(&DiffOutcome::Buffered { evicted: 2 });

        let health = monitor.health();
        assert_eq!(health.diffs_applied, 1);
        assert_eq!(health.sequence_gaps, 1);
        assert_eq!(health.diffs_evicted, 2);
    }

    #[test]
    fn test_transition_history_is_bounded() {
        let monitor = monitor();
        use ConnectionState::*;
        let path = [(Idle, Connecting), (Connecting, Open), (Open, Failed), (Idle, Connecting)];
        for (from, to) in path {
            monitor.record_transition(StreamKind::Depth, from, to, None);
        }
        let transitions = monitor.health().recent_transitions;
        assert_eq!(transitions.len(), 3);
        assert_eq!(transitions[0].to, ConnectionState::Open);
        assert!(monitor
            .alerts_since(0)
            .iter()
            .any(|a| a.kind == AlertKind::ConnectionFailed));
    }
}
