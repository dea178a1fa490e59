//! Reconnection supervisor
//!
//! Replaces failed connections after a jittered exponential backoff, asking
//! the shared rate limiter before every attempt. Past the attempt cap it
//! parks until resumed or shut down.

use rand::Rng;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch, Notify};
use tokio::time::sleep;
use tracing::{error, info, warn};

use super::{ConnectionStatus, Connector, FeedConnection, FeedEvent};
use crate::config::ReconnectSettings;
use crate::error::MarketDataError;
use crate::model::StreamKind;
use crate::quality::QualityMonitor;
use crate::rate_limit::RateLimiter;

/// Exponential backoff with a multiplicative jitter in [0.5, 1.5]
#[derive(Debug, Clone, Copy)]
pub struct Backoff {
    base: Duration,
    max: Duration,
}

impl Backoff {
    pub fn new(base: Duration, max: Duration) -> Self {
        Self { base, max }
    }

    pub fn from_settings(settings: &ReconnectSettings) -> Self {
        Self::new(
            Duration::from_millis(settings.base_delay_ms),
            Duration::from_millis(settings.max_delay_ms),
        )
    }

    /// `min(max, base × 2^attempt)` before jitter
    pub fn ceiling(&self, attempt: u32) -> Duration {
        let multiplier = 1u32.checked_shl(attempt.min(31)).unwrap_or(u32::MAX);
        self.base.saturating_mul(multiplier).min(self.max)
    }

    /// Delay to wait after the `attempt`-th consecutive failure
    pub fn delay(&self, attempt: u32) -> Duration {
        let jitter: f64 = rand::thread_rng().gen_range(0.5..=1.5);
        self.ceiling(attempt).mul_f64(jitter)
    }
}

/// Keeps one logical stream connected
pub struct ReconnectSupervisor {
    symbol: String,
    stream: StreamKind,
    url: String,
    max_attempts: u32,
    backoff: Backoff,
    probe_interval: Duration,
    connect_timeout: Duration,
    limiter: Arc<RateLimiter>,
    connector: Arc<dyn Connector>,
    monitor: Arc<QualityMonitor>,
    status: Arc<watch::Sender<ConnectionStatus>>,
    resume: Arc<Notify>,
}

impl ReconnectSupervisor {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        symbol: &str,
        stream: StreamKind,
        url: String,
        settings: &ReconnectSettings,
        probe_interval: Duration,
        connect_timeout: Duration,
        limiter: Arc<RateLimiter>,
        connector: Arc<dyn Connector>,
        monitor: Arc<QualityMonitor>,
    ) -> Self {
        let (status, _) = watch::channel(ConnectionStatus::new(stream));
        Self {
            symbol: symbol.to_string(),
            stream,
            url,
            max_attempts: settings.max_attempts,
            backoff: Backoff::from_settings(settings),
            probe_interval,
            connect_timeout,
            limiter,
            connector,
            monitor,
            status: Arc::new(status),
            resume: Arc::new(Notify::new()),
        }
    }

    /// Live status of the supervised stream
    pub fn status(&self) -> watch::Receiver<ConnectionStatus> {
        self.status.subscribe()
    }

    /// Handle that restarts an exhausted supervisor
    pub fn resume_handle(&self) -> Arc<Notify> {
        self.resume.clone()
    }

    /// Run until shutdown is signalled or the event consumer goes away
    pub async fn run(self, sink: mpsc::Sender<FeedEvent>, mut shutdown: watch::Receiver<bool>) {
        let mut attempt: u32 = 0;
        info!(
            symbol = %self.symbol,
            stream = %self.stream,
            url = %self.url,
            "Starting feed supervisor"
        );

        loop {
            if *shutdown.borrow() {
                return;
            }

            let mut connection = FeedConnection::new(
                &self.symbol,
                self.stream,
                &self.url,
                self.probe_interval,
                self.connect_timeout,
                self.status.clone(),
                self.monitor.clone(),
            );

            let result = match connection
                .connect(&self.limiter, self.connector.as_ref())
                .await
            {
                Ok(()) => connection.run(&sink, &mut shutdown).await,
                Err(e) => Err(e),
            };

            let err = match result {
                Ok(()) => {
                    info!(symbol = %self.symbol, stream = %self.stream, "Feed supervisor stopped");
                    return;
                }
                Err(e) => e,
            };

            if connection.delivered_any() {
                attempt = 0;
            }
            attempt = attempt.saturating_add(1);
            self.status.send_modify(|s| s.attempt_count = attempt);

            // Retrying cannot clear a non-transient error; park until resumed
            let transient = err.is_transient();
            if !transient || attempt > self.max_attempts {
                let attempts = if transient { attempt - 1 } else { attempt };
                let reason = if transient {
                    MarketDataError::ReconnectExhausted { attempts }.to_string()
                } else {
                    err.to_string()
                };
                error!(
                    symbol = %self.symbol,
                    stream = %self.stream,
                    attempts,
                    reason = %reason,
                    "Feed stopped retrying, waiting for resume"
                );
                self.monitor.record_reconnect_exhausted(self.stream, attempts);
                self.status.send_modify(|s| {
                    s.exhausted = true;
                    s.last_error = Some(reason);
                });

                tokio::select! {
                    _ = self.resume.notified() => {
                        info!(symbol = %self.symbol, stream = %self.stream, "Supervisor resumed");
                        attempt = 0;
                        self.status.send_modify(|s| {
                            s.exhausted = false;
                            s.attempt_count = 0;
                        });
                        continue;
                    }
                    changed = shutdown.changed() => {
                        if changed.is_err() || *shutdown.borrow() {
                            return;
                        }
                        continue;
                    }
                }
            }

            let mut delay = self.backoff.delay(attempt);
            if let MarketDataError::RateLimited { retry_after } = err {
                delay = delay.max(retry_after);
            }
            self.monitor.record_reconnect_attempt(self.stream);

            warn!(
                symbol = %self.symbol,
                stream = %self.stream,
                attempt,
                delay_ms = delay.as_millis() as u64,
                error = %err,
                "Reconnecting after error..."
            );

            tokio::select! {
                _ = sleep(delay) => {}
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        return;
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::QualitySettings;
    use crate::error::Result;
    use crate::feed::{ConnectionState, Transport};
    use crate::telemetry::EngineMetrics;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[test]
    fn test_backoff_bounds() {
        let backoff = Backoff::new(Duration::from_secs(1), Duration::from_secs(30));
        for n in 1..=10u32 {
            let ceiling = 30f64.min(2f64.powi(n as i32));
            assert_eq!(backoff.ceiling(n), Duration::from_secs_f64(ceiling));
            for _ in 0..200 {
                let delay = backoff.delay(n).as_secs_f64();
                assert!(delay >= 0.5 * ceiling - 1e-9, "attempt {} delay {}", n, delay);
                assert!(delay <= 1.5 * ceiling + 1e-9, "attempt {} delay {}", n, delay);
            }
        }
    }

    #[test]
    fn test_backoff_does_not_overflow() {
        let backoff = Backoff::new(Duration::from_millis(500), Duration::from_secs(60));
        assert_eq!(backoff.ceiling(u32::MAX), Duration::from_secs(60));
    }

    struct RefusingConnector {
        attempts: AtomicU32,
        fatal: bool,
    }

    impl RefusingConnector {
        fn new(fatal: bool) -> Arc<Self> {
            Arc::new(Self {
                attempts: AtomicU32::new(0),
                fatal,
            })
        }
    }

    #[async_trait]
    impl Connector for RefusingConnector {
        async fn connect(&self, _url: &str) -> Result<Box<dyn Transport>> {
            self.attempts.fetch_add(1, Ordering::SeqCst);
            if self.fatal {
                Err(MarketDataError::InvalidState("handshake rejected".into()))
            } else {
                Err(MarketDataError::WebSocketConnection("refused".into()))
            }
        }
    }

    fn supervisor(connector: Arc<RefusingConnector>, max_attempts: u32) -> ReconnectSupervisor {
        let metrics = Arc::new(EngineMetrics::new().unwrap());
        let monitor = Arc::new(QualityMonitor::new(
            "BTCUSDT",
            QualitySettings {
                latency_window: 8,
                alert_capacity: 8,
                transition_history: 8,
            },
            3,
            metrics,
        ));
        ReconnectSupervisor::new(
            "BTCUSDT",
            StreamKind::Trades,
            "ws://test/btcusdt@trade".to_string(),
            &ReconnectSettings {
                base_delay_ms: 100,
                max_delay_ms: 1_000,
                max_attempts,
            },
            Duration::from_secs(10),
            Duration::from_secs(1),
            Arc::new(RateLimiter::new(100, Duration::from_millis(1))),
            connector,
            monitor,
        )
    }

    #[tokio::test(start_paused = true)]
    async fn test_exhausts_then_resumes() {
        let connector = RefusingConnector::new(false);
        let supervisor = supervisor(connector.clone(), 3);
        let mut status = supervisor.status();
        let resume = supervisor.resume_handle();
        let (sink, _events) = mpsc::channel(8);
        let (shutdown_tx, shutdown) = watch::channel(false);

        let task = tokio::spawn(supervisor.run(sink, shutdown));

        status.wait_for(|s| s.exhausted).await.unwrap();
        assert_eq!(connector.attempts.load(Ordering::SeqCst), 4);
        assert_eq!(status.borrow().state, ConnectionState::Failed);

        // Parked: no further attempts without a resume
        tokio::time::sleep(Duration::from_secs(3600)).await;
        assert_eq!(connector.attempts.load(Ordering::SeqCst), 4);

        resume.notify_one();
        status.wait_for(|s| s.attempt_count >= 1 && !s.exhausted).await.unwrap();
        assert!(connector.attempts.load(Ordering::SeqCst) > 4);

        shutdown_tx.send(true).unwrap();
        task.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_cancels_pending_backoff() {
        let connector = RefusingConnector::new(false);
        let supervisor = supervisor(connector.clone(), 100);
        let mut status = supervisor.status();
        let (sink, _events) = mpsc::channel(8);
        let (shutdown_tx, shutdown) = watch::channel(false);

        let task = tokio::spawn(supervisor.run(sink, shutdown));
        status.wait_for(|s| s.attempt_count == 1).await.unwrap();

        shutdown_tx.send(true).unwrap();
        tokio::time::timeout(Duration::from_millis(1), task)
            .await
            .expect("supervisor should stop without waiting out the backoff")
            .unwrap();
        assert_eq!(connector.attempts.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_non_transient_error_parks_without_retrying() {
        let connector = RefusingConnector::new(true);
        let supervisor = supervisor(connector.clone(), 100);
        let mut status = supervisor.status();
        let resume = supervisor.resume_handle();
        let (sink, _events) = mpsc::channel(8);
        let (shutdown_tx, shutdown) = watch::channel(false);

        let task = tokio::spawn(supervisor.run(sink, shutdown));

        status.wait_for(|s| s.exhausted).await.unwrap();
        assert_eq!(connector.attempts.load(Ordering::SeqCst), 1);
        let last_error = status.borrow().last_error.clone().unwrap();
        assert!(last_error.contains("handshake rejected"), "{}", last_error);

        tokio::time::sleep(Duration::from_secs(3600)).await;
        assert_eq!(connector.attempts.load(Ordering::SeqCst), 1);

        // Resume gives it exactly one more try
        resume.notify_one();
        tokio::time::sleep(Duration::from_secs(3600)).await;
        assert_eq!(connector.attempts.load(Ordering::SeqCst), 2);
        assert!(status.borrow().exhausted);

        shutdown_tx.send(true).unwrap();
        task.await.unwrap();
    }
}
