//! One transport session to one logical stream
//!
//! `Idle → Connecting → Open → {Closing → Closed | Failed}`. A connection is
//! never reused; the supervisor builds a new one for every attempt.

use chrono::Utc;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::time::{interval_at, timeout, Instant, MissedTickBehavior};
use tracing::{debug, info, trace, warn};

use super::{ConnectionState, ConnectionStatus, Connector, FeedEvent, Frame, Transport};
use crate::error::{MarketDataError, Result};
use crate::model::StreamKind;
use crate::parser::ParsedMessage;
use crate::quality::QualityMonitor;
use crate::rate_limit::{Admission, RateLimiter};

/// Unanswered probes tolerated before the session is declared dead
const MAX_MISSED_PROBES: u32 = 2;

pub struct FeedConnection {
    symbol: String,
    stream: StreamKind,
    url: String,
    state: ConnectionState,
    transport: Option<Box<dyn Transport>>,
    probe_interval: Duration,
    connect_timeout: Duration,
    unanswered_probes: u32,
    probe_nonce: u64,
    messages: u64,
    malformed: u64,
    status: Arc<watch::Sender<ConnectionStatus>>,
    monitor: Arc<QualityMonitor>,
}

impl FeedConnection {
    pub fn new(
        symbol: &str,
        stream: StreamKind,
        url: &str,
        probe_interval: Duration,
        connect_timeout: Duration,
        status: Arc<watch::Sender<ConnectionStatus>>,
        monitor: Arc<QualityMonitor>,
    ) -> Self {
        status.send_modify(|s| s.state = ConnectionState::Idle);
        Self {
            symbol: symbol.to_string(),
            stream,
            url: url.to_string(),
            state: ConnectionState::Idle,
            transport: None,
            probe_interval,
            connect_timeout,
            unanswered_probes: 0,
            probe_nonce: 0,
            messages: 0,
            malformed: 0,
            status,
            monitor,
        }
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    /// Whether the session delivered at least one well-formed message
    pub fn delivered_any(&self) -> bool {
        self.messages > 0
    }

    pub fn malformed_count(&self) -> u64 {
        self.malformed
    }

    fn transition(&mut self, next: ConnectionState, error: Option<String>) -> Result<()> {
        if !self.state.can_transition_to(next) {
            return Err(MarketDataError::InvalidState(format!(
                "{:?} -> {:?}",
                self.state, next
            )));
        }

        let previous = self.state;
        self.state = next;
        debug!(
            symbol = %self.symbol,
            stream = %self.stream,
            from = ?previous,
            to = ?next,
            "Connection state change"
        );

        self.status.send_modify(|s| {
            s.state = next;
            if next == ConnectionState::Open {
                s.opened_at = Some(Utc::now());
            }
            if let Some(err) = &error {
                s.last_error = Some(err.clone());
            }
        });
        self.monitor.record_transition(self.stream, previous, next, error);
        Ok(())
    }

    fn fail(&mut self, err: MarketDataError) -> MarketDataError {
        warn!(symbol = %self.symbol, stream = %self.stream, error = %err, "Feed connection failed");
        self.transport = None;
        if let Err(invalid) = self.transition(ConnectionState::Failed, Some(err.to_string())) {
            debug!(error = %invalid, "Connection already terminal");
        }
        err
    }

    /// Leave `Idle`. Fails fast, without touching the network, when the rate
    /// limiter denies admission.
    pub async fn connect(
        &mut self,
        limiter: &RateLimiter,
        connector: &dyn Connector,
    ) -> Result<()> {
        if self.state != ConnectionState::Idle {
            return Err(MarketDataError::InvalidState(format!(
                "connect() from {:?}",
                self.state
            )));
        }

        if let Admission::Denied { retry_after } = limiter.try_acquire() {
            return Err(self.fail(MarketDataError::RateLimited { retry_after }));
        }

        self.transition(ConnectionState::Connecting, None)?;

        match timeout(self.connect_timeout, connector.connect(&self.url)).await {
            Ok(Ok(transport)) => {
                self.transport = Some(transport);
                self.transition(ConnectionState::Open, None)?;
                info!(symbol = %self.symbol, stream = %self.stream, "Feed connection open");
                Ok(())
            }
            Ok(Err(e)) => Err(self.fail(e)),
            Err(_) => Err(self.fail(MarketDataError::WebSocketConnection(format!(
                "connect timed out after {:?}",
                self.connect_timeout
            )))),
        }
    }

    /// Pump the open session. `Ok` means it was closed on request, either
    /// by shutdown or because the consumer went away.
    pub async fn run(
        &mut self,
        sink: &mpsc::Sender<FeedEvent>,
        shutdown: &mut watch::Receiver<bool>,
    ) -> Result<()> {
        if self.state != ConnectionState::Open {
            return Err(MarketDataError::InvalidState(format!("run() from {:?}", self.state)));
        }

        if sink
            .send(FeedEvent::SessionStarted { stream: self.stream })
            .await
            .is_err()
        {
            self.close().await;
            return Ok(());
        }

        let mut probe = interval_at(Instant::now() + self.probe_interval, self.probe_interval);
        probe.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            let Some(transport) = self.transport.as_mut() else {
                return Err(self.fail(MarketDataError::ConnectionClosed));
            };

            tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        self.close().await;
                        return Ok(());
                    }
                }
                _ = probe.tick() => {
                    if self.unanswered_probes >= MAX_MISSED_PROBES {
                        return Err(self.fail(MarketDataError::LivenessTimeout {
                            missed: self.unanswered_probes,
                        }));
                    }
                    if let Err(e) = self.send_probe().await {
                        return Err(self.fail(e));
                    }
                }
                frame = transport.recv() => {
                    match frame {
                        Some(Ok(Frame::Text(text))) => {
                            if !self.handle_text(&text, sink).await {
                                self.close().await;
                                return Ok(());
                            }
                        }
                        Some(Ok(Frame::Binary(data))) => {
                            let text = String::from_utf8_lossy(&data).to_string();
                            if !self.handle_text(&text, sink).await {
                                self.close().await;
                                return Ok(());
                            }
                        }
                        Some(Ok(Frame::Ping(payload))) => {
                            if let Some(transport) = self.transport.as_mut() {
                                if let Err(e) = transport.send_pong(payload).await {
                                    return Err(self.fail(e));
                                }
                            }
                        }
                        Some(Ok(Frame::Pong(_))) => {
                            trace!(symbol = %self.symbol, "Received pong");
                            self.unanswered_probes = 0;
                        }
                        Some(Ok(Frame::Close)) => {
                            return Err(self.fail(MarketDataError::ConnectionClosed));
                        }
                        Some(Err(e)) => return Err(self.fail(e)),
                        None => return Err(self.fail(MarketDataError::ConnectionClosed)),
                    }
                }
            }
        }
    }

    async fn send_probe(&mut self) -> Result<()> {
        self.probe_nonce += 1;
        self.unanswered_probes += 1;
        let payload = self.probe_nonce.to_be_bytes().to_vec();
        match self.transport.as_mut() {
            Some(transport) => transport.send_ping(payload).await,
            None => Err(MarketDataError::ConnectionClosed),
        }
    }

    /// Parse and forward one message. Returns false once the consumer is gone.
    async fn handle_text(&mut self, raw: &str, sink: &mpsc::Sender<FeedEvent>) -> bool {
        let parsed = match ParsedMessage::parse(raw) {
            Ok(parsed) => parsed,
            Err(e) => {
                self.malformed += 1;
                let total = self.malformed;
                self.status.send_modify(|s| s.malformed_messages = total);
                self.monitor.record_malformed(self.stream, &e.to_string());
                debug!(
                    symbol = %self.symbol,
                    stream = %self.stream,
                    error = %e,
                    "Dropped malformed message"
                );
                return true;
            }
        };

        if self.messages == 0 {
            self.status.send_modify(|s| s.attempt_count = 0);
        }
        self.messages += 1;

        let received_at_ms = Utc::now().timestamp_millis();
        let event = match parsed {
            ParsedMessage::Diff(diff) => FeedEvent::Diff {
                diff,
                received_at_ms,
            },
            ParsedMessage::Trade(trade) => FeedEvent::Trade {
                trade,
                received_at_ms,
            },
            ParsedMessage::Candle(candle) => FeedEvent::Candle { candle },
            ParsedMessage::Ack { id } => {
                debug!(symbol = %self.symbol, id, "Subscription acknowledged");
                return true;
            }
            ParsedMessage::Pong { nonce } => {
                trace!(symbol = %self.symbol, nonce, "Keep-alive response");
                self.unanswered_probes = 0;
                return true;
            }
            ParsedMessage::Unknown(msg) => {
                trace!(msg = %msg, "Unknown message type");
                return true;
            }
        };

        sink.send(event).await.is_ok()
    }

    /// Close an open session: `Open → Closing → Closed`
    pub async fn close(&mut self) {
        if self.state != ConnectionState::Open {
            return;
        }
        if self.transition(ConnectionState::Closing, None).is_err() {
            return;
        }
        if let Some(mut transport) = self.transport.take() {
            transport.close().await;
        }
        let _ = self.transition(ConnectionState::Closed, None);
        info!(symbol = %self.symbol, stream = %self.stream, "Feed connection closed");
    }
}
