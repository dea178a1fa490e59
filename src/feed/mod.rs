//! Feed module: exchange stream sessions and their reconnection
//!
//! A [`FeedConnection`] owns one transport session to one logical stream. A
//! [`ReconnectSupervisor`] replaces failed connections with fresh ones after
//! a jittered exponential backoff gated by a shared [`crate::RateLimiter`].

mod client;
mod connection;
mod supervisor;

pub use client::{stream_url, WebSocketClient, WsConnector};
pub use connection::FeedConnection;
pub use supervisor::{Backoff, ReconnectSupervisor};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::model::{Candle, OrderBookDiff, StreamKind, Trade};

/// Lifecycle of one feed connection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionState {
    Idle,
    Connecting,
    Open,
    Closing,
    Closed,
    Failed,
}

impl ConnectionState {
    pub fn can_transition_to(self, next: ConnectionState) -> bool {
        use ConnectionState::*;
        matches!(
            (self, next),
            (Idle, Connecting)
                | (Idle, Failed)
                | (Connecting, Open)
                | (Connecting, Failed)
                | (Open, Closing)
                | (Open, Failed)
                | (Closing, Closed)
                | (Closing, Failed)
        )
    }
}

/// Externally visible status of one supervised stream
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConnectionStatus {
    pub stream: StreamKind,
    pub state: ConnectionState,
    /// Consecutive failed attempts; reset on the first message of a session
    pub attempt_count: u32,
    pub last_error: Option<String>,
    pub opened_at: Option<DateTime<Utc>>,
    /// Auto-retry stopped; requires an explicit resume
    pub exhausted: bool,
    pub malformed_messages: u64,
}

impl ConnectionStatus {
    pub fn new(stream: StreamKind) -> Self {
        Self {
            stream,
            state: ConnectionState::Idle,
            attempt_count: 0,
            last_error: None,
            opened_at: None,
            exhausted: false,
            malformed_messages: 0,
        }
    }
}

/// Typed event emitted by a feed connection
#[derive(Debug, Clone)]
pub enum FeedEvent {
    /// A new session opened; trade ids restart their continuity check
    SessionStarted { stream: StreamKind },
    Diff {
        diff: OrderBookDiff,
        received_at_ms: i64,
    },
    Trade {
        trade: Trade,
        received_at_ms: i64,
    },
    Candle { candle: Candle },
}

/// Transport-level frame
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    Text(String),
    Binary(Vec<u8>),
    Ping(Vec<u8>),
    Pong(Vec<u8>),
    Close,
}

/// One established duplex session
#[async_trait]
pub trait Transport: Send {
    /// Next inbound frame; `None` once the peer has gone away. Must be
    /// cancel-safe.
    async fn recv(&mut self) -> Option<Result<Frame>>;

    async fn send_ping(&mut self, payload: Vec<u8>) -> Result<()>;

    async fn send_pong(&mut self, payload: Vec<u8>) -> Result<()>;

    async fn close(&mut self);
}

/// Opens transports; one per connection attempt
#[async_trait]
pub trait Connector: Send + Sync {
    async fn connect(&self, url: &str) -> Result<Box<dyn Transport>>;
}
