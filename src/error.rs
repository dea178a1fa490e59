//! Error types for the consistency engine

use std::time::Duration;
use thiserror::Error;

/// Market data engine errors
#[derive(Error, Debug)]
pub enum MarketDataError {
    #[error("WebSocket connection error: {0}")]
    WebSocketConnection(String),

    #[error("WebSocket message error: {0}")]
    WebSocketMessage(String),

    #[error("Failed to parse message: {0}")]
    ParseError(String),

    #[error("REST API error: {0}")]
    RestApiError(String),

    #[error("Snapshot fetch failed for {symbol}: {reason}")]
    SnapshotFetch { symbol: String, reason: String },

    #[error("IPC error: {0}")]
    IpcError(String),

    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error("Serialization error: {0}")]
    SerializationError(String),

    #[error("Metrics error: {0}")]
    MetricsError(String),

    #[error("Connection attempt rate limited, retry after {retry_after:?}")]
    RateLimited { retry_after: Duration },

    #[error("Liveness probe unanswered {missed} times")]
    LivenessTimeout { missed: u32 },

    #[error("Connection closed by peer")]
    ConnectionClosed,

    #[error("Reconnect attempts exhausted after {attempts} attempts")]
    ReconnectExhausted { attempts: u32 },

    #[error("Symbol not subscribed: {0}")]
    NotSubscribed(String),

    #[error("Invalid connection state transition: {0}")]
    InvalidState(String),

    #[error("Invalid query: {0}")]
    InvalidQuery(String),
}

impl MarketDataError {
    /// Whether the error is recovered automatically by backoff or the next
    /// reconciliation tick.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            MarketDataError::WebSocketConnection(_)
                | MarketDataError::WebSocketMessage(_)
                | MarketDataError::RestApiError(_)
                | MarketDataError::SnapshotFetch { .. }
                | MarketDataError::RateLimited { .. }
                | MarketDataError::LivenessTimeout { .. }
                | MarketDataError::ConnectionClosed
        )
    }
}

impl From<tokio_tungstenite::tungstenite::Error> for MarketDataError {
    fn from(err: tokio_tungstenite::tungstenite::Error) -> Self {
        MarketDataError::WebSocketConnection(err.to_string())
    }
}

impl From<serde_json::Error> for MarketDataError {
    fn from(err: serde_json::Error) -> Self {
        MarketDataError::ParseError(err.to_string())
    }
}

impl From<reqwest::Error> for MarketDataError {
    fn from(err: reqwest::Error) -> Self {
        MarketDataError::RestApiError(err.to_string())
    }
}

impl From<std::io::Error> for MarketDataError {
    fn from(err: std::io::Error) -> Self {
        MarketDataError::IpcError(err.to_string())
    }
}

impl From<prometheus::Error> for MarketDataError {
    fn from(err: prometheus::Error) -> Self {
        MarketDataError::MetricsError(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, MarketDataError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transient_classification() {
        assert!(MarketDataError::ConnectionClosed.is_transient());
        assert!(MarketDataError::RateLimited {
            retry_after: Duration::from_secs(1)
        }
        .is_transient());
        assert!(!MarketDataError::ReconnectExhausted { attempts: 3 }.is_transient());
        assert!(!MarketDataError::ConfigError("bad".into()).is_transient());
        assert!(!MarketDataError::InvalidState("connect() from Open".into()).is_transient());
        assert!(!MarketDataError::InvalidQuery("tick".into()).is_transient());
    }
}
