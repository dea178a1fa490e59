//! Configuration module for the consistency engine

use serde::Deserialize;
use std::env;
use std::str::FromStr;
use std::time::Duration;

use crate::error::{MarketDataError, Result};

/// Application configuration
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    /// Trading symbols to subscribe to at startup (e.g., ["BTCUSDT", "ETHUSDT"])
    pub symbols: Vec<String>,

    /// WebSocket endpoint for push streams
    pub ws_endpoint: String,

    /// REST API endpoint for snapshots
    pub rest_endpoint: String,

    /// IPC socket path for publishing engine events
    pub ipc_socket_path: String,

    /// Bind address of the health/metrics HTTP server
    pub health_addr: String,

    /// Snapshot depth requested from the REST API
    pub depth_levels: usize,

    /// Candle stream interval (e.g. "1m"); candles are not streamed when unset
    pub candle_interval: Option<String>,

    /// Capacity of the feed-to-store and downstream event channels
    pub event_channel_capacity: usize,

    pub book: BookSettings,
    pub rate_limit: RateLimitSettings,
    pub reconnect: ReconnectSettings,
    pub connection: ConnectionSettings,
    pub reconciliation: ReconciliationSettings,
    pub quality: QualitySettings,
}

/// Order book store settings
#[derive(Debug, Clone, Deserialize)]
pub struct BookSettings {
    /// Diffs held while waiting for a snapshot or a gap-resolving rebase
    pub max_buffered_diffs: usize,
    pub stale_after_ms: u64,
}

/// Per-host connection token bucket
#[derive(Debug, Clone, Deserialize)]
pub struct RateLimitSettings {
    pub capacity: u32,
    pub refill_interval_ms: u64,
}

/// Reconnect backoff settings
#[derive(Debug, Clone, Deserialize)]
pub struct ReconnectSettings {
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
    /// Soft cap; exceeding it parks the supervisor until resumed
    pub max_attempts: u32,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ConnectionSettings {
    pub probe_interval_ms: u64,
    pub connect_timeout_ms: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ReconciliationSettings {
    pub interval_ms: u64,
    pub stale_check_interval_ms: u64,
    pub failure_alert_threshold: u32,
}

#[derive(Debug, Clone, Deserialize)]
pub struct QualitySettings {
    pub latency_window: usize,
    pub alert_capacity: usize,
    pub transition_history: usize,
}

impl Config {
    /// Load configuration from environment variables
    pub fn load() -> Result<Self> {
        dotenvy::dotenv().ok();

        let symbols: Vec<String> = env::var("SYMBOLS")
            .unwrap_or_else(|_| "BTCUSDT,ETHUSDT".to_string())
            .split(',')
            .map(|s| s.trim().to_uppercase())
            .filter(|s| !s.is_empty())
            .collect();

        let defaults = Self::default();

        let config = Self {
            symbols,
            ws_endpoint: env::var("WS_ENDPOINT").unwrap_or(defaults.ws_endpoint),
            rest_endpoint: env::var("REST_ENDPOINT").unwrap_or(defaults.rest_endpoint),
            ipc_socket_path: env::var("IPC_SOCKET_PATH").unwrap_or(defaults.ipc_socket_path),
            health_addr: env::var("HEALTH_ADDR").unwrap_or(defaults.health_addr),
            depth_levels: env_or("DEPTH_LEVELS", defaults.depth_levels),
            candle_interval: env::var("CANDLE_INTERVAL")
                .ok()
                .filter(|s| !s.trim().is_empty()),
            event_channel_capacity: env_or(
                "EVENT_CHANNEL_CAPACITY",
                defaults.event_channel_capacity,
            ),
            book: BookSettings {
                max_buffered_diffs: env_or("MAX_BUFFERED_DIFFS", defaults.book.max_buffered_diffs),
                stale_after_ms: env_or("STALE_AFTER_MS", defaults.book.stale_after_ms),
            },
            rate_limit: RateLimitSettings {
                capacity: env_or("RATE_LIMIT_CAPACITY", defaults.rate_limit.capacity),
                refill_interval_ms: env_or(
                    "RATE_LIMIT_REFILL_MS",
                    defaults.rate_limit.refill_interval_ms,
                ),
            },
            reconnect: ReconnectSettings {
                base_delay_ms: env_or("RECONNECT_BASE_DELAY_MS", defaults.reconnect.base_delay_ms),
                max_delay_ms: env_or("RECONNECT_MAX_DELAY_MS", defaults.reconnect.max_delay_ms),
                max_attempts: env_or("MAX_RECONNECT_ATTEMPTS", defaults.reconnect.max_attempts),
            },
            connection: ConnectionSettings {
                probe_interval_ms: env_or(
                    "PROBE_INTERVAL_MS",
                    defaults.connection.probe_interval_ms,
                ),
                connect_timeout_ms: env_or(
                    "CONNECT_TIMEOUT_MS",
                    defaults.connection.connect_timeout_ms,
                ),
            },
            reconciliation: ReconciliationSettings {
                interval_ms: env_or("RECONCILE_INTERVAL_MS", defaults.reconciliation.interval_ms),
                stale_check_interval_ms: env_or(
                    "STALE_CHECK_INTERVAL_MS",
                    defaults.reconciliation.stale_check_interval_ms,
                ),
                failure_alert_threshold: env_or(
                    "SNAPSHOT_FAILURE_ALERT_THRESHOLD",
                    defaults.reconciliation.failure_alert_threshold,
                ),
            },
            quality: QualitySettings {
                latency_window: env_or("LATENCY_WINDOW", defaults.quality.latency_window),
                alert_capacity: env_or("ALERT_CAPACITY", defaults.quality.alert_capacity),
                transition_history: env_or(
                    "TRANSITION_HISTORY",
                    defaults.quality.transition_history,
                ),
            },
        };

        config.validate()?;
        Ok(config)
    }

    /// Reject settings the engine cannot run with
    pub fn validate(&self) -> Result<()> {
        let checks: [(bool, &str); 11] = [
            (self.depth_levels > 0, "DEPTH_LEVELS must be positive"),
            (self.book.max_buffered_diffs > 0, "MAX_BUFFERED_DIFFS must be positive"),
            (self.rate_limit.capacity > 0, "RATE_LIMIT_CAPACITY must be positive"),
            (self.rate_limit.refill_interval_ms > 0, "RATE_LIMIT_REFILL_MS must be positive"),
            (self.reconnect.base_delay_ms > 0, "RECONNECT_BASE_DELAY_MS must be positive"),
            (
                self.reconnect.max_delay_ms >= self.reconnect.base_delay_ms,
                "RECONNECT_MAX_DELAY_MS must not be below the base delay",
            ),
            (self.connection.probe_interval_ms > 0, "PROBE_INTERVAL_MS must be positive"),
            (self.connection.connect_timeout_ms > 0, "CONNECT_TIMEOUT_MS must be positive"),
            (self.reconciliation.interval_ms > 0, "RECONCILE_INTERVAL_MS must be positive"),
            (
                self.reconciliation.stale_check_interval_ms > 0,
                "STALE_CHECK_INTERVAL_MS must be positive",
            ),
            (self.event_channel_capacity > 0, "EVENT_CHANNEL_CAPACITY must be positive"),
        ];

        match checks.iter().find(|(ok, _)| !ok) {
            Some((_, message)) => Err(MarketDataError::ConfigError(message.to_string())),
            None => Ok(()),
        }
    }

    pub fn stale_after(&self) -> Duration {
        Duration::from_millis(self.book.stale_after_ms)
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            symbols: vec!["BTCUSDT".to_string()],
            ws_endpoint: "wss://stream.binance.com:9443/ws".to_string(),
            rest_endpoint: "https://api.binance.com/api/v3".to_string(),
            ipc_socket_path: "/tmp/book-sync.sock".to_string(),
            health_addr: "0.0.0.0:9090".to_string(),
            depth_levels: 100,
            candle_interval: None,
            event_channel_capacity: 4096,
            book: BookSettings {
                max_buffered_diffs: 1000,
                stale_after_ms: 5_000,
            },
            rate_limit: RateLimitSettings {
                capacity: 5,
                refill_interval_ms: 12_000,
            },
            reconnect: ReconnectSettings {
                base_delay_ms: 1_000,
                max_delay_ms: 30_000,
                max_attempts: 10,
            },
            connection: ConnectionSettings {
                probe_interval_ms: 15_000,
                connect_timeout_ms: 10_000,
            },
            reconciliation: ReconciliationSettings {
                interval_ms: 30_000,
                stale_check_interval_ms: 1_000,
                failure_alert_threshold: 3,
            },
            quality: QualitySettings {
                latency_window: 1024,
                alert_capacity: 256,
                transition_history: 64,
            },
        }
    }
}

/// Read and parse an environment variable, falling back to `default` when
/// unset or unparseable.
fn env_or<T: FromStr>(key: &str, default: T) -> T {
    env::var(key)
        .ok()
        .and_then(|raw| raw.trim().parse().ok())
        .unwrap_or(default)
}
