//! Book Sync - Market Data Consistency Engine
//!
//! Maintains sequenced, self-correcting order books from exchange REST
//! snapshots and WebSocket diffs, with supervised reconnection, per-host
//! connection rate limiting, periodic reconciliation and feed quality
//! monitoring.

pub mod config;
pub mod engine;
pub mod error;
pub mod feed;
pub mod model;
pub mod orderbook;
pub mod parser;
pub mod publisher;
pub mod quality;
pub mod rate_limit;
pub mod reconcile;
pub mod telemetry;

pub use config::Config;
pub use engine::{ConnectionHealth, EngineEvent, MarketDataEngine};
pub use error::{MarketDataError, Result};
pub use feed::{ConnectionState, ConnectionStatus, WsConnector};
pub use model::{Candle, OrderBookDiff, OrderBookSnapshot, PriceLevel, StreamKind, Trade};
pub use orderbook::{AggregatedBook, BookView, OrderBookMetrics, OrderBookStore, SyncState};
pub use publisher::Publisher;
pub use quality::{Alert, HealthSummary, QualityMonitor};
pub use rate_limit::{RateLimiter, RateLimiterRegistry};
pub use reconcile::{RestSnapshotSource, SnapshotSource};
pub use telemetry::EngineMetrics;
