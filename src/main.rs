//! Book Sync - Market Data Consistency Engine
//!
//! Keeps order books for the configured symbols consistent with the
//! exchange, serves them over HTTP and publishes engine events over IPC.

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use rust_decimal::Decimal;
use serde::Deserialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tower_http::trace::TraceLayer;
use tracing::{error, info, warn, Level};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use book_sync::{
    AggregatedBook, Alert, BookView, Config, ConnectionHealth, MarketDataEngine, MarketDataError,
    Publisher, RestSnapshotSource, WsConnector,
};

const SNAPSHOT_REQUEST_TIMEOUT: Duration = Duration::from_secs(10);
const DEFAULT_VIEW_DEPTH: usize = 20;

type AppState = Arc<MarketDataEngine>;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize logging
    tracing_subscriber::registry()
        .with(fmt::layer().json())
        .with(EnvFilter::from_default_env().add_directive(Level::INFO.into()))
        .init();

    info!("Starting Book Sync");

    // Load configuration
    let config = Config::load()?;
    info!(symbols = ?config.symbols, "Configuration loaded");

    let snapshots = RestSnapshotSource::new(
        &config.rest_endpoint,
        config.depth_levels,
        SNAPSHOT_REQUEST_TIMEOUT,
    )?;
    let engine = Arc::new(MarketDataEngine::new(
        config.clone(),
        Arc::new(WsConnector),
        Arc::new(snapshots),
    )?);

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    // Publisher for IPC
    let publisher = tokio::spawn(
        Publisher::new(&config.ipc_socket_path).run(engine.events(), shutdown_rx.clone()),
    );

    for symbol in &config.symbols {
        if let Err(e) = engine.subscribe(symbol).await {
            error!(symbol = %symbol, error = %e, "Failed to subscribe");
        }
    }

    // Start health check server
    let server = tokio::spawn(start_health_server(
        engine.clone(),
        config.health_addr.clone(),
        shutdown_rx,
    ));

    tokio::signal::ctrl_c().await?;
    info!("Shutdown signal received");

    let _ = shutdown_tx.send(true);
    engine.shutdown_all().await;

    match server.await {
        Ok(Err(e)) => warn!(error = %e, "Health server error"),
        Err(e) => warn!(error = %e, "Health server task failed"),
        Ok(Ok(())) => {}
    }
    if let Err(e) = publisher.await {
        warn!(error = %e, "Publisher task failed");
    }

    info!("Book Sync stopped");
    Ok(())
}

/// Start HTTP server for health checks, metrics and book queries
async fn start_health_server(
    engine: AppState,
    addr: String,
    mut shutdown: watch::Receiver<bool>,
) -> anyhow::Result<()> {
    let app = Router::new()
        .route("/health", get(health_check))
        .route("/metrics", get(metrics))
        .route("/books/:symbol", get(book))
        .route("/books/:symbol/aggregated", get(aggregated))
        .route("/books/:symbol/health", get(book_health))
        .route("/books/:symbol/alerts", get(alerts))
        .route("/books/:symbol/resume", post(resume))
        .layer(TraceLayer::new_for_http())
        .with_state(engine);

    let listener = tokio::net::TcpListener::bind(&addr).await?;
    info!(addr = %addr, "Starting health check server");

    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            while !*shutdown.borrow() {
                if shutdown.changed().await.is_err() {
                    break;
                }
            }
        })
        .await?;

    Ok(())
}

/// Maps engine errors onto HTTP statuses
struct ApiError(MarketDataError);

impl From<MarketDataError> for ApiError {
    fn from(err: MarketDataError) -> Self {
        Self(err)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match self.0 {
            MarketDataError::NotSubscribed(_) => StatusCode::NOT_FOUND,
            MarketDataError::InvalidQuery(_) => StatusCode::BAD_REQUEST,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        let body = Json(serde_json::json!({ "error": self.0.to_string() }));
        (status, body).into_response()
    }
}

async fn health_check(State(engine): State<AppState>) -> Json<serde_json::Value> {
    Json(serde_json::json!({
        "status": "healthy",
        "component": "book-sync",
        "symbols": engine.symbols().await,
        "timestamp": chrono::Utc::now().to_rfc3339()
    }))
}

async fn metrics(State(engine): State<AppState>) -> Result<String, ApiError> {
    Ok(engine.metrics().render()?)
}

#[derive(Debug, Deserialize)]
struct DepthQuery {
    depth: Option<usize>,
}

async fn book(
    State(engine): State<AppState>,
    Path(symbol): Path<String>,
    Query(query): Query<DepthQuery>,
) -> Result<Json<BookView>, ApiError> {
    let depth = query.depth.unwrap_or(DEFAULT_VIEW_DEPTH);
    Ok(Json(engine.current_levels(&symbol, depth).await?))
}

#[derive(Debug, Deserialize)]
struct AggregateQuery {
    tick: Decimal,
    depth: Option<usize>,
    /// Drop levels larger than this multiple of the side's mean size
    outlier: Option<Decimal>,
}

async fn aggregated(
    State(engine): State<AppState>,
    Path(symbol): Path<String>,
    Query(query): Query<AggregateQuery>,
) -> Result<Json<AggregatedBook>, ApiError> {
    let book = engine
        .aggregated_levels(
            &symbol,
            query.tick,
            query.depth.unwrap_or(DEFAULT_VIEW_DEPTH),
            query.outlier.unwrap_or(Decimal::ZERO),
        )
        .await?;
    Ok(Json(book))
}

async fn book_health(
    State(engine): State<AppState>,
    Path(symbol): Path<String>,
) -> Result<Json<ConnectionHealth>, ApiError> {
    Ok(Json(engine.connection_health(&symbol).await?))
}

#[derive(Debug, Deserialize)]
struct AlertsQuery {
    since: Option<u64>,
}

async fn alerts(
    State(engine): State<AppState>,
    Path(symbol): Path<String>,
    Query(query): Query<AlertsQuery>,
) -> Result<Json<Vec<Alert>>, ApiError> {
    Ok(Json(engine.alerts(&symbol, query.since.unwrap_or(0)).await?))
}

async fn resume(
    State(engine): State<AppState>,
    Path(symbol): Path<String>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let resumed = engine.resume(&symbol).await?;
    Ok(Json(serde_json::json!({ "symbol": symbol, "resumed": resumed })))
}
