//! WebSocket client for Binance streams
//!
//! Handles connection and frame-level I/O for a single stream.

use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio_tungstenite::{
    connect_async,
    tungstenite::protocol::Message,
    MaybeTlsStream, WebSocketStream,
};
use tracing::{debug, info, warn};

use super::{Connector, Frame, Transport};
use crate::error::{MarketDataError, Result};
use crate::model::StreamKind;

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Stream URL for one symbol and stream kind
pub fn stream_url(
    endpoint: &str,
    symbol: &str,
    kind: StreamKind,
    candle_interval: Option<&str>,
) -> String {
    let s_lower = symbol.to_lowercase();
    let stream = match kind {
        StreamKind::Depth => format!("{}@depth@100ms", s_lower),
        StreamKind::Trades => format!("{}@trade", s_lower),
        StreamKind::Candles => format!("{}@kline_{}", s_lower, candle_interval.unwrap_or("1m")),
    };
    format!("{}/{}", endpoint.trim_end_matches('/'), stream)
}

/// WebSocket client for a single connection
pub struct WebSocketClient {
    stream: Option<WsStream>,
}

impl WebSocketClient {
    /// Connect to the WebSocket endpoint
    pub async fn connect(url: &str) -> Result<Self> {
        info!(url = %url, "Connecting to WebSocket");

        let (ws_stream, response) = connect_async(url).await.map_err(|e| {
            MarketDataError::WebSocketConnection(format!("Failed to connect: {}", e))
        })?;

        info!(status = ?response.status(), "WebSocket connected");

        Ok(Self {
            stream: Some(ws_stream),
        })
    }

    async fn send(&mut self, message: Message) -> Result<()> {
        let stream = self
            .stream
            .as_mut()
            .ok_or_else(|| MarketDataError::WebSocketConnection("Not connected".to_string()))?;
        stream
            .send(message)
            .await
            .map_err(|e| MarketDataError::WebSocketMessage(e.to_string()))
    }
}

#[async_trait]
impl Transport for WebSocketClient {
    async fn recv(&mut self) -> Option<Result<Frame>> {
        let stream = self.stream.as_mut()?;

        loop {
            let frame = match stream.next().await {
                Some(Ok(Message::Text(text))) => Frame::Text(text),
                Some(Ok(Message::Binary(data))) => Frame::Binary(data),
                Some(Ok(Message::Ping(data))) => Frame::Ping(data),
                Some(Ok(Message::Pong(data))) => Frame::Pong(data),
                Some(Ok(Message::Close(frame))) => {
                    warn!(frame = ?frame, "Received close frame");
                    Frame::Close
                }
                Some(Ok(Message::Frame(_))) => continue,
                Some(Err(e)) => {
                    self.stream = None;
                    return Some(Err(MarketDataError::WebSocketMessage(e.to_string())));
                }
                None => {
                    warn!("WebSocket stream ended");
                    self.stream = None;
                    return None;
                }
            };
            return Some(Ok(frame));
        }
    }

    async fn send_ping(&mut self, payload: Vec<u8>) -> Result<()> {
        self.send(Message::Ping(payload)).await
    }

    async fn send_pong(&mut self, payload: Vec<u8>) -> Result<()> {
        debug!("Received ping, sending pong");
        self.send(Message::Pong(payload)).await
    }

    /// Close the connection
    async fn close(&mut self) {
        if let Some(mut stream) = self.stream.take() {
            let _ = stream.close(None).await;
        }
    }
}

/// Opens real WebSocket sessions
#[derive(Debug, Default, Clone, Copy)]
pub struct WsConnector;

#[async_trait]
impl Connector for WsConnector {
    async fn connect(&self, url: &str) -> Result<Box<dyn Transport>> {
        let client = WebSocketClient::connect(url).await?;
        Ok(Box::new(client))
    }
}
