//! Publisher module for IPC communication
//!
//! Forwards engine events to other system components over a Unix socket as
//! length-prefixed MessagePack frames.

use bytes::{BufMut, BytesMut};
use std::path::Path;
use tokio::io::AsyncWriteExt;
use tokio::net::UnixStream;
use tokio::sync::{broadcast, watch};
use tracing::{debug, info, warn};

use crate::engine::EngineEvent;
use crate::error::{MarketDataError, Result};

/// Publisher for sending engine events via Unix socket
pub struct Publisher {
    socket_path: String,
    stream: Option<UnixStream>,
    published: u64,
}

impl Publisher {
    /// Create a new publisher. The socket is connected lazily.
    pub fn new(socket_path: &str) -> Self {
        Self {
            socket_path: socket_path.to_string(),
            stream: None,
            published: 0,
        }
    }

    pub fn published(&self) -> u64 {
        self.published
    }

    /// Connect to the Unix socket
    async fn connect(&mut self) -> Result<()> {
        let path = Path::new(&self.socket_path);

        if !path.exists() {
            return Err(MarketDataError::IpcError(format!(
                "Socket path does not exist: {}",
                self.socket_path
            )));
        }

        let stream = UnixStream::connect(path).await.map_err(|e| {
            MarketDataError::IpcError(format!("Failed to connect to {}: {}", self.socket_path, e))
        })?;

        self.stream = Some(stream);
        info!(path = %self.socket_path, "Connected to IPC socket");
        Ok(())
    }

    /// Encode one event as `u32` big-endian length + MessagePack body
    pub fn encode(event: &EngineEvent) -> Result<BytesMut> {
        let data = rmp_serde::to_vec_named(event).map_err(|e| {
            MarketDataError::SerializationError(format!("Failed to serialize: {}", e))
        })?;

        let len = u32::try_from(data.len()).map_err(|_| {
            MarketDataError::SerializationError(format!("Frame too large: {} bytes", data.len()))
        })?;

        let mut frame = BytesMut::with_capacity(4 + data.len());
        frame.put_u32(len);
        frame.put_slice(&data);
        Ok(frame)
    }

    /// Publish one event. Delivery failures are logged and dropped.
    pub async fn publish(&mut self, event: &EngineEvent) -> Result<()> {
        let frame = Self::encode(event)?;

        if self.stream.is_none() {
            if let Err(e) = self.connect().await {
                debug!(error = %e, "Failed to reconnect to IPC socket");
                return Ok(()); // Don't fail on publish errors
            }
        }

        if let Some(stream) = self.stream.as_mut() {
            match stream.write_all(&frame).await {
                Ok(_) => {
                    self.published += 1;
                    debug!(bytes = frame.len(), "Published engine event");
                }
                Err(e) => {
                    warn!(error = %e, "Failed to write to IPC socket");
                    self.stream = None; // Mark as disconnected
                }
            }
        }

        Ok(())
    }

    /// Forward events until the engine closes the channel or shutdown fires
    pub async fn run(
        mut self,
        mut events: broadcast::Receiver<EngineEvent>,
        mut shutdown: watch::Receiver<bool>,
    ) {
        info!(path = %self.socket_path, "Starting IPC publisher");
        loop {
            tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
                received = events.recv() => match received {
                    Ok(event) => {
                        if let Err(e) = self.publish(&event).await {
                            warn!(error = %e, "Dropping unpublishable event");
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!(skipped, "Publisher lagged behind engine events");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                },
            }
        }
        info!(published = self.published, "IPC publisher stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncReadExt;
    use tokio::net::UnixListener;

    fn book_changed(sequence_id: u64) -> EngineEvent {
        EngineEvent::BookChanged {
            symbol: "BTCUSDT".to_string(),
            sequence_id,
        }
    }

    #[test]
    fn test_frame_has_length_prefix() {
        let frame = Publisher::encode(&book_changed(7)).unwrap();
        let len = u32::from_be_bytes([frame[0], frame[1], frame[2], frame[3]]) as usize;
        assert_eq!(len, frame.len() - 4);

        let decoded: EngineEvent = rmp_serde::from_slice(&frame[4..]).unwrap();
        assert_eq!(decoded, book_changed(7));
    }

    #[tokio::test]
    async fn test_missing_socket_is_not_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("absent.sock");
        let mut publisher = Publisher::new(path.to_str().unwrap());

        assert!(publisher.publish(&book_changed(1)).await.is_ok());
        assert_eq!(publisher.published(), 0);
    }

    #[tokio::test]
    async fn test_forwards_broadcast_events() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("book-sync.sock");
        let listener = UnixListener::bind(&path).unwrap();

        let (tx, rx) = broadcast::channel(8);
        let (shutdown_tx, shutdown) = watch::channel(false);
        let publisher = Publisher::new(path.to_str().unwrap());
        let task = tokio::spawn(publisher.run(rx, shutdown));

        tx.send(book_changed(100)).unwrap();
        tx.send(book_changed(101)).unwrap();

        let (mut socket, _) = listener.accept().await.unwrap();
        for expected in [100, 101] {
            let len = socket.read_u32().await.unwrap() as usize;
            let mut body = vec![0u8; len];
            socket.read_exact(&mut body).await.unwrap();
            let event: EngineEvent = rmp_serde::from_slice(&body).unwrap();
            assert_eq!(event, book_changed(expected));
        }

        shutdown_tx.send(true).unwrap();
        task.await.unwrap();
    }
}
