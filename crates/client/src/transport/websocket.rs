//! WebSocket transport
//!
//! Each envelope travels as one binary WebSocket message.

use super::Transport;
use async_trait::async_trait;
use bytes::Bytes;
use exsim_protocol::Envelope;
use futures::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio_tungstenite::{connect_async, tungstenite::Message};

/// WebSocket client that connects to a server and bridges envelope channels
pub struct WebSocketClient {
    url: String,
}

impl WebSocketClient {
    /// Creates a new WebSocket client for the given URL
    pub fn new(url: impl Into<String>) -> Self {
        Self { url: url.into() }
    }
}

#[async_trait]
impl Transport for WebSocketClient {
    type Error = WebSocketClientError;

    async fn run(
        self,
        incoming_tx: mpsc::Sender<Envelope>,
        mut outgoing_rx: mpsc::Receiver<Envelope>,
    ) -> Result<(), Self::Error> {
        tracing::info!(url = %self.url, "Connecting to WebSocket server");

        let (ws_stream, _) = connect_async(&self.url)
            .await
            .map_err(|e| WebSocketClientError::ConnectionError(e.to_string()))?;

        tracing::info!(url = %self.url, "WebSocket connection established");

        let (mut ws_sender, mut ws_receiver) = ws_stream.split();

        loop {
            tokio::select! {
                msg = ws_receiver.next() => {
                    match msg {
                        Some(Ok(Message::Binary(data))) => {
                            match Envelope::from_bytes(Bytes::from(data)) {
                                Ok(envelope) => {
                                    if incoming_tx.send(envelope).await.is_err() {
                                        tracing::debug!("Event loop gone, closing connection");
                                        break;
                                    }
                                }
                                Err(e) => {
                                    tracing::error!(error = %e, "Failed to parse envelope");
                                }
                            }
                        }
                        Some(Ok(Message::Close(_))) => {
                            tracing::info!("Server closed connection");
                            break;
                        }
                        Some(Ok(_)) => {
                            // Ignore text messages and other types
                        }
                        Some(Err(e)) => {
                            return Err(WebSocketClientError::WebSocketError(e.to_string()));
                        }
                        None => {
                            tracing::info!("Connection closed");
                            break;
                        }
                    }
                }

                outgoing = outgoing_rx.recv() => {
                    let Some(envelope) = outgoing else {
                        tracing::debug!("Event loop finished, closing connection");
                        let _ = ws_sender.send(Message::Close(None)).await;
                        break;
                    };

                    let bytes = envelope.to_bytes();
                    ws_sender
                        .send(Message::Binary(bytes.to_vec()))
                        .await
                        .map_err(|e| WebSocketClientError::WebSocketError(e.to_string()))?;
                }
            }
        }

        Ok(())
    }
}

/// WebSocket client errors
#[derive(Debug, thiserror::Error)]
pub enum WebSocketClientError {
    #[error("Failed to connect: {0}")]
    ConnectionError(String),

    #[error("WebSocket error: {0}")]
    WebSocketError(String),
}
