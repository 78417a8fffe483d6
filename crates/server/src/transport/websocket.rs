use std::collections::HashMap;
use std::net::SocketAddr;

use super::ServerTransport;
use async_trait::async_trait;
use bytes::Bytes;
use exsim_protocol::{Envelope, SessionEnvelope, SessionEvent, SessionId};
use futures::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream, ToSocketAddrs};
use tokio::sync::mpsc;
use tokio_tungstenite::{accept_async, tungstenite::Message};

/// Capacity of the channel reporting closed connections
const CLOSED_BUFFER: usize = 100;

/// WebSocket server that accepts connections and bridges them to session events
///
/// Each connection becomes a session with a fresh [`SessionId`]; outgoing
/// envelopes are routed to the connection their session id names. Every
/// connection drains its own queue, so one slow peer never stalls the rest.
pub struct WebSocketServer {
    listener: TcpListener,
}

impl WebSocketServer {
    /// Binds the server to the given address
    pub async fn bind(addr: impl ToSocketAddrs) -> Result<Self, WebSocketServerError> {
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|e| WebSocketServerError::BindError(e.to_string()))?;
        Ok(Self { listener })
    }

    /// Returns the address the server is listening on
    pub fn local_addr(&self) -> Result<SocketAddr, WebSocketServerError> {
        self.listener
            .local_addr()
            .map_err(|e| WebSocketServerError::BindError(e.to_string()))
    }
}

/// Handles a single WebSocket connection, then reports it closed
async fn handle_connection(
    stream: TcpStream,
    peer_addr: SocketAddr,
    session_id: SessionId,
    events_tx: mpsc::Sender<SessionEvent>,
    outgoing_rx: mpsc::UnboundedReceiver<Envelope>,
    closed_tx: mpsc::Sender<SessionId>,
) {
    if events_tx.send(SessionEvent::Connected(session_id)).await.is_err() {
        let _ = closed_tx.send(session_id).await;
        return;
    }

    if let Err(e) = serve_connection(stream, peer_addr, session_id, &events_tx, outgoing_rx).await {
        tracing::warn!(%peer_addr, %session_id, error = %e, "Connection error");
    }

    tracing::info!(%peer_addr, %session_id, "Client disconnected");
    let _ = events_tx.send(SessionEvent::Disconnected(session_id)).await;
    let _ = closed_tx.send(session_id).await;
}

async fn serve_connection(
    stream: TcpStream,
    peer_addr: SocketAddr,
    session_id: SessionId,
    events_tx: &mpsc::Sender<SessionEvent>,
    mut outgoing_rx: mpsc::UnboundedReceiver<Envelope>,
) -> Result<(), WebSocketServerError> {
    let ws_stream = accept_async(stream)
        .await
        .map_err(|e| WebSocketServerError::WebSocketError(e.to_string()))?;

    tracing::debug!(%peer_addr, "WebSocket handshake completed");

    let (mut ws_sender, mut ws_receiver) = ws_stream.split();

    loop {
        tokio::select! {
            msg = ws_receiver.next() => {
                match msg {
                    Some(Ok(Message::Binary(data))) => {
                        match Envelope::from_bytes(Bytes::from(data)) {
                            Ok(envelope) => {
                                let event = SessionEvent::Envelope(SessionEnvelope::new(session_id, envelope));
                                if events_tx.send(event).await.is_err() {
                                    break;
                                }
                            }
                            Err(e) => {
                                tracing::warn!(%peer_addr, error = %e, "Failed to parse envelope");
                            }
                        }
                    }
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Ok(_)) => {
                        // Ignore text messages and other types
                    }
                    Some(Err(e)) => {
                        return Err(WebSocketServerError::WebSocketError(e.to_string()));
                    }
                }
            }

            outgoing = outgoing_rx.recv() => {
                let Some(envelope) = outgoing else {
                    let _ = ws_sender.send(Message::Close(None)).await;
                    break;
                };

                ws_sender
                    .send(Message::Binary(envelope.to_bytes().to_vec()))
                    .await
                    .map_err(|e| WebSocketServerError::WebSocketError(e.to_string()))?;
            }
        }
    }

    Ok(())
}

#[async_trait]
impl ServerTransport for WebSocketServer {
    type Error = WebSocketServerError;

    async fn run(
        self,
        events_tx: mpsc::Sender<SessionEvent>,
        mut outgoing_rx: mpsc::Receiver<SessionEnvelope>,
    ) -> Result<(), Self::Error> {
        tracing::info!(addr = ?self.listener.local_addr().ok(), "WebSocket server listening");

        let mut connections: HashMap<SessionId, mpsc::UnboundedSender<Envelope>> =
            HashMap::new();
        let (closed_tx, mut closed_rx) = mpsc::channel(CLOSED_BUFFER);

        loop {
            tokio::select! {
                accept_result = self.listener.accept() => {
                    match accept_result {
                        Ok((stream, peer_addr)) => {
                            let session_id = SessionId::new_v4();
                            tracing::info!(%peer_addr, %session_id, "New connection");

                            let (to_connection, from_server) = mpsc::unbounded_channel();
                            connections.insert(session_id, to_connection);

                            tokio::spawn(handle_connection(
                                stream,
                                peer_addr,
                                session_id,
                                events_tx.clone(),
                                from_server,
                                closed_tx.clone(),
                            ));
                        }
                        Err(e) => {
                            tracing::error!(error = %e, "Failed to accept connection");
                        }
                    }
                }

                Some(session_id) = closed_rx.recv() => {
                    connections.remove(&session_id);
                }

                outgoing = outgoing_rx.recv() => {
                    let Some(SessionEnvelope { session_id, envelope }) = outgoing else {
                        tracing::info!("WebSocket server shutting down");
                        return Ok(());
                    };

                    match connections.get(&session_id) {
                        Some(to_connection) => {
                            if to_connection.send(envelope).is_err() {
                                tracing::debug!(%session_id, "Connection gone, envelope dropped");
                            }
                        }
                        None => {
                            tracing::debug!(%session_id, "Envelope for unknown session dropped");
                        }
                    }
                }
            }
        }
    }
}

/// WebSocket server errors
#[derive(Debug, thiserror::Error)]
pub enum WebSocketServerError {
    #[error("Failed to bind to address: {0}")]
    BindError(String),

    #[error("WebSocket error: {0}")]
    WebSocketError(String),
}

#[cfg(test)]
mod tests {
    use super::*;
    use exsim_protocol::messages::routes;
    use tokio::time::{timeout, Duration};
    use tokio_tungstenite::connect_async;

    async fn start_server() -> (
        SocketAddr,
        mpsc::Receiver<SessionEvent>,
        mpsc::Sender<SessionEnvelope>,
    ) {
        let server = WebSocketServer::bind("127.0.0.1:0").await.unwrap();
        let addr = server.local_addr().unwrap();

        let (events_tx, events_rx) = mpsc::channel(10);
        let (outgoing_tx, outgoing_rx) = mpsc::channel(10);
        tokio::spawn(server.run(events_tx, outgoing_rx));

        (addr, events_rx, outgoing_tx)
    }

    async fn next_event(events_rx: &mut mpsc::Receiver<SessionEvent>) -> SessionEvent {
        timeout(Duration::from_secs(1), events_rx.recv())
            .await
            .unwrap()
            .unwrap()
    }

    #[tokio::test]
    async fn test_server_receives_envelopes_in_order() {
        let (addr, mut events_rx, _outgoing_tx) = start_server().await;

        let (mut ws_stream, _) = connect_async(format!("ws://{}", addr)).await.unwrap();
        let SessionEvent::Connected(session_id) = next_event(&mut events_rx).await else {
            panic!("expected Connected");
        };

        // Garbage is skipped, the connection survives
        ws_stream.send(Message::Binary(vec![1, 2, 3, 4, 5])).await.unwrap();

        for msg_id in 1u64..=3 {
            let envelope = Envelope::request(1, routes::PROPOSE_ACTION, msg_id, Bytes::from_static(b"{}"));
            ws_stream
                .send(Message::Binary(envelope.to_bytes().to_vec()))
                .await
                .unwrap();
        }

        for msg_id in 1u64..=3 {
            match next_event(&mut events_rx).await {
                SessionEvent::Envelope(received) => {
                    assert_eq!(received.session_id, session_id);
                    assert_eq!(received.envelope.msg_id, msg_id);
                }
                other => panic!("unexpected event {:?}", other),
            }
        }
    }

    #[tokio::test]
    async fn test_server_routes_outgoing_by_session() {
        let (addr, mut events_rx, outgoing_tx) = start_server().await;

        let (mut first, _) = connect_async(format!("ws://{}", addr)).await.unwrap();
        let SessionEvent::Connected(first_id) = next_event(&mut events_rx).await else {
            panic!("expected Connected");
        };
        let (mut second, _) = connect_async(format!("ws://{}", addr)).await.unwrap();
        let SessionEvent::Connected(second_id) = next_event(&mut events_rx).await else {
            panic!("expected Connected");
        };

        for (session_id, msg_id) in [(first_id, 1u64), (second_id, 2u64)] {
            let envelope = Envelope::request(1, routes::PERFORM_ACTION, msg_id, Bytes::new());
            outgoing_tx
                .send(SessionEnvelope::new(session_id, envelope))
                .await
                .unwrap();
        }

        for (ws_stream, msg_id) in [(&mut first, 1u64), (&mut second, 2u64)] {
            let msg = timeout(Duration::from_secs(1), ws_stream.next())
                .await
                .unwrap()
                .unwrap()
                .unwrap();
            let Message::Binary(data) = msg else {
                panic!("expected binary message");
            };
            let envelope = Envelope::from_bytes(Bytes::from(data)).unwrap();
            assert_eq!(envelope.msg_id, msg_id);
        }
    }

    #[tokio::test]
    async fn test_server_reports_disconnect() {
        let (addr, mut events_rx, _outgoing_tx) = start_server().await;

        let (mut ws_stream, _) = connect_async(format!("ws://{}", addr)).await.unwrap();
        let SessionEvent::Connected(session_id) = next_event(&mut events_rx).await else {
            panic!("expected Connected");
        };

        ws_stream.close(None).await.unwrap();

        match next_event(&mut events_rx).await {
            SessionEvent::Disconnected(id) => assert_eq!(id, session_id),
            other => panic!("unexpected event {:?}", other),
        }
    }
}
