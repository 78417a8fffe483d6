//! In-memory server transport
//!
//! Lets clients in the same process connect to the server without sockets.
//! Each [`MemoryConnector::connect`] call opens one session and returns the
//! client side as the client crate's [`MemoryTransport`].

use std::collections::HashMap;

use async_trait::async_trait;
use exsim_protocol::{Envelope, SessionEnvelope, SessionEvent, SessionId};
use tokio::sync::mpsc;

use super::ServerTransport;
pub use exsim_client::transport::memory::{MemoryTransport, MemoryTransportError};

/// Server end of one in-memory connection
struct MemoryConnection {
    to_client: mpsc::Sender<Envelope>,
    from_client: mpsc::Receiver<Envelope>,
}

/// Opens in-memory connections to a [`MemoryServerTransport`]
#[derive(Clone)]
pub struct MemoryConnector {
    connections_tx: mpsc::Sender<MemoryConnection>,
    buffer_size: usize,
}

impl MemoryConnector {
    /// Opens a new session and returns its client-side transport
    pub async fn connect(&self) -> Result<MemoryTransport, MemoryTransportError> {
        let (client_to_server_tx, client_to_server_rx) = mpsc::channel(self.buffer_size);
        let (server_to_client_tx, server_to_client_rx) = mpsc::channel(self.buffer_size);

        self.connections_tx
            .send(MemoryConnection {
                to_client: server_to_client_tx,
                from_client: client_to_server_rx,
            })
            .await
            .map_err(|_| MemoryTransportError::ChannelClosed)?;

        Ok(MemoryTransport::new(client_to_server_tx, server_to_client_rx))
    }
}

/// In-memory server transport
///
/// # Example
///
/// ```no_run
/// use exsim_server::transport::memory::MemoryServerTransport;
///
/// # async fn demo() {
/// let (transport, connector) = MemoryServerTransport::new(100);
/// // Hand `transport` to the server, then:
/// let client_transport = connector.connect().await.unwrap();
/// # }
/// ```
pub struct MemoryServerTransport {
    connections_rx: mpsc::Receiver<MemoryConnection>,
    buffer_size: usize,
}

impl MemoryServerTransport {
    /// Creates the transport and the connector clients use to reach it
    pub fn new(buffer_size: usize) -> (Self, MemoryConnector) {
        let (connections_tx, connections_rx) = mpsc::channel(buffer_size);

        let transport = Self {
            connections_rx,
            buffer_size,
        };
        let connector = MemoryConnector {
            connections_tx,
            buffer_size,
        };

        (transport, connector)
    }
}

/// Feeds one client at its own pace
///
/// Each session has its own queue, so a client that reads slowly never holds
/// up deliveries to the others.
async fn deliver_to_client(
    mut queue: mpsc::UnboundedReceiver<Envelope>,
    to_client: mpsc::Sender<Envelope>,
) {
    while let Some(envelope) = queue.recv().await {
        if to_client.send(envelope).await.is_err() {
            break;
        }
    }
}

/// Announces one connection, then forwards its envelopes until the client hangs up
async fn forward_connection(
    session_id: SessionId,
    mut from_client: mpsc::Receiver<Envelope>,
    events_tx: mpsc::Sender<SessionEvent>,
    closed_tx: mpsc::Sender<SessionId>,
) {
    if events_tx.send(SessionEvent::Connected(session_id)).await.is_err() {
        return;
    }

    while let Some(envelope) = from_client.recv().await {
        let event = SessionEvent::Envelope(SessionEnvelope::new(session_id, envelope));
        if events_tx.send(event).await.is_err() {
            return;
        }
    }

    tracing::debug!(%session_id, "Memory client disconnected");
    let _ = events_tx.send(SessionEvent::Disconnected(session_id)).await;
    let _ = closed_tx.send(session_id).await;
}

#[async_trait]
impl ServerTransport for MemoryServerTransport {
    type Error = MemoryTransportError;

    async fn run(
        mut self,
        events_tx: mpsc::Sender<SessionEvent>,
        mut outgoing_rx: mpsc::Receiver<SessionEnvelope>,
    ) -> Result<(), Self::Error> {
        let mut connections: HashMap<SessionId, mpsc::UnboundedSender<Envelope>> = HashMap::new();
        let (closed_tx, mut closed_rx) = mpsc::channel(self.buffer_size);

        loop {
            tokio::select! {
                Some(connection) = self.connections_rx.recv() => {
                    let session_id = SessionId::new_v4();
                    let (queue_tx, queue_rx) = mpsc::unbounded_channel();
                    connections.insert(session_id, queue_tx);
                    tokio::spawn(deliver_to_client(queue_rx, connection.to_client));
                    tokio::spawn(forward_connection(
                        session_id,
                        connection.from_client,
                        events_tx.clone(),
                        closed_tx.clone(),
                    ));
                }

                Some(session_id) = closed_rx.recv() => {
                    connections.remove(&session_id);
                }

                outgoing = outgoing_rx.recv() => {
                    let Some(SessionEnvelope { session_id, envelope }) = outgoing else {
                        return Ok(());
                    };

                    match connections.get(&session_id) {
                        Some(queue) => {
                            if queue.send(envelope).is_err() {
                                tracing::debug!(%session_id, "Client gone, envelope dropped");
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

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use exsim_protocol::messages::routes;
    use exsim_protocol::Transport;
    use tokio::time::{timeout, Duration};

    async fn next_event(events_rx: &mut mpsc::Receiver<SessionEvent>) -> SessionEvent {
        timeout(Duration::from_secs(1), events_rx.recv())
            .await
            .unwrap()
            .unwrap()
    }

    #[tokio::test]
    async fn test_sessions_are_routed_separately() {
        let (transport, connector) = MemoryServerTransport::new(10);
        let (events_tx, mut events_rx) = mpsc::channel(10);
        let (outgoing_tx, outgoing_rx) = mpsc::channel(10);
        tokio::spawn(transport.run(events_tx, outgoing_rx));

        let mut clients = Vec::new();
        for _ in 0..2 {
            let client = connector.connect().await.unwrap();
            let (incoming_tx, incoming_rx) = mpsc::channel(10);
            let (client_out_tx, client_out_rx) = mpsc::channel(10);
            tokio::spawn(client.run(incoming_tx, client_out_rx));

            let SessionEvent::Connected(session_id) = next_event(&mut events_rx).await else {
                panic!("expected Connected");
            };
            clients.push((session_id, incoming_rx, client_out_tx));
        }

        // Client -> server carries the session id
        let (first_id, _, first_out) = &clients[0];
        let envelope = Envelope::request(1, routes::GET_STATE, 1, Bytes::new());
        first_out.send(envelope.clone()).await.unwrap();
        match next_event(&mut events_rx).await {
            SessionEvent::Envelope(received) => {
                assert_eq!(received.session_id, *first_id);
                assert_eq!(received.envelope, envelope);
            }
            other => panic!("unexpected event {:?}", other),
        }

        // Server -> client reaches only the addressed session
        let second_id = clients[1].0;
        let push = Envelope::request(1, routes::PERFORM_ACTION, 9, Bytes::from_static(b"{}"));
        outgoing_tx
            .send(SessionEnvelope::new(second_id, push.clone()))
            .await
            .unwrap();

        let received = timeout(Duration::from_secs(1), clients[1].1.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(received, push);
        assert!(clients[0].1.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_client_hangup_reports_disconnect() {
        let (transport, connector) = MemoryServerTransport::new(10);
        let (events_tx, mut events_rx) = mpsc::channel(10);
        let (_outgoing_tx, outgoing_rx) = mpsc::channel(10);
        tokio::spawn(transport.run(events_tx, outgoing_rx));

        let client = connector.connect().await.unwrap();
        let SessionEvent::Connected(session_id) = next_event(&mut events_rx).await else {
            panic!("expected Connected");
        };

        drop(client);

        match next_event(&mut events_rx).await {
            SessionEvent::Disconnected(id) => assert_eq!(id, session_id),
            other => panic!("unexpected event {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_slow_client_does_not_block_others() {
        let (transport, connector) = MemoryServerTransport::new(1);
        let (events_tx, mut events_rx) = mpsc::channel(10);
        let (outgoing_tx, outgoing_rx) = mpsc::channel(10);
        tokio::spawn(transport.run(events_tx, outgoing_rx));

        // Never run, so nothing it is sent is ever read
        let _stalled = connector.connect().await.unwrap();
        let SessionEvent::Connected(stalled_id) = next_event(&mut events_rx).await else {
            panic!("expected Connected");
        };

        let reader = connector.connect().await.unwrap();
        let SessionEvent::Connected(reader_id) = next_event(&mut events_rx).await else {
            panic!("expected Connected");
        };
        let (incoming_tx, mut incoming_rx) = mpsc::channel(10);
        let (_reader_out_tx, reader_out_rx) = mpsc::channel(10);
        tokio::spawn(reader.run(incoming_tx, reader_out_rx));

        for msg_id in 1..=5 {
            let push = Envelope::request(1, routes::PERFORM_ACTION, msg_id, Bytes::new());
            outgoing_tx
                .send(SessionEnvelope::new(stalled_id, push))
                .await
                .unwrap();
        }
        let push = Envelope::request(1, routes::PERFORM_ACTION, 6, Bytes::new());
        outgoing_tx
            .send(SessionEnvelope::new(reader_id, push.clone()))
            .await
            .unwrap();

        let received = timeout(Duration::from_secs(1), incoming_rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(received, push);
    }
}
