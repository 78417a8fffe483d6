//! In-memory transport
//!
//! Uses Tokio channels instead of sockets. Useful for tests and for running
//! a client in the same process as the exercise server (see the server's
//! `MemoryConnector`).

use super::Transport;
use async_trait::async_trait;
use exsim_protocol::Envelope;
use tokio::sync::mpsc;

/// In-memory transport that talks to its peer through channels
///
/// # Example
///
/// ```no_run
/// use exsim_client::transport::memory::MemoryTransport;
/// use tokio::sync::mpsc;
///
/// let (to_peer_tx, to_peer_rx) = mpsc::channel(100);
/// let (from_peer_tx, from_peer_rx) = mpsc::channel(100);
///
/// let transport = MemoryTransport::new(to_peer_tx, from_peer_rx);
/// ```
pub struct MemoryTransport {
    /// Channel to send envelopes to the peer
    to_peer: mpsc::Sender<Envelope>,
    /// Channel to receive envelopes from the peer
    from_peer: mpsc::Receiver<Envelope>,
}

impl MemoryTransport {
    /// Creates a new in-memory transport
    pub fn new(to_peer: mpsc::Sender<Envelope>, from_peer: mpsc::Receiver<Envelope>) -> Self {
        Self { to_peer, from_peer }
    }

    /// Creates two transports connected to each other
    ///
    /// ```
    /// use exsim_client::transport::memory::MemoryTransport;
    ///
    /// let (local, remote) = MemoryTransport::create_pair(100);
    /// ```
    pub fn create_pair(buffer_size: usize) -> (Self, Self) {
        let (a_to_b_tx, a_to_b_rx) = mpsc::channel(buffer_size);
        let (b_to_a_tx, b_to_a_rx) = mpsc::channel(buffer_size);

        (Self::new(a_to_b_tx, b_to_a_rx), Self::new(b_to_a_tx, a_to_b_rx))
    }
}

#[async_trait]
impl Transport for MemoryTransport {
    type Error = MemoryTransportError;

    async fn run(
        mut self,
        incoming_tx: mpsc::Sender<Envelope>,
        mut outgoing_rx: mpsc::Receiver<Envelope>,
    ) -> Result<(), Self::Error> {
        loop {
            tokio::select! {
                // Receive from peer, forward to event loop
                from_peer = self.from_peer.recv() => {
                    let Some(envelope) = from_peer else {
                        return Ok(());
                    };
                    if incoming_tx.send(envelope).await.is_err() {
                        return Err(MemoryTransportError::ChannelClosed);
                    }
                }

                // Receive from event loop, send to peer
                outgoing = outgoing_rx.recv() => {
                    let Some(envelope) = outgoing else {
                        return Ok(());
                    };
                    if self.to_peer.send(envelope).await.is_err() {
                        return Err(MemoryTransportError::ChannelClosed);
                    }
                }
            }
        }
    }
}

/// Memory transport errors
#[derive(Debug, thiserror::Error)]
pub enum MemoryTransportError {
    #[error("Transport channel closed")]
    ChannelClosed,
}
