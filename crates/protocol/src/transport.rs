//! Transport layer abstraction
//!
//! Transports only move envelopes. They know nothing about exercises,
//! proposals or state; the client and server event loops stay
//! transport-agnostic by talking to them through channels.

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::{Envelope, SessionEnvelope, SessionId};

/// Client-side transport: one connection to one server
///
/// # Example: Implementing a custom transport
///
/// ```no_run
/// use async_trait::async_trait;
/// use exsim_protocol::transport::Transport;
/// use exsim_protocol::Envelope;
/// use tokio::sync::mpsc;
///
/// struct LoopbackTransport;
///
/// #[async_trait]
/// impl Transport for LoopbackTransport {
///     type Error = std::io::Error;
///
///     async fn run(
///         self,
///         incoming_tx: mpsc::Sender<Envelope>,
///         mut outgoing_rx: mpsc::Receiver<Envelope>,
///     ) -> Result<(), Self::Error> {
///         while let Some(envelope) = outgoing_rx.recv().await {
///             if incoming_tx.send(envelope).await.is_err() {
///                 break;
///             }
///         }
///         Ok(())
///     }
/// }
/// ```
#[async_trait]
pub trait Transport: Send + 'static {
    /// Error type for this transport
    type Error: std::error::Error + Send + Sync + 'static;

    /// Runs the transport, bridging the connection and the event loop
    ///
    /// Envelopes read from the connection go to `incoming_tx`, in the order
    /// they were received. Envelopes from `outgoing_rx` are written to the
    /// connection in the order they were queued.
    ///
    /// Returns `Ok(())` when either side shuts down gracefully.
    async fn run(
        self,
        incoming_tx: mpsc::Sender<Envelope>,
        outgoing_rx: mpsc::Receiver<Envelope>,
    ) -> Result<(), Self::Error>;
}

/// Connection lifecycle and traffic reported by a server transport
#[derive(Debug, Clone)]
pub enum SessionEvent {
    /// A new connection was accepted and assigned a session id
    Connected(SessionId),

    /// An envelope arrived on an existing connection
    Envelope(SessionEnvelope),

    /// The connection is gone; no more envelopes will arrive for it
    Disconnected(SessionId),
}

/// Server-side transport: many connections multiplexed by session id
#[async_trait]
pub trait ServerTransport: Send + 'static {
    /// Error type for this transport
    type Error: std::error::Error + Send + Sync + 'static;

    /// Runs the transport until it is shut down
    ///
    /// For every connection the transport emits `Connected`, then its
    /// envelopes in receive order, then `Disconnected`. Outgoing envelopes
    /// are routed to the connection named by their session id; envelopes for
    /// unknown sessions are dropped.
    async fn run(
        self,
        events_tx: mpsc::Sender<SessionEvent>,
        outgoing_rx: mpsc::Receiver<SessionEnvelope>,
    ) -> Result<(), Self::Error>;
}
