//! # exsim Server
//!
//! Authoritative exercise server.
//!
//! [`ExerciseServer`] owns the one true exercise state. Clients propose
//! actions; the server reduces each proposal against its state, and if the
//! reducer accepts it, commits it, records it in the history and broadcasts
//! it to every joined client as an authoritative action. Commit order is the
//! order every client applies actions in.
//!
//! ## Example
//!
//! ```no_run
//! # use exsim_simulation::{LogicalClock, Reducer, ReducerError};
//! # use serde::{Deserialize, Serialize};
//! # #[derive(Clone, Default, Serialize, Deserialize)]
//! # struct Exercise { time: u64 }
//! # impl LogicalClock for Exercise { fn current_time(&self) -> u64 { self.time } }
//! # struct Tick;
//! # impl Reducer for Tick {
//! #     type State = Exercise;
//! #     type Action = u64;
//! #     fn reduce(&self, state: &mut Exercise, ms: &u64) -> Result<(), ReducerError> {
//! #         state.time += ms;
//! #         Ok(())
//! #     }
//! # }
//! use exsim_server::{transport::websocket::WebSocketServer, ExerciseServer, ServerConfig};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let transport = WebSocketServer::bind("127.0.0.1:3201").await?;
//!     let (handle, server) =
//!         ExerciseServer::spawn(transport, Tick, Exercise::default(), ServerConfig::default());
//!
//!     // Server-originated actions go through the same commit path
//!     handle.perform_action(1000).await?;
//!     server.await?;
//!     Ok(())
//! }
//! ```

mod handle;
pub mod transport;

use std::collections::HashMap;
use std::sync::Arc;

use exsim_protocol::{
    messages::{
        routes, ErrorReason, Hello, HelloError, HelloOk, JoinExercise, PerformAction,
        ProposeAction, EXERCISE_MESSAGES_START,
    },
    negotiate_version, ActionResponse, CodecType, ConnectionState, Envelope, ProtocolError,
    Response, ServerTransport, SessionEnvelope, SessionEvent, SessionId, CURRENT_PROTOCOL_VERSION,
    MIN_PROTOCOL_VERSION,
};
use exsim_simulation::{LogicalClock, Reducer, ReducerError, ReducerStore, ReplayLog, StateStore};
use serde::{de::DeserializeOwned, Serialize};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use handle::ServerCommand;
pub use handle::ServerHandle;

/// Server configuration
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Capacity of the event, envelope and command channels
    pub channel_capacity: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            channel_capacity: 100,
        }
    }
}

/// Server-side view of one client connection
struct Session {
    connection: ConnectionState,

    /// Codec negotiated in HELLO, used for pushed messages
    codec: CodecType,

    participant: Option<String>,
}

/// Server event loop handler
pub struct ExerciseServer<R: Reducer> {
    /// Connection events and envelopes from the transport
    events_rx: mpsc::Receiver<SessionEvent>,

    /// Channel to send envelopes to transport layer
    outgoing_tx: mpsc::Sender<SessionEnvelope>,

    /// Commands from handles
    command_rx: mpsc::Receiver<ServerCommand<R>>,

    /// The authoritative state
    store: ReducerStore<R>,

    /// Every committed action since the initial state
    history: ReplayLog<R>,

    sessions: HashMap<SessionId, Session>,

    /// Message ID counter for outgoing messages
    next_msg_id: u64,
}

impl<R: Reducer> ExerciseServer<R> {
    /// Creates a server with the default configuration
    pub fn new(
        reducer: R,
        initial_state: R::State,
        events_rx: mpsc::Receiver<SessionEvent>,
        outgoing_tx: mpsc::Sender<SessionEnvelope>,
    ) -> (Self, ServerHandle<R>) {
        Self::with_config(
            reducer,
            initial_state,
            events_rx,
            outgoing_tx,
            ServerConfig::default(),
        )
    }

    /// Creates a server with a custom configuration
    pub fn with_config(
        reducer: R,
        initial_state: R::State,
        events_rx: mpsc::Receiver<SessionEvent>,
        outgoing_tx: mpsc::Sender<SessionEnvelope>,
        config: ServerConfig,
    ) -> (Self, ServerHandle<R>) {
        let reducer = Arc::new(reducer);
        let store = ReducerStore::new(reducer.clone(), initial_state);
        let history = ReplayLog::new(reducer, store.get_state());
        let state_rx = store.subscribe();
        let (command_tx, command_rx) = mpsc::channel(config.channel_capacity);

        let server = Self {
            events_rx,
            outgoing_tx,
            command_rx,
            store,
            history,
            sessions: HashMap::new(),
            next_msg_id: 1,
        };

        (server, ServerHandle::new(command_tx, state_rx))
    }

    /// Starts `transport` and a server on top of it
    ///
    /// Returns the server's handle and the event loop task.
    pub fn spawn<T: ServerTransport>(
        transport: T,
        reducer: R,
        initial_state: R::State,
        config: ServerConfig,
    ) -> (ServerHandle<R>, JoinHandle<()>) {
        let (events_tx, events_rx) = mpsc::channel(config.channel_capacity);
        let (outgoing_tx, outgoing_rx) = mpsc::channel(config.channel_capacity);

        tokio::spawn(async move {
            if let Err(e) = transport.run(events_tx, outgoing_rx).await {
                tracing::error!(error = %e, "Server transport failed");
            }
        });

        let (server, handle) =
            Self::with_config(reducer, initial_state, events_rx, outgoing_tx, config);
        (handle, tokio::spawn(server.run()))
    }

    /// Runs the main event loop
    ///
    /// Returns when the transport closes its event channel.
    pub async fn run(mut self) {
        loop {
            tokio::select! {
                event = self.events_rx.recv() => {
                    let Some(event) = event else {
                        tracing::info!("Server shutting down: transport closed");
                        break;
                    };
                    if let Err(e) = self.handle_event(event).await {
                        tracing::error!(error = %e, "Error handling session event");
                    }
                }

                Some(command) = self.command_rx.recv() => {
                    self.handle_command(command).await;
                }
            }
        }
    }

    async fn handle_event(&mut self, event: SessionEvent) -> Result<(), ServerError> {
        match event {
            SessionEvent::Connected(session_id) => {
                tracing::info!(%session_id, "Session connected");
                self.sessions.insert(
                    session_id,
                    Session {
                        connection: ConnectionState::Connecting,
                        codec: CodecType::default(),
                        participant: None,
                    },
                );
                Ok(())
            }
            SessionEvent::Disconnected(session_id) => {
                if let Some(session) = self.sessions.remove(&session_id) {
                    tracing::info!(
                        %session_id,
                        participant = session.participant.as_deref().unwrap_or("-"),
                        "Session disconnected"
                    );
                }
                Ok(())
            }
            SessionEvent::Envelope(session_envelope) => {
                self.handle_session_envelope(session_envelope).await
            }
        }
    }

    /// Handles a single session envelope
    async fn handle_session_envelope(
        &mut self,
        session_envelope: SessionEnvelope,
    ) -> Result<(), ServerError> {
        let SessionEnvelope {
            session_id,
            envelope,
        } = session_envelope;

        let Some(session) = self.sessions.get(&session_id) else {
            tracing::warn!(%session_id, "Envelope from unknown session dropped");
            return Ok(());
        };

        tracing::debug!(
            %session_id,
            route_id = envelope.route_id,
            msg_id = envelope.msg_id,
            payload_len = envelope.payload_len,
            state = %session.connection,
            "Server received envelope"
        );

        // Dispatch based on route_id: control messages (<100) vs exercise messages (>=100)
        if envelope.route_id < EXERCISE_MESSAGES_START {
            self.handle_control_message(session_id, envelope).await
        } else {
            self.handle_exercise_message(session_id, envelope).await
        }
    }

    /// Handles control messages (route_id < 100)
    async fn handle_control_message(
        &mut self,
        session_id: SessionId,
        envelope: Envelope,
    ) -> Result<(), ServerError> {
        match envelope.route_id {
            routes::HELLO => self.handle_hello(session_id, envelope).await,
            route_id => Err(ProtocolError::UnknownRoute(route_id).into()),
        }
    }

    /// Handles HELLO message from client
    async fn handle_hello(
        &mut self,
        session_id: SessionId,
        envelope: Envelope,
    ) -> Result<(), ServerError> {
        let hello: Hello = decode(&envelope)?;

        tracing::info!(
            %session_id,
            version = format!("{:#06x}", hello.protocol_version),
            min = format!("{:#06x}", hello.min_protocol_version),
            codec_id = hello.codec_id,
            "HELLO from client"
        );

        let rejection = match self.accept_hello(session_id, &hello) {
            Ok(negotiated_version) => {
                let hello_ok = HelloOk {
                    server_version: negotiated_version,
                    session_id: session_id.to_string(),
                };
                self.reply(session_id, &envelope, routes::HELLO_OK, &hello_ok)
                    .await?;
                tracing::info!(
                    %session_id,
                    version = format!("{:#06x}", negotiated_version),
                    "Connection established"
                );
                return Ok(());
            }
            Err(rejection) => rejection,
        };

        tracing::warn!(
            %session_id,
            reason = ?rejection.reason,
            message = %rejection.message,
            "Rejecting HELLO"
        );
        self.reply(session_id, &envelope, routes::HELLO_ERROR, &rejection)
            .await
    }

    fn accept_hello(&mut self, session_id: SessionId, hello: &Hello) -> Result<u16, HelloError> {
        let session = self.sessions.get_mut(&session_id).ok_or_else(|| HelloError {
            reason: ErrorReason::InvalidState,
            message: "Unknown session".to_string(),
        })?;

        if !session.connection.can_transition_to(ConnectionState::Connected)
            || session.connection.is_connected()
        {
            return Err(HelloError {
                reason: ErrorReason::InvalidState,
                message: format!("HELLO not expected in state {}", session.connection),
            });
        }

        let codec = CodecType::from_id(hello.codec_id).map_err(|e| HelloError {
            reason: ErrorReason::UnsupportedCodec,
            message: e.to_string(),
        })?;

        let negotiated = negotiate_version(
            hello.protocol_version,
            hello.min_protocol_version,
            CURRENT_PROTOCOL_VERSION,
            MIN_PROTOCOL_VERSION,
        )
        .map_err(|e| HelloError {
            reason: ErrorReason::VersionMismatch,
            message: e.to_string(),
        })?;

        session.codec = codec;
        session.connection = ConnectionState::Connected;
        Ok(negotiated)
    }

    /// Handles exercise messages (route_id >= 100)
    async fn handle_exercise_message(
        &mut self,
        session_id: SessionId,
        envelope: Envelope,
    ) -> Result<(), ServerError> {
        let connection = self.connection(session_id);
        if !connection.is_connected() {
            tracing::warn!(
                %session_id,
                route_id = envelope.route_id,
                state = %connection,
                "Rejecting exercise message before handshake"
            );
            return Ok(());
        }

        match envelope.route_id {
            routes::JOIN_EXERCISE => self.handle_join(session_id, envelope).await,
            routes::LEAVE_EXERCISE => {
                self.handle_leave(session_id);
                Ok(())
            }
            routes::PROPOSE_ACTION => self.handle_propose(session_id, envelope).await,
            routes::GET_STATE => {
                let state = self.store.get_state();
                let snapshot = Response::ok_with(&*state);
                self.reply(session_id, &envelope, routes::EXERCISE_STATE, &snapshot)
                    .await
            }
            routes::GET_HISTORY => {
                let history = Response::ok_with(self.history.to_history());
                self.reply(session_id, &envelope, routes::EXERCISE_HISTORY, &history)
                    .await
            }
            route_id => Err(ProtocolError::UnknownRoute(route_id).into()),
        }
    }

    async fn handle_join(
        &mut self,
        session_id: SessionId,
        envelope: Envelope,
    ) -> Result<(), ServerError> {
        let join = match decode::<JoinExercise>(&envelope) {
            Ok(join) => join,
            Err(e) => {
                let rejection = Response::<()>::failure(e.to_string());
                return self
                    .reply(session_id, &envelope, routes::EXERCISE_STATE, &rejection)
                    .await;
            }
        };

        if let Some(session) = self.sessions.get_mut(&session_id) {
            if session.connection.transition_to(ConnectionState::Joining).is_err() {
                let rejection = Response::<()>::failure("Already joined");
                return self
                    .reply(session_id, &envelope, routes::EXERCISE_STATE, &rejection)
                    .await;
            }
            session.participant = Some(join.participant_name.clone());
        }

        // Broadcasts start with the first action committed after this snapshot
        let state = self.store.get_state();
        let snapshot = Response::ok_with(&*state);
        self.reply(session_id, &envelope, routes::EXERCISE_STATE, &snapshot)
            .await?;

        if let Some(session) = self.sessions.get_mut(&session_id) {
            session.connection.transition_to(ConnectionState::Joined)?;
        }

        tracing::info!(%session_id, participant = %join.participant_name, "Participant joined");
        Ok(())
    }

    fn handle_leave(&mut self, session_id: SessionId) {
        if let Some(session) = self.sessions.get_mut(&session_id) {
            if session.connection.is_joined() {
                session.connection = ConnectionState::Connected;
                tracing::info!(
                    %session_id,
                    participant = session.participant.as_deref().unwrap_or("-"),
                    "Participant left"
                );
            }
        }
    }

    async fn handle_propose(
        &mut self,
        session_id: SessionId,
        envelope: Envelope,
    ) -> Result<(), ServerError> {
        let response = if !self.connection(session_id).is_joined() {
            ActionResponse::failure("Not joined to the exercise")
        } else {
            match decode::<ProposeAction<R::Action>>(&envelope) {
                Ok(proposal) => match self.commit(proposal.action).await {
                    Ok(()) => ActionResponse::ok(),
                    Err(ServerError::Rejected(e)) => {
                        tracing::debug!(%session_id, error = %e, "Proposal rejected");
                        ActionResponse::failure(e.to_string())
                    }
                    Err(e) => return Err(e),
                },
                Err(e) => ActionResponse::failure(e.to_string()),
            }
        };

        // The proposer sees its own PERFORM_ACTION before this response
        self.reply(session_id, &envelope, routes::ACTION_RESPONSE, &response)
            .await
    }

    /// Validates, commits, records and broadcasts one action
    async fn commit(&mut self, action: R::Action) -> Result<(), ServerError> {
        self.store.apply_action(&action)?;

        let timestamp = self.store.get_state().current_time();
        tracing::debug!(?action, timestamp, "Action committed");
        self.history.push(action.clone(), timestamp);

        self.broadcast(&PerformAction { action }).await
    }

    /// Pushes PERFORM_ACTION to every joined session
    async fn broadcast(&mut self, perform: &PerformAction<R::Action>) -> Result<(), ServerError> {
        let targets: Vec<(SessionId, CodecType)> = self
            .sessions
            .iter()
            .filter(|(_, session)| session.connection.is_joined())
            .map(|(session_id, session)| (*session_id, session.codec))
            .collect();

        for (session_id, codec) in targets {
            let msg_id = self.allocate_msg_id();
            let envelope = Envelope::request(
                codec.id(),
                routes::PERFORM_ACTION,
                msg_id,
                codec.encode(perform)?,
            );
            self.send(session_id, envelope).await?;
        }

        Ok(())
    }

    async fn handle_command(&mut self, command: ServerCommand<R>) {
        match command {
            ServerCommand::Perform { action, reply } => {
                let result = match self.commit(action).await {
                    Ok(()) => Ok(()),
                    Err(ServerError::Rejected(e)) => Err(e),
                    Err(e) => {
                        tracing::error!(error = %e, "Failed to broadcast server action");
                        Ok(())
                    }
                };
                let _ = reply.send(result);
            }
            ServerCommand::Participants { reply } => {
                let participants = self
                    .sessions
                    .values()
                    .filter(|session| session.connection.is_joined())
                    .filter_map(|session| session.participant.clone())
                    .collect();
                let _ = reply.send(participants);
            }
        }
    }

    fn connection(&self, session_id: SessionId) -> ConnectionState {
        self.sessions
            .get(&session_id)
            .map(|session| session.connection)
            .unwrap_or_default()
    }

    /// Replies to `request` in the codec it was written in
    async fn reply<T: Serialize>(
        &mut self,
        session_id: SessionId,
        request: &Envelope,
        route_id: u16,
        message: &T,
    ) -> Result<(), ServerError> {
        let codec = CodecType::from_id(request.codec_id)?;
        let msg_id = self.allocate_msg_id();
        let envelope = Envelope::new(
            codec.id(),
            route_id,
            msg_id,
            request.msg_id,
            codec.encode(message)?,
        );
        self.send(session_id, envelope).await
    }

    async fn send(&mut self, session_id: SessionId, envelope: Envelope) -> Result<(), ServerError> {
        self.outgoing_tx
            .send(SessionEnvelope::new(session_id, envelope))
            .await
            .map_err(|_| ServerError::ChannelSendError)
    }

    fn allocate_msg_id(&mut self) -> u64 {
        let msg_id = self.next_msg_id;
        self.next_msg_id += 1;
        msg_id
    }
}

/// Decodes an envelope's payload with the codec it names
fn decode<T: DeserializeOwned>(envelope: &Envelope) -> Result<T, ServerError> {
    let codec = CodecType::from_id(envelope.codec_id)?;
    Ok(codec.decode(&envelope.payload)?)
}

/// Server errors
#[derive(Debug, thiserror::Error)]
pub enum ServerError {
    #[error("Failed to send envelope through channel")]
    ChannelSendError,

    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    #[error("Action rejected: {0}")]
    Rejected(#[from] ReducerError),

    #[error("Server stopped")]
    Stopped,
}
