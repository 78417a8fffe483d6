//! Client event loop

use std::collections::{HashMap, VecDeque};
use std::ops::ControlFlow;
use std::sync::Arc;

use exsim_protocol::{
    messages::{
        routes, GetHistory, GetState, Hello, HelloError, HelloOk, JoinExercise, LeaveExercise,
        PerformAction, ProposeAction, EXERCISE_MESSAGES_START,
    },
    CodecType, ConnectionState, Envelope, ExerciseHistory, ProtocolError, Response, Transport,
    CURRENT_PROTOCOL_VERSION, MIN_PROTOCOL_VERSION,
};
use exsim_simulation::{
    Dispatch, OptimisticCoordinator, ProposalError, ProposalResult, Reducer, ReducerStore,
    ReplayLog, StateStore,
};
use serde::{de::DeserializeOwned, Serialize};
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;

use crate::handle::Command;
use crate::{ClientConfig, ClientError, ClientHandle, SessionMode};

type Reply<T> = oneshot::Sender<Result<T, ClientError>>;

/// A request sent to the server, waiting for its reply
enum Pending {
    Hello { participant: String, reply: Reply<()> },
    Join { reply: Reply<()> },
    Proposal { reply: oneshot::Sender<ProposalResult> },
    Snapshot {
        reply: Option<Reply<()>>,
        /// Ends time travel once installed
        resume_live: bool,
    },
    History { reply: Reply<(u64, u64)> },
}

/// The optimistic proposal the server has not answered yet
struct RoundTrip {
    msg_id: u64,
    deadline: Option<Instant>,
}

/// Client event loop handler
///
/// Owns the local exercise state and the optimistic coordinator. Envelopes
/// from the transport, commands from [`ClientHandle`]s and the round-trip
/// deadline are handled one at a time.
pub struct ExerciseClient<R: Reducer> {
    /// Channel to receive envelopes from transport layer
    incoming_rx: mpsc::Receiver<Envelope>,

    /// Channel to send envelopes to transport layer
    outgoing_tx: mpsc::Sender<Envelope>,

    /// Commands from handles
    command_rx: mpsc::Receiver<Command<R>>,

    config: ClientConfig,

    /// Codec for exercise messages
    codec: CodecType,

    connection: ConnectionState,

    mode: watch::Sender<SessionMode>,

    coordinator: OptimisticCoordinator<ReducerStore<R>>,

    /// Outstanding requests by msg_id
    pending: HashMap<u64, Pending>,

    round_trip: Option<RoundTrip>,

    /// GET_STATE requests not answered yet
    ///
    /// Authoritative actions arriving meanwhile are contained in the snapshot
    /// and are dropped.
    snapshots_in_flight: usize,

    /// Envelopes read while waiting to send, handled before new ones
    backlog: VecDeque<Envelope>,

    /// The transport closed the incoming channel while we were sending
    incoming_closed: bool,

    /// Loaded history, present while time travelling until leaving is requested
    history: Option<ReplayLog<R>>,

    next_msg_id: u64,
}

impl<R: Reducer> ExerciseClient<R> {
    /// Creates a client with the default configuration
    ///
    /// `initial_state` is shown until the exercise has been joined.
    pub fn new(
        reducer: R,
        initial_state: R::State,
        incoming_rx: mpsc::Receiver<Envelope>,
        outgoing_tx: mpsc::Sender<Envelope>,
    ) -> (Self, ClientHandle<R>) {
        Self::with_config(
            reducer,
            initial_state,
            incoming_rx,
            outgoing_tx,
            ClientConfig::default(),
        )
    }

    /// Creates a client with a custom configuration
    pub fn with_config(
        reducer: R,
        initial_state: R::State,
        incoming_rx: mpsc::Receiver<Envelope>,
        outgoing_tx: mpsc::Sender<Envelope>,
        config: ClientConfig,
    ) -> (Self, ClientHandle<R>) {
        let codec = CodecType::from_id(config.codec_id).unwrap_or_else(|e| {
            tracing::warn!(error = %e, "Falling back to JSON for exercise messages");
            CodecType::default()
        });

        let store = ReducerStore::new(Arc::new(reducer), initial_state);
        let state_rx = store.subscribe();
        let (command_tx, command_rx) = mpsc::channel(config.channel_capacity);
        let (mode, mode_rx) = watch::channel(SessionMode::Idle);

        let client = Self {
            incoming_rx,
            outgoing_tx,
            command_rx,
            config,
            codec,
            connection: ConnectionState::Closed,
            mode,
            coordinator: OptimisticCoordinator::new(store),
            pending: HashMap::new(),
            round_trip: None,
            snapshots_in_flight: 0,
            backlog: VecDeque::new(),
            incoming_closed: false,
            history: None,
            next_msg_id: 1,
        };

        (client, ClientHandle::new(command_tx, state_rx, mode_rx))
    }

    /// Starts `transport` and a client on top of it
    ///
    /// Returns the client's handle and the event loop task. Transport errors
    /// are logged; when the transport stops, so does the loop.
    pub fn spawn<T: Transport>(
        transport: T,
        reducer: R,
        initial_state: R::State,
        config: ClientConfig,
    ) -> (ClientHandle<R>, JoinHandle<()>) {
        let (incoming_tx, incoming_rx) = mpsc::channel(config.channel_capacity);
        let (outgoing_tx, outgoing_rx) = mpsc::channel(config.channel_capacity);

        tokio::spawn(async move {
            if let Err(e) = transport.run(incoming_tx, outgoing_rx).await {
                tracing::error!(error = %e, "Client transport failed");
            }
        });

        let (client, handle) =
            Self::with_config(reducer, initial_state, incoming_rx, outgoing_tx, config);
        (handle, tokio::spawn(client.run()))
    }

    /// Runs the main event loop
    ///
    /// Returns when the transport closes, after a leave, or once every
    /// handle has been dropped.
    pub async fn run(mut self) {
        loop {
            if let Some(envelope) = self.backlog.pop_front() {
                self.handle_envelope(envelope).await;
                continue;
            }
            if self.incoming_closed {
                tracing::info!("Client shutting down: incoming channel closed");
                break;
            }

            let deadline = self.round_trip.as_ref().and_then(|rt| rt.deadline);

            tokio::select! {
                incoming = self.incoming_rx.recv() => {
                    let Some(envelope) = incoming else {
                        tracing::info!("Client shutting down: incoming channel closed");
                        break;
                    };
                    self.handle_envelope(envelope).await;
                }

                command = self.command_rx.recv() => {
                    let Some(command) = command else {
                        tracing::info!("Client shutting down: all handles dropped");
                        break;
                    };
                    if self.handle_command(command).await.is_break() {
                        break;
                    }
                }

                _ = tokio::time::sleep_until(deadline.unwrap_or_else(Instant::now)), if deadline.is_some() => {
                    self.expire_round_trip().await;
                }
            }
        }

        self.shutdown();
    }

    fn shutdown(&mut self) {
        if !self.pending.is_empty() {
            tracing::debug!(pending = self.pending.len(), "Dropping unanswered requests");
        }
        // Dropping the reply senders fails every waiting caller
        self.pending.clear();
        self.history = None;
        self.connection = ConnectionState::Closed;
        self.mode.send_replace(SessionMode::Idle);
    }

    /// Handles a single incoming envelope
    async fn handle_envelope(&mut self, envelope: Envelope) {
        tracing::debug!(
            route_id = envelope.route_id,
            msg_id = envelope.msg_id,
            correlation_id = envelope.correlation_id,
            payload_len = envelope.payload_len,
            state = %self.connection,
            "Client received envelope"
        );

        let result = if envelope.route_id < EXERCISE_MESSAGES_START {
            self.handle_control_message(envelope).await
        } else {
            self.handle_exercise_message(envelope).await
        };

        if let Err(e) = result {
            tracing::error!(error = %e, "Error handling envelope");
        }
    }

    /// Handles control messages (route_id < 100)
    async fn handle_control_message(&mut self, envelope: Envelope) -> Result<(), ClientError> {
        match envelope.route_id {
            routes::HELLO_OK => self.handle_hello_ok(envelope).await,
            routes::HELLO_ERROR => self.handle_hello_error(envelope),
            _ => {
                tracing::warn!(route_id = envelope.route_id, "Unknown control message");
                Ok(())
            }
        }
    }

    /// Handles exercise messages (route_id >= 100)
    async fn handle_exercise_message(&mut self, envelope: Envelope) -> Result<(), ClientError> {
        match envelope.route_id {
            routes::PERFORM_ACTION => self.handle_perform_action(envelope).await,
            routes::ACTION_RESPONSE => self.handle_action_response(envelope).await,
            routes::EXERCISE_STATE => self.handle_exercise_state(envelope).await,
            routes::EXERCISE_HISTORY => {
                self.handle_exercise_history(envelope);
                Ok(())
            }
            route_id => Err(ProtocolError::UnknownRoute(route_id).into()),
        }
    }

    async fn handle_hello_ok(&mut self, envelope: Envelope) -> Result<(), ClientError> {
        let Some(Pending::Hello { participant, reply }) =
            self.take_pending(&envelope, |p| matches!(p, Pending::Hello { .. }))
        else {
            return Ok(());
        };

        match self.complete_handshake(&envelope, participant).await {
            Ok(msg_id) => {
                self.pending.insert(msg_id, Pending::Join { reply });
            }
            Err(e) => {
                self.connection = ConnectionState::Closed;
                let _ = reply.send(Err(e));
            }
        }
        Ok(())
    }

    async fn complete_handshake(
        &mut self,
        envelope: &Envelope,
        participant: String,
    ) -> Result<u64, ClientError> {
        let hello_ok: HelloOk = decode(envelope)?;

        tracing::info!(
            version = format!("{:#06x}", hello_ok.server_version),
            session_id = %hello_ok.session_id,
            "HELLO_OK received"
        );

        self.connection.transition_to(ConnectionState::Connected)?;

        let join = JoinExercise {
            participant_name: participant,
        };
        let msg_id = self
            .send_request(self.codec, routes::JOIN_EXERCISE, &join)
            .await?;

        self.connection.transition_to(ConnectionState::Joining)?;
        Ok(msg_id)
    }

    fn handle_hello_error(&mut self, envelope: Envelope) -> Result<(), ClientError> {
        let Some(Pending::Hello { reply, .. }) =
            self.take_pending(&envelope, |p| matches!(p, Pending::Hello { .. }))
        else {
            return Ok(());
        };

        self.connection = ConnectionState::Closed;

        let error = match decode::<HelloError>(&envelope) {
            Ok(hello_error) => {
                tracing::error!(
                    reason = ?hello_error.reason,
                    message = %hello_error.message,
                    "HELLO_ERROR received"
                );
                ClientError::HandshakeRejected(hello_error.message)
            }
            Err(e) => e,
        };

        let _ = reply.send(Err(error));
        Ok(())
    }

    async fn handle_perform_action(&mut self, envelope: Envelope) -> Result<(), ClientError> {
        if !self.connection.is_joined() || self.is_time_travelling() {
            tracing::debug!("Ignoring authoritative action outside live mode");
            return Ok(());
        }

        if self.snapshots_in_flight > 0 {
            tracing::trace!("Dropping authoritative action, snapshot pending");
            return Ok(());
        }

        let applied = decode::<PerformAction<R::Action>>(&envelope).and_then(|perform| {
            self.coordinator
                .perform_action(perform.action)
                .map_err(ClientError::from)
        });

        if let Err(e) = applied {
            tracing::warn!(error = %e, "Authoritative action could not be applied, resynchronizing");
            self.request_snapshot(None, false).await;
        }

        Ok(())
    }

    async fn handle_action_response(&mut self, envelope: Envelope) -> Result<(), ClientError> {
        let Some(Pending::Proposal { reply }) =
            self.take_pending(&envelope, |p| matches!(p, Pending::Proposal { .. }))
        else {
            return Ok(());
        };

        let response = decode::<Response>(&envelope)
            .unwrap_or_else(|e| Response::failure(format!("Malformed response: {}", e)));

        tracing::debug!(
            msg_id = envelope.correlation_id,
            success = response.success,
            "Proposal answered"
        );

        let closes_round_trip = self
            .round_trip
            .as_ref()
            .is_some_and(|rt| rt.msg_id == envelope.correlation_id);

        if closes_round_trip {
            let dispatches = self.settle_round_trip().await;
            let _ = reply.send(Ok(response));
            self.send_dispatches(dispatches).await;
        } else {
            let _ = reply.send(Ok(response));
        }

        Ok(())
    }

    async fn handle_exercise_state(&mut self, envelope: Envelope) -> Result<(), ClientError> {
        let Some(pending) = self.take_pending(&envelope, |p| {
            matches!(p, Pending::Join { .. } | Pending::Snapshot { .. })
        }) else {
            return Ok(());
        };

        let snapshot = decode::<Response<R::State>>(&envelope).and_then(into_payload);

        match pending {
            Pending::Join { reply } => {
                let result = snapshot.and_then(|state| {
                    self.connection.transition_to(ConnectionState::Joined)?;
                    self.coordinator.resynchronize(Arc::new(state));
                    self.mode.send_replace(SessionMode::Live);
                    tracing::info!("Joined exercise");
                    Ok(())
                });

                if result.is_err() {
                    self.connection = ConnectionState::Closed;
                }
                let _ = reply.send(result);
            }

            Pending::Snapshot { reply, resume_live } => {
                self.snapshots_in_flight = self.snapshots_in_flight.saturating_sub(1);

                let result = snapshot.and_then(|state| {
                    if self.is_time_travelling() && !resume_live {
                        return Err(ClientError::TimeTravelActive);
                    }
                    self.coordinator.resynchronize(Arc::new(state));
                    if resume_live {
                        self.mode.send_replace(SessionMode::Live);
                        tracing::info!("Time travel stopped, back to live");
                    } else {
                        tracing::info!("Resynchronized with server");
                    }
                    Ok(())
                });

                match reply {
                    Some(reply) => {
                        let _ = reply.send(result);
                    }
                    None => {
                        if let Err(e) = result {
                            tracing::error!(error = %e, "Resynchronization failed");
                        }
                    }
                }
            }

            _ => {}
        }

        Ok(())
    }

    fn handle_exercise_history(&mut self, envelope: Envelope) {
        let Some(Pending::History { reply }) =
            self.take_pending(&envelope, |p| matches!(p, Pending::History { .. }))
        else {
            return;
        };

        let _ = reply.send(self.enter_time_travel(&envelope));
    }

    fn enter_time_travel(&mut self, envelope: &Envelope) -> Result<(u64, u64), ClientError> {
        let history: ExerciseHistory<R::State, R::Action> =
            decode::<Response<_>>(envelope).and_then(into_payload)?;

        if self.mode() != SessionMode::Live {
            return Err(ClientError::NotJoined);
        }
        if self.coordinator.is_waiting() {
            return Err(ClientError::RoundTripInFlight);
        }

        let log = ReplayLog::from_history(self.coordinator.store().reducer().clone(), history);
        let range = log.time_range();

        tracing::info!(
            actions = log.len(),
            from = range.0,
            to = range.1,
            "Time travel started"
        );

        self.history = Some(log);
        self.mode.send_replace(SessionMode::TimeTravel { time: range.1 });
        Ok(range)
    }

    /// Handles a command from a handle
    async fn handle_command(&mut self, command: Command<R>) -> ControlFlow<()> {
        match command {
            Command::Join { participant, reply } => self.start_join(participant, reply).await,

            Command::Propose {
                action,
                optimistic,
                reply,
            } => self.propose(action, optimistic, reply).await,

            Command::Resync { reply } => match self.live_check() {
                Ok(()) => self.request_snapshot(Some(reply), false).await,
                Err(e) => {
                    let _ = reply.send(Err(e));
                }
            },

            Command::StartTimeTravel { reply } => self.start_time_travel(reply).await,

            Command::JumpToTime { time, reply } => {
                let _ = reply.send(self.jump_to_time(time));
            }

            Command::StopTimeTravel { reply } => {
                if !self.is_time_travelling() {
                    let _ = reply.send(Err(ClientError::NotTimeTravelling));
                } else {
                    // Still time travelling until the live snapshot is installed
                    self.history = None;
                    self.request_snapshot(Some(reply), true).await;
                }
            }

            Command::Leave { reply } => {
                let _ = reply.send(self.leave().await);
                return ControlFlow::Break(());
            }
        }

        ControlFlow::Continue(())
    }

    async fn start_join(&mut self, participant: String, reply: Reply<()>) {
        if !self.connection.is_closed() {
            let _ = reply.send(Err(ClientError::AlreadyJoined));
            return;
        }

        match self.send_hello().await {
            Ok(msg_id) => {
                self.pending
                    .insert(msg_id, Pending::Hello { participant, reply });
            }
            Err(e) => {
                self.connection = ConnectionState::Closed;
                let _ = reply.send(Err(e));
            }
        }
    }

    /// Initiates the handshake by sending HELLO
    async fn send_hello(&mut self) -> Result<u64, ClientError> {
        tracing::info!("Sending HELLO");

        self.connection.transition_to(ConnectionState::Connecting)?;

        let hello = Hello {
            protocol_version: CURRENT_PROTOCOL_VERSION,
            min_protocol_version: MIN_PROTOCOL_VERSION,
            codec_id: self.codec.id(),
        };
        let msg_id = self
            .send_request(CodecType::default(), routes::HELLO, &hello)
            .await?;

        self.connection.transition_to(ConnectionState::HelloSent)?;
        Ok(msg_id)
    }

    async fn propose(
        &mut self,
        action: R::Action,
        optimistic: bool,
        reply: oneshot::Sender<ProposalResult>,
    ) {
        if let Err(e) = self.live_check() {
            let _ = reply.send(Ok(Response::failure(e.to_string())));
            return;
        }

        if let Some(dispatch) = self.coordinator.propose_action(action, optimistic, reply) {
            self.send_dispatches(vec![dispatch]).await;
        }
    }

    /// Sends proposals handed out by the coordinator, in order
    ///
    /// A proposal that cannot be sent resolves as rejected; if it was the
    /// optimistic one, its round trip is closed right away and whatever the
    /// coordinator releases next is sent in its place.
    async fn send_dispatches(&mut self, dispatches: Vec<Dispatch<R::Action>>) {
        let mut queue = VecDeque::from(dispatches);

        while let Some(dispatch) = queue.pop_front() {
            let proposal = ProposeAction {
                action: dispatch.action,
            };

            match self
                .send_request(self.codec, routes::PROPOSE_ACTION, &proposal)
                .await
            {
                Ok(msg_id) => {
                    if dispatch.optimistic {
                        self.round_trip = Some(RoundTrip {
                            msg_id,
                            deadline: self.config.round_trip_timeout.map(|t| Instant::now() + t),
                        });
                    }
                    self.pending
                        .insert(msg_id, Pending::Proposal { reply: dispatch.reply });
                }
                Err(e) => {
                    tracing::warn!(error = %e, "Failed to send proposal");
                    let _ = dispatch.reply.send(Ok(Response::failure(e.to_string())));
                    if dispatch.optimistic {
                        queue.extend(self.settle_round_trip().await);
                    }
                }
            }
        }
    }

    /// Closes the coordinator's round trip and returns what to send next
    async fn settle_round_trip(&mut self) -> Vec<Dispatch<R::Action>> {
        self.round_trip = None;

        let settled = self.coordinator.finish_round_trip();
        if settled.replay_error.is_some() {
            self.request_snapshot(None, false).await;
        }

        settled.dispatches
    }

    async fn expire_round_trip(&mut self) {
        let Some(round_trip) = self.round_trip.take() else {
            return;
        };

        tracing::warn!(
            msg_id = round_trip.msg_id,
            "Optimistic proposal timed out, rolling back"
        );

        let dispatches = self.settle_round_trip().await;
        if let Some(Pending::Proposal { reply }) = self.pending.remove(&round_trip.msg_id) {
            let _ = reply.send(Err(ProposalError::Unanswered));
        }
        self.send_dispatches(dispatches).await;
    }

    /// Requests a full snapshot; authoritative actions are dropped until it arrives
    async fn request_snapshot(&mut self, reply: Option<Reply<()>>, resume_live: bool) {
        match self.send_request(self.codec, routes::GET_STATE, &GetState).await {
            Ok(msg_id) => {
                self.snapshots_in_flight += 1;
                self.pending
                    .insert(msg_id, Pending::Snapshot { reply, resume_live });
            }
            Err(e) => {
                tracing::error!(error = %e, "Failed to request state snapshot");
                if let Some(reply) = reply {
                    let _ = reply.send(Err(e));
                }
            }
        }
    }

    async fn start_time_travel(&mut self, reply: Reply<(u64, u64)>) {
        if let Err(e) = self.live_check() {
            let _ = reply.send(Err(e));
            return;
        }
        if self.coordinator.is_waiting() {
            let _ = reply.send(Err(ClientError::RoundTripInFlight));
            return;
        }

        match self
            .send_request(self.codec, routes::GET_HISTORY, &GetHistory)
            .await
        {
            Ok(msg_id) => {
                self.pending.insert(msg_id, Pending::History { reply });
            }
            Err(e) => {
                let _ = reply.send(Err(e));
            }
        }
    }

    fn jump_to_time(&mut self, time: u64) -> Result<(), ClientError> {
        let Some(log) = &self.history else {
            return Err(ClientError::NotTimeTravelling);
        };

        let state = log.state_at(time)?;
        self.coordinator.store_mut().set_state(state);
        self.mode.send_replace(SessionMode::TimeTravel { time });

        tracing::debug!(time, "Jumped to exercise time");
        Ok(())
    }

    async fn leave(&mut self) -> Result<(), ClientError> {
        if self.connection.is_joined() {
            self.send_request(self.codec, routes::LEAVE_EXERCISE, &LeaveExercise)
                .await?;
            tracing::info!("Left exercise");
        }
        Ok(())
    }

    /// Succeeds if the session is joined and following the server
    fn live_check(&self) -> Result<(), ClientError> {
        match self.mode() {
            SessionMode::Live => Ok(()),
            SessionMode::TimeTravel { .. } => Err(ClientError::TimeTravelActive),
            SessionMode::Idle => Err(ClientError::NotJoined),
        }
    }

    fn mode(&self) -> SessionMode {
        *self.mode.borrow()
    }

    fn is_time_travelling(&self) -> bool {
        matches!(self.mode(), SessionMode::TimeTravel { .. })
    }

    /// Removes the request `envelope` answers, if it is of the expected kind
    fn take_pending(&mut self, envelope: &Envelope, expected: fn(&Pending) -> bool) -> Option<Pending> {
        match self.pending.get(&envelope.correlation_id) {
            Some(pending) if expected(pending) => self.pending.remove(&envelope.correlation_id),
            Some(_) => {
                tracing::warn!(
                    route_id = envelope.route_id,
                    correlation_id = envelope.correlation_id,
                    "Reply does not match the request it answers"
                );
                None
            }
            None => {
                tracing::debug!(
                    route_id = envelope.route_id,
                    correlation_id = envelope.correlation_id,
                    "Ignoring reply to unknown or expired request"
                );
                None
            }
        }
    }

    /// Sends a request and returns its msg_id
    async fn send_request<T: Serialize>(
        &mut self,
        codec: CodecType,
        route_id: u16,
        message: &T,
    ) -> Result<u64, ClientError> {
        let msg_id = self.next_msg_id;
        self.next_msg_id += 1;

        let payload = codec.encode(message)?;
        let envelope = Envelope::request(codec.id(), route_id, msg_id, payload);

        // Keep reading while the outgoing channel is full; the peer may be
        // waiting for us to drain before it can take more
        let permit = loop {
            tokio::select! {
                permit = self.outgoing_tx.reserve() => {
                    break permit.map_err(|_| ClientError::ChannelSendError)?;
                }

                incoming = self.incoming_rx.recv(), if !self.incoming_closed => {
                    match incoming {
                        Some(envelope) => self.backlog.push_back(envelope),
                        None => self.incoming_closed = true,
                    }
                }
            }
        };
        permit.send(envelope);

        Ok(msg_id)
    }
}

/// Decodes an envelope's payload with the codec it names
fn decode<T: DeserializeOwned>(envelope: &Envelope) -> Result<T, ClientError> {
    let codec = CodecType::from_id(envelope.codec_id)?;
    Ok(codec.decode(&envelope.payload)?)
}

fn into_payload<T>(response: Response<T>) -> Result<T, ClientError> {
    response
        .into_result()
        .map_err(ClientError::Rejected)?
        .ok_or_else(|| ClientError::InvalidMessage("Accepted response without payload".to_string()))
}
