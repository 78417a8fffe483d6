//! Application-facing handle to a running [`ExerciseClient`](crate::ExerciseClient)

use std::sync::Arc;

use exsim_protocol::ActionResponse;
use exsim_simulation::{ProposalResult, Reducer};
use tokio::sync::{mpsc, oneshot, watch};

use crate::{ClientError, SessionMode};

type Reply<T> = oneshot::Sender<Result<T, ClientError>>;

/// Requests from handles to the event loop
pub(crate) enum Command<R: Reducer> {
    Join {
        participant: String,
        reply: Reply<()>,
    },
    Propose {
        action: R::Action,
        optimistic: bool,
        reply: oneshot::Sender<ProposalResult>,
    },
    Resync {
        reply: Reply<()>,
    },
    StartTimeTravel {
        reply: Reply<(u64, u64)>,
    },
    JumpToTime {
        time: u64,
        reply: Reply<()>,
    },
    StopTimeTravel {
        reply: Reply<()>,
    },
    Leave {
        reply: Reply<()>,
    },
}

/// Cloneable handle to a client session
///
/// All methods are answered by the event loop. Once the loop has stopped
/// (after [`leave`](Self::leave), or because the transport closed) every call
/// fails with [`ClientError::SessionClosed`]; the last published state stays
/// readable.
pub struct ClientHandle<R: Reducer> {
    commands: mpsc::Sender<Command<R>>,
    state: watch::Receiver<Arc<R::State>>,
    mode: watch::Receiver<SessionMode>,
}

impl<R: Reducer> Clone for ClientHandle<R> {
    fn clone(&self) -> Self {
        Self {
            commands: self.commands.clone(),
            state: self.state.clone(),
            mode: self.mode.clone(),
        }
    }
}

impl<R: Reducer> ClientHandle<R> {
    pub(crate) fn new(
        commands: mpsc::Sender<Command<R>>,
        state: watch::Receiver<Arc<R::State>>,
        mode: watch::Receiver<SessionMode>,
    ) -> Self {
        Self {
            commands,
            state,
            mode,
        }
    }

    /// Performs the handshake and joins the exercise
    ///
    /// Resolves once the exercise state has been received and installed.
    pub async fn join(&self, participant: impl Into<String>) -> Result<(), ClientError> {
        let participant = participant.into();
        self.request(|reply| Command::Join { participant, reply }).await
    }

    /// Proposes an action to the server
    ///
    /// With `optimistic` set, the action is applied to the local state before
    /// the server has seen it, and rolled back once the server has answered.
    /// Either way, the action's lasting effect comes from the server's
    /// authoritative broadcast.
    ///
    /// A rejection by the server is `Ok` with `success == false`. An action
    /// that cannot even be applied locally is [`ClientError::Reducer`]. An
    /// optimistic proposal the server did not answer before
    /// [`round_trip_timeout`](crate::ClientConfig::round_trip_timeout) is
    /// [`ClientError::RoundTripTimedOut`]; it may still be committed.
    pub async fn propose_action(
        &self,
        action: R::Action,
        optimistic: bool,
    ) -> Result<ActionResponse, ClientError> {
        let mode = *self.mode.borrow();
        match mode {
            SessionMode::Idle => return Err(ClientError::NotJoined),
            SessionMode::TimeTravel { .. } => return Err(ClientError::TimeTravelActive),
            SessionMode::Live => {}
        }

        let (reply, response) = oneshot::channel();
        self.send(Command::Propose {
            action,
            optimistic,
            reply,
        })
        .await?;

        Ok(response.await.map_err(|_| ClientError::SessionClosed)??)
    }

    /// Replaces the local state with a fresh snapshot from the server
    pub async fn resync(&self) -> Result<(), ClientError> {
        self.request(|reply| Command::Resync { reply }).await
    }

    /// Stops following the server and loads the exercise history
    ///
    /// Returns the exercise time range that can be jumped to. Refused while
    /// an optimistic proposal is outstanding.
    pub async fn start_time_travel(&self) -> Result<(u64, u64), ClientError> {
        self.request(|reply| Command::StartTimeTravel { reply }).await
    }

    /// Shows the exercise as it was at `time`
    pub async fn jump_to_time(&self, time: u64) -> Result<(), ClientError> {
        self.request(|reply| Command::JumpToTime { time, reply }).await
    }

    /// Returns to live mode and resynchronizes with the server
    pub async fn stop_time_travel(&self) -> Result<(), ClientError> {
        self.request(|reply| Command::StopTimeTravel { reply }).await
    }

    /// Leaves the exercise and stops the session
    pub async fn leave(&self) -> Result<(), ClientError> {
        self.request(|reply| Command::Leave { reply }).await
    }

    /// Returns the current local state
    pub fn state(&self) -> Arc<R::State> {
        self.state.borrow().clone()
    }

    /// Subscribes to local state changes
    pub fn subscribe(&self) -> watch::Receiver<Arc<R::State>> {
        self.state.clone()
    }

    /// Returns the current session mode
    pub fn mode(&self) -> SessionMode {
        *self.mode.borrow()
    }

    /// Subscribes to session mode changes
    pub fn subscribe_mode(&self) -> watch::Receiver<SessionMode> {
        self.mode.clone()
    }

    async fn request<T>(
        &self,
        command: impl FnOnce(Reply<T>) -> Command<R>,
    ) -> Result<T, ClientError> {
        let (reply, response) = oneshot::channel();
        self.send(command(reply)).await?;
        response.await.map_err(|_| ClientError::SessionClosed)?
    }

    async fn send(&self, command: Command<R>) -> Result<(), ClientError> {
        self.commands
            .send(command)
            .await
            .map_err(|_| ClientError::SessionClosed)
    }
}
