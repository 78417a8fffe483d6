//! Handle to a running [`ExerciseServer`](crate::ExerciseServer)

use std::sync::Arc;

use exsim_simulation::{Reducer, ReducerError};
use tokio::sync::{mpsc, oneshot, watch};

use crate::ServerError;

pub(crate) enum ServerCommand<R: Reducer> {
    Perform {
        action: R::Action,
        reply: oneshot::Sender<Result<(), ReducerError>>,
    },
    Participants {
        reply: oneshot::Sender<Vec<String>>,
    },
}

/// Cloneable handle for server-side code
pub struct ServerHandle<R: Reducer> {
    commands: mpsc::Sender<ServerCommand<R>>,
    state: watch::Receiver<Arc<R::State>>,
}

impl<R: Reducer> Clone for ServerHandle<R> {
    fn clone(&self) -> Self {
        Self {
            commands: self.commands.clone(),
            state: self.state.clone(),
        }
    }
}

impl<R: Reducer> ServerHandle<R> {
    pub(crate) fn new(
        commands: mpsc::Sender<ServerCommand<R>>,
        state: watch::Receiver<Arc<R::State>>,
    ) -> Self {
        Self { commands, state }
    }

    /// Commits a server-originated action, such as a clock tick
    ///
    /// The action is validated, recorded and broadcast exactly like an
    /// accepted proposal.
    pub async fn perform_action(&self, action: R::Action) -> Result<(), ServerError> {
        let (reply, result) = oneshot::channel();
        self.commands
            .send(ServerCommand::Perform { action, reply })
            .await
            .map_err(|_| ServerError::Stopped)?;

        Ok(result.await.map_err(|_| ServerError::Stopped)??)
    }

    /// Returns the names of the participants currently joined
    pub async fn participants(&self) -> Result<Vec<String>, ServerError> {
        let (reply, result) = oneshot::channel();
        self.commands
            .send(ServerCommand::Participants { reply })
            .await
            .map_err(|_| ServerError::Stopped)?;

        result.await.map_err(|_| ServerError::Stopped)
    }

    /// Returns the current authoritative state
    pub fn state(&self) -> Arc<R::State> {
        self.state.borrow().clone()
    }

    /// Subscribes to authoritative state changes
    pub fn subscribe(&self) -> watch::Receiver<Arc<R::State>> {
        self.state.clone()
    }
}
