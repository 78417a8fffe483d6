//! Shared fixtures for the integration tests
//!
//! A small mass-casualty exercise: patients arrive, get triaged, move
//! between locations and are discharged while the exercise clock ticks.

#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use exsim_client::{ClientConfig, ClientHandle, ExerciseClient};
use exsim_server::transport::memory::{MemoryConnector, MemoryServerTransport};
use exsim_server::{ExerciseServer, ServerConfig, ServerHandle};
use exsim_simulation::{LogicalClock, Reducer, ReducerError};
use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tokio::time::timeout;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Category {
    Immediate,
    Delayed,
    Minor,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Patient {
    pub id: String,
    pub location: String,
    pub category: Option<Category>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Exercise {
    pub time: u64,
    pub patients: Vec<Patient>,
}

impl Exercise {
    pub fn patient(&self, id: &str) -> Option<&Patient> {
        self.patients.iter().find(|p| p.id == id)
    }

    pub fn patient_ids(&self) -> Vec<&str> {
        self.patients.iter().map(|p| p.id.as_str()).collect()
    }
}

impl LogicalClock for Exercise {
    fn current_time(&self) -> u64 {
        self.time
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Action {
    Tick(u64),
    AddPatient { id: String, location: String },
    Triage { id: String, category: Category },
    MovePatient { id: String, to: String },
    Discharge { id: String },
}

impl Action {
    pub fn add(id: &str, location: &str) -> Self {
        Action::AddPatient {
            id: id.to_string(),
            location: location.to_string(),
        }
    }

    pub fn triage(id: &str, category: Category) -> Self {
        Action::Triage {
            id: id.to_string(),
            category,
        }
    }

    pub fn move_to(id: &str, to: &str) -> Self {
        Action::MovePatient {
            id: id.to_string(),
            to: to.to_string(),
        }
    }

    pub fn discharge(id: &str) -> Self {
        Action::Discharge { id: id.to_string() }
    }
}

pub struct ExerciseReducer;

impl ExerciseReducer {
    fn patient_mut<'a>(state: &'a mut Exercise, id: &str) -> Result<&'a mut Patient, ReducerError> {
        state
            .patients
            .iter_mut()
            .find(|p| p.id == id)
            .ok_or_else(|| ReducerError::not_found("patient", id))
    }
}

impl Reducer for ExerciseReducer {
    type State = Exercise;
    type Action = Action;

    fn reduce(&self, state: &mut Exercise, action: &Action) -> Result<(), ReducerError> {
        match action {
            Action::Tick(ms) => state.time += ms,
            Action::AddPatient { id, location } => {
                if state.patient(id).is_some() {
                    return Err(ReducerError::invalid(format!("patient {id} already exists")));
                }
                state.patients.push(Patient {
                    id: id.clone(),
                    location: location.clone(),
                    category: None,
                });
            }
            Action::Triage { id, category } => {
                Self::patient_mut(state, id)?.category = Some(*category);
            }
            Action::MovePatient { id, to } => {
                let patient = Self::patient_mut(state, id)?;
                if patient.category.is_none() {
                    return Err(ReducerError::invalid(format!("patient {id} is not triaged")));
                }
                patient.location = to.clone();
            }
            Action::Discharge { id } => {
                let index = state
                    .patients
                    .iter()
                    .position(|p| p.id == *id)
                    .ok_or_else(|| ReducerError::not_found("patient", id))?;
                state.patients.remove(index);
            }
        }
        Ok(())
    }
}

pub fn init_tracing() {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init()
        .ok();
}

/// Starts a server on the in-memory transport
pub fn start_memory_server(initial: Exercise) -> (ServerHandle<ExerciseReducer>, MemoryConnector) {
    let (transport, connector) = MemoryServerTransport::new(100);
    let (handle, _server) =
        ExerciseServer::spawn(transport, ExerciseReducer, initial, ServerConfig::default());
    (handle, connector)
}

/// Connects and joins a client through the in-memory transport
pub async fn join_memory_client(
    connector: &MemoryConnector,
    participant: &str,
    config: ClientConfig,
) -> ClientHandle<ExerciseReducer> {
    let transport = connector.connect().await.unwrap();
    let (handle, _client) =
        ExerciseClient::spawn(transport, ExerciseReducer, Exercise::default(), config);
    handle.join(participant).await.unwrap();
    handle
}

/// Waits until a published state satisfies `condition`
pub async fn wait_for_state(
    mut state_rx: watch::Receiver<Arc<Exercise>>,
    condition: impl FnMut(&Arc<Exercise>) -> bool,
) -> Arc<Exercise> {
    let state = timeout(Duration::from_secs(2), state_rx.wait_for(condition))
        .await
        .expect("timed out waiting for state")
        .expect("state channel closed");
    state.clone()
}
