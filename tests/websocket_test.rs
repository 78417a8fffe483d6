//! Client and server talking over real WebSocket connections

mod common;

use std::net::SocketAddr;

use common::*;
use exsim_client::{transport::websocket::WebSocketClient, ClientConfig, ClientHandle, ExerciseClient};
use exsim_protocol::codec::POSTCARD_CODEC_ID;
use exsim_server::{transport::websocket::WebSocketServer, ExerciseServer, ServerConfig, ServerHandle};

async fn start_server(initial: Exercise) -> (ServerHandle<ExerciseReducer>, SocketAddr) {
    let transport = WebSocketServer::bind("127.0.0.1:0").await.unwrap();
    let addr = transport.local_addr().unwrap();
    let (handle, _server) =
        ExerciseServer::spawn(transport, ExerciseReducer, initial, ServerConfig::default());
    (handle, addr)
}

async fn join(addr: SocketAddr, participant: &str, config: ClientConfig) -> ClientHandle<ExerciseReducer> {
    let transport = WebSocketClient::new(format!("ws://{}", addr));
    let (handle, _client) =
        ExerciseClient::spawn(transport, ExerciseReducer, Exercise::default(), config);
    handle.join(participant).await.unwrap();
    handle
}

#[tokio::test]
async fn test_exercise_over_websocket() {
    init_tracing();

    let (server, addr) = start_server(Exercise::default()).await;
    let trainer = join(addr, "trainer", ClientConfig::default()).await;
    let medic = join(
        addr,
        "medic",
        ClientConfig {
            codec_id: POSTCARD_CODEC_ID,
            ..ClientConfig::default()
        },
    )
    .await;

    let response = trainer.propose_action(Action::add("p1", "scene"), true).await.unwrap();
    assert!(response.success);

    wait_for_state(medic.subscribe(), |s| s.patient("p1").is_some()).await;

    let (triaged, moved) = futures::join!(
        medic.propose_action(Action::triage("p1", Category::Immediate), true),
        medic.propose_action(Action::move_to("p1", "hospital"), true),
    );
    assert!(triaged.unwrap().success);
    assert!(moved.unwrap().success);

    server.perform_action(Action::Tick(60)).await.unwrap();

    let state = wait_for_state(trainer.subscribe(), |s| s.time == 60).await;
    assert_eq!(state.patient("p1").unwrap().location, "hospital");
    assert_eq!(*state, *server.state());

    wait_for_state(medic.subscribe(), |s| s.time == 60).await;
    assert_eq!(*medic.state(), *server.state());
}

#[tokio::test]
async fn test_rejection_over_websocket() {
    init_tracing();

    let (server, addr) = start_server(Exercise::default()).await;
    let trainer = join(addr, "trainer", ClientConfig::default()).await;

    let response = trainer.propose_action(Action::discharge("nobody"), false).await.unwrap();
    assert!(!response.success);

    assert!(trainer.state().patients.is_empty());
    assert!(server.state().patients.is_empty());
}

#[tokio::test]
async fn test_time_travel_over_websocket() {
    init_tracing();

    let (server, addr) = start_server(Exercise::default()).await;
    let trainer = join(addr, "trainer", ClientConfig::default()).await;

    for action in [Action::add("p1", "scene"), Action::Tick(30), Action::add("p2", "scene")] {
        server.perform_action(action).await.unwrap();
    }

    assert_eq!(trainer.start_time_travel().await.unwrap(), (0, 30));
    trainer.jump_to_time(0).await.unwrap();
    assert_eq!(trainer.state().patient_ids(), vec!["p1"]);

    trainer.stop_time_travel().await.unwrap();
    assert_eq!(trainer.state().patient_ids(), vec!["p1", "p2"]);
}
