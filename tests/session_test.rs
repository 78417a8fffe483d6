//! End-to-end sessions over the in-memory transport

mod common;

use std::time::Duration;

use common::*;
use exsim_client::{ClientConfig, ClientError, SessionMode};
use exsim_protocol::codec::POSTCARD_CODEC_ID;
use exsim_protocol::ActionResponse;
use exsim_simulation::ReducerError;
use tokio::time::timeout;

#[tokio::test]
async fn test_join_receives_current_state() {
    init_tracing();

    let mut initial = Exercise::default();
    initial.time = 500;
    let (server, connector) = start_memory_server(initial);
    server.perform_action(Action::add("p1", "scene")).await.unwrap();

    let client = join_memory_client(&connector, "trainer", ClientConfig::default()).await;

    assert_eq!(client.mode(), SessionMode::Live);
    let state = client.state();
    assert_eq!(state.time, 500);
    assert_eq!(state.patient_ids(), vec!["p1"]);
    assert_eq!(server.participants().await.unwrap(), vec!["trainer".to_string()]);
}

#[tokio::test]
async fn test_accepted_proposal_is_applied_everywhere() {
    init_tracing();

    let (server, connector) = start_memory_server(Exercise::default());
    let alice = join_memory_client(&connector, "alice", ClientConfig::default()).await;
    let bob = join_memory_client(&connector, "bob", ClientConfig::default()).await;

    let response = alice.propose_action(Action::add("p1", "scene"), true).await.unwrap();
    assert!(response.success);

    // Settled before the answer is handed out
    assert_eq!(alice.state().patient_ids(), vec!["p1"]);

    let state = wait_for_state(bob.subscribe(), |s| s.patient("p1").is_some()).await;
    assert_eq!(state.patient("p1").unwrap().location, "scene");
    assert_eq!(server.state().patient_ids(), vec!["p1"]);
}

#[tokio::test]
async fn test_non_optimistic_rejection_leaves_state_untouched() {
    init_tracing();

    let (server, connector) = start_memory_server(Exercise::default());
    let client = join_memory_client(&connector, "trainer", ClientConfig::default()).await;

    let response = client.propose_action(Action::discharge("ghost"), false).await.unwrap();

    assert!(!response.success);
    assert!(response.message.unwrap().contains("ghost"));
    assert!(client.state().patients.is_empty());
    assert!(server.state().patients.is_empty());
}

#[tokio::test]
async fn test_optimistic_proposal_that_fails_locally() {
    init_tracing();

    let (server, connector) = start_memory_server(Exercise::default());
    let client = join_memory_client(&connector, "trainer", ClientConfig::default()).await;
    client.propose_action(Action::add("p1", "scene"), false).await.unwrap();

    // Untriaged patients cannot be moved
    let result = client.propose_action(Action::move_to("p1", "hospital"), true).await;

    assert!(matches!(result, Err(ClientError::Reducer(ReducerError::Invalid(_)))));
    assert_eq!(client.state().patient("p1").unwrap().location, "scene");
    assert_eq!(server.state().patient("p1").unwrap().location, "scene");
}

#[tokio::test]
async fn test_queued_proposals_commit_in_order() {
    init_tracing();

    let (server, connector) = start_memory_server(Exercise::default());
    let client = join_memory_client(&connector, "trainer", ClientConfig::default()).await;

    // Each proposal depends on the one before it
    let (added, triaged, moved) = futures::join!(
        client.propose_action(Action::add("p1", "scene"), true),
        client.propose_action(Action::triage("p1", Category::Immediate), true),
        client.propose_action(Action::move_to("p1", "hospital"), true),
    );

    assert!(added.unwrap().success);
    assert!(triaged.unwrap().success);
    assert!(moved.unwrap().success);

    let expected = Patient {
        id: "p1".to_string(),
        location: "hospital".to_string(),
        category: Some(Category::Immediate),
    };
    assert_eq!(client.state().patients, vec![expected.clone()]);
    assert_eq!(server.state().patients, vec![expected]);
}

#[tokio::test]
async fn test_contended_discharge_has_one_winner() {
    init_tracing();

    let (server, connector) = start_memory_server(Exercise::default());
    server.perform_action(Action::add("p1", "scene")).await.unwrap();

    let alice = join_memory_client(&connector, "alice", ClientConfig::default()).await;
    let bob = join_memory_client(&connector, "bob", ClientConfig::default()).await;

    let (a, b) = tokio::join!(
        alice.propose_action(Action::discharge("p1"), true),
        bob.propose_action(Action::discharge("p1"), true),
    );

    // The loser is either rejected by the server or, if the winner's commit
    // reached it first, refused by its own reducer
    let won = |result: &Result<ActionResponse, ClientError>| matches!(result, Ok(r) if r.success);
    assert_eq!(won(&a) as u8 + won(&b) as u8, 1);

    assert!(server.state().patients.is_empty());
    wait_for_state(alice.subscribe(), |s| s.patients.is_empty()).await;
    wait_for_state(bob.subscribe(), |s| s.patients.is_empty()).await;
}

#[tokio::test]
async fn test_clients_converge_under_concurrent_load() {
    init_tracing();

    let (server, connector) = start_memory_server(Exercise::default());

    let mut clients = Vec::new();
    for name in ["alice", "bob", "carol"] {
        clients.push(join_memory_client(&connector, name, ClientConfig::default()).await);
    }

    let mut tasks = Vec::new();
    for (index, client) in clients.iter().enumerate() {
        let client = client.clone();
        tasks.push(tokio::spawn(async move {
            for n in 0..5 {
                let id = format!("p{index}-{n}");
                client.propose_action(Action::add(&id, "scene"), n % 2 == 0).await.unwrap();
                client
                    .propose_action(Action::triage(&id, Category::Delayed), true)
                    .await
                    .unwrap();
            }
        }));
    }
    for task in tasks {
        task.await.unwrap();
    }

    server.perform_action(Action::Tick(1000)).await.unwrap();

    let expected = server.state();
    assert_eq!(expected.patients.len(), 15);
    assert!(expected.patients.iter().all(|p| p.category == Some(Category::Delayed)));

    for client in &clients {
        let state = wait_for_state(client.subscribe(), |s| s.time == 1000).await;
        assert_eq!(*state, *expected);
    }
}

#[tokio::test]
async fn test_postcard_session() {
    init_tracing();

    let (server, connector) = start_memory_server(Exercise::default());
    let config = ClientConfig {
        codec_id: POSTCARD_CODEC_ID,
        ..ClientConfig::default()
    };
    let postcard = join_memory_client(&connector, "postcard", config).await;
    let json = join_memory_client(&connector, "json", ClientConfig::default()).await;

    let response = postcard.propose_action(Action::add("p1", "scene"), true).await.unwrap();
    assert!(response.success);

    wait_for_state(json.subscribe(), |s| s.patient("p1").is_some()).await;

    let response = json
        .propose_action(Action::triage("p1", Category::Minor), false)
        .await
        .unwrap();
    assert!(response.success);

    let state = wait_for_state(postcard.subscribe(), |s| {
        s.patient("p1").is_some_and(|p| p.category.is_some())
    })
    .await;
    assert_eq!(*state, *server.state());
}

#[tokio::test]
async fn test_resync_replaces_local_state() {
    init_tracing();

    let (server, connector) = start_memory_server(Exercise::default());
    let client = join_memory_client(&connector, "trainer", ClientConfig::default()).await;

    server.perform_action(Action::add("p1", "scene")).await.unwrap();
    server.perform_action(Action::Tick(250)).await.unwrap();

    client.resync().await.unwrap();

    assert_eq!(*client.state(), *server.state());
}

#[tokio::test]
async fn test_proposal_before_join_is_refused() {
    init_tracing();

    let (_server, connector) = start_memory_server(Exercise::default());
    let transport = connector.connect().await.unwrap();
    let (client, _task) = exsim_client::ExerciseClient::spawn(
        transport,
        ExerciseReducer,
        Exercise::default(),
        ClientConfig::default(),
    );

    let result = client.propose_action(Action::Tick(1), true).await;
    assert!(matches!(result, Err(ClientError::NotJoined)));
}

#[tokio::test]
async fn test_leave_removes_participant() {
    init_tracing();

    let (server, connector) = start_memory_server(Exercise::default());
    let alice = join_memory_client(&connector, "alice", ClientConfig::default()).await;
    let bob = join_memory_client(&connector, "bob", ClientConfig::default()).await;

    alice.leave().await.unwrap();

    timeout(Duration::from_secs(2), async {
        while server.participants().await.unwrap() != vec!["bob".to_string()] {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .unwrap();

    // Bob still follows the exercise
    server.perform_action(Action::Tick(10)).await.unwrap();
    wait_for_state(bob.subscribe(), |s| s.time == 10).await;

    assert!(matches!(
        alice.propose_action(Action::Tick(1), true).await,
        Err(ClientError::SessionClosed) | Err(ClientError::NotJoined)
    ));
}

#[tokio::test]
async fn test_tiny_channels_do_not_stall_sessions() {
    init_tracing();

    let (transport, connector) = exsim_server::transport::memory::MemoryServerTransport::new(2);
    let (server, _task) = exsim_server::ExerciseServer::spawn(
        transport,
        ExerciseReducer,
        Exercise::default(),
        exsim_server::ServerConfig {
            channel_capacity: 2,
        },
    );
    let config = ClientConfig {
        channel_capacity: 2,
        ..ClientConfig::default()
    };
    let alice = join_memory_client(&connector, "alice", config.clone()).await;
    let bob = join_memory_client(&connector, "bob", config).await;

    let load = async {
        let proposals = [&alice, &bob].into_iter().flat_map(|client| {
            (0..100u64).map(move |n| client.propose_action(Action::Tick(1), n % 3 != 0))
        });
        let ticks = async {
            for _ in 0..250 {
                server.perform_action(Action::Tick(1)).await.unwrap();
            }
        };
        let (results, ()) = tokio::join!(futures::future::join_all(proposals), ticks);
        results
    };

    let results = timeout(Duration::from_secs(10), load)
        .await
        .expect("sessions stalled under backpressure");
    assert!(results.into_iter().all(|r| r.unwrap().success));

    assert_eq!(server.state().time, 450);
    wait_for_state(alice.subscribe(), |s| s.time == 450).await;
    wait_for_state(bob.subscribe(), |s| s.time == 450).await;
}
