//! End-to-end runs over loopback: one broker, a pool of workers and one
//! controller per test, checked against the reference simulator.

use lattica_testing::{evolve_n, patterns, translate};

use crate::controller::Event;
use crate::prelude::*;

use super::cluster::*;

#[tokio::test(flavor = "multi_thread")]
async fn blinker_single_worker() {
    let broker = start_broker().await;
    let _workers = start_workers(&broker.addr, 1).await;
    let (session, mut events, _cancel) = attach_controller(&broker.addr).await;

    let initial = patterns::blinker();
    session
        .start(initial.clone(), params(16, 16, 2))
        .await
        .unwrap();

    let log = collect_run(&mut events, |_| {}).await;
    log.assert_sequential(2);

    let expected_flips = as_set(&[
        Cell::new(1, 0),
        Cell::new(0, 1),
        Cell::new(2, 1),
        Cell::new(1, 2),
    ]);
    assert_eq!(as_set(&log.deltas[0].1), expected_flips);
    assert_eq!(as_set(&log.deltas[1].1), expected_flips);

    // period two: back to the initial state
    assert_eq!(as_set(&log.final_alive), as_set(&initial));

    log.replay(16, 16, &initial);
    session.kill().await.unwrap();
}

#[tokio::test(flavor = "multi_thread")]
async fn still_life_block_three_workers() {
    let broker = start_broker().await;
    let _workers = start_workers(&broker.addr, 3).await;
    let (session, mut events, _cancel) = attach_controller(&broker.addr).await;

    let initial = patterns::block();
    session
        .start(initial.clone(), params(16, 16, 10))
        .await
        .unwrap();

    let log = collect_run(&mut events, |_| {}).await;
    log.assert_sequential(10);

    for (turn, delta) in &log.deltas {
        assert!(delta.is_empty(), "still life flipped cells at turn {turn}");
    }
    assert_eq!(as_set(&log.final_alive), as_set(&initial));

    session.kill().await.unwrap();
}

#[tokio::test(flavor = "multi_thread")]
async fn glider_four_workers() {
    let broker = start_broker().await;
    let _workers = start_workers(&broker.addr, 4).await;
    let (session, mut events, _cancel) = attach_controller(&broker.addr).await;

    let initial = patterns::glider();
    session
        .start(initial.clone(), params(16, 16, 4))
        .await
        .unwrap();

    let log = collect_run(&mut events, |_| {}).await;
    log.assert_sequential(4);

    let expected = translate(&initial, 1, 1, 16, 16);
    assert_eq!(as_set(&log.final_alive), as_set(&expected));

    log.replay(16, 16, &initial);
    session.kill().await.unwrap();
}

#[tokio::test(flavor = "multi_thread")]
async fn empty_world_eight_workers() {
    let broker = start_broker().await;
    let _workers = start_workers(&broker.addr, 8).await;
    let (session, mut events, _cancel) = attach_controller(&broker.addr).await;

    session.start(vec![], params(64, 64, 100)).await.unwrap();

    let log = collect_run(&mut events, |_| {}).await;
    log.assert_sequential(100);

    assert!(log.deltas.iter().all(|(_, delta)| delta.is_empty()));
    assert!(log.final_alive.is_empty());

    session.kill().await.unwrap();
}

#[tokio::test(flavor = "multi_thread")]
async fn deltas_replay_to_the_reference_world() {
    let broker = start_broker().await;
    let _workers = start_workers(&broker.addr, 4).await;
    let (session, mut events, _cancel) = attach_controller(&broker.addr).await;

    let initial = patterns::r_pentomino();
    session
        .start(initial.clone(), params(32, 32, 30))
        .await
        .unwrap();

    let log = collect_run(&mut events, |_| {}).await;
    log.assert_sequential(30);

    let replayed = log.replay(32, 32, &initial);

    let oracle = evolve_n(&World::from_cells(32, 32, &initial), 30);
    assert_eq!(as_set(&replayed.alive_cells()), as_set(&oracle.alive_cells()));

    // lock-step equivalence: the shadow world agrees with the replay
    let (shadow, turn) = session.snapshot().await.unwrap();
    assert_eq!(turn, 30);
    assert_eq!(as_set(&shadow.alive_cells()), as_set(&oracle.alive_cells()));

    session.kill().await.unwrap();
}

#[tokio::test(flavor = "multi_thread")]
async fn zero_turns_echoes_the_initial_state() {
    let broker = start_broker().await;
    // deliberately no workers: a zero-turn run needs none
    let (session, mut events, _cancel) = attach_controller(&broker.addr).await;

    let initial = patterns::block();
    session
        .start(initial.clone(), params(16, 16, 0))
        .await
        .unwrap();

    let flipped = loop {
        match next_event(&mut events).await {
            Event::CellsFlipped { turn, cells } => {
                assert_eq!(turn, 0);
                break cells;
            }
            Event::FinalTurnComplete { .. } => panic!("final before the turn 0 delta"),
            _ => {}
        }
    };
    assert_eq!(as_set(&flipped), as_set(&initial));

    loop {
        match next_event(&mut events).await {
            Event::FinalTurnComplete { turn, alive } => {
                assert_eq!(turn, 0);
                assert_eq!(as_set(&alive), as_set(&initial));
                break;
            }
            _ => {}
        }
    }

    session.kill().await.unwrap();
}

#[tokio::test(flavor = "multi_thread")]
async fn second_controller_is_refused() {
    let broker = start_broker().await;
    let (_session, _events, _cancel) = attach_controller(&broker.addr).await;

    let config = ControllerConfig {
        listen_address: "127.0.0.1:0".into(),
        broker_address: broker.addr.clone(),
        advertise_address: None,
    };
    let (tx, _rx) = tokio::sync::mpsc::unbounded_channel();

    let refused = crate::controller::Session::connect(
        &config,
        tx,
        tokio_util::sync::CancellationToken::new(),
    )
    .await;

    assert!(refused.is_err());

    broker.cancel.cancel();
}

#[tokio::test(flavor = "multi_thread")]
async fn pause_gates_forwarding_not_completion() {
    let broker = start_broker().await;
    let _workers = start_workers(&broker.addr, 2).await;
    let (session, mut events, _cancel) = attach_controller(&broker.addr).await;

    let initial = patterns::r_pentomino();
    session
        .start(initial.clone(), params(32, 32, 40))
        .await
        .unwrap();

    let paused = session.pause().await.unwrap();
    assert_eq!(paused, crate::controller::ExecutionState::Paused);

    // workers keep computing while the latch is closed
    tokio::time::sleep(std::time::Duration::from_millis(300)).await;

    let resumed = session.pause().await.unwrap();
    assert_eq!(resumed, crate::controller::ExecutionState::Running);

    let log = collect_run(&mut events, |_| {}).await;
    log.assert_sequential(40);

    let oracle = evolve_n(&World::from_cells(32, 32, &initial), 40);
    let replayed = log.replay(32, 32, &initial);
    assert_eq!(as_set(&replayed.alive_cells()), as_set(&oracle.alive_cells()));

    session.kill().await.unwrap();
}
