//! Worker churn under a live run: crashes caught by the watchdog, voluntary
//! leaves, and joins, all without corrupting the simulation.

use lattica_testing::{evolve_n, patterns};

use crate::prelude::*;

use super::cluster::*;

#[tokio::test(flavor = "multi_thread")]
async fn crashed_worker_is_dropped_and_the_run_completes() {
    let broker = start_broker().await;
    let workers = start_workers(&broker.addr, 4).await;
    let (session, mut events, _cancel) = attach_controller(&broker.addr).await;

    let initial = patterns::r_pentomino();
    session
        .start(initial.clone(), params(32, 32, 50))
        .await
        .unwrap();

    // kill worker id=2 the moment turn 20 reaches the controller; the
    // watchdog has to notice the silence and repartition the survivors
    let log = collect_run(&mut events, |turn| {
        if turn == 20 {
            workers[2].kill();
        }
    })
    .await;

    log.assert_sequential(50);

    let oracle = evolve_n(&World::from_cells(32, 32, &initial), 50);
    let replayed = log.replay(32, 32, &initial);
    assert_eq!(as_set(&replayed.alive_cells()), as_set(&oracle.alive_cells()));

    session.kill().await.unwrap();
}

#[tokio::test(flavor = "multi_thread")]
async fn leaving_worker_hands_its_strip_back() {
    let broker = start_broker().await;
    let workers = start_workers(&broker.addr, 3).await;
    let (session, mut events, _cancel) = attach_controller(&broker.addr).await;

    let initial = patterns::r_pentomino();
    session
        .start(initial.clone(), params(32, 32, 40))
        .await
        .unwrap();

    // a polite deregistration mid-run; no watchdog involved
    let (leave_tx, leave_rx) = tokio::sync::oneshot::channel::<()>();
    let control = workers[1].control.clone();
    let id = workers[1].id;
    let cancel = workers[1].cancel.clone();
    let leaver = tokio::spawn(async move {
        let _ = leave_rx.await;
        let _ = control.call(Request::WorkerDisconnect { id }).await;
        cancel.cancel();
    });

    let mut leave_tx = Some(leave_tx);
    let log = collect_run(&mut events, move |turn| {
        if turn == 10 {
            if let Some(tx) = leave_tx.take() {
                let _ = tx.send(());
            }
        }
    })
    .await;

    log.assert_sequential(40);

    let oracle = evolve_n(&World::from_cells(32, 32, &initial), 40);
    let replayed = log.replay(32, 32, &initial);
    assert_eq!(as_set(&replayed.alive_cells()), as_set(&oracle.alive_cells()));

    leaver.await.unwrap();
    session.kill().await.unwrap();
}

#[tokio::test(flavor = "multi_thread")]
async fn joining_worker_is_absorbed_mid_run() {
    let broker = start_broker().await;
    let _workers = start_workers(&broker.addr, 2).await;
    let (session, mut events, _cancel) = attach_controller(&broker.addr).await;

    let initial = patterns::r_pentomino();
    session
        .start(initial.clone(), params(32, 32, 60))
        .await
        .unwrap();

    let broker_addr = broker.addr.clone();
    let (join_tx, join_rx) = tokio::sync::oneshot::channel::<()>();
    let joiner = tokio::spawn(async move {
        let _ = join_rx.await;
        start_worker(&broker_addr).await
    });

    let mut join_tx = Some(join_tx);
    let log = collect_run(&mut events, move |turn| {
        if turn == 15 {
            if let Some(tx) = join_tx.take() {
                let _ = tx.send(());
            }
        }
    })
    .await;

    log.assert_sequential(60);

    let oracle = evolve_n(&World::from_cells(32, 32, &initial), 60);
    let replayed = log.replay(32, 32, &initial);
    assert_eq!(as_set(&replayed.alive_cells()), as_set(&oracle.alive_cells()));

    let _joined = joiner.await.unwrap();
    session.kill().await.unwrap();
}
