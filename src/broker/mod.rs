//! Broker role: the central coordinator. Owns the authoritative world,
//! partitions rows across the worker pool, merges per-turn deltas and
//! forwards them to the controller in strict turn order, and survives
//! workers joining, leaving or crashing mid-computation.

pub mod forward;

use std::collections::{BTreeMap, HashMap, HashSet};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use itertools::Itertools;
use tokio::net::TcpListener;
use tokio::sync::{mpsc, Mutex, Notify};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use crate::prelude::*;
use crate::rpc::{self, Client, Service};

/// Grace given to Shutdown calls towards workers that may already be dead.
const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(1);

/// A delta this far beyond the current turn breaks the run-ahead invariant.
const FUTURE_TURN_SLACK: u64 = 1000;

/// How long the turn in line may sit incomplete before the silent workers
/// are declared faulty.
pub(crate) const WATCHDOG_GRACE: Duration = Duration::from_secs(1);

struct WorkerHandle {
    link: Client,
    reply_addr: String,
    height: u32,
    row_offset: u32,
    primed: bool,
}

#[derive(Default)]
struct TurnEntry {
    flipped: Vec<Cell>,
    responded: HashSet<WorkerId>,
}

struct Run {
    params: Params,
    world: World,
    last_completed: Turn,
    log: HashMap<Turn, TurnEntry>,
    epoch: Epoch,
}

#[derive(Default)]
struct State {
    registry: BTreeMap<WorkerId, WorkerHandle>,
    controller: Option<Client>,
    run: Option<Run>,
    paused: bool,
    next_id: WorkerId,
    epochs: Epoch,
    /// Last moment the run moved: a turn forwarded or a pool (re)dispatch.
    /// The watchdog only declares workers faulty once this goes stale.
    progress_at: Option<Instant>,
}

impl State {
    /// Pops the next in-line turn if every registered worker responded.
    /// Applies the delta to the authoritative world before returning it.
    fn pop_ready_turn(&mut self) -> Option<(Turn, TurnEntry, bool)> {
        let Self {
            registry,
            run,
            paused,
            controller,
            progress_at,
            ..
        } = self;

        if *paused || controller.is_none() || registry.is_empty() {
            return None;
        }

        let run = run.as_mut()?;
        let next = run.last_completed + 1;

        let complete = {
            let entry = run.log.get(&next)?;
            registry.keys().all(|id| entry.responded.contains(id))
        };

        if !complete {
            return None;
        }

        let entry = run.log.remove(&next).unwrap();
        run.world.apply(&entry.flipped);
        run.last_completed = next;
        *progress_at = Some(Instant::now());

        Some((next, entry, next >= run.params.turns))
    }
}

/// Receiver ends of the coordination signals, owned by the forward stage.
pub struct Signals {
    pub(crate) turn_ready: mpsc::Receiver<()>,
    pub(crate) churn: mpsc::Receiver<Vec<WorkerId>>,
}

/// Shared handle given to the RPC service and the forward stage.
#[derive(Clone)]
pub struct Broker {
    state: Arc<Mutex<State>>,
    prime_lock: Arc<Mutex<()>>,
    turn_ready: mpsc::Sender<()>,
    churn: mpsc::Sender<Vec<WorkerId>>,
    worker_joined: Arc<Notify>,
    cancel: CancellationToken,
}

#[async_trait]
impl Service for Broker {
    async fn handle(&self, request: Request) -> Response {
        match request {
            Request::ControllerConnect { reply_addr } => self.controller_connect(reply_addr).await,
            Request::ControllerQuit => self.controller_quit().await,
            Request::ServerQuit => self.server_quit().await,
            Request::PauseToggle => self.pause_toggle().await,
            Request::StartGol { alive, params } => self.start_gol(alive, params).await,
            Request::WorkerConnect { reply_addr } => self.worker_connect(reply_addr).await,
            Request::WorkerDisconnect { id } => self.worker_disconnect(id).await,
            Request::PushDelta {
                worker,
                epoch,
                turn,
                flipped,
            } => self.push_delta(worker, epoch, turn, flipped).await,
            other => {
                warn!(?other, "request outside the broker surface");
                Response::Refused("not a broker method".into())
            }
        }
    }
}

impl Broker {
    pub fn new(cancel: CancellationToken) -> (Self, Signals) {
        let (turn_ready_tx, turn_ready_rx) = mpsc::channel(1);
        let (churn_tx, churn_rx) = mpsc::channel(16);

        let broker = Self {
            state: Default::default(),
            prime_lock: Default::default(),
            turn_ready: turn_ready_tx,
            churn: churn_tx,
            worker_joined: Arc::new(Notify::new()),
            cancel,
        };

        let signals = Signals {
            turn_ready: turn_ready_rx,
            churn: churn_rx,
        };

        (broker, signals)
    }

    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    async fn controller_connect(&self, reply_addr: String) -> Response {
        let link = match Client::connect(&reply_addr).await {
            Ok(link) => link,
            Err(error) => {
                return Response::Refused(format!("could not dial back {reply_addr}: {error}"))
            }
        };

        let mut state = self.state.lock().await;
        if state.controller.is_some() {
            return Response::Refused("a controller is already connected".into());
        }

        state.controller = Some(link);
        info!(addr = %reply_addr, "controller connected");

        Response::Unit
    }

    async fn controller_quit(&self) -> Response {
        let mut state = self.state.lock().await;
        state.controller = None;
        // the world dies with its controller; workers stay primed
        state.run = None;
        info!("controller detached");

        Response::Unit
    }

    async fn server_quit(&self) -> Response {
        info!("server quit requested");

        let links = {
            let state = self.state.lock().await;
            state.registry.values().map(|h| h.link.clone()).collect_vec()
        };

        for link in links {
            let _ = tokio::time::timeout(SHUTDOWN_TIMEOUT, link.call(Request::Shutdown)).await;
        }

        self.cancel.cancel();

        Response::Unit
    }

    async fn pause_toggle(&self) -> Response {
        let now = {
            let mut state = self.state.lock().await;
            state.paused = !state.paused;
            if state.paused {
                PauseState::Paused
            } else {
                PauseState::Running
            }
        };

        if now == PauseState::Running {
            // resuming nudges the forward loop to drain what piled up
            let _ = self.turn_ready.try_send(());
        }

        info!(state = ?now, "pause latch toggled");

        Response::Pause(now)
    }

    #[instrument(skip_all, fields(turns = params.turns))]
    async fn start_gol(&self, alive: Vec<Cell>, params: Params) -> Response {
        if params.turns == 0 {
            // zero-turn runs echo the initial state straight back as turn 0
            let state = self.state.lock().await;
            let Some(controller) = state.controller.clone() else {
                return Response::Refused("no controller attached".into());
            };

            let pushed = controller
                .call(Request::PushState {
                    turn: 0,
                    flipped: alive,
                })
                .await;

            if let Err(error) = pushed {
                warn!(%error, "could not push initial state");
            }

            return Response::Unit;
        }

        {
            let mut state = self.state.lock().await;
            if state.controller.is_none() {
                return Response::Refused("no controller attached".into());
            }

            state.epochs += 1;
            let epoch = state.epochs;
            state.run = Some(Run {
                world: World::from_cells(params.image_width, params.image_height, &alive),
                params,
                last_completed: 0,
                log: HashMap::new(),
                epoch,
            });
        }

        info!(
            width = params.image_width,
            height = params.image_height,
            "run initialised"
        );

        loop {
            let joined = self.worker_joined.notified();
            tokio::pin!(joined);
            // register before checking, or a join in between is missed
            joined.as_mut().enable();
            if !self.state.lock().await.registry.is_empty() {
                break;
            }
            info!("waiting for a worker to join");
            joined.await;
        }

        self.prime_and_dispatch().await;

        Response::Unit
    }

    async fn worker_connect(&self, reply_addr: String) -> Response {
        let link = match Client::connect(&reply_addr).await {
            Ok(link) => link,
            Err(error) => {
                return Response::Refused(format!("could not dial back {reply_addr}: {error}"))
            }
        };

        let (id, mid_run) = {
            let mut state = self.state.lock().await;
            let id = state.next_id;
            state.next_id += 1;
            state.registry.insert(
                id,
                WorkerHandle {
                    link,
                    reply_addr: reply_addr.clone(),
                    height: 0,
                    row_offset: 0,
                    primed: false,
                },
            );
            (id, state.run.is_some())
        };

        info!(id, addr = %reply_addr, "worker connected");
        self.worker_joined.notify_waiters();

        if mid_run {
            // a join repartitions the pool like any other churn
            self.report_churn(vec![]).await;
        }

        Response::WorkerId(id)
    }

    async fn worker_disconnect(&self, id: WorkerId) -> Response {
        let (removed, mid_run) = {
            let mut state = self.state.lock().await;
            (state.registry.remove(&id).is_some(), state.run.is_some())
        };

        if !removed {
            debug!(id, "deregistration for unknown worker");
            return Response::Unit;
        }

        info!(id, "worker deregistered");

        if mid_run {
            self.report_churn(vec![]).await;
        }

        Response::Unit
    }

    async fn push_delta(
        &self,
        worker: WorkerId,
        epoch: Epoch,
        turn: Turn,
        flipped: Vec<Cell>,
    ) -> Response {
        let ready = {
            let mut state = self.state.lock().await;

            if !state.registry.contains_key(&worker) {
                debug!(violation = %BrokenInvariant::UnknownWorker(worker), "delta ignored");
                return Response::Unit;
            }

            let State { registry, run, .. } = &mut *state;
            let Some(run) = run.as_mut() else {
                return Response::Unit;
            };

            if epoch != run.epoch {
                debug!(worker, epoch, current = run.epoch, "delta from a stale epoch");
                return Response::Unit;
            }

            if turn <= run.last_completed {
                debug!(worker, turn, "stale delta");
                return Response::Unit;
            }

            if turn > run.last_completed + FUTURE_TURN_SLACK {
                warn!(
                    violation = %BrokenInvariant::TurnFromTheFuture(turn, run.last_completed),
                    worker,
                    "delta breaks the run-ahead invariant"
                );
            }

            let entry = run.log.entry(turn).or_default();
            if !entry.responded.insert(worker) {
                debug!(worker, turn, "duplicate delta ignored");
                return Response::Unit;
            }
            entry.flipped.extend(flipped);

            turn == run.last_completed + 1
                && registry.keys().all(|id| entry.responded.contains(id))
        };

        if ready {
            let _ = self.turn_ready.try_send(());
        }

        Response::Unit
    }

    async fn report_churn(&self, failed: Vec<WorkerId>) {
        let _ = self.churn.send(failed).await;
    }

    /// Forwards every turn that is ready, in order. Returns how many were
    /// forwarded. Called from the forward stage only.
    pub(crate) async fn forward_ready_turns(&self) -> u64 {
        let mut forwarded = 0;

        loop {
            let mut state = self.state.lock().await;

            let Some((turn, entry, finished)) = state.pop_ready_turn() else {
                break;
            };

            let controller = state.controller.clone().unwrap();

            debug!(turn, flipped = entry.flipped.len(), "forwarding turn");

            // the one call allowed while holding the state lock: the push
            // must stay serialised with world mutation
            let pushed = controller
                .call(Request::PushState {
                    turn,
                    flipped: entry.flipped,
                })
                .await
                .and_then(Response::expect_unit);

            match pushed {
                Ok(()) => {
                    forwarded += 1;
                    if finished {
                        info!(turns = turn, "run complete");
                        state.run = None;
                        break;
                    }
                }
                Err(error) => {
                    warn!(%error, "controller unreachable, detaching");
                    state.controller = None;
                    state.run = None;
                    break;
                }
            }
        }

        forwarded
    }

    /// Drops the given workers, shuts them down best-effort, clears the
    /// turn log and reprimes whatever pool remains.
    pub(crate) async fn handle_churn(&self, failed: Vec<WorkerId>) {
        let dropped = {
            let mut state = self.state.lock().await;
            if let Some(run) = state.run.as_mut() {
                // partial contributions die with the log
                run.log.clear();
            }
            failed
                .iter()
                .filter_map(|id| state.registry.remove(id))
                .collect_vec()
        };

        for handle in dropped {
            let _ = tokio::time::timeout(SHUTDOWN_TIMEOUT, handle.link.call(Request::Shutdown))
                .await;
        }

        let (has_workers, has_run) = {
            let state = self.state.lock().await;
            (!state.registry.is_empty(), state.run.is_some())
        };

        if has_workers && has_run {
            self.prime_and_dispatch().await;
        } else if has_run {
            info!("no workers left, waiting for a new join");
        }
    }

    /// Workers that have not answered for the turn currently in line, once
    /// the run has been stuck for a full watchdog period.
    pub(crate) async fn watchdog_sweep(&self) -> Vec<WorkerId> {
        let state = self.state.lock().await;

        let Some(run) = state.run.as_ref() else {
            return vec![];
        };

        let fresh = state
            .progress_at
            .map_or(true, |at| at.elapsed() < WATCHDOG_GRACE);
        if fresh {
            return vec![];
        }

        let next = run.last_completed + 1;
        if next > run.params.turns {
            return vec![];
        }

        let responded = run.log.get(&next);

        state
            .registry
            .keys()
            .filter(|id| responded.map_or(true, |entry| !entry.responded.contains(id)))
            .copied()
            .collect()
    }

    /// Recomputes the row partition, reassigns neighbours and redispatches
    /// the turn loops from the last completed turn.
    ///
    /// Runs in two phases under a dedicated lock so overlapping reprimes
    /// cannot interleave: assignments are computed and sent to every worker
    /// first, and only then do the evolve dispatches go out. No turn loop of
    /// the new epoch starts before every worker has fresh halo queues.
    #[instrument(skip_all)]
    pub(crate) async fn prime_and_dispatch(&self) {
        let _guard = self.prime_lock.lock().await;

        let (inits, evolves) = {
            let mut state = self.state.lock().await;

            state.epochs += 1;
            let epoch = state.epochs;

            let State { registry, run, .. } = &mut *state;
            let Some(run) = run.as_mut() else {
                return;
            };

            run.log.clear();
            run.epoch = epoch;

            let ids = registry.keys().copied().collect_vec();
            if ids.is_empty() {
                return;
            }

            let params = run.params;
            let heights = partition::split_rows(params.image_height, ids.len());
            let offsets = partition::row_offsets(&heights);
            let single = ids.len() == 1;
            let start_turn = run.last_completed + 1;

            if heights.contains(&0) {
                warn!(
                    workers = ids.len(),
                    rows = params.image_height,
                    "more workers than rows, some strips are empty"
                );
            }

            let mut inits = Vec::new();
            let mut evolves = Vec::new();

            for (index, id) in ids.iter().enumerate() {
                let (top_addr, bottom_addr) = if single {
                    (None, None)
                } else {
                    let (top, bottom) = partition::wrap_neighbours(index, ids.len());
                    (
                        Some(registry[&ids[top]].reply_addr.clone()),
                        Some(registry[&ids[bottom]].reply_addr.clone()),
                    )
                };

                let handle = registry.get_mut(id).unwrap();
                handle.height = heights[index];
                handle.row_offset = offsets[index];
                let first_time = !handle.primed;
                handle.primed = true;

                inits.push((
                    *id,
                    handle.link.clone(),
                    Request::InitialiseWorker(StripAssignment {
                        width: params.image_width,
                        height: heights[index],
                        row_offset: offsets[index],
                        epoch,
                        top_addr,
                        bottom_addr,
                        first_time,
                    }),
                ));

                let flipped = run
                    .world
                    .alive_cells_in_rows(offsets[index]..offsets[index] + heights[index]);

                evolves.push((
                    *id,
                    handle.link.clone(),
                    Request::EvolveSlice {
                        flipped,
                        start_turn,
                        turns: Some(params.turns),
                        single_worker: single,
                    },
                ));
            }

            info!(
                workers = ids.len(),
                epoch, start_turn, "priming worker pool"
            );

            (inits, evolves)
        };

        let mut failed = Vec::new();

        for (id, link, request) in inits {
            let result = link.call(request).await.and_then(Response::expect_unit);
            if let Err(error) = result {
                warn!(id, %error, "worker failed to prime");
                failed.push(id);
            }
        }

        for (id, link, request) in evolves {
            if failed.contains(&id) {
                continue;
            }
            let result = link.call(request).await.and_then(Response::expect_unit);
            if let Err(error) = result {
                warn!(id, %error, "worker failed to accept its slice");
                failed.push(id);
            }
        }

        if !failed.is_empty() {
            self.report_churn(failed).await;
        }

        // the new pool gets a fresh watchdog period to produce its first turn
        let mut state = self.state.lock().await;
        state.progress_at = Some(Instant::now());
    }
}

/// One broker process: listener plus the forward stage.
pub struct Driver {
    listener: TcpListener,
    broker: Broker,
    signals: Signals,
}

impl Driver {
    pub async fn bind(config: &BrokerConfig, cancel: CancellationToken) -> Result<Self, Error> {
        let listener = rpc::bind(&config.listen_address)
            .await
            .map_err(Error::server)?;

        info!(addr = %listener.local_addr()?, "broker listening");

        let (broker, signals) = Broker::new(cancel);

        Ok(Self {
            listener,
            broker,
            signals,
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr, Error> {
        Ok(self.listener.local_addr()?)
    }

    pub async fn run(self, policy: gasket::runtime::Policy) -> Result<(), Error> {
        let cancel = self.broker.cancel_token();

        let stage = forward::Stage::new(self.broker.clone(), self.signals);
        let tether = gasket::runtime::spawn_stage(stage, policy);

        let served = rpc::serve(
            self.listener,
            Arc::new(self.broker),
            CancelTokenImpl(cancel),
        )
        .await;

        tether.dismiss_stage().ok();
        tether.join_stage();

        served.map_err(Error::server)
    }
}
