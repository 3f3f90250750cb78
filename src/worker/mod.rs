//! Worker role: owns one horizontal strip of the world and evolves it turn
//! by turn, swapping halo rows with its two neighbours and pushing each
//! turn's flipped cells to the broker.

pub mod evolve;
pub mod life;

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use gasket::messaging::tokio::{ChannelRecvAdapter, ChannelSendAdapter};
use gasket::messaging::SendAdapter;
use tokio::net::TcpListener;
use tokio::sync::{mpsc, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use crate::prelude::*;
use crate::rpc::{self, Client, Service};

/// Single-slot queues: a neighbour that runs a turn ahead blocks on its
/// push until this strip consumes the previous row.
const HALO_QUEUE_DEPTH: usize = 1;

/// Strip configuration staged by `InitialiseWorker`, consumed by the next
/// `EvolveSlice`.
struct Primed {
    width: u32,
    height: u32,
    row_offset: u32,
    epoch: Epoch,
    top: Option<Client>,
    bottom: Option<Client>,
    halo_top: mpsc::Receiver<HaloRow>,
    halo_bottom: mpsc::Receiver<HaloRow>,
    generation: CancellationToken,
}

#[derive(Default)]
struct NodeState {
    epoch: Epoch,
    halo_top_tx: Option<mpsc::Sender<HaloRow>>,
    halo_bottom_tx: Option<mpsc::Sender<HaloRow>>,
    primed: Option<Primed>,
    generation: Option<CancellationToken>,
}

/// Shared handle behind the worker's inbound RPC surface.
pub struct Node {
    id: WorkerId,
    state: Mutex<NodeState>,
    plans: Mutex<ChannelSendAdapter<evolve::Plan>>,
    cancel: CancellationToken,
    broker_shutdown: AtomicBool,
}

#[async_trait]
impl Service for Node {
    async fn handle(&self, request: Request) -> Response {
        match request {
            Request::InitialiseWorker(assignment) => self.initialise(assignment).await,
            Request::EvolveSlice {
                flipped,
                start_turn,
                turns,
                single_worker,
            } => self.evolve_slice(flipped, start_turn, turns, single_worker).await,
            Request::PushHalo { epoch, is_top, row } => self.push_halo(epoch, is_top, row).await,
            Request::Shutdown => {
                info!("shutdown requested by broker");
                self.broker_shutdown.store(true, Ordering::SeqCst);
                self.cancel.cancel();
                Response::Unit
            }
            other => {
                warn!(?other, "request outside the worker surface");
                Response::Refused("not a worker method".into())
            }
        }
    }
}

impl Node {
    fn new(id: WorkerId, plans: ChannelSendAdapter<evolve::Plan>, cancel: CancellationToken) -> Self {
        Self {
            id,
            state: Mutex::new(NodeState::default()),
            plans: Mutex::new(plans),
            cancel,
            broker_shutdown: AtomicBool::new(false),
        }
    }

    /// Adopts a new strip configuration. Any active turn loop is cancelled
    /// and its halo queues replaced, which also drains whatever a stale
    /// neighbour still had in flight.
    #[instrument(skip_all, fields(id = self.id))]
    async fn initialise(&self, assignment: StripAssignment) -> Response {
        let top = match &assignment.top_addr {
            Some(addr) => match Client::connect(addr).await {
                Ok(client) => Some(client),
                Err(error) => {
                    return Response::Refused(format!("cannot dial top neighbour {addr}: {error}"))
                }
            },
            None => None,
        };

        let bottom = match &assignment.bottom_addr {
            Some(addr) => match Client::connect(addr).await {
                Ok(client) => Some(client),
                Err(error) => {
                    return Response::Refused(format!(
                        "cannot dial bottom neighbour {addr}: {error}"
                    ))
                }
            },
            None => None,
        };

        let mut state = self.state.lock().await;

        if let Some(old) = state.generation.take() {
            old.cancel();
        }

        if !assignment.first_time {
            debug!("discarding previous neighbour links");
        }

        let (top_tx, top_rx) = mpsc::channel(HALO_QUEUE_DEPTH);
        let (bottom_tx, bottom_rx) = mpsc::channel(HALO_QUEUE_DEPTH);
        let generation = self.cancel.child_token();

        state.epoch = assignment.epoch;
        state.halo_top_tx = Some(top_tx);
        state.halo_bottom_tx = Some(bottom_tx);
        state.generation = Some(generation.clone());
        state.primed = Some(Primed {
            width: assignment.width,
            height: assignment.height,
            row_offset: assignment.row_offset,
            epoch: assignment.epoch,
            top,
            bottom,
            halo_top: top_rx,
            halo_bottom: bottom_rx,
            generation,
        });

        info!(
            height = assignment.height,
            offset = assignment.row_offset,
            epoch = assignment.epoch,
            "strip configured"
        );

        Response::Unit
    }

    /// Builds the strip from the shipped flip set and hands the turn loop
    /// over to the evolve stage.
    async fn evolve_slice(
        &self,
        flipped: Vec<Cell>,
        start_turn: Turn,
        turns: Option<Turn>,
        single_worker: bool,
    ) -> Response {
        let primed = self.state.lock().await.primed.take();

        let Some(primed) = primed else {
            return Response::Refused("worker is not primed".into());
        };

        let mut strip = World::blank(primed.width, primed.height);
        for cell in &flipped {
            // cells arrive in world coordinates
            match cell.y.checked_sub(primed.row_offset) {
                Some(y) => strip.flip(&Cell::new(cell.x, y)),
                None => warn!(%cell, offset = primed.row_offset, "cell below the strip"),
            }
        }

        let plan = evolve::Plan {
            strip,
            row_offset: primed.row_offset,
            epoch: primed.epoch,
            next_turn: start_turn,
            turns,
            single: single_worker,
            top: primed.top,
            bottom: primed.bottom,
            halo_top: primed.halo_top,
            halo_bottom: primed.halo_bottom,
            generation: primed.generation,
        };

        let mut plans = self.plans.lock().await;
        if plans.send(plan.into()).await.is_err() {
            return Response::Refused("evolve stage is gone".into());
        }

        Response::Unit
    }

    /// A neighbour delivering one halo row. Awaiting the queue slot is the
    /// backpressure that keeps neighbours in turn lock-step.
    async fn push_halo(&self, epoch: Epoch, is_top: bool, row: HaloRow) -> Response {
        let sender = {
            let state = self.state.lock().await;
            if epoch != state.epoch {
                debug!(epoch, current = state.epoch, "halo from a stale epoch");
                return Response::Unit;
            }
            if is_top {
                state.halo_top_tx.clone()
            } else {
                state.halo_bottom_tx.clone()
            }
        };

        match sender {
            Some(sender) => {
                if sender.send(row).await.is_err() {
                    debug!("halo dropped, strip was reprimed");
                }
            }
            None => debug!("halo for an unconfigured strip"),
        }

        Response::Unit
    }
}

/// How the worker's serve loop ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Exit {
    /// The broker sent `Shutdown`; no deregistration is owed.
    BrokerShutdown,
    /// The local cancel token fired (ctrl-c or embedding teardown).
    Cancelled,
}

/// One worker process: listener, broker registration and evolve pipeline.
pub struct Driver {
    id: WorkerId,
    node: Arc<Node>,
    broker: Client,
    listener: TcpListener,
    plans_rx: ChannelRecvAdapter<evolve::Plan>,
    cancel: CancellationToken,
}

impl Driver {
    /// Binds the halo/control listener and registers with the broker. The
    /// listener must be up first: the broker dials back immediately.
    pub async fn connect(config: &WorkerConfig, cancel: CancellationToken) -> Result<Self, Error> {
        let listener = rpc::bind(&config.listen_address)
            .await
            .map_err(Error::server)?;
        let local = listener.local_addr()?;

        let advertise = config
            .advertise_address
            .clone()
            .unwrap_or_else(|| local.to_string());

        let broker = Client::connect(&config.broker_address)
            .await
            .map_err(Error::client)?;

        let id = broker
            .call(Request::WorkerConnect {
                reply_addr: advertise,
            })
            .await
            .map_err(Error::client)?
            .expect_worker_id()
            .map_err(Error::client)?;

        info!(id, addr = %local, "registered with broker");

        let (plans_tx, plans_rx) = gasket::messaging::tokio::mpsc_channel(4);
        let node = Arc::new(Node::new(id, plans_tx, cancel.clone()));

        Ok(Self {
            id,
            node,
            broker,
            listener,
            plans_rx,
            cancel,
        })
    }

    pub fn id(&self) -> WorkerId {
        self.id
    }

    pub fn local_addr(&self) -> Result<SocketAddr, Error> {
        Ok(self.listener.local_addr()?)
    }

    /// Link to the broker, shared with the evolve stage. Callers use it for
    /// the polite `WorkerDisconnect` on a local exit.
    pub fn control(&self) -> Client {
        self.broker.clone()
    }

    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Serves until the broker shuts this worker down or the cancel token
    /// fires. Deregistration is left to the caller: only a voluntary exit
    /// owes the broker a goodbye.
    pub async fn run(self, policy: gasket::runtime::Policy) -> Result<Exit, Error> {
        let mut stage = evolve::Stage::new(self.id, self.broker.clone());
        stage.plans.connect(self.plans_rx);

        let tether = gasket::runtime::spawn_stage(stage, policy);

        let served = rpc::serve(
            self.listener,
            self.node.clone(),
            CancelTokenImpl(self.cancel.clone()),
        )
        .await;

        tether.dismiss_stage().ok();
        tether.join_stage();

        served.map_err(Error::server)?;

        if self.node.broker_shutdown.load(Ordering::SeqCst) {
            Ok(Exit::BrokerShutdown)
        } else {
            Ok(Exit::Cancelled)
        }
    }
}
