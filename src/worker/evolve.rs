use gasket::framework::*;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::prelude::*;
use crate::rpc::Client;

use super::life;

pub type PlanPort = gasket::messaging::InputPort<Plan>;

/// A primed strip plus everything its turn loop needs: neighbour links,
/// inbound halo queues and the generation token that a reprime cancels.
pub struct Plan {
    pub strip: World,
    pub row_offset: u32,
    pub epoch: Epoch,
    pub next_turn: Turn,
    /// `None` runs until the next reprime.
    pub turns: Option<Turn>,
    pub single: bool,
    pub top: Option<Client>,
    pub bottom: Option<Client>,
    pub halo_top: mpsc::Receiver<HaloRow>,
    pub halo_bottom: mpsc::Receiver<HaloRow>,
    pub generation: CancellationToken,
}

impl Plan {
    fn finished(&self, completed: Turn) -> bool {
        self.turns.is_some_and(|total| completed >= total)
    }
}

pub enum WorkUnit {
    Turn,
}

#[derive(Stage)]
#[stage(name = "evolve", unit = "WorkUnit", worker = "Evolver")]
pub struct Stage {
    worker_id: WorkerId,
    broker: Client,

    pub plans: PlanPort,

    #[metric]
    current_turn: gasket::metrics::Gauge,

    #[metric]
    flipped_cells: gasket::metrics::Counter,
}

impl Stage {
    pub fn new(worker_id: WorkerId, broker: Client) -> Self {
        Self {
            worker_id,
            broker,
            plans: Default::default(),
            current_turn: Default::default(),
            flipped_cells: Default::default(),
        }
    }
}

pub struct Evolver {
    plan: Option<Plan>,
}

#[async_trait::async_trait(?Send)]
impl gasket::framework::Worker<Stage> for Evolver {
    async fn bootstrap(_stage: &Stage) -> Result<Self, WorkerError> {
        Ok(Self { plan: None })
    }

    async fn schedule(&mut self, stage: &mut Stage) -> Result<WorkSchedule<WorkUnit>, WorkerError> {
        while self.plan.is_none() {
            let msg = stage.plans.recv().await.or_panic()?;
            let plan = msg.payload;

            if plan.generation.is_cancelled() {
                debug!("skipping superseded assignment");
                continue;
            }

            info!(
                start = plan.next_turn,
                offset = plan.row_offset,
                single = plan.single,
                "strip assignment received"
            );
            self.plan = Some(plan);
        }

        Ok(WorkSchedule::Unit(WorkUnit::Turn))
    }

    async fn execute(&mut self, _unit: &WorkUnit, stage: &mut Stage) -> Result<(), WorkerError> {
        let Some(plan) = self.plan.as_mut() else {
            return Ok(());
        };

        let turn = plan.next_turn;

        let Some((top, bottom)) = fetch_halos(plan).await else {
            debug!(turn, "turn abandoned");
            self.plan = None;
            return Ok(());
        };

        let (next, flipped) = life::evolve_strip(&plan.strip, &top, &bottom, plan.row_offset);
        plan.strip = next;

        stage.current_turn.set(turn as i64);
        stage.flipped_cells.inc(flipped.len() as u64);

        let push = Request::PushDelta {
            worker: stage.worker_id,
            epoch: plan.epoch,
            turn,
            flipped,
        };

        let pushed = stage.broker.call(push).await.and_then(Response::expect_unit);
        if let Err(error) = pushed {
            warn!(%error, turn, "broker unreachable, parking strip");
            self.plan = None;
            return Ok(());
        }

        plan.next_turn += 1;

        if plan.finished(turn) || plan.generation.is_cancelled() {
            info!(turn, "turn loop finished");
            self.plan = None;
        }

        Ok(())
    }
}

/// Swaps edge rows with both neighbours. Send and receive run concurrently:
/// serialising them would deadlock two workers that are each other's
/// neighbour, since both would wait for the other's send to land first.
async fn fetch_halos(plan: &mut Plan) -> Option<(HaloRow, HaloRow)> {
    if plan.single {
        // the strip is the whole world, so the torus wraps onto itself
        let top = plan.strip.row(plan.strip.height() - 1).to_vec();
        let bottom = plan.strip.row(0).to_vec();
        return Some((top, bottom));
    }

    let first = plan.strip.row(0).to_vec();
    let last = plan.strip.row(plan.strip.height() - 1).to_vec();

    let top_link = plan.top.clone()?;
    let bottom_link = plan.bottom.clone()?;
    let epoch = plan.epoch;
    let generation = plan.generation.clone();

    let send = async {
        // our first row is the top neighbour's bottom halo and our last row
        // is the bottom neighbour's top halo
        let up = top_link.call(Request::PushHalo {
            epoch,
            is_top: false,
            row: first,
        });
        let down = bottom_link.call(Request::PushHalo {
            epoch,
            is_top: true,
            row: last,
        });

        let (up, down) = tokio::join!(up, down);
        up.and(down)
    };

    let halo_top = &mut plan.halo_top;
    let halo_bottom = &mut plan.halo_bottom;
    let receive = async { tokio::join!(halo_top.recv(), halo_bottom.recv()) };

    tokio::select! {
        _ = generation.cancelled() => None,
        (sent, received) = async { tokio::join!(send, receive) } => {
            if let Err(error) = sent {
                warn!(%error, "halo push failed");
                return None;
            }

            match received {
                (Some(top), Some(bottom)) => Some((top, bottom)),
                _ => None,
            }
        }
    }
}
