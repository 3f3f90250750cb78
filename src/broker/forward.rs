use gasket::framework::*;
use tokio::sync::mpsc;
use tracing::warn;

use crate::prelude::*;

use super::{Broker, Signals, WATCHDOG_GRACE};

pub enum Signal {
    TurnReady,
    Churn(Vec<WorkerId>),
    Watchdog,
}

/// The coordination loop. Single-threaded by construction: every state
/// transition of a run funnels through this stage, one signal at a time.
/// Inbound RPC handlers only mutate bookkeeping and raise signals.
#[derive(Stage)]
#[stage(name = "forward", unit = "Signal", worker = "Coordinator")]
pub struct Stage {
    broker: Broker,

    turn_ready: mpsc::Receiver<()>,
    churn: mpsc::Receiver<Vec<WorkerId>>,

    #[metric]
    forwarded_turns: gasket::metrics::Counter,

    #[metric]
    dropped_workers: gasket::metrics::Counter,
}

impl Stage {
    pub fn new(broker: Broker, signals: Signals) -> Self {
        Self {
            broker,
            turn_ready: signals.turn_ready,
            churn: signals.churn,
            forwarded_turns: Default::default(),
            dropped_workers: Default::default(),
        }
    }
}

pub struct Coordinator;

#[async_trait::async_trait(?Send)]
impl gasket::framework::Worker<Stage> for Coordinator {
    async fn bootstrap(_stage: &Stage) -> Result<Self, WorkerError> {
        Ok(Self)
    }

    async fn schedule(&mut self, stage: &mut Stage) -> Result<WorkSchedule<Signal>, WorkerError> {
        let signal = tokio::select! {
            ready = stage.turn_ready.recv() => match ready {
                Some(()) => Signal::TurnReady,
                None => return Ok(WorkSchedule::Idle),
            },
            churn = stage.churn.recv() => match churn {
                Some(ids) => Signal::Churn(ids),
                None => return Ok(WorkSchedule::Idle),
            },
            _ = tokio::time::sleep(WATCHDOG_GRACE) => Signal::Watchdog,
        };

        Ok(WorkSchedule::Unit(signal))
    }

    async fn execute(&mut self, unit: &Signal, stage: &mut Stage) -> Result<(), WorkerError> {
        match unit {
            Signal::TurnReady => {
                let forwarded = stage.broker.forward_ready_turns().await;
                stage.forwarded_turns.inc(forwarded);
            }
            Signal::Churn(ids) => {
                stage.dropped_workers.inc(ids.len() as u64);
                stage.broker.handle_churn(ids.clone()).await;
            }
            Signal::Watchdog => {
                let silent = stage.broker.watchdog_sweep().await;
                if silent.is_empty() {
                    return Ok(());
                }

                warn!(?silent, "workers silent for a full turn, dropping");
                stage.dropped_workers.inc(silent.len() as u64);
                stage.broker.handle_churn(silent).await;
            }
        }

        Ok(())
    }
}
