//! Controller role: keeps a lock-step shadow of the broker's world and
//! exposes the command surface the UI drives. The UI itself (keypresses,
//! image IO, viewers) lives outside this crate; it consumes the event
//! stream and calls the session methods.

use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::{mpsc, watch, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::prelude::*;
use crate::rpc::{self, Client, Service};

/// What the external sink sees. `CellsFlipped` always precedes the
/// `TurnComplete` for the same turn.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Event {
    CellsFlipped { turn: Turn, cells: Vec<Cell> },
    TurnComplete { turn: Turn },
    FinalTurnComplete { turn: Turn, alive: Vec<Cell> },
    StateChange { turn: Turn, state: ExecutionState },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecutionState {
    Paused,
    Running,
    Quitting,
}

impl From<PauseState> for ExecutionState {
    fn from(value: PauseState) -> Self {
        match value {
            PauseState::Paused => ExecutionState::Paused,
            PauseState::Running => ExecutionState::Running,
        }
    }
}

struct Shadow {
    world: World,
    turn: Turn,
    turns: Turn,
}

/// Inbound RPC surface: the broker's reverse channel lands here.
struct Inbox {
    shadow: Mutex<Option<Shadow>>,
    events: mpsc::UnboundedSender<Event>,
    finished: watch::Sender<bool>,
}

#[async_trait]
impl Service for Inbox {
    async fn handle(&self, request: Request) -> Response {
        match request {
            Request::PushState { turn, flipped } => self.push_state(turn, flipped).await,
            other => {
                warn!(?other, "request outside the controller surface");
                Response::Refused("not a controller method".into())
            }
        }
    }
}

impl Inbox {
    /// Applies one turn's delta to the shadow world and emits the matching
    /// events. Turn 0 is the initial state itself and is not re-applied.
    async fn push_state(&self, turn: Turn, flipped: Vec<Cell>) -> Response {
        let mut guard = self.shadow.lock().await;

        let Some(shadow) = guard.as_mut() else {
            return Response::Refused("no run in progress".into());
        };

        if turn > 0 {
            shadow.world.apply(&flipped);
        }
        shadow.turn = turn;

        let _ = self.events.send(Event::CellsFlipped {
            turn,
            cells: flipped,
        });
        let _ = self.events.send(Event::TurnComplete { turn });

        if turn >= shadow.turns {
            let alive = shadow.world.alive_cells();
            info!(turn, alive = alive.len(), "final turn complete");
            let _ = self.events.send(Event::FinalTurnComplete { turn, alive });
            let _ = self.finished.send(true);
        }

        Response::Unit
    }
}

/// An attached controller: the dialed broker link plus the inbox serving
/// its reverse calls.
pub struct Session {
    broker: Client,
    inbox: Arc<Inbox>,
    finished: watch::Receiver<bool>,
    cancel: CancellationToken,
}

impl Session {
    /// Binds the reverse-call listener and registers with the broker. Fails
    /// if another controller is already attached.
    pub async fn connect(
        config: &ControllerConfig,
        events: mpsc::UnboundedSender<Event>,
        cancel: CancellationToken,
    ) -> Result<Self, Error> {
        let listener = rpc::bind(&config.listen_address)
            .await
            .map_err(Error::server)?;
        let local = listener.local_addr()?;

        let advertise = config
            .advertise_address
            .clone()
            .unwrap_or_else(|| local.to_string());

        let (finished_tx, finished_rx) = watch::channel(false);

        let inbox = Arc::new(Inbox {
            shadow: Mutex::new(None),
            events,
            finished: finished_tx,
        });

        tokio::spawn(rpc::serve(
            listener,
            inbox.clone(),
            CancelTokenImpl(cancel.clone()),
        ));

        let broker = Client::connect(&config.broker_address)
            .await
            .map_err(Error::client)?;

        let attached = broker
            .call(Request::ControllerConnect {
                reply_addr: advertise,
            })
            .await
            .and_then(Response::expect_unit);

        if let Err(error) = attached {
            // the inbox listener dies with the failed attachment
            cancel.cancel();
            return Err(Error::client(error));
        }

        info!(addr = %local, "attached to broker");

        Ok(Self {
            broker,
            inbox,
            finished: finished_rx,
            cancel,
        })
    }

    /// Starts a run. The shadow world becomes the initial state; per-turn
    /// deltas stream back through the inbox. Blocks until the broker has
    /// at least one worker and has primed the pool.
    pub async fn start(&self, alive: Vec<Cell>, params: Params) -> Result<(), Error> {
        {
            let mut shadow = self.inbox.shadow.lock().await;
            *shadow = Some(Shadow {
                world: World::from_cells(params.image_width, params.image_height, &alive),
                turn: 0,
                turns: params.turns,
            });
        }
        let _ = self.inbox.finished.send(false);

        self.broker
            .call(Request::StartGol { alive, params })
            .await?
            .expect_unit()?;

        Ok(())
    }

    /// Resolves once the final turn's delta has been applied.
    pub async fn wait_finished(&self) -> Result<(), Error> {
        let mut finished = self.finished.clone();
        while !*finished.borrow_and_update() {
            finished
                .changed()
                .await
                .map_err(|_| Error::message("session closed before the final turn"))?;
        }
        Ok(())
    }

    /// Toggles the broker's pause latch. Pausing stops delta forwarding,
    /// not worker computation.
    pub async fn pause(&self) -> Result<ExecutionState, Error> {
        let state: ExecutionState = self
            .broker
            .call(Request::PauseToggle)
            .await?
            .expect_pause()?
            .into();

        let turn = self.current_turn().await;
        let _ = self.inbox.events.send(Event::StateChange { turn, state });

        Ok(state)
    }

    /// Snapshot of the shadow world for the IO collaborator ("save").
    pub async fn snapshot(&self) -> Option<(World, Turn)> {
        let guard = self.inbox.shadow.lock().await;
        guard.as_ref().map(|s| (s.world.clone(), s.turn))
    }

    /// Alive-cell count at the current turn, for tick-based reporting.
    pub async fn alive_count(&self) -> Option<(usize, Turn)> {
        let guard = self.inbox.shadow.lock().await;
        guard.as_ref().map(|s| (s.world.count_alive(), s.turn))
    }

    async fn current_turn(&self) -> Turn {
        let guard = self.inbox.shadow.lock().await;
        guard.as_ref().map(|s| s.turn).unwrap_or_default()
    }

    /// Detaches from the broker, leaving it and its workers running.
    pub async fn quit(self) -> Result<(), Error> {
        let turn = self.current_turn().await;

        let _ = self.broker.call(Request::ControllerQuit).await;
        let _ = self.inbox.events.send(Event::StateChange {
            turn,
            state: ExecutionState::Quitting,
        });

        self.cancel.cancel();
        info!("detached from broker");

        Ok(())
    }

    /// Tears the whole system down: broker and every worker.
    pub async fn kill(self) -> Result<(), Error> {
        self.broker
            .call(Request::ServerQuit)
            .await?
            .expect_unit()?;

        self.cancel.cancel();
        info!("server quit issued");

        Ok(())
    }
}
