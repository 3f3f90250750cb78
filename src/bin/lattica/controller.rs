use std::path::PathBuf;

use miette::{Context as _, Result};
use tokio::sync::mpsc;
use tracing::{debug, info};

use lattica::controller::{Event, Session};
use lattica::prelude::*;

#[derive(Debug, clap::Args)]
pub struct Args {
    /// Broker address to attach to.
    #[arg(long, short)]
    broker: Option<String>,

    /// Port to listen on for the broker's reverse calls.
    #[arg(long, short)]
    port: Option<u16>,

    /// World width in cells.
    #[arg(long, default_value_t = 512)]
    width: u32,

    /// World height in cells.
    #[arg(long, default_value_t = 512)]
    height: u32,

    /// Number of turns to evolve.
    #[arg(long, short, default_value_t = 100)]
    turns: u64,

    /// Seed file with one `x y` pair per line. An empty world otherwise.
    #[arg(long)]
    seed: Option<PathBuf>,

    /// Path to an alternative config file.
    #[arg(long)]
    config: Option<PathBuf>,
}

fn read_seed(path: &PathBuf) -> Result<Vec<Cell>, Error> {
    let raw = std::fs::read_to_string(path)?;

    let mut cells = Vec::new();
    for (number, line) in raw.lines().enumerate() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }

        let mut parts = line.split_whitespace();
        let (Some(x), Some(y)) = (parts.next(), parts.next()) else {
            return Err(Error::parse(format!("seed line {}: expected `x y`", number + 1)));
        };

        let x = x
            .parse()
            .map_err(|_| Error::parse(format!("seed line {}: bad x", number + 1)))?;
        let y = y
            .parse()
            .map_err(|_| Error::parse(format!("seed line {}: bad y", number + 1)))?;

        cells.push(Cell::new(x, y));
    }

    Ok(cells)
}

#[tokio::main]
pub async fn run(args: &Args) -> Result<()> {
    let mut config = crate::common::load_config(&args.config)?;

    if let Some(port) = args.port {
        config.controller.listen_address = format!("0.0.0.0:{port}");
    }

    if let Some(broker) = &args.broker {
        config.controller.broker_address = broker.clone();
    }

    crate::common::setup_tracing(&config.logging)?;

    let exit = crate::common::hook_exit_token();

    let alive = match &args.seed {
        Some(path) => read_seed(path).context("reading seed file")?,
        None => vec![],
    };

    let params = Params {
        turns: args.turns,
        threads: 1,
        image_width: args.width,
        image_height: args.height,
    };

    let (events_tx, mut events_rx) = mpsc::unbounded_channel();

    // the event sink: a UI would subscribe here, we just narrate
    tokio::spawn(async move {
        while let Some(event) = events_rx.recv().await {
            match event {
                Event::CellsFlipped { turn, cells } => {
                    debug!(turn, flipped = cells.len(), "cells flipped")
                }
                Event::TurnComplete { turn } => debug!(turn, "turn complete"),
                Event::FinalTurnComplete { turn, alive } => {
                    info!(turn, alive = alive.len(), "final turn complete")
                }
                Event::StateChange { turn, state } => info!(turn, ?state, "state change"),
            }
        }
    });

    let session = Session::connect(&config.controller, events_tx, exit.clone()).await?;

    info!(
        turns = params.turns,
        width = params.image_width,
        height = params.image_height,
        seeded = alive.len(),
        "starting run"
    );

    session.start(alive, params).await?;

    let finished = tokio::select! {
        res = session.wait_finished() => {
            res?;
            true
        }
        _ = exit.cancelled() => {
            info!("interrupted, detaching");
            false
        }
    };

    if !finished {
        session.quit().await?;
        return Ok(());
    }

    let (world, turn) = session
        .snapshot()
        .await
        .ok_or_else(|| Error::message("no final state"))?;

    info!(turn, alive = world.count_alive(), "run finished");

    session.quit().await?;

    Ok(())
}
