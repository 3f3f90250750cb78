//! Types and machinery that are common to all lattica crates.
//!
//! Glossary:
//!  - `strip`: a contiguous range of world rows owned by one worker.
//!  - `halo`: the single row directly above or below a strip, supplied by a
//!    neighbouring worker each turn.
//!  - `delta`: the set of cells whose alive/dead state changed between two
//!    consecutive turns. Applying a delta twice is the identity.
//!  - `priming`: the broker's procedure of (re)assigning strips and
//!    neighbour identities to the whole worker pool.

use serde::{Deserialize, Serialize};
use std::fmt::Display;
use thiserror::Error;

pub mod config;
pub mod partition;
pub mod wire;
pub mod world;

pub use wire::*;
pub use world::*;

/// Identifier handed out by the broker when a worker registers. Ids grow
/// monotonically and are never reused, so registry order is join order.
pub type WorkerId = u32;

/// A turn of the simulation. Turn 0 is the initial state.
pub type Turn = u64;

/// A reprime cycle of the worker pool. Payloads tagged with an older epoch
/// are leftovers from before a pool change and must be ignored.
pub type Epoch = u64;

/// One row of cell bytes, one byte per column.
pub type HaloRow = Vec<u8>;

/// Byte value of a living cell. Evolution only reads the MSB.
pub const ALIVE: u8 = 0xFF;

/// Byte value of a dead cell.
pub const DEAD: u8 = 0x00;

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
pub struct Cell {
    pub x: u32,
    pub y: u32,
}

impl Cell {
    pub fn new(x: u32, y: u32) -> Self {
        Self { x, y }
    }
}

impl From<(u32, u32)> for Cell {
    fn from(value: (u32, u32)) -> Self {
        Self::new(value.0, value.1)
    }
}

impl Display for Cell {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "({}, {})", self.x, self.y)
    }
}

#[derive(Debug, Error)]
pub enum BrokenInvariant {
    #[error("cell {0} outside a {1}x{2} world")]
    CellOutOfBounds(Cell, u32, u32),

    #[error("delta for turn {0} while turn {1} is current")]
    TurnFromTheFuture(Turn, Turn),

    #[error("worker {0} is not registered")]
    UnknownWorker(WorkerId),
}

#[derive(Debug, Error)]
pub enum ServeError {
    #[error("failed to bind listener")]
    BindError(std::io::Error),

    #[error("failed to shutdown")]
    ShutdownError(std::io::Error),

    #[error(transparent)]
    Internal(#[from] Box<dyn std::error::Error + Send + Sync>),
}

#[trait_variant::make(Send)]
pub trait CancelToken: Send + Sync + 'static + Clone {
    async fn cancelled(&self);
}
