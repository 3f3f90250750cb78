//! Wire schema shared by the three roles.
//!
//! Every link carries bincode-encoded `Request`/`Response` envelopes inside
//! length-delimited frames. The schema is symmetric: each role answers the
//! subset of requests it implements and refuses the rest.

use serde::{de::DeserializeOwned, Deserialize, Serialize};
use thiserror::Error;

use crate::{Cell, Epoch, HaloRow, Turn, WorkerId};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Params {
    pub turns: u64,
    /// Advisory parallelism hint; the strip kernel decides for itself.
    pub threads: u32,
    pub image_width: u32,
    pub image_height: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PauseState {
    Paused,
    Running,
}

/// Everything a worker needs to adopt a strip: geometry plus the addresses
/// of the strips above and below. Both addresses are `None` in single-worker
/// mode, where the strip supplies its own halos.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StripAssignment {
    pub width: u32,
    pub height: u32,
    pub row_offset: u32,
    pub epoch: Epoch,
    pub top_addr: Option<String>,
    pub bottom_addr: Option<String>,
    /// False signals the worker to discard prior neighbour links and halo
    /// queues before adopting the new configuration.
    pub first_time: bool,
}

impl StripAssignment {
    pub fn is_single(&self) -> bool {
        self.top_addr.is_none() && self.bottom_addr.is_none()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Request {
    // controller -> broker
    ControllerConnect { reply_addr: String },
    ControllerQuit,
    ServerQuit,
    PauseToggle,
    StartGol { alive: Vec<Cell>, params: Params },

    // broker -> controller
    PushState { turn: Turn, flipped: Vec<Cell> },

    // worker -> broker
    WorkerConnect { reply_addr: String },
    WorkerDisconnect { id: WorkerId },
    PushDelta {
        worker: WorkerId,
        epoch: Epoch,
        turn: Turn,
        flipped: Vec<Cell>,
    },

    // broker -> worker
    InitialiseWorker(StripAssignment),
    EvolveSlice {
        flipped: Vec<Cell>,
        start_turn: Turn,
        /// `None` runs until the next reprime.
        turns: Option<Turn>,
        single_worker: bool,
    },
    Shutdown,

    // worker <-> worker
    PushHalo {
        epoch: Epoch,
        is_top: bool,
        row: HaloRow,
    },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Response {
    Unit,
    WorkerId(WorkerId),
    Pause(PauseState),
    Refused(String),
}

impl Response {
    pub fn expect_unit(self) -> Result<(), WireError> {
        match self {
            Response::Unit => Ok(()),
            other => Err(other.unexpected()),
        }
    }

    pub fn expect_worker_id(self) -> Result<WorkerId, WireError> {
        match self {
            Response::WorkerId(id) => Ok(id),
            other => Err(other.unexpected()),
        }
    }

    pub fn expect_pause(self) -> Result<PauseState, WireError> {
        match self {
            Response::Pause(state) => Ok(state),
            other => Err(other.unexpected()),
        }
    }

    fn unexpected(self) -> WireError {
        match self {
            Response::Refused(reason) => WireError::Refused(reason),
            other => WireError::Refused(format!("unexpected response: {other:?}")),
        }
    }
}

#[derive(Debug, Error)]
pub enum WireError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("codec error: {0}")]
    Codec(#[from] bincode::Error),

    #[error("connection closed by peer")]
    Disconnected,

    #[error("refused by peer: {0}")]
    Refused(String),
}

pub fn to_frame<T: Serialize>(value: &T) -> Result<Vec<u8>, WireError> {
    Ok(bincode::serialize(value)?)
}

pub fn from_frame<T: DeserializeOwned>(bytes: &[u8]) -> Result<T, WireError> {
    Ok(bincode::deserialize(bytes)?)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_survives_the_wire() {
        let request = Request::PushDelta {
            worker: 7,
            epoch: 3,
            turn: 42,
            flipped: vec![Cell::new(1, 2), Cell::new(15, 0)],
        };

        let frame = to_frame(&request).unwrap();
        let decoded: Request = from_frame(&frame).unwrap();

        match decoded {
            Request::PushDelta {
                worker,
                epoch,
                turn,
                flipped,
            } => {
                assert_eq!(worker, 7);
                assert_eq!(epoch, 3);
                assert_eq!(turn, 42);
                assert_eq!(flipped, vec![Cell::new(1, 2), Cell::new(15, 0)]);
            }
            other => panic!("decoded into {other:?}"),
        }
    }

    #[test]
    fn refused_response_surfaces_as_error() {
        let response = Response::Refused("already connected".into());
        let err = response.expect_unit().unwrap_err();
        assert!(matches!(err, WireError::Refused(reason) if reason == "already connected"));
    }

    #[test]
    fn mismatched_response_kind_is_refused() {
        assert!(Response::Unit.expect_worker_id().is_err());
        assert!(Response::WorkerId(1).expect_pause().is_err());
    }
}
