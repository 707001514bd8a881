//! Shared fixture for unit tests: a mock board, the simulated encoder and an
//! in-memory store wired into a `Dome`.

use std::sync::Arc;

use observatory_common::board::MockBoard;
use observatory_common::store::{MemoryStore, Store, INITIALIZED_KEY};

use crate::config::{EncoderLink, MotionConfig, Roles};
use crate::encoder::{BusTiming, Encoder};
use crate::motion::{Dome, DomeIo, KEY_POSITION};
use crate::sim::{demo_board, SimEncoder};

pub struct Rig {
    pub board: Arc<MockBoard>,
    pub sim: SimEncoder,
    pub store: Arc<MemoryStore>,
    pub dome: Arc<Dome>,
    pub roles: Roles,
}

/// Dome in AUTO with switchboard and AC on, not restored.
pub fn rig_unrestored(az: i32) -> Rig {
    let roles = Roles::default();
    let board = demo_board(&roles, 3, 6);
    let sim = SimEncoder::new(board.clone(), &roles, az);
    let encoder = Encoder::new(
        Box::new(sim.clone()),
        BusTiming::from(&EncoderLink::default()),
    );
    let store = Arc::new(MemoryStore::new());
    let io = DomeIo::new(board.clone(), board.clone(), roles.clone());
    let dome = Arc::new(Dome::new(
        io,
        encoder,
        store.clone(),
        MotionConfig::default(),
    ));
    Rig {
        board,
        sim,
        store,
        dome,
        roles,
    }
}

/// Dome restored from storage at `az`, encoder agreeing.
pub async fn rig(az: i32) -> Rig {
    let rig = rig_unrestored(az);
    rig.store.write_int(KEY_POSITION, i64::from(az)).await.unwrap();
    rig.store.write_bool(INITIALIZED_KEY, true).await.unwrap();
    rig.store.commit().await.unwrap();
    rig.dome.restore().await.unwrap();
    rig
}
