//! Shared fixture for unit tests: a mock board and an in-memory store wired
//! into a `Shutter`.

use std::sync::Arc;

use observatory_common::board::MockBoard;
use observatory_common::store::MemoryStore;

use crate::config::{MotionConfig, Roles};
use crate::motion::{Shutter, ShutterIo};
use crate::sim::demo_board;

pub struct Rig {
    pub board: Arc<MockBoard>,
    pub store: Arc<MemoryStore>,
    pub shutter: Arc<Shutter>,
    pub roles: Roles,
}

/// Closed shutter in AUTO, not restored.
pub fn rig_unrestored() -> Rig {
    let roles = Roles::default();
    let board = demo_board(&roles, 2, 3);
    let store = Arc::new(MemoryStore::new());
    let io = ShutterIo::new(board.clone(), board.clone(), roles.clone());
    let shutter = Arc::new(Shutter::new(io, store.clone(), MotionConfig::default()));
    Rig {
        board,
        store,
        shutter,
        roles,
    }
}

/// Closed shutter in AUTO with first-start defaults stored.
pub async fn rig() -> Rig {
    let rig = rig_unrestored();
    rig.shutter.restore().await.unwrap();
    rig
}
