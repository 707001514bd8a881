//! Simulated shutter mechanics for running without hardware: the leaves
//! travel while a motor relay is energized and the limit switches follow.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::time::{interval, MissedTickBehavior};
use tracing::debug;

use observatory_common::board::{MockBoard, RelayBank};

use crate::config::Roles;

/// Board in AUTO with the shutter resting closed.
pub fn demo_board(roles: &Roles, relays: usize, inputs: usize) -> Arc<MockBoard> {
    let board = Arc::new(MockBoard::new(relays, inputs));
    board.watch_pair(roles.opening_relay, roles.closing_relay);
    board.set_input(roles.auto_input, true);
    board.set_input(roles.closed_input, true);
    board
}

pub struct ShutterSim {
    board: Arc<MockBoard>,
    roles: Roles,
    /// Ticks of travel from fully closed (0) to fully opened (`full`).
    position: Mutex<u32>,
    full: u32,
}

impl ShutterSim {
    pub fn new(board: Arc<MockBoard>, roles: &Roles, full: u32) -> Self {
        Self {
            board,
            roles: roles.clone(),
            position: Mutex::new(0),
            full: full.max(1),
        }
    }

    pub fn position(&self) -> u32 {
        *self.position.lock().unwrap_or_else(|p| p.into_inner())
    }

    /// Advance one tick and update the limit switches.
    pub fn step(&self) {
        let opening = self.board.relay(self.roles.opening_relay);
        let closing = self.board.relay(self.roles.closing_relay);
        let mut pos = self.position.lock().unwrap_or_else(|p| p.into_inner());
        let before = *pos;
        match (opening, closing) {
            (true, false) => *pos = (*pos + 1).min(self.full),
            (false, true) => *pos = pos.saturating_sub(1),
            _ => {}
        }
        if *pos != before {
            debug!(position = *pos, "sim: shutter moved");
        }
        self.board.set_input(self.roles.closed_input, *pos == 0);
        self.board.set_input(self.roles.opened_input, *pos == self.full);
    }

    pub async fn run(self: Arc<Self>, period: Duration) {
        let mut ticker = interval(period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            self.step();
        }
    }
}

// ===========================================================================
// Tests
// ===========================================================================
