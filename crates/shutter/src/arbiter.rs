//! The shutter control loop. Each cycle takes the unit lock with a short
//! wait; in AUTO it runs the stall watchdog and stops a travel that reached
//! a limit switch, in MANUAL it clears any relay left energized.

use std::sync::Arc;
use std::time::Duration;

use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, info, warn};

use observatory_common::events::EventKind;

use crate::config::ControlConfig;
use crate::motion::Shutter;

pub struct ShutterLoop {
    shutter: Arc<Shutter>,
    cfg: ControlConfig,
}

impl ShutterLoop {
    pub fn new(shutter: Arc<Shutter>, cfg: ControlConfig) -> Self {
        Self { shutter, cfg }
    }

    pub async fn run(self) {
        info!(period_ms = self.cfg.loop_period_ms, "loop: control loop started");
        let mut ticker = interval(Duration::from_millis(self.cfg.loop_period_ms));
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            self.tick().await;
        }
    }

    /// One control cycle. Returns false when the lock was busy.
    pub async fn tick(&self) -> bool {
        let wait = Duration::from_millis(self.cfg.loop_lock_ms);
        let Ok(guard) = self.shutter.lock().acquire(wait).await else {
            debug!("loop: unit lock busy, skipping cycle");
            return false;
        };

        let io = self.shutter.io();
        if io.auto() {
            self.shutter.watchdog(&guard).await;
            self.shutter.finish_travel(&guard).await;
        } else if io.moving() {
            warn!("loop: shutter moving in manual mode, turning off relays");
            self.shutter.force_stop(&guard);
            self.shutter
                .events()
                .record(EventKind::Mode, "relays cleared in manual mode");
        }
        true
    }
}

// ===========================================================================
// Tests
// ===========================================================================
