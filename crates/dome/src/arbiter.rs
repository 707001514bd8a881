//! The dome control loop. Each cycle takes the unit lock with a short wait
//! and runs either the AUTO branch (slew tracking, homing, site handover)
//! or the MANUAL branch (residual motion stop, park re-derivation, panel
//! buttons). A busy lock skips the cycle.

use std::sync::Arc;
use std::time::Duration;

use tokio::time::{interval, sleep, Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

use observatory_common::events::EventKind;
use observatory_common::lock::UnitGuard;

use crate::config::ControlConfig;
use crate::motion::{arc_distance, Button, Direction, Dome, ZeroOutcome};
use crate::site::SiteHooks;

pub struct ControlLoop {
    dome: Arc<Dome>,
    hooks: Arc<dyn SiteHooks>,
    cfg: ControlConfig,
    /// Whether the site last acknowledged automatic mode. Starts opposite
    /// to the switch so the first cycle always reconciles.
    site_auto: bool,
}

impl ControlLoop {
    pub fn new(dome: Arc<Dome>, hooks: Arc<dyn SiteHooks>, cfg: ControlConfig) -> Self {
        let site_auto = !dome.io().auto();
        Self {
            dome,
            hooks,
            cfg,
            site_auto,
        }
    }

    fn ms(v: u64) -> Duration {
        Duration::from_millis(v)
    }

    pub async fn run(mut self) {
        info!(period_ms = self.cfg.loop_period_ms, "loop: control loop started");
        let mut ticker = interval(Self::ms(self.cfg.loop_period_ms));
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            self.tick().await;
        }
    }

    /// One control cycle. Returns false when the lock was busy.
    pub async fn tick(&mut self) -> bool {
        let guard = match self.dome.lock().acquire(Self::ms(self.cfg.loop_lock_ms)).await {
            Ok(g) => g,
            Err(_) => {
                debug!("loop: unit lock busy, skipping cycle");
                return false;
            }
        };

        let guard = if self.dome.io().auto() {
            self.auto_cycle(guard).await
        } else {
            self.manual_cycle(&guard).await;
            guard
        };

        self.watch_switchboard(&guard).await;
        true
    }

    // ── AUTO ────────────────────────────────────────────────────────

    async fn auto_cycle(&mut self, guard: UnitGuard) -> UnitGuard {
        if !self.site_auto {
            self.site_auto = self.hooks.manual_to_auto().await;
            if self.site_auto {
                self.dome
                    .events()
                    .record(EventKind::Mode, "site switched to automatic");
            }
        }

        if self.dome.io().moving() {
            debug!("loop: update dome position");
            self.dome.track(&guard).await;
            return guard;
        }
        if !self.dome.finding_zero() {
            return guard;
        }

        info!("loop: finding zero");
        self.dome.prepare_find_zero(&guard).await;
        drop(guard);
        match self.dome.find_zero().await {
            Ok(ZeroOutcome::Found(az)) => debug!(az, "loop: zero found"),
            Ok(outcome) => debug!(?outcome, "loop: find-zero ended"),
            Err(e) => {
                warn!("loop: find-zero failed: {e}");
                self.dome
                    .events()
                    .record(EventKind::Error, format!("find zero: {e}"));
            }
        }
        self.dome.lock().acquire_blocking().await
    }

    // ── MANUAL ──────────────────────────────────────────────────────

    async fn manual_cycle(&mut self, guard: &UnitGuard) {
        if self.site_auto {
            self.site_auto = !self.hooks.auto_to_manual().await;
            if !self.site_auto {
                self.dome
                    .events()
                    .record(EventKind::Mode, "site switched to manual");
            }
        }

        if self.dome.io().moving() {
            info!("loop: dome moving in manual mode, turning off relays");
            self.dome.stop_slewing(guard).await;
        }

        self.reconcile_park(guard).await;
        if self.dome.finding_park() || self.dome.finding_zero() {
            info!("loop: manual mode, clearing park and zero intents");
            self.dome.clear_intents();
        }

        let switchboard = self.dome.io().switchboard_on();
        let hold = Self::ms(self.cfg.rotation_hold_ms);
        if switchboard && self.button_pressed(Button::ManualCw, hold).await {
            self.rotate(guard, Direction::Cw, Button::ManualCw).await;
        } else if switchboard && self.button_pressed(Button::ManualCcw, hold).await {
            self.rotate(guard, Direction::Ccw, Button::ManualCcw).await;
        } else if !switchboard
            && self
                .button_pressed(Button::Ignition, Self::ms(self.cfg.ignition_hold_ms))
                .await
        {
            info!("loop: ignite switchboard");
            self.dome.ignite_switchboard(guard).await;
        }
    }

    /// In MANUAL the park flag follows the position, not a command.
    async fn reconcile_park(&self, guard: &UnitGuard) {
        let cfg = self.dome.motion_config();
        let near = arc_distance(self.dome.current_az(), cfg.park_azimuth)
            <= cfg.manual_park_tolerance;
        if near != self.dome.parked() {
            info!(park = near, "loop: park flag re-derived in manual mode");
            self.dome.set_park(guard, near).await;
        }
    }

    /// Drive while the button stays held and the switchboard stays on.
    async fn rotate(&self, guard: &UnitGuard, dir: Direction, button: Button) {
        info!(direction = %dir, "loop: start manual motion");
        self.dome.start_motion(guard, dir).await;
        loop {
            sleep(Self::ms(self.cfg.loop_period_ms)).await;
            self.dome.refresh_position().await;
            if !(self.dome.io().pressed(button) && self.dome.io().switchboard_on()) {
                break;
            }
        }
        self.dome.stop_slewing(guard).await;
        info!(direction = %dir, "loop: end manual motion");
    }

    /// Short press, then a hold of `hold` while the siren sounds. The siren
    /// needs the bus; without it the press is not confirmed.
    async fn button_pressed(&self, button: Button, hold: Duration) -> bool {
        let io = self.dome.io();
        if !io.pressed(button) {
            return false;
        }
        let poll = Self::ms(self.cfg.button_poll_ms);
        debug!(?button, "panel: button pressed");
        let short_end = Instant::now() + Self::ms(self.cfg.short_press_ms);
        while io.pressed(button) && Instant::now() < short_end {
            sleep(poll).await;
        }

        if io.pressed(button) {
            debug!(?button, "panel: long press detected");
            match self.dome.encoder().session().await {
                Err(e) => warn!(?button, "panel: siren unavailable: {e}"),
                Ok(mut bus) => {
                    bus.start_siren();
                    let deadline = Instant::now() + hold;
                    let mut completed = false;
                    while io.pressed(button) {
                        sleep(poll).await;
                        if Instant::now() > deadline {
                            completed = true;
                            break;
                        }
                    }
                    drop(bus);
                    self.dome.encoder().stop_siren().await;
                    if completed {
                        info!(?button, "panel: press confirmed");
                        return true;
                    }
                }
            }
        }
        debug!(?button, "panel: button released before completion");
        false
    }

    async fn watch_switchboard(&self, guard: &UnitGuard) {
        if self.dome.switchboard_ignited() && !self.dome.io().switchboard_on() {
            warn!("loop: switchboard off, shutting down");
            self.dome.shut_down(guard).await;
            self.dome.set_switchboard_ignited(false);
        }
    }
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::motion::{Movement, KEY_PARK};
    use crate::site::tests::RecordingHooks;
    use crate::testkit::{rig, Rig};
    use observatory_common::board::RelayBank;
    use std::sync::atomic::Ordering;

    fn control(r: &Rig) -> (ControlLoop, Arc<RecordingHooks>) {
        let hooks = Arc::new(RecordingHooks::default());
        let cl = ControlLoop::new(r.dome.clone(), hooks.clone(), ControlConfig::default());
        (cl, hooks)
    }

    // -- AUTO ---------------------------------------------------------------

    #[tokio::test(start_paused = true)]
    async fn slew_stops_on_arrival() {
        let r = rig(0).await;
        let (mut cl, _) = control(&r);
        {
            let g = r.dome.lock().acquire_blocking().await;
            r.dome.start_slewing(&g, 10).await;
        }
        for _ in 0..20 {
            cl.tick().await;
        }
        assert_eq!(r.dome.io().movement(), Movement::Idle);
        assert!(arc_distance(r.dome.current_az(), 10) < 2);
        assert_eq!(r.dome.target_az(), r.dome.current_az());
    }

    #[tokio::test(start_paused = true)]
    async fn busy_lock_skips_cycle() {
        let r = rig(0).await;
        let (mut cl, hooks) = control(&r);
        let _held = r.dome.lock().acquire_blocking().await;
        assert!(!cl.tick().await);
        assert_eq!(hooks.to_auto.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn loop_runs_requested_find_zero() {
        let r = rig(10).await;
        let (mut cl, _) = control(&r);
        r.dome.request_zero();
        assert!(cl.tick().await);
        assert!(!r.dome.finding_zero());
        assert_eq!(r.dome.current_az(), 248);
        assert!(!r.dome.lock().is_held());
    }

    #[tokio::test(start_paused = true)]
    async fn site_told_about_auto_until_it_succeeds() {
        let r = rig(0).await;
        let (mut cl, hooks) = control(&r);
        hooks.fail.store(true, Ordering::SeqCst);
        cl.tick().await;
        cl.tick().await;
        hooks.fail.store(false, Ordering::SeqCst);
        cl.tick().await;
        cl.tick().await;
        assert_eq!(hooks.to_auto.load(Ordering::SeqCst), 3);
    }

    // -- MANUAL -------------------------------------------------------------

    #[tokio::test(start_paused = true)]
    async fn entering_manual_reconciles_site_once() {
        let r = rig(0).await;
        let (mut cl, hooks) = control(&r);
        cl.tick().await;
        r.board.set_input(r.roles.auto_input, false);
        cl.tick().await;
        cl.tick().await;
        assert_eq!(hooks.to_manual.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn manual_park_detection_persists_once() {
        let r = rig(88).await;
        let (mut cl, _) = control(&r);
        r.board.set_input(r.roles.auto_input, false);
        for _ in 0..5 {
            cl.tick().await;
        }
        assert!(r.dome.parked());
        assert_eq!(r.store.writes(KEY_PARK), 1);

        r.dome.with_state(|st| st.current_az = 120);
        for _ in 0..5 {
            cl.tick().await;
        }
        assert!(!r.dome.parked());
        assert_eq!(r.store.writes(KEY_PARK), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn residual_motion_stopped_in_manual() {
        let r = rig(0).await;
        let (mut cl, _) = control(&r);
        r.board.set_input(r.roles.auto_input, false);
        r.board.set_relay(r.roles.ccw_relay, true);
        cl.tick().await;
        assert_eq!(r.dome.io().movement(), Movement::Idle);
    }

    #[tokio::test(start_paused = true)]
    async fn manual_mode_clears_intents() {
        let r = rig(0).await;
        let (mut cl, _) = control(&r);
        r.dome.request_zero();
        r.board.set_input(r.roles.auto_input, false);
        cl.tick().await;
        assert!(!r.dome.finding_zero());
    }

    #[tokio::test(start_paused = true)]
    async fn held_cw_button_rotates_until_released() {
        let r = rig(0).await;
        let (mut cl, _) = control(&r);
        r.board.set_input(r.roles.auto_input, false);
        let held = vec![true; 60];
        r.board.script_input(r.roles.manual_cw_input, &held);
        r.board.script_input(r.roles.manual_cw_input, &[false]);
        cl.tick().await;
        assert_eq!(r.dome.io().movement(), Movement::Idle);
        assert!(r.dome.current_az() > 0);
        assert!(!r.sim.siren());
        assert_eq!(r.board.overlaps(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn short_tap_is_not_a_press() {
        let r = rig(0).await;
        let (mut cl, _) = control(&r);
        r.board.set_input(r.roles.auto_input, false);
        r.board.script_input(r.roles.manual_cw_input, &[true, true, false]);
        cl.tick().await;
        assert_eq!(r.dome.current_az(), 0);
        assert_eq!(r.dome.io().movement(), Movement::Idle);
    }

    #[tokio::test(start_paused = true)]
    async fn ignition_button_with_switchboard_off() {
        let r = rig(0).await;
        let (mut cl, _) = control(&r);
        r.board.set_input(r.roles.auto_input, false);
        r.board.set_input(r.roles.switchboard_status_input, false);
        r.board.set_input(r.roles.manual_ignition_input, true);
        let ticking = tokio::spawn(async move {
            cl.tick().await;
            cl
        });
        // The pulse brings the switchboard up while the relay is still on.
        sleep(Duration::from_millis(3500)).await;
        r.board.set_input(r.roles.manual_ignition_input, false);
        r.board.set_input(r.roles.switchboard_status_input, true);
        ticking.await.unwrap();
        assert!(r.dome.switchboard_ignited());
    }

    // -- Switchboard watch --------------------------------------------------

    #[tokio::test(start_paused = true)]
    async fn switchboard_drop_shuts_down() {
        let r = rig(0).await;
        let (mut cl, _) = control(&r);
        {
            let g = r.dome.lock().acquire_blocking().await;
            r.dome.start_slewing(&g, 100).await;
        }
        assert!(r.dome.switchboard_ignited());
        r.board.set_input(r.roles.switchboard_status_input, false);
        cl.tick().await;
        assert!(!r.dome.io().moving());
        assert!(!r.dome.switchboard_ignited());
    }
}
