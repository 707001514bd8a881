//! Dome motion: relay-level CW/CCW actuation, slewing, parking, find-zero
//! homing and position persistence.
//!
//! ```text
//!          start_motion(CW)            start_motion(CCW)
//! Idle ───────────────────▶ MovingCW ◀──────────────────▶ MovingCCW
//!  ▲                           │   (AUTO: stop, settle, reverse)  │
//!  └──────── stop_motion ──────┴──────────────────────────────────┘
//! ```
//!
//! Every relay change happens with the unit lock held (callers pass the
//! guard), except the find-zero sweep which releases the unit lock so an
//! abort can cancel it; it holds the bus lock instead.

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use anyhow::Result;
use tokio::time::sleep;
use tracing::{debug, error, info, warn};

use observatory_common::board::{RelayBank, SensorBank};
use observatory_common::events::{EventKind, EventLog};
use observatory_common::lock::{UnitGuard, UnitLock};
use observatory_common::store::{self, Store};
use observatory_common::ControlError;

use crate::config::{MotionConfig, Roles};
use crate::encoder::{decode_zero, Encoder};
use crate::state::{DomeState, InputStatus, RelayStatus};

pub const KEY_POSITION: &str = "dome.position";
pub const KEY_PARK: &str = "dome.park";

// ---------------------------------------------------------------------------
// Direction
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Cw,
    Ccw,
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Direction::Cw => "CW",
            Direction::Ccw => "CCW",
        })
    }
}

/// Shortest-arc direction from `current` to `target`. At exactly 180° the
/// tie goes CW when `target > current` and CCW otherwise.
pub fn direction_for(current: i32, target: i32) -> Direction {
    let delta = (current - target).abs();
    if (target < current) == (delta > 180) {
        Direction::Cw
    } else {
        Direction::Ccw
    }
}

/// Angular distance along the shorter arc, in [0, 180].
pub fn arc_distance(a: i32, b: i32) -> i32 {
    let delta = (a - b).rem_euclid(360);
    delta.min(360 - delta)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Movement {
    Idle,
    Cw,
    Ccw,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SlewOutcome {
    /// Refused by the guard conditions (mode, switchboard, homing, same target).
    Ignored,
    /// Already moving the right way; relays untouched.
    Underway(Direction),
    Started(Direction),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ZeroOutcome {
    Found(i32),
    Aborted,
    ModeSwitched,
}

// ---------------------------------------------------------------------------
// Hardware roles
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Button {
    ManualCw,
    ManualCcw,
    Ignition,
}

/// Relays and inputs addressed by what they do.
pub struct DomeIo {
    relays: Arc<dyn RelayBank>,
    inputs: Arc<dyn SensorBank>,
    roles: Roles,
}

impl DomeIo {
    pub fn new(relays: Arc<dyn RelayBank>, inputs: Arc<dyn SensorBank>, roles: Roles) -> Self {
        Self {
            relays,
            inputs,
            roles,
        }
    }

    pub fn auto(&self) -> bool {
        self.inputs.input(self.roles.auto_input)
    }

    pub fn switchboard_on(&self) -> bool {
        self.inputs.input(self.roles.switchboard_status_input)
    }

    pub fn ac_present(&self) -> bool {
        self.inputs.input(self.roles.ac_presence_input)
    }

    pub fn pressed(&self, button: Button) -> bool {
        let id = match button {
            Button::ManualCw => self.roles.manual_cw_input,
            Button::ManualCcw => self.roles.manual_ccw_input,
            Button::Ignition => self.roles.manual_ignition_input,
        };
        self.inputs.input(id)
    }

    pub fn movement(&self) -> Movement {
        match (
            self.relays.relay(self.roles.cw_relay),
            self.relays.relay(self.roles.ccw_relay),
        ) {
            (true, _) => Movement::Cw,
            (false, true) => Movement::Ccw,
            (false, false) => Movement::Idle,
        }
    }

    pub fn moving(&self) -> bool {
        self.movement() != Movement::Idle
    }

    /// Opposite relay is always released first.
    fn energize(&self, dir: Direction) {
        let (on, off) = match dir {
            Direction::Cw => (self.roles.cw_relay, self.roles.ccw_relay),
            Direction::Ccw => (self.roles.ccw_relay, self.roles.cw_relay),
        };
        self.relays.set_relay(off, false);
        self.relays.set_relay(on, true);
    }

    fn release_motors(&self) {
        self.relays.set_relay(self.roles.ccw_relay, false);
        self.relays.set_relay(self.roles.cw_relay, false);
    }

    fn all_off(&self) {
        self.relays.all_off();
    }

    fn set_switchboard_relay(&self, on: bool) {
        self.relays.set_relay(self.roles.switchboard_relay, on);
    }

    pub fn relay_status(&self) -> RelayStatus {
        RelayStatus {
            cw_motor: self.relays.relay(self.roles.cw_relay),
            ccw_motor: self.relays.relay(self.roles.ccw_relay),
            switchboard: self.relays.relay(self.roles.switchboard_relay),
        }
    }

    pub fn input_status(&self) -> InputStatus {
        InputStatus {
            auto: self.auto(),
            switchboard_status: self.switchboard_on(),
            ac_presence: self.ac_present(),
            manual_cw_button: self.pressed(Button::ManualCw),
            manual_ccw_button: self.pressed(Button::ManualCcw),
            manual_ignition: self.pressed(Button::Ignition),
        }
    }
}

// ---------------------------------------------------------------------------
// Dome
// ---------------------------------------------------------------------------

pub struct Dome {
    pub(crate) io: DomeIo,
    pub(crate) encoder: Encoder,
    pub(crate) events: EventLog,
    pub(crate) started_at: Instant,
    store: Arc<dyn Store>,
    lock: UnitLock,
    cfg: MotionConfig,
    state: Mutex<DomeState>,
    finding_zero: AtomicBool,
    finding_park: AtomicBool,
}

impl Dome {
    pub fn new(io: DomeIo, encoder: Encoder, store: Arc<dyn Store>, cfg: MotionConfig) -> Self {
        Self {
            io,
            encoder,
            events: EventLog::new(),
            started_at: Instant::now(),
            store,
            lock: UnitLock::new(),
            cfg,
            state: Mutex::new(DomeState {
                target_az: -1,
                ..DomeState::default()
            }),
            finding_zero: AtomicBool::new(false),
            finding_park: AtomicBool::new(false),
        }
    }

    pub fn lock(&self) -> &UnitLock {
        &self.lock
    }

    pub fn events(&self) -> &EventLog {
        &self.events
    }

    pub fn io(&self) -> &DomeIo {
        &self.io
    }

    pub fn encoder(&self) -> &Encoder {
        &self.encoder
    }

    pub fn store(&self) -> &Arc<dyn Store> {
        &self.store
    }

    pub fn motion_config(&self) -> &MotionConfig {
        &self.cfg
    }

    // ── Startup ─────────────────────────────────────────────────────

    /// Load position and park flag, writing defaults on first start.
    pub async fn restore(&self) -> Result<()> {
        store::initialise(
            &*self.store,
            &[
                (KEY_POSITION, self.cfg.park_azimuth.to_string()),
                (KEY_PARK, false.to_string()),
            ],
        )
        .await?;

        let position = self
            .store
            .read_int(KEY_POSITION)
            .await?
            .and_then(|v| i32::try_from(v).ok())
            .filter(|az| (0..360).contains(az))
            .unwrap_or(self.cfg.park_azimuth);
        let park = self.store.read_bool(KEY_PARK).await?.unwrap_or(false);
        let ignited = self.io.switchboard_on();

        self.with_state(|st| {
            st.current_az = position;
            st.target_az = position;
            st.park = park;
            st.switchboard_ignited = ignited;
        });
        info!(az = position, park, ignited, "dome: state restored");
        self.events
            .record(EventKind::System, format!("restored at {position}°, park {park}"));
        Ok(())
    }

    /// Push the stored azimuth into the encoder, retrying until accepted.
    pub async fn sync_encoder(&self, retry: Duration) {
        let az = self.current_az();
        while let Err(e) = self.encoder.write_position(az).await {
            warn!(az, "dome: encoder position sync failed: {e}");
            sleep(retry).await;
        }
    }

    // ── State access ────────────────────────────────────────────────

    pub(crate) fn with_state<R>(&self, f: impl FnOnce(&mut DomeState) -> R) -> R {
        let mut st = self.state.lock().unwrap_or_else(|p| p.into_inner());
        f(&mut st)
    }

    pub fn snapshot(&self) -> DomeState {
        self.with_state(|st| st.clone())
    }

    pub fn current_az(&self) -> i32 {
        self.with_state(|st| st.current_az)
    }

    pub fn target_az(&self) -> i32 {
        self.with_state(|st| st.target_az)
    }

    pub fn parked(&self) -> bool {
        self.with_state(|st| st.park)
    }

    pub fn finding_zero(&self) -> bool {
        self.finding_zero.load(Ordering::SeqCst)
    }

    pub fn finding_park(&self) -> bool {
        self.finding_park.load(Ordering::SeqCst)
    }

    pub fn request_zero(&self) {
        self.finding_zero.store(true, Ordering::SeqCst);
    }

    pub fn clear_intents(&self) {
        self.finding_zero.store(false, Ordering::SeqCst);
        self.finding_park.store(false, Ordering::SeqCst);
    }

    pub(crate) fn clear_finding_park(&self) {
        self.finding_park.store(false, Ordering::SeqCst);
    }

    pub(crate) fn clear_finding_zero(&self) {
        self.finding_zero.store(false, Ordering::SeqCst);
    }

    // ── Persistence ─────────────────────────────────────────────────

    async fn persist_position(&self, az: i32) {
        if !(0..360).contains(&az) {
            return;
        }
        let res = async {
            self.store.write_int(KEY_POSITION, i64::from(az)).await?;
            self.store.commit().await
        }
        .await;
        if let Err(e) = res {
            error!(az, "dome: failed to persist position: {e:#}");
            self.events
                .record(EventKind::Error, format!("persist position failed: {e}"));
        }
    }

    /// Set the park flag and persist it. No write when unchanged.
    pub(crate) async fn set_park(&self, _guard: &UnitGuard, park: bool) {
        let changed = self.with_state(|st| std::mem::replace(&mut st.park, park) != park);
        if !changed {
            return;
        }
        let res = async {
            self.store.write_bool(KEY_PARK, park).await?;
            self.store.commit().await
        }
        .await;
        if let Err(e) = res {
            error!(park, "dome: failed to persist park flag: {e:#}");
            self.events
                .record(EventKind::Error, format!("persist park failed: {e}"));
        }
        self.events
            .record(EventKind::Motion, format!("park flag {park}"));
    }

    // ── Relay level ─────────────────────────────────────────────────

    pub async fn start_motion(&self, _guard: &UnitGuard, dir: Direction) {
        self.drive(dir).await;
    }

    async fn drive(&self, dir: Direction) {
        if self.io.auto() && self.io.moving() {
            info!("move: dome moving, stopping before reversal");
            self.stop_motion();
            sleep(Duration::from_millis(self.cfg.reversal_settle_ms)).await;
        }
        info!(direction = %dir, "move: start motion");
        self.io.energize(dir);
        self.events
            .record(EventKind::Motion, format!("start {dir} motion"));
    }

    pub fn stop_motion(&self) {
        self.io.release_motors();
        debug!("move: motion stopped");
    }

    // ── Slewing ─────────────────────────────────────────────────────

    pub async fn start_slewing(&self, guard: &UnitGuard, new_target: i32) -> SlewOutcome {
        if !self.io.auto()
            || !self.io.switchboard_on()
            || self.finding_zero()
            || new_target == self.target_az()
        {
            return SlewOutcome::Ignored;
        }

        let target = new_target.rem_euclid(360);
        let current = self.with_state(|st| {
            st.target_az = target;
            st.current_az
        });
        info!(az = target, "slew: start slewing");
        self.set_park(guard, false).await;

        let dir = direction_for(current, target);
        debug!(
            delta = arc_distance(current, target),
            direction = %dir,
            "slew: direction computed"
        );

        let needed = match self.io.movement() {
            Movement::Idle => true,
            Movement::Cw => dir == Direction::Ccw,
            Movement::Ccw => dir == Direction::Cw,
        };
        if needed {
            debug!("slew: start slew needed");
            self.start_motion(guard, dir).await;
            SlewOutcome::Started(dir)
        } else {
            debug!("slew: start slew not needed");
            SlewOutcome::Underway(dir)
        }
    }

    /// Stop, let the dome drift to rest, settle intents and save position.
    pub async fn stop_slewing(&self, guard: &UnitGuard) {
        info!("slew: stop slewing and saving state");
        self.stop_motion();
        sleep(Duration::from_millis(self.cfg.drift_settle_ms)).await;

        if self.io.auto() {
            self.clear_finding_zero();
            if self.finding_park() {
                self.set_park(guard, true).await;
            }
            self.clear_finding_park();
        }

        match self.encoder.request_position().await {
            Ok(az) => {
                self.with_state(|st| {
                    st.current_az = az;
                    st.target_az = az;
                });
                self.persist_position(az).await;
                self.events
                    .record(EventKind::Motion, format!("stopped at {az}°"));
            }
            Err(e) => {
                // Keep the last confirmed azimuth rather than a sentinel.
                warn!("slew: position read after stop failed: {e}");
                self.with_state(|st| st.target_az = st.current_az);
                self.events
                    .record(EventKind::Error, format!("position read after stop: {e}"));
            }
        }
    }

    pub async fn park(&self, guard: &UnitGuard) -> SlewOutcome {
        self.finding_park.store(true, Ordering::SeqCst);
        self.start_slewing(guard, self.cfg.park_azimuth).await
    }

    /// Refresh `current_az` from the encoder. Read failures leave it stale.
    pub async fn refresh_position(&self) -> Option<i32> {
        match self.encoder.request_position().await {
            Ok(az) => {
                self.with_state(|st| st.current_az = az);
                Some(az)
            }
            Err(e) => {
                debug!("dome: position refresh failed: {e}");
                None
            }
        }
    }

    /// One AUTO-cycle step while slewing: stop on arrival.
    pub async fn track(&self, guard: &UnitGuard) {
        let Some(az) = self.refresh_position().await else {
            return;
        };
        if arc_distance(az, self.target_az()) < self.cfg.arrival_tolerance {
            self.stop_slewing(guard).await;
        }
    }

    // ── Find zero ───────────────────────────────────────────────────

    /// Intent bookkeeping before homing, under the unit lock.
    pub async fn prepare_find_zero(&self, guard: &UnitGuard) {
        self.clear_finding_park();
        self.with_state(|st| st.target_az = -1);
        self.set_park(guard, false).await;
    }

    /// Sweep CW until the encoder reports its reference mark. Runs with the
    /// unit lock released; takes it again only to commit the outcome.
    pub async fn find_zero(&self) -> Result<ZeroOutcome, ControlError> {
        info!("zero: start find-zero procedure");
        let frame = {
            let mut bus = self.encoder.session().await?;
            self.drive(Direction::Cw).await;
            let frame = bus
                .request_zero(|| self.finding_zero() && self.io.auto())
                .await;
            self.stop_motion();
            frame
        };

        if !self.io.auto() {
            let _guard = self.lock.acquire_blocking().await;
            self.clear_finding_zero();
            info!("zero: manual mode, aborting");
            return Ok(ZeroOutcome::ModeSwitched);
        }
        if !self.finding_zero() {
            info!("zero: aborted");
            return Ok(ZeroOutcome::Aborted);
        }
        let az = decode_zero(&frame).map_err(|e| {
            warn!("zero: wrong encoder response: {e}");
            e
        })?;

        let _guard = self.lock.acquire_blocking().await;
        self.clear_finding_zero();
        self.with_state(|st| st.current_az = az);
        self.persist_position(az).await;
        info!(az, "zero: found");
        self.events
            .record(EventKind::Motion, format!("zero found at {az}°"));
        Ok(ZeroOutcome::Found(az))
    }

    // ── Power & switchboard ─────────────────────────────────────────

    /// All relays off, wait for drift, save position.
    pub async fn shut_down(&self, _guard: &UnitGuard) {
        info!("dome: shutting down");
        self.io.all_off();
        sleep(Duration::from_millis(self.cfg.drift_settle_ms)).await;
        if let Some(az) = self.refresh_position().await {
            self.persist_position(az).await;
        }
        self.events.record(EventKind::System, "shutdown");
    }

    pub async fn ignite_switchboard(&self, _guard: &UnitGuard) {
        info!("dome: igniting switchboard");
        self.io.set_switchboard_relay(true);
        sleep(Duration::from_millis(self.cfg.switchboard_pulse_ms)).await;
        self.io.set_switchboard_relay(false);
        self.with_state(|st| st.switchboard_ignited = true);
        self.events.record(EventKind::System, "switchboard ignited");
    }

    pub fn switchboard_ignited(&self) -> bool {
        self.with_state(|st| st.switchboard_ignited)
    }

    pub(crate) fn set_switchboard_ignited(&self, ignited: bool) {
        self.with_state(|st| st.switchboard_ignited = ignited);
    }

    pub(crate) fn set_power_alert(&self, alert: bool) {
        self.with_state(|st| st.power_alert = alert);
    }
}

// ===========================================================================
// Tests
// ===========================================================================
