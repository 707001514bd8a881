//! Shutter motion: open/close relay actuation bounded by the two limit
//! switches, the stall watchdog and the persisted hardware alert.
//!
//! ```text
//!            drive(Open)                  limit switch + hold
//! Idle ──────────────────▶ Opening ───────────────────────────▶ Idle
//!  │         drive(Close)                 limit switch + hold    ▲
//!  └─────────────────────▶ Closing ──────────────────────────────┘
//! ```
//!
//! A motion that outlives the stall timeout is cut by the watchdog and
//! raises the hardware alert, which blocks further open/close requests
//! until an operator resets it.

use std::fmt;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::Result;
use tokio::time::{sleep, Instant};
use tracing::{debug, error, info, warn};

use observatory_common::board::{RelayBank, SensorBank};
use observatory_common::events::{EventKind, EventLog};
use observatory_common::lock::{UnitGuard, UnitLock};
use observatory_common::store::{self, Store};
use observatory_common::ControlError;

use crate::config::{MotionConfig, Roles};
use crate::state::{EmergencyProcedure, InputStatus, RelayStatus, ShutterState, ShutterStatus};

pub const KEY_ALERT: &str = "shutter.alert";
pub const KEY_ALERT_DESCRIPTION: &str = "shutter.alert_description";

pub const STALL_DESCRIPTION: &str = "the shutter did not stop within the maximum time";

// ---------------------------------------------------------------------------
// Travel
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Travel {
    Open,
    Close,
}

impl Travel {
    /// What the alert says when the far limit switch never released.
    fn stuck_description(self) -> &'static str {
        match self {
            Travel::Open => {
                "the closing limit switch sensor did not toggle in time during the opening procedure"
            }
            Travel::Close => {
                "the opening limit switch sensor did not toggle in time during the closing procedure"
            }
        }
    }
}

impl fmt::Display for Travel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Travel::Open => "open",
            Travel::Close => "close",
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TravelOutcome {
    /// The far limit switch released; the motor is running.
    Underway,
    /// The switch went to MANUAL before the far switch released.
    ModeSwitched,
    /// The far switch never released. The watchdog fires on its next check.
    SensorStuck,
}

// ---------------------------------------------------------------------------
// Hardware roles
// ---------------------------------------------------------------------------

pub struct ShutterIo {
    relays: Arc<dyn RelayBank>,
    inputs: Arc<dyn SensorBank>,
    roles: Roles,
}

impl ShutterIo {
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

    pub fn closed(&self) -> bool {
        self.inputs.input(self.roles.closed_input)
    }

    pub fn opened(&self) -> bool {
        self.inputs.input(self.roles.opened_input)
    }

    pub fn opening(&self) -> bool {
        self.relays.relay(self.roles.opening_relay)
    }

    pub fn closing(&self) -> bool {
        self.relays.relay(self.roles.closing_relay)
    }

    pub fn moving(&self) -> bool {
        self.opening() || self.closing()
    }

    pub fn status(&self) -> ShutterStatus {
        if self.opening() {
            ShutterStatus::Opening
        } else if self.closing() {
            ShutterStatus::Closing
        } else if self.opened() {
            ShutterStatus::Opened
        } else if self.closed() {
            ShutterStatus::Closed
        } else {
            ShutterStatus::PartiallyOpened
        }
    }

    /// Limit switch that must release once `travel` gets going.
    fn departure_sensor(&self, travel: Travel) -> bool {
        match travel {
            Travel::Open => self.closed(),
            Travel::Close => self.opened(),
        }
    }

    /// Opposite relay is always released first.
    fn energize(&self, travel: Travel) {
        let (on, off) = match travel {
            Travel::Open => (self.roles.opening_relay, self.roles.closing_relay),
            Travel::Close => (self.roles.closing_relay, self.roles.opening_relay),
        };
        self.relays.set_relay(off, false);
        self.relays.set_relay(on, true);
    }

    fn all_off(&self) {
        self.relays.all_off();
    }

    pub fn relay_status(&self) -> RelayStatus {
        RelayStatus {
            opening_motor: self.opening(),
            closing_motor: self.closing(),
        }
    }

    pub fn input_status(&self) -> InputStatus {
        InputStatus {
            auto: self.auto(),
            closed_sensor: self.closed(),
            opened_sensor: self.opened(),
        }
    }
}

// ---------------------------------------------------------------------------
// Motion clock
// ---------------------------------------------------------------------------

/// Start of the current motion as seen by the watchdog. Back-dating adds
/// credit instead of moving the instant, so it can never underflow.
#[derive(Debug)]
struct MotionClock {
    started: Instant,
    credit: Duration,
}

impl MotionClock {
    fn new() -> Self {
        Self {
            started: Instant::now(),
            credit: Duration::ZERO,
        }
    }

    fn start(&mut self) {
        self.started = Instant::now();
        self.credit = Duration::ZERO;
    }

    fn back_date(&mut self, by: Duration) {
        self.credit += by;
    }

    fn elapsed(&self) -> Duration {
        self.started.elapsed() + self.credit
    }
}

// ---------------------------------------------------------------------------
// Shutter
// ---------------------------------------------------------------------------

pub struct Shutter {
    pub(crate) io: ShutterIo,
    pub(crate) events: EventLog,
    pub(crate) started_at: std::time::Instant,
    store: Arc<dyn Store>,
    lock: UnitLock,
    cfg: MotionConfig,
    state: Mutex<ShutterState>,
    clock: Mutex<MotionClock>,
}

impl Shutter {
    pub fn new(io: ShutterIo, store: Arc<dyn Store>, cfg: MotionConfig) -> Self {
        Self {
            io,
            events: EventLog::new(),
            started_at: std::time::Instant::now(),
            store,
            lock: UnitLock::new(),
            cfg,
            state: Mutex::new(ShutterState::default()),
            clock: Mutex::new(MotionClock::new()),
        }
    }

    pub fn lock(&self) -> &UnitLock {
        &self.lock
    }

    pub fn events(&self) -> &EventLog {
        &self.events
    }

    pub fn io(&self) -> &ShutterIo {
        &self.io
    }

    pub fn store(&self) -> &Arc<dyn Store> {
        &self.store
    }

    // ── Startup ─────────────────────────────────────────────────────

    /// Load the hardware alert, writing defaults on first start.
    pub async fn restore(&self) -> Result<()> {
        store::initialise(
            &*self.store,
            &[
                (KEY_ALERT, false.to_string()),
                (KEY_ALERT_DESCRIPTION, String::new()),
            ],
        )
        .await?;

        let alert = self.store.read_bool(KEY_ALERT).await?.unwrap_or(false);
        let description = self
            .store
            .read_string(KEY_ALERT_DESCRIPTION)
            .await?
            .unwrap_or_default();
        let auto = self.io.auto();

        self.with_state(|st| {
            st.hardware_alert = alert;
            st.alert_description = description.clone();
            st.emergency = if auto {
                EmergencyProcedure::NotNeeded
            } else {
                EmergencyProcedure::Disabled
            };
        });
        if alert {
            warn!(description = %description, "shutter: restored in hardware alert");
        }
        info!(alert, "shutter: state restored");
        self.events
            .record(EventKind::System, format!("restored, hardware alert {alert}"));
        Ok(())
    }

    // ── State access ────────────────────────────────────────────────

    pub(crate) fn with_state<R>(&self, f: impl FnOnce(&mut ShutterState) -> R) -> R {
        let mut st = self.state.lock().unwrap_or_else(|p| p.into_inner());
        f(&mut st)
    }

    pub fn snapshot(&self) -> ShutterState {
        self.with_state(|st| st.clone())
    }

    pub fn hardware_alert(&self) -> bool {
        self.with_state(|st| st.hardware_alert)
    }

    pub fn movement_locked(&self) -> bool {
        self.with_state(|st| st.lock_movement)
    }

    pub fn set_lock_movement(&self, locked: bool) {
        self.with_state(|st| st.lock_movement = locked);
        info!(locked, "shutter: movement lock changed");
        self.events
            .record(EventKind::System, format!("movement lock {locked}"));
    }

    fn with_clock<R>(&self, f: impl FnOnce(&mut MotionClock) -> R) -> R {
        let mut clock = self.clock.lock().unwrap_or_else(|p| p.into_inner());
        f(&mut clock)
    }

    // ── Requests ────────────────────────────────────────────────────

    /// Gate for an open/close request. `Ok(false)` means the shutter is
    /// already there or heading there.
    pub fn check_request(&self, travel: Travel) -> Result<bool, ControlError> {
        let st = self.snapshot();
        if st.hardware_alert {
            return Err(ControlError::HardwareAlert);
        }
        if st.network_alert {
            return Err(ControlError::NetworkAlert);
        }
        if !self.io.auto() {
            return Err(ControlError::ManualMode);
        }
        if travel == Travel::Open && st.lock_movement {
            return Err(ControlError::MovementLocked);
        }
        let there = match (travel, self.io.status()) {
            (Travel::Open, ShutterStatus::Opened | ShutterStatus::Opening) => true,
            (Travel::Close, ShutterStatus::Closed | ShutterStatus::Closing) => true,
            _ => false,
        };
        Ok(!there)
    }

    // ── Relay level ─────────────────────────────────────────────────

    /// Start `travel` and hold the lock until the far limit switch releases,
    /// so the control loop cannot mistake it for an arrival.
    pub async fn drive(&self, _guard: &UnitGuard, travel: Travel) -> TravelOutcome {
        if self.io.moving() {
            info!("move: shutter moving, stopping first");
            self.io.all_off();
            sleep(Duration::from_millis(self.cfg.settle_ms)).await;
        }
        self.with_clock(MotionClock::start);
        info!(%travel, "move: start motion");
        self.io.energize(travel);
        self.events
            .record(EventKind::Motion, format!("start {travel}"));

        let poll = Duration::from_millis(self.cfg.poll_ms);
        let toggle = Duration::from_millis(self.cfg.toggle_timeout_ms);
        let t = Instant::now();
        while self.io.departure_sensor(travel) {
            if !self.io.auto() {
                debug!("move: manual mode while leaving the limit switch");
                return TravelOutcome::ModeSwitched;
            }
            sleep(poll).await;
            if t.elapsed() > toggle {
                let description = travel.stuck_description();
                error!(%travel, "move: {description}");
                self.note_alert_cause(description).await;
                self.with_clock(|c| c.back_date(Duration::from_millis(self.cfg.stall_timeout_ms)));
                return TravelOutcome::SensorStuck;
            }
        }
        TravelOutcome::Underway
    }

    /// Cut everything, no questions asked.
    pub fn force_stop(&self, _guard: &UnitGuard) {
        self.io.all_off();
        debug!("move: all relays off");
    }

    // ── Control-loop checks ─────────────────────────────────────────

    /// Stall watchdog. Returns true when it cut a motion.
    pub async fn watchdog(&self, guard: &UnitGuard) -> bool {
        let stall = Duration::from_millis(self.cfg.stall_timeout_ms);
        if !self.io.moving() || self.with_clock(|c| c.elapsed()) <= stall {
            return false;
        }
        self.force_stop(guard);
        self.raise_alert(STALL_DESCRIPTION).await;
        true
    }

    /// Limit switch reached: keep the motor on for the last of the travel,
    /// then stop. Returns true when it stopped a motion.
    pub async fn finish_travel(&self, guard: &UnitGuard) -> bool {
        if !self.io.moving() || !(self.io.closed() || self.io.opened()) {
            return false;
        }
        info!("loop: stopping shutter");
        let poll = Duration::from_millis(self.cfg.poll_ms);
        let hold = Duration::from_millis(self.cfg.limit_hold_ms);
        let t = Instant::now();
        while self.io.auto() && t.elapsed() < hold {
            sleep(poll).await;
        }
        self.force_stop(guard);
        let status = self.io.status();
        info!(?status, "loop: shutter stopped");
        self.events
            .record(EventKind::Motion, format!("stopped, {status:?}"));
        true
    }

    // ── Hardware alert ──────────────────────────────────────────────

    /// Record why the alert is (about to be) raised. The first cause wins.
    async fn note_alert_cause(&self, description: &str) -> bool {
        let noted = self.with_state(|st| {
            if st.alert_description.is_empty() {
                st.alert_description = description.to_string();
                true
            } else {
                false
            }
        });
        if noted {
            self.persist_alert().await;
        }
        noted
    }

    pub async fn raise_alert(&self, description: &str) {
        self.with_state(|st| st.hardware_alert = true);
        if !self.note_alert_cause(description).await {
            self.persist_alert().await;
        }
        let cause = self.with_state(|st| st.alert_description.clone());
        error!(cause = %cause, "shutter: hardware alert");
        self.events
            .record(EventKind::Alert, format!("hardware alert: {cause}"));
    }

    pub async fn reset_alert(&self, _guard: &UnitGuard) {
        self.with_state(|st| {
            st.hardware_alert = false;
            st.alert_description.clear();
        });
        self.persist_alert().await;
        info!("shutter: hardware alert reset");
        self.events.record(EventKind::Alert, "hardware alert reset");
    }

    async fn persist_alert(&self) {
        let (alert, description) =
            self.with_state(|st| (st.hardware_alert, st.alert_description.clone()));
        let res = async {
            self.store.write_bool(KEY_ALERT, alert).await?;
            self.store
                .write_string(KEY_ALERT_DESCRIPTION, &description)
                .await?;
            self.store.commit().await
        }
        .await;
        if let Err(e) = res {
            error!(alert, "shutter: failed to persist alert: {e:#}");
            self.events
                .record(EventKind::Error, format!("persist alert failed: {e}"));
        }
    }

    // ── Emergency ───────────────────────────────────────────────────

    /// Forced close for the no-network procedure. Waits for the lock
    /// however long it takes.
    pub async fn emergency_close(&self) -> TravelOutcome {
        let guard = self.lock.acquire_blocking().await;
        warn!("shutter: emergency close");
        self.events.record(EventKind::Network, "emergency close");
        self.drive(&guard, Travel::Close).await
    }
}

// ===========================================================================
// Tests
// ===========================================================================
