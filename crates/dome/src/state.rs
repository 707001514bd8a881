use serde::Serialize;

use observatory_common::events::UnitEvent;

use crate::motion::Dome;

// ---------------------------------------------------------------------------
// Core types
// ---------------------------------------------------------------------------

/// Mutable dome context. Only touched in short critical sections so status
/// snapshots never wait behind a running motion.
#[derive(Debug, Clone, Default)]
pub struct DomeState {
    /// Last azimuth confirmed by the encoder.
    pub current_az: i32,
    /// Slew target; -1 while homing.
    pub target_az: i32,
    pub park: bool,
    pub switchboard_ignited: bool,
    pub power_alert: bool,
}

// ---------------------------------------------------------------------------
// JSON response (what the API returns)
// ---------------------------------------------------------------------------

#[derive(Debug, Serialize)]
#[serde(rename_all = "kebab-case")]
pub struct DomeStatus {
    pub firmware_version: &'static str,
    pub uptime_secs: u64,
    /// -1 while homing, the stored azimuth is meaningless until zero is found.
    pub dome_azimuth: i32,
    pub target_azimuth: i32,
    pub movement_status: bool,
    pub in_park: bool,
    pub finding_park: bool,
    pub finding_zero: bool,
    pub switchboard_ignited: bool,
    pub power_alert: bool,
    pub relay: RelayStatus,
    pub optoin: InputStatus,
    pub events: Vec<UnitEvent>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "kebab-case")]
pub struct RelayStatus {
    pub cw_motor: bool,
    pub ccw_motor: bool,
    pub switchboard: bool,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "kebab-case")]
pub struct InputStatus {
    pub auto: bool,
    pub switchboard_status: bool,
    pub ac_presence: bool,
    pub manual_cw_button: bool,
    pub manual_ccw_button: bool,
    pub manual_ignition: bool,
}

impl Dome {
    /// Build the JSON-serialisable status snapshot.
    pub fn status(&self) -> DomeStatus {
        let st = self.snapshot();
        let finding_zero = self.finding_zero();
        let io = &self.io;
        DomeStatus {
            firmware_version: env!("CARGO_PKG_VERSION"),
            uptime_secs: self.started_at.elapsed().as_secs(),
            dome_azimuth: if finding_zero { -1 } else { st.current_az },
            target_azimuth: st.target_az,
            movement_status: io.moving(),
            in_park: st.park,
            finding_park: self.finding_park(),
            finding_zero,
            switchboard_ignited: st.switchboard_ignited,
            power_alert: st.power_alert,
            relay: io.relay_status(),
            optoin: io.input_status(),
            events: self.events.recent(),
        }
    }
}
