use serde::Serialize;

use observatory_common::events::UnitEvent;

use crate::motion::Shutter;

// ---------------------------------------------------------------------------
// Core types
// ---------------------------------------------------------------------------

/// Shutter position as seen from the limit switches and motor relays. A
/// running relay wins over the sensors.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum ShutterStatus {
    Opening,
    Closing,
    Opened,
    Closed,
    PartiallyOpened,
}

/// No-network auto-close procedure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum EmergencyProcedure {
    #[default]
    NotNeeded,
    /// Network down, grace period running.
    Waiting,
    /// Grace period over, closing.
    Running,
    Completed,
    /// A hardware alert stopped the forced close.
    Error,
    /// MANUAL mode, the operator is in charge.
    Disabled,
}

#[derive(Debug, Clone, Default)]
pub struct ShutterState {
    pub hardware_alert: bool,
    pub alert_description: String,
    pub network_alert: bool,
    pub network_connected: bool,
    pub emergency: EmergencyProcedure,
    pub lock_movement: bool,
}

// ---------------------------------------------------------------------------
// JSON response (what the API returns)
// ---------------------------------------------------------------------------

#[derive(Debug, Serialize)]
#[serde(rename_all = "kebab-case")]
pub struct ShutterReport {
    pub firmware_version: &'static str,
    pub uptime_secs: u64,
    pub shutter_status: ShutterStatus,
    pub movement_status: bool,
    pub lock_movement: bool,
    pub network_status: bool,
    pub alert: AlertStatus,
    pub relay: RelayStatus,
    pub optoin: InputStatus,
    pub events: Vec<UnitEvent>,
}

#[derive(Debug, Serialize)]
pub struct AlertStatus {
    pub hardware: HardwareAlert,
    pub network: NetworkAlert,
}

#[derive(Debug, Serialize)]
pub struct HardwareAlert {
    pub status: bool,
    pub description: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "kebab-case")]
pub struct NetworkAlert {
    pub status: bool,
    pub security_procedures: EmergencyProcedure,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "kebab-case")]
pub struct RelayStatus {
    pub opening_motor: bool,
    pub closing_motor: bool,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "kebab-case")]
pub struct InputStatus {
    pub auto: bool,
    pub closed_sensor: bool,
    pub opened_sensor: bool,
}

impl Shutter {
    /// Build the JSON-serialisable status snapshot.
    pub fn report(&self) -> ShutterReport {
        let st = self.snapshot();
        let io = &self.io;
        ShutterReport {
            firmware_version: env!("CARGO_PKG_VERSION"),
            uptime_secs: self.started_at.elapsed().as_secs(),
            shutter_status: io.status(),
            movement_status: io.moving(),
            lock_movement: st.lock_movement,
            network_status: st.network_connected,
            alert: AlertStatus {
                hardware: HardwareAlert {
                    status: st.hardware_alert,
                    description: st.alert_description,
                },
                network: NetworkAlert {
                    status: st.network_alert,
                    security_procedures: st.emergency,
                },
            },
            relay: io.relay_status(),
            optoin: io.input_status(),
            events: self.events.recent(),
        }
    }
}
