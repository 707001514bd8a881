//! TOML config for the dome unit: board wiring, motion and bus timings,
//! power-loss debounce and the site reconciliation endpoints.

use serde::Deserialize;
use std::collections::HashSet;

use observatory_common::config::{check_positive, BoardConfig, Validate};

// ---------------------------------------------------------------------------
// Config file structures
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    #[serde(default = "default_board")]
    pub board: BoardConfig,
    #[serde(default)]
    pub roles: Roles,
    #[serde(default)]
    pub motion: MotionConfig,
    #[serde(default)]
    pub encoder: EncoderLink,
    #[serde(default)]
    pub control: ControlConfig,
    #[serde(default)]
    pub power: PowerConfig,
    #[serde(default)]
    pub site: SiteConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            board: default_board(),
            roles: Roles::default(),
            motion: MotionConfig::default(),
            encoder: EncoderLink::default(),
            control: ControlConfig::default(),
            power: PowerConfig::default(),
            site: SiteConfig::default(),
        }
    }
}

fn default_board() -> BoardConfig {
    BoardConfig {
        relay_gpio: vec![17, 27, 22],
        input_gpio: vec![5, 6, 13, 19, 26, 21],
        relay_active_low: true,
        input_active_low: false,
    }
}

/// Which relay/input index plays which part.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Roles {
    pub cw_relay: usize,
    pub ccw_relay: usize,
    pub switchboard_relay: usize,
    pub manual_cw_input: usize,
    pub auto_input: usize,
    pub switchboard_status_input: usize,
    pub manual_ccw_input: usize,
    pub manual_ignition_input: usize,
    pub ac_presence_input: usize,
}

impl Default for Roles {
    fn default() -> Self {
        Self {
            cw_relay: 0,
            ccw_relay: 1,
            switchboard_relay: 2,
            manual_cw_input: 0,
            auto_input: 1,
            switchboard_status_input: 2,
            manual_ccw_input: 3,
            manual_ignition_input: 4,
            ac_presence_input: 5,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct MotionConfig {
    pub park_azimuth: i32,
    pub reversal_settle_ms: u64,
    pub drift_settle_ms: u64,
    pub switchboard_pulse_ms: u64,
    /// Slewing stops once the shortest arc to target is below this.
    pub arrival_tolerance: i32,
    /// Park auto-detection window while in MANUAL.
    pub manual_park_tolerance: i32,
    /// API park requests within this window just set the flag.
    pub park_request_tolerance: i32,
}

impl Default for MotionConfig {
    fn default() -> Self {
        Self {
            park_azimuth: 90,
            reversal_settle_ms: 750,
            drift_settle_ms: 500,
            switchboard_pulse_ms: 500,
            arrival_tolerance: 2,
            manual_park_tolerance: 5,
            park_request_tolerance: 2,
        }
    }
}

/// RS-485 link to the rotary encoder.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct EncoderLink {
    pub device: String,
    pub baud: u32,
    pub read_retries: u32,
    pub poll_ms: u64,
    pub bus_lock_ms: u64,
    pub startup_retry_ms: u64,
}

impl Default for EncoderLink {
    fn default() -> Self {
        Self {
            device: "/dev/ttyAMA0".into(),
            baud: 19200,
            read_retries: 10,
            poll_ms: 30,
            bus_lock_ms: 250,
            startup_retry_ms: 500,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ControlConfig {
    pub loop_period_ms: u64,
    pub loop_lock_ms: u64,
    pub api_lock_ms: u64,
    pub short_press_ms: u64,
    pub button_poll_ms: u64,
    pub rotation_hold_ms: u64,
    pub ignition_hold_ms: u64,
}

impl Default for ControlConfig {
    fn default() -> Self {
        Self {
            loop_period_ms: 100,
            loop_lock_ms: 50,
            api_lock_ms: 300,
            short_press_ms: 250,
            button_poll_ms: 50,
            rotation_hold_ms: 2000,
            ignition_hold_ms: 3000,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct PowerConfig {
    /// Consecutive AC-absent cycles before an outage is declared.
    pub trip_cycles: u32,
}

impl Default for PowerConfig {
    fn default() -> Self {
        Self { trip_cycles: 10 }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SiteConfig {
    pub timeout_ms: u64,
    pub manual_to_auto: Vec<SiteRequest>,
    pub auto_to_manual: Vec<SiteRequest>,
    pub power_lost: Vec<SiteRequest>,
    pub power_restored: Vec<SiteRequest>,
}

impl Default for SiteConfig {
    fn default() -> Self {
        Self {
            timeout_ms: 5000,
            manual_to_auto: Vec::new(),
            auto_to_manual: Vec::new(),
            power_lost: Vec::new(),
            power_restored: Vec::new(),
        }
    }
}

impl SiteConfig {
    fn all(&self) -> Vec<(&'static str, &SiteRequest)> {
        let mut out = Vec::new();
        for (hook, list) in [
            ("manual_to_auto", &self.manual_to_auto),
            ("auto_to_manual", &self.auto_to_manual),
            ("power_lost", &self.power_lost),
            ("power_restored", &self.power_restored),
        ] {
            out.extend(list.iter().map(|r| (hook, r)));
        }
        out
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct SiteRequest {
    pub url: String,
    #[serde(default)]
    pub method: HttpMethod,
    #[serde(default)]
    pub body: String,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum HttpMethod {
    #[default]
    Get,
    Put,
}

// ---------------------------------------------------------------------------
// Validation
// ---------------------------------------------------------------------------

impl Validate for Config {
    fn collect_errors(&self, errors: &mut Vec<String>) {
        self.board.collect_errors(errors);
        self.validate_roles(errors);
        self.validate_motion(errors);
        self.validate_timings(errors);
        self.validate_site(errors);
    }
}

impl Config {
    fn validate_roles(&self, errors: &mut Vec<String>) {
        let r = &self.roles;
        let relays = [
            ("cw_relay", r.cw_relay),
            ("ccw_relay", r.ccw_relay),
            ("switchboard_relay", r.switchboard_relay),
        ];
        for (role, idx) in relays {
            self.board.check_relay_role(errors, role, idx);
        }
        self.board.check_distinct_relays(errors, &relays);

        for (role, idx) in [
            ("manual_cw_input", r.manual_cw_input),
            ("auto_input", r.auto_input),
            ("switchboard_status_input", r.switchboard_status_input),
            ("manual_ccw_input", r.manual_ccw_input),
            ("manual_ignition_input", r.manual_ignition_input),
            ("ac_presence_input", r.ac_presence_input),
        ] {
            self.board.check_input_role(errors, role, idx);
        }
    }

    fn validate_motion(&self, errors: &mut Vec<String>) {
        let m = &self.motion;
        if !(0..360).contains(&m.park_azimuth) {
            errors.push(format!(
                "motion: park_azimuth {} out of range [0, 360)",
                m.park_azimuth
            ));
        }
        for (field, tol) in [
            ("motion.arrival_tolerance", m.arrival_tolerance),
            ("motion.manual_park_tolerance", m.manual_park_tolerance),
            ("motion.park_request_tolerance", m.park_request_tolerance),
        ] {
            if !(1..180).contains(&tol) {
                errors.push(format!("{field} {tol} out of range [1, 180)"));
            }
        }
    }

    fn validate_timings(&self, errors: &mut Vec<String>) {
        let m = &self.motion;
        let e = &self.encoder;
        let c = &self.control;
        for (field, value) in [
            ("motion.reversal_settle_ms", m.reversal_settle_ms),
            ("motion.drift_settle_ms", m.drift_settle_ms),
            ("motion.switchboard_pulse_ms", m.switchboard_pulse_ms),
            ("encoder.poll_ms", e.poll_ms),
            ("encoder.bus_lock_ms", e.bus_lock_ms),
            ("encoder.startup_retry_ms", e.startup_retry_ms),
            ("control.loop_period_ms", c.loop_period_ms),
            ("control.loop_lock_ms", c.loop_lock_ms),
            ("control.api_lock_ms", c.api_lock_ms),
            ("control.short_press_ms", c.short_press_ms),
            ("control.button_poll_ms", c.button_poll_ms),
            ("control.rotation_hold_ms", c.rotation_hold_ms),
            ("control.ignition_hold_ms", c.ignition_hold_ms),
            ("power.trip_cycles", u64::from(self.power.trip_cycles)),
            ("encoder.baud", u64::from(e.baud)),
        ] {
            check_positive(errors, field, value);
        }
        if e.device.trim().is_empty() {
            errors.push("encoder: device is empty".into());
        }
    }

    fn validate_site(&self, errors: &mut Vec<String>) {
        check_positive(errors, "site.timeout_ms", self.site.timeout_ms);
        let mut seen: HashSet<(&str, &str)> = HashSet::new();
        for (hook, req) in self.site.all() {
            if !(req.url.starts_with("http://") || req.url.starts_with("https://")) {
                errors.push(format!(
                    "site.{hook}: url '{}' must start with http:// or https://",
                    req.url
                ));
            }
            if req.method == HttpMethod::Get && !req.body.is_empty() {
                errors.push(format!("site.{hook}: GET request '{}' has a body", req.url));
            }
            if !seen.insert((hook, req.url.as_str())) {
                errors.push(format!("site.{hook}: duplicate url '{}'", req.url));
            }
        }
    }
}

// ===========================================================================
// Tests
// ===========================================================================
