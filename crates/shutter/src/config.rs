use serde::Deserialize;

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
    pub control: ControlConfig,
    #[serde(default)]
    pub network: NetworkConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            board: default_board(),
            roles: Roles::default(),
            motion: MotionConfig::default(),
            control: ControlConfig::default(),
            network: NetworkConfig::default(),
        }
    }
}

fn default_board() -> BoardConfig {
    BoardConfig {
        relay_gpio: vec![17, 27],
        input_gpio: vec![5, 6, 13],
        relay_active_low: true,
        input_active_low: false,
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Roles {
    pub opening_relay: usize,
    pub closing_relay: usize,
    pub auto_input: usize,
    pub closed_input: usize,
    pub opened_input: usize,
}

impl Default for Roles {
    fn default() -> Self {
        Self {
            opening_relay: 0,
            closing_relay: 1,
            auto_input: 0,
            closed_input: 1,
            opened_input: 2,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct MotionConfig {
    /// Pause between cutting a running motor and energizing the other one.
    pub settle_ms: u64,
    /// Time allowed for the far limit switch to release after a start.
    pub toggle_timeout_ms: u64,
    /// Relay hold once a limit switch asserts, to finish the last of the travel.
    pub limit_hold_ms: u64,
    /// Longest a single travel may take before the watchdog cuts it.
    pub stall_timeout_ms: u64,
    pub poll_ms: u64,
}

impl Default for MotionConfig {
    fn default() -> Self {
        Self {
            settle_ms: 150,
            toggle_timeout_ms: 4500,
            limit_hold_ms: 4500,
            stall_timeout_ms: 22000,
            poll_ms: 50,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ControlConfig {
    pub loop_period_ms: u64,
    pub loop_lock_ms: u64,
    pub api_lock_ms: u64,
}

impl Default for ControlConfig {
    fn default() -> Self {
        Self {
            loop_period_ms: 100,
            loop_lock_ms: 50,
            api_lock_ms: 50,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct NetworkConfig {
    /// Interface whose link state counts as "wifi up".
    pub interface: String,
    pub probe_host: String,
    pub probe_port: u16,
    pub probe_timeout_ms: u64,
    pub probe_interval_ms: u64,
    /// Cumulative outage after which the shutter is closed.
    pub max_no_network_ms: u64,
    pub period_ms: u64,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            interface: "wlan0".into(),
            probe_host: "www.google.com".into(),
            probe_port: 443,
            probe_timeout_ms: 3000,
            probe_interval_ms: 60_000,
            max_no_network_ms: 600_000,
            period_ms: 100,
        }
    }
}

// ---------------------------------------------------------------------------
// Validation
// ---------------------------------------------------------------------------

impl Validate for Config {
    fn collect_errors(&self, errors: &mut Vec<String>) {
        self.board.collect_errors(errors);

        let r = &self.roles;
        let relays = [
            ("opening_relay", r.opening_relay),
            ("closing_relay", r.closing_relay),
        ];
        for (role, idx) in relays {
            self.board.check_relay_role(errors, role, idx);
        }
        self.board.check_distinct_relays(errors, &relays);
        for (role, idx) in [
            ("auto_input", r.auto_input),
            ("closed_input", r.closed_input),
            ("opened_input", r.opened_input),
        ] {
            self.board.check_input_role(errors, role, idx);
        }

        let m = &self.motion;
        let c = &self.control;
        let n = &self.network;
        for (field, value) in [
            ("motion.settle_ms", m.settle_ms),
            ("motion.toggle_timeout_ms", m.toggle_timeout_ms),
            ("motion.limit_hold_ms", m.limit_hold_ms),
            ("motion.stall_timeout_ms", m.stall_timeout_ms),
            ("motion.poll_ms", m.poll_ms),
            ("control.loop_period_ms", c.loop_period_ms),
            ("control.loop_lock_ms", c.loop_lock_ms),
            ("control.api_lock_ms", c.api_lock_ms),
            ("network.probe_timeout_ms", n.probe_timeout_ms),
            ("network.probe_interval_ms", n.probe_interval_ms),
            ("network.max_no_network_ms", n.max_no_network_ms),
            ("network.period_ms", n.period_ms),
            ("network.probe_port", u64::from(n.probe_port)),
        ] {
            check_positive(errors, field, value);
        }

        if m.stall_timeout_ms <= m.toggle_timeout_ms {
            errors.push(format!(
                "motion: stall_timeout_ms ({}) must exceed toggle_timeout_ms ({})",
                m.stall_timeout_ms, m.toggle_timeout_ms
            ));
        }
        if n.interface.trim().is_empty() {
            errors.push("network: interface is empty".into());
        }
        if n.probe_host.trim().is_empty() {
            errors.push("network: probe_host is empty".into());
        }
    }
}

// ===========================================================================
// Tests
// ===========================================================================
